//! Envelope wire types
//!
//! Hand-written prost messages, so no protoc step is needed at build time.
//! The outer `TransportMessage` carries exactly one of request, response or
//! signal. Inner payloads are opaque bytes owned by the method handler.

/// Host call methods understood by the host or the guest
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum Method {
    Unknown = 0,
    Transform = 1,
    TransformConfig = 2,
    ToolInvoke = 3,
    InternalToolCreate = 4,
    VecStoreCreate = 5,
    VecStoreDelete = 6,
    VecStoreInsert = 7,
    VecStoreQuery = 8,
    Input = 9,
    Speak = 10,
    Record = 11,
    Custom = 12,
    NormalToolCreate = 13,
}

impl Method {
    /// Dotted name used in logs and metric labels
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Unknown => "unknown",
            Method::Transform => "transform",
            Method::TransformConfig => "transform.config",
            Method::ToolInvoke => "tool.invoke",
            Method::InternalToolCreate => "tool.internal.create",
            Method::VecStoreCreate => "vectorstore.create",
            Method::VecStoreDelete => "vectorstore.delete",
            Method::VecStoreInsert => "vectorstore.insert",
            Method::VecStoreQuery => "vectorstore.search",
            Method::Input => "io.input",
            Method::Speak => "io.speak",
            Method::Record => "io.record",
            Method::Custom => "custom",
            Method::NormalToolCreate => "tool.normal.create",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Out-of-band notifications
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum Signal {
    Unknown = 0,
    Terminate = 1,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TransportRequest {
    #[prost(int64, tag = "1")]
    pub id: i64,
    #[prost(enumeration = "Method", tag = "2")]
    pub method: i32,
    #[prost(bytes = "vec", tag = "3")]
    pub payload: Vec<u8>,
}

impl TransportRequest {
    pub fn new(id: i64, method: Method, payload: Vec<u8>) -> Self {
        Self {
            id,
            method: method as i32,
            payload,
        }
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TransportResponse {
    #[prost(int64, tag = "1")]
    pub id: i64,
    /// 0 on success
    #[prost(int32, tag = "2")]
    pub code: i32,
    #[prost(string, tag = "3")]
    pub message: String,
    #[prost(bytes = "vec", tag = "4")]
    pub payload: Vec<u8>,
}

impl TransportResponse {
    pub fn ok(id: i64, payload: Vec<u8>) -> Self {
        Self {
            id,
            code: 0,
            message: String::new(),
            payload,
        }
    }

    pub fn error(id: i64, code: i32, message: impl Into<String>) -> Self {
        Self {
            id,
            code,
            message: message.into(),
            payload: Vec::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == 0
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TransportSignal {
    #[prost(enumeration = "Signal", tag = "1")]
    pub method: i32,
    #[prost(bytes = "vec", tag = "2")]
    pub payload: Vec<u8>,
}

impl TransportSignal {
    pub fn new(signal: Signal, payload: Vec<u8>) -> Self {
        Self {
            method: signal as i32,
            payload,
        }
    }
}

/// One of the three envelope kinds
#[derive(Clone, PartialEq, ::prost::Oneof)]
pub enum Envelope {
    #[prost(message, tag = "1")]
    Request(TransportRequest),
    #[prost(message, tag = "2")]
    Response(TransportResponse),
    #[prost(message, tag = "3")]
    Signal(TransportSignal),
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TransportMessage {
    #[prost(oneof = "Envelope", tags = "1, 2, 3")]
    pub envelope: Option<Envelope>,
}
