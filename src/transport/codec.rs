//! Envelope encoding
//!
//! Stateless conversion between an [`Envelope`] and the bytes carried inside
//! one frame.

use prost::Message;
use thiserror::Error;

use super::proto::{Envelope, TransportMessage};

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] prost::DecodeError),
    /// The outer message carried no known variant
    #[error("unknown envelope variant")]
    UnknownVariant,
}

/// Encode an envelope into frame payload bytes
pub fn encode(envelope: &Envelope) -> Vec<u8> {
    TransportMessage {
        envelope: Some(envelope.clone()),
    }
    .encode_to_vec()
}

/// Decode frame payload bytes into an envelope
pub fn decode(bytes: &[u8]) -> Result<Envelope, CodecError> {
    let msg = TransportMessage::decode(bytes)?;
    msg.envelope.ok_or(CodecError::UnknownVariant)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::proto::{
        Method, Signal, TransportRequest, TransportResponse, TransportSignal,
    };

    #[test]
    fn test_request_round_trip() {
        let env = Envelope::Request(TransportRequest::new(42, Method::Transform, b"{}".to_vec()));
        let decoded = decode(&encode(&env)).unwrap();
        assert_eq!(decoded, env);
        match decoded {
            Envelope::Request(req) => assert_eq!(req.method(), Method::Transform),
            other => panic!("expected request, got {:?}", other),
        }
    }

    #[test]
    fn test_error_response_keeps_code_and_message() {
        let env = Envelope::Response(TransportResponse::error(7, 2, "method not found"));
        match decode(&encode(&env)).unwrap() {
            Envelope::Response(resp) => {
                assert_eq!(resp.id, 7);
                assert_eq!(resp.code, 2);
                assert_eq!(resp.message, "method not found");
                assert!(!resp.is_ok());
            }
            other => panic!("expected response, got {:?}", other),
        }
    }

    #[test]
    fn test_signal_round_trip() {
        let env = Envelope::Signal(TransportSignal::new(Signal::Terminate, Vec::new()));
        assert_eq!(decode(&encode(&env)).unwrap(), env);
    }

    #[test]
    fn test_empty_message_is_unknown_variant() {
        // A TransportMessage with no variant set encodes to zero bytes
        let bytes = TransportMessage { envelope: None }.encode_to_vec();
        assert!(matches!(decode(&bytes), Err(CodecError::UnknownVariant)));
    }

    #[test]
    fn test_unrecognised_outer_tag_is_rejected() {
        // field 9, wire type varint, value 1
        let bytes = [0x48, 0x01];
        assert!(matches!(decode(&bytes), Err(CodecError::UnknownVariant)));
    }

    #[test]
    fn test_garbage_is_malformed() {
        let bytes = [0x0a, 0xff, 0xff];
        assert!(matches!(decode(&bytes), Err(CodecError::Malformed(_))));
    }
}
