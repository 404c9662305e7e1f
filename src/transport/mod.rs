//! Host ↔ guest transport
//!
//! - `proto` - envelope wire types (request, response, signal)
//! - `codec` - envelope encode/decode
//! - `frame` - length-prefixed framing over any async byte stream
//! - `demux` - container log stream demultiplexing

pub mod codec;
pub mod demux;
pub mod frame;
pub mod proto;

pub use codec::{decode, encode, CodecError};
pub use frame::{read_frame, write_close, write_frame, FrameError, MAX_FRAME_SIZE};
pub use proto::{Envelope, Method, Signal, TransportRequest, TransportResponse, TransportSignal};

/// Opaque encoded envelope as it travels through a task's queues
pub type Message = Vec<u8>;
