//! # Broker Wire Protocol
//!
//! Frame codec and typed work-envelope decoding for the broker channel.
//! The connection layer moves [`Frame`]s; the routing layer only ever sees a
//! validated [`WorkEnvelope`].

pub mod envelope;
pub mod frame;

pub use envelope::{
    EnvelopeError, RequestType, ResponseBody, WorkEnvelope, ENVELOPE_HEADER, MESSAGE_ID_HEADER,
};
pub use frame::{Frame, FrameCommand, FrameError};
