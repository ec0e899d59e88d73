//! Wire message types for the parameter server RPC surface (§6): plain,
//! transport-agnostic request/response structs and enums. Framing
//! (length-prefixing, multiplexing) lives in [`framing`]; the envelopes
//! here could be carried over any transport without change.

pub mod envelope;
pub mod framing;
pub mod messages;

pub use envelope::{Request, Response};
pub use messages::*;
