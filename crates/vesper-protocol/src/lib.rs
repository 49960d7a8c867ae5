//! vesper-protocol: RESP wire format.
//!
//! Frame type, incremental parser (multi-bulk and inline requests), and
//! direct-to-buffer serializer. Protocol concerns stay out of the engine
//! crates — everything above works with parsed [`Frame`] values.

pub mod error;
pub mod parse;
pub mod serialize;
pub mod types;

pub use error::ProtocolError;
pub use parse::{parse_frame, parse_request};
pub use types::Frame;
