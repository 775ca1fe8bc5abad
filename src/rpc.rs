//! RPC surface shared by client and daemon.
//!
//! One message type exists per daemon operation. A message is a tagged
//! header (small, JSON-encoded) plus an optional bulk payload of raw bytes
//! that rides in the same frame after the header; data and dirent payloads
//! never pass through the JSON encoder. The transport behind [`Channel`]
//! is a length-delimited TCP stream, but nothing outside this module
//! depends on that.

mod channel;
pub use channel::*;

mod codec;
pub use codec::*;

mod message;
pub use message::*;
