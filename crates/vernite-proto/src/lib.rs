//! vernite-proto: wire protocol of the Vernite real-time gateway.
//!
//! Provides the packet catalog, the self-describing CBOR envelope codec and
//! the shared error type.

pub mod codec;
pub mod error;
pub mod packets;

// Re-export commonly used items at crate root.
pub use codec::{decode, encode, Envelope};
pub use error::{VerniteError, VerniteResult};
pub use packets::{Packet, CATALOG};
