//! veil-core: Shared protocol library for the veil tunnel.
//!
//! Provides the binary handshake codec, the shared-secret identity type,
//! the share-link builder, and the common error type. Nothing here performs
//! I/O; the server crate owns sockets and files.

pub mod error;
pub mod handshake;
pub mod identity;
pub mod link;

// Re-export commonly used items at crate root.
pub use error::{VeilError, VeilResult};
pub use handshake::{parse_handshake, Handshake, HandshakeError, TargetAddr, CMD_TCP};
pub use identity::Identity;
pub use link::{decode_link, encode_link, LinkParams};
