//! Tunnel sessions and the bidirectional relay they run.

pub mod engine;
pub mod session;

pub use session::Session;
