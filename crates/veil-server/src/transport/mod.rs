//! Transport layer: WebSocket upgrade on the shared listener and the
//! outbound TCP dial to tunnel targets.

pub mod target;
pub mod websocket;
