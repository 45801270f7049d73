//! Session state and the handshake/packet-pump machinery that drives one
//! proxied connection end to end.

pub mod handshake;
pub mod pump;
pub mod session;

pub use session::{LoginStage, Session};
