//! Error kinds for the proxy core.
//!
//! Transport and protocol errors are fatal to the owning session; the
//! accept loop in `mcproxy` catches them at the session boundary and moves
//! on to the next connection. `SessionHijack` is explicitly non-fatal:
//! callers log it and continue, since the upstream server will drop the
//! connection itself if authentication failed.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("protocol framing error: {0}")]
    ProtocolFraming(String),

    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("session hijack error: {0}")]
    SessionHijack(String),
}

impl ProxyError {
    pub fn framing(msg: impl Into<String>) -> Self {
        Self::ProtocolFraming(msg.into())
    }

    pub fn handshake(msg: impl Into<String>) -> Self {
        Self::HandshakeFailed(msg.into())
    }

    pub fn hijack(msg: impl Into<String>) -> Self {
        Self::SessionHijack(msg.into())
    }

    /// Whether this error should tear down the owning session, as opposed
    /// to being logged and otherwise ignored (only `SessionHijack` is not).
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ProxyError::SessionHijack(_))
    }
}

/// Crate-wide result type. An unknown packet type is not an error at all,
/// just a forward-as-opaque decision made by the registry.
pub type Result<T> = std::result::Result<T, ProxyError>;
