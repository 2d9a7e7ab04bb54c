//! Error types for the tunnel, SOCKS engine, and registry.

use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running an agent, a gateway, or the SOCKS
/// engine.
#[derive(Error, Debug)]
pub enum Error {
    /// Network I/O error
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// WebSocket transport error (dial, upgrade, or frame level)
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// TLS material could not be loaded or the config could not be built
    #[error("tls error: {0}")]
    Tls(String),

    /// Configuration error (flags, registry file, addresses)
    #[error("configuration error: {0}")]
    Config(String),

    /// A bounded operation did not finish in time
    #[error("{0} timed out")]
    Timeout(&'static str),

    /// Registration rejected by the gateway
    #[error("failed to register: invalid auth key({0}) or cert CN")]
    Unauthorized(String),

    /// Malformed SOCKS greeting, request, or address
    #[error("socks protocol error: {0}")]
    Protocol(String),

    /// SOCKS command other than CONNECT
    #[error("unsupported socks command: {0:#04x}")]
    UnsupportedCommand(u8),

    /// The mux layer declared the peer dead
    #[error("broken session with the server")]
    BrokenSession,

    /// Ambient cancellation fired
    #[error("canceled")]
    Canceled,
}

impl Error {
    /// Create a new TLS error.
    pub fn tls(msg: impl Into<String>) -> Self {
        Error::Tls(msg.into())
    }

    /// Create a new configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a new SOCKS protocol error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// Whether the agent may recover from this error by re-registering.
    /// Everything is recoverable except cancellation.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Error::Canceled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::BrokenSession;
        assert_eq!(err.to_string(), "broken session with the server");

        let err = Error::Unauthorized("xyz".into());
        assert_eq!(
            err.to_string(),
            "failed to register: invalid auth key(xyz) or cert CN"
        );

        let err = Error::UnsupportedCommand(0x02);
        assert_eq!(err.to_string(), "unsupported socks command: 0x02");
    }

    #[test]
    fn test_error_recoverable() {
        assert!(Error::BrokenSession.is_recoverable());
        assert!(Error::Timeout("websocket handshake").is_recoverable());
        assert!(Error::Unauthorized("k".into()).is_recoverable());
        assert!(!Error::Canceled.is_recoverable());
    }
}
