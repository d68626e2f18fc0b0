//! Error types for the STOMP transport.

use thiserror::Error;

/// Errors raised by the frame codec and broker connection.
#[derive(Debug, Error)]
pub enum StompError {
    /// Socket error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The broker closed the socket.
    #[error("connection closed by broker")]
    Closed,

    /// No session is open (the connection was lost and not yet re-established).
    #[error("not connected")]
    NotConnected,

    /// Bytes on the wire do not form a valid frame.
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// A frame grew beyond the parser limit.
    #[error("frame exceeds {limit} bytes")]
    FrameTooLarge { limit: usize },

    /// The broker sent an ERROR frame.
    #[error("broker error: {0}")]
    Broker(String),

    /// The broker does not speak STOMP 1.1 or later (no NACK support).
    #[error("broker negotiated STOMP {0}; 1.1 or later is required")]
    UnsupportedVersion(String),

    /// The broker answered CONNECT with something other than CONNECTED.
    #[error("unexpected {0} frame during handshake")]
    UnexpectedFrame(String),

    /// A handshake step did not finish in time.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// Every configured host failed.
    #[error("no broker reachable: {0}")]
    Unreachable(String),

    /// The host list is empty.
    #[error("no broker hosts configured")]
    NoHosts,
}

impl StompError {
    /// Returns true if the error means the session is gone and must be
    /// re-established before further use.
    pub fn is_connection_lost(&self) -> bool {
        matches!(
            self,
            StompError::Io(_)
                | StompError::Closed
                | StompError::NotConnected
                | StompError::Malformed(_)
                | StompError::FrameTooLarge { .. }
                | StompError::Broker(_)
                | StompError::Unreachable(_)
        )
    }
}
