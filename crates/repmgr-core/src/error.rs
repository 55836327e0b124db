//! Error types for the replication group-communication layer

use thiserror::Error;

/// Result type alias using the repmgr Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by connections, the codec and the connection manager
#[derive(Error, Debug)]
pub enum Error {
    /// Socket-level I/O errors (reset, broken pipe, unexpected EOF)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Remote site refused or could not be reached on any address
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    /// No protocol version in common with the remote site
    #[error("Version mismatch: local {local_min}..={local_max}, peer {remote_min}..={remote_max}")]
    ProtocolVersionMismatch {
        /// Lowest version we speak
        local_min: u32,
        /// Highest version we speak
        local_max: u32,
        /// Lowest version the remote proposed
        remote_min: u32,
        /// Highest version the remote proposed
        remote_max: u32,
    },

    /// Outbound queue is full and the send could not wait
    #[error("Outbound queue full")]
    QueueFull,

    /// Frame failed validation (type, size, checksum, payload layout)
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// Connection has not finished negotiation or is defunct
    #[error("Connection not ready")]
    NotReady,

    /// Ack policy not satisfied before the wait expired
    #[error("Timed out waiting for acknowledgement")]
    AckTimeout,

    /// Eid does not name a remote site
    #[error("Unknown site: {0}")]
    UnknownSite(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Manager has shut down
    #[error("Replication manager shut down")]
    Shutdown,

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a malformed frame error
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedFrame(msg.into())
    }

    /// Create a connection refused error
    pub fn refused(msg: impl Into<String>) -> Self {
        Self::ConnectionRefused(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether the caller may retry the same operation later
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::QueueFull | Error::AckTimeout | Error::ConnectionRefused(_) => true,
            Error::Io(io_error) => matches!(
                io_error.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }

    /// Whether hitting this error on a connection must bust it
    pub fn busts_connection(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::ConnectionRefused(_)
                | Error::MalformedFrame(_)
                | Error::ProtocolVersionMismatch { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::QueueFull.is_retryable());
        assert!(Error::AckTimeout.is_retryable());
        assert!(
            Error::Io(std::io::Error::from(std::io::ErrorKind::ConnectionReset)).is_retryable()
        );
        assert!(!Error::NotReady.is_retryable());
        assert!(!Error::malformed("bad").is_retryable());
    }

    #[test]
    fn test_bust_classification() {
        assert!(Error::malformed("crc").busts_connection());
        assert!(Error::Io(std::io::Error::from(std::io::ErrorKind::BrokenPipe)).busts_connection());
        assert!(!Error::QueueFull.busts_connection());
        assert!(!Error::NotReady.busts_connection());
    }

    #[test]
    fn test_display() {
        let err = Error::ProtocolVersionMismatch {
            local_min: 1,
            local_max: 2,
            remote_min: 3,
            remote_max: 4,
        };
        assert_eq!(
            err.to_string(),
            "Version mismatch: local 1..=2, peer 3..=4"
        );
    }
}
