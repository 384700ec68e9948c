//! # Error Taxonomy
//!
//! Purpose: Name every way an operation can fail so callers can tell a dead
//! node from a bad key from a server-side status.
//!
//! ## Design Principles
//! 1. **Clone-able Failures**: One socket error fails many futures, so the
//!    underlying `io::Error` is shared behind an `Arc`.
//! 2. **Transport vs. Status**: A non-success status code is a result value;
//!    `Status` only appears when a convenience wrapper collapses it.
//! 3. **Endpoint Context**: Node-level errors carry the endpoint they came from.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;

use crate::protocol::Status;

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced through operation futures and client calls.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// The owning node was known to be down when the operation was enqueued.
    #[error("{endpoint} is not alive")]
    NotAlive { endpoint: SocketAddr },

    /// No node in the working set can take the operation.
    #[error("all nodes are dead")]
    AllNodesDead,

    /// Socket-level failure while sending or receiving.
    #[error("io failure on {endpoint}: {source}")]
    Io {
        endpoint: SocketAddr,
        #[source]
        source: Arc<io::Error>,
    },

    /// Key exceeds the protocol maximum.
    #[error("key too long: {len} bytes")]
    KeyTooLong { len: usize },

    /// Server answered with a non-success status.
    #[error("server status: {0}")]
    Status(Status),

    /// Malformed frame or unexpected response shape.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The operation was dropped before a response arrived (shutdown).
    #[error("operation abandoned")]
    Abandoned,

    /// Endpoint string could not be parsed into a socket address.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// A cluster was configured without endpoints.
    #[error("no endpoints configured")]
    NoEndpoints,

    /// The driver thread could not be started.
    #[error("failed to start driver: {0}")]
    Driver(Arc<io::Error>),
}

impl ClientError {
    /// Wraps an `io::Error` raised on `endpoint`.
    pub fn io(endpoint: SocketAddr, err: io::Error) -> Self {
        ClientError::Io {
            endpoint,
            source: Arc::new(err),
        }
    }

    /// Returns true for failures caused by the transport rather than the caller.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ClientError::NotAlive { .. } | ClientError::AllNodesDead | ClientError::Io { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_is_shared_between_clones() {
        let endpoint: SocketAddr = "127.0.0.1:11211".parse().unwrap();
        let err = ClientError::io(endpoint, io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
        let copy = err.clone();

        match (&err, &copy) {
            (ClientError::Io { source: a, .. }, ClientError::Io { source: b, .. }) => {
                assert!(Arc::ptr_eq(a, b));
            }
            _ => panic!("expected io errors"),
        }
        assert!(err.is_transport());
        assert!(err.to_string().contains("127.0.0.1:11211"));
    }

    #[test]
    fn test_status_is_not_transport() {
        let err = ClientError::Status(Status::KeyNotFound);
        assert!(!err.is_transport());
        assert!(!ClientError::KeyTooLong { len: 300 }.is_transport());
    }
}
