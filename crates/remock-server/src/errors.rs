//! Server error types.

use std::time::Duration;

/// Why a connection handshake was rejected. The display strings are the
/// exact user-visible reasons sent in the `rejected` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// The server requires a token and the handshake carried none.
    #[error("An interceptor token is required, but none was provided.")]
    NoTokenProvided,
    /// A token was supplied but did not verify.
    #[error("The interceptor token is not valid.")]
    InvalidToken,
}

impl AuthError {
    /// The user-visible rejection reason.
    pub fn reason(self) -> String {
        self.to_string()
    }
}

/// Failure of a single forwarded request. Delivered only to the pending
/// caller; never fatal to the server.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RpcFailure {
    /// The owning connection closed before a reply arrived.
    #[error("connection closed while a forwarded request was pending")]
    ConnectionClosed,
    /// The remote handler reported a failure.
    #[error("remote handler failed: {0}")]
    HandlerThrew(String),
}

/// Fatal outcome of a specific `start()`/`stop()` call. Never affects
/// already-accepted connections.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    /// The listener did not bind within the start deadline.
    #[error("server did not start within {0:?}")]
    StartTimeout(Duration),
    /// Connections did not drain within the stop deadline.
    #[error("server did not stop within {0:?}")]
    StopTimeout(Duration),
    /// The requested port is already bound.
    #[error("address {0} is already in use")]
    PortInUse(String),
    /// The host/port pair does not resolve to a bindable address.
    #[error("invalid listen address: {0}")]
    InvalidAddr(String),
    /// Any other I/O failure while binding or shutting down.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_reasons_are_exact() {
        assert_eq!(
            AuthError::NoTokenProvided.reason(),
            "An interceptor token is required, but none was provided."
        );
        assert_eq!(
            AuthError::InvalidToken.reason(),
            "The interceptor token is not valid."
        );
    }

    #[test]
    fn rpc_failure_display() {
        assert_eq!(
            RpcFailure::ConnectionClosed.to_string(),
            "connection closed while a forwarded request was pending"
        );
        assert!(
            RpcFailure::HandlerThrew("boom".into())
                .to_string()
                .contains("boom")
        );
    }

    #[test]
    fn lifecycle_display() {
        let err = LifecycleError::StartTimeout(Duration::from_secs(30));
        assert!(err.to_string().contains("did not start"));
        let err = LifecycleError::PortInUse("127.0.0.1:4141".into());
        assert!(err.to_string().contains("already in use"));
    }
}
