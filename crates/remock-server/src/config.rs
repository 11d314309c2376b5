//! Server configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the relay server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for an OS-assigned ephemeral port).
    pub port: u16,
    /// Directory of interceptor tokens. When set, every connection must
    /// authenticate with a valid token; when unset, all connections are
    /// accepted.
    pub tokens_dir: Option<PathBuf>,
    /// Log unhandled and erroring requests as structured warnings.
    pub log_unhandled: bool,
    /// Deadline for binding the listener, in seconds.
    pub start_timeout_secs: u64,
    /// Deadline for draining connections on stop, in seconds.
    pub stop_timeout_secs: u64,
    /// Heartbeat ping interval in seconds.
    pub heartbeat_interval_secs: u64,
    /// Close a connection after this many seconds without a pong.
    pub heartbeat_timeout_secs: u64,
    /// Per-connection outbound message queue size.
    pub max_send_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            tokens_dir: None,
            log_unhandled: false,
            start_timeout_secs: 30,
            stop_timeout_secs: 30,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 90,
            max_send_queue: 256,
        }
    }
}

impl ServerConfig {
    /// Start deadline as a [`Duration`].
    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    /// Stop deadline as a [`Duration`].
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_binds_loopback_ephemeral() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.host, "127.0.0.1");
        assert_eq!(cfg.port, 0);
    }

    #[test]
    fn default_has_no_tokens_dir() {
        let cfg = ServerConfig::default();
        assert!(cfg.tokens_dir.is_none());
        assert!(!cfg.log_unhandled);
    }

    #[test]
    fn default_deadlines() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.start_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.stop_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn serde_roundtrip() {
        let cfg = ServerConfig {
            host: "0.0.0.0".into(),
            port: 4141,
            tokens_dir: Some(PathBuf::from("/tmp/tokens")),
            log_unhandled: true,
            ..ServerConfig::default()
        };
        let json = serde_json::to_string(&cfg).unwrap();
        let back: ServerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.host, cfg.host);
        assert_eq!(back.port, cfg.port);
        assert_eq!(back.tokens_dir, cfg.tokens_dir);
        assert!(back.log_unhandled);
    }
}
