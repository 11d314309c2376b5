//! # remock-server
//!
//! The remock relay server.
//!
//! - Connection registry + auth gate: accepts interceptor clients over
//!   WebSocket, optionally gated by interceptor tokens
//! - Commitment table: `(method, URL pattern) → owning connection`
//! - RPC correlator: pairs forwarded requests with asynchronous replies
//! - Request dispatcher: relays live HTTP traffic to the owning client
//! - Lifecycle: deadline-bounded bind and cascading stop

#![deny(unsafe_code)]

pub mod commitments;
pub mod config;
pub mod correlator;
pub mod dispatch;
pub mod errors;
pub mod registry;
pub mod server;
pub mod websocket;

pub use config::ServerConfig;
pub use errors::{AuthError, LifecycleError, RpcFailure};
pub use server::{RelayServer, ServerHandle};
