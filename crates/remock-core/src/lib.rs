//! # remock-core
//!
//! Shared vocabulary for the remock relay:
//!
//! - Branded identifiers ([`ids::ConnectionId`], [`ids::CallId`])
//! - The wire protocol spoken between the relay server and interceptor
//!   clients ([`protocol::ClientMessage`], [`protocol::ServerMessage`])
//! - Serialized HTTP request/response shapes carried over that protocol

#![deny(unsafe_code)]

pub mod ids;
pub mod protocol;

pub use ids::{CallId, ConnectionId};
pub use protocol::{
    ClientMessage, ReplyOutcome, SerializedRequest, SerializedResponse, ServerMessage,
};
