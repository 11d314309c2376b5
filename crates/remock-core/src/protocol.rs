//! Wire protocol between the relay server and interceptor clients.
//!
//! Every frame is a JSON text message shaped as a closed tagged union
//! discriminated by a `kind` field. Frames are validated by serde at the
//! boundary; a frame with an unknown `kind` never reaches dispatch logic.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use crate::ids::CallId;

/// Messages sent by an interceptor client to the relay server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Register a handler for `(method, url)` owned by this connection.
    Commit {
        /// Client-chosen request id, echoed in the acknowledgment.
        id: String,
        /// HTTP method the handler answers.
        method: String,
        /// URL pattern; segments starting with `:` match any one segment.
        url: String,
    },
    /// Remove handlers owned by this connection.
    ///
    /// Provided fields act as filters; omitting both clears every
    /// commitment the connection owns.
    Uncommit {
        /// Client-chosen request id, echoed in the acknowledgment.
        id: String,
        /// Only remove handlers for this method.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        method: Option<String>,
        /// Only remove handlers for this URL pattern.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
    },
    /// Answer to a previously forwarded request.
    Reply {
        /// Correlation id from the matching `forward_request`.
        id: CallId,
        /// What the handler produced.
        outcome: ReplyOutcome,
    },
}

/// Messages sent by the relay server to an interceptor client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Acknowledges a `commit` or `uncommit` by its request id.
    Ack {
        /// The client-chosen request id being acknowledged.
        id: String,
    },
    /// The handshake was rejected; the connection closes after this frame.
    Rejected {
        /// User-visible rejection reason.
        reason: String,
    },
    /// A live HTTP request routed to a handler this connection owns.
    ForwardRequest {
        /// Correlation id the client must echo in its `reply`.
        id: CallId,
        /// The serialized inbound request.
        request: SerializedRequest,
    },
}

/// The result a handler produced for a forwarded request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyOutcome {
    /// The handler computed a response to relay to the HTTP caller.
    Response(SerializedResponse),
    /// The handler declined to answer; the request counts as unhandled.
    Bypass,
    /// The handler failed; carries the failure message.
    Error(String),
}

/// An HTTP request serialized for transport to an interceptor client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedRequest {
    /// HTTP method, uppercase.
    pub method: String,
    /// Request target (path plus any query string).
    pub url: String,
    /// Header pairs in arrival order; duplicates preserved.
    pub headers: Vec<(String, String)>,
    /// Base64-encoded body; empty string for an empty body.
    #[serde(default)]
    pub body: String,
}

/// An HTTP response serialized for transport back to the relay server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedResponse {
    /// HTTP status code.
    pub status: u16,
    /// Header pairs to relay; duplicates preserved.
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    /// Base64-encoded body; empty string for an empty body.
    #[serde(default)]
    pub body: String,
}

impl SerializedRequest {
    /// Encode raw body bytes into the wire representation.
    pub fn encode_body(bytes: &[u8]) -> String {
        BASE64.encode(bytes)
    }

    /// Decode the body back into raw bytes.
    pub fn body_bytes(&self) -> Result<Vec<u8>, base64::DecodeError> {
        BASE64.decode(&self.body)
    }
}

impl SerializedResponse {
    /// Encode raw body bytes into the wire representation.
    pub fn encode_body(bytes: &[u8]) -> String {
        BASE64.encode(bytes)
    }

    /// Decode the body back into raw bytes.
    pub fn body_bytes(&self) -> Result<Vec<u8>, base64::DecodeError> {
        BASE64.decode(&self.body)
    }
}
