//! RPC correlation: pairs forwarded requests with their eventual replies.

use dashmap::DashMap;
use remock_core::protocol::{ReplyOutcome, SerializedRequest, ServerMessage};
use remock_core::{CallId, ConnectionId};
use tokio::sync::oneshot;

use crate::errors::RpcFailure;
use crate::registry::Connection;

struct PendingCall {
    owner: ConnectionId,
    resolver: oneshot::Sender<Result<ReplyOutcome, RpcFailure>>,
}

/// Table of in-flight forwarded requests.
///
/// A pending call is removed at the exact moment it settles, and per-key
/// removal on the map is atomic, so a reply racing a connection close
/// settles the call exactly once; the loser finds nothing and no-ops.
pub struct RpcCorrelator {
    pending: DashMap<CallId, PendingCall>,
}

impl RpcCorrelator {
    /// Create an empty correlator.
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
        }
    }

    /// Forward a serialized request to `connection` and wait for the
    /// correlated reply.
    ///
    /// Suspends the caller until the owning client replies or the
    /// connection dies; there is deliberately no per-call timeout, the
    /// HTTP caller's own timeout bounds worst-case latency.
    pub async fn forward(
        &self,
        connection: &Connection,
        request: SerializedRequest,
    ) -> Result<ReplyOutcome, RpcFailure> {
        let id = CallId::new();
        let (resolver, settled) = oneshot::channel();
        let _ = self.pending.insert(
            id.clone(),
            PendingCall {
                owner: connection.id.clone(),
                resolver,
            },
        );

        let delivered = connection.send(ServerMessage::ForwardRequest {
            id: id.clone(),
            request,
        });
        if !delivered {
            let _ = self.pending.remove(&id);
            return Err(RpcFailure::ConnectionClosed);
        }

        tracing::debug!(call_id = %id, connection_id = %connection.id, "request forwarded");
        match settled.await {
            Ok(outcome) => outcome,
            // Resolver dropped without settling; only happens if the
            // pending entry was torn down outside resolve/fail paths.
            Err(_) => Err(RpcFailure::ConnectionClosed),
        }
    }

    /// Settle a pending call with the client's reply. A reply for an
    /// already-settled (or never-known) call id is discarded without
    /// effect. Returns whether a call was actually settled.
    pub fn resolve(&self, id: &CallId, outcome: ReplyOutcome) -> bool {
        match self.pending.remove(id) {
            Some((_, call)) => {
                let _ = call.resolver.send(Ok(outcome));
                true
            }
            None => {
                tracing::debug!(call_id = %id, "late reply discarded");
                false
            }
        }
    }

    /// Reject every pending call owned by a connection that just died.
    /// Returns how many calls were rejected.
    pub fn fail_connection(&self, connection_id: &ConnectionId) -> usize {
        let owned: Vec<CallId> = self
            .pending
            .iter()
            .filter(|entry| entry.value().owner == *connection_id)
            .map(|entry| entry.key().clone())
            .collect();

        let mut rejected = 0;
        for id in owned {
            if let Some((_, call)) = self.pending.remove(&id) {
                let _ = call.resolver.send(Err(RpcFailure::ConnectionClosed));
                rejected += 1;
            }
        }
        if rejected > 0 {
            tracing::debug!(
                connection_id = %connection_id,
                rejected,
                "pending calls rejected on connection close"
            );
        }
        rejected
    }

    /// Number of in-flight calls.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

impl Default for RpcCorrelator {
    fn default() -> Self {
        Self::new()
    }
}
