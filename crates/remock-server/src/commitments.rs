//! The handler table: `(method, URL pattern) → owning connection`.

use parking_lot::Mutex;
use remock_core::ConnectionId;

/// A registered handler mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commitment {
    /// The connection that owns the handler.
    pub connection_id: ConnectionId,
    /// HTTP method, uppercase.
    pub method: String,
    /// URL pattern; segments starting with `:` match any single non-empty
    /// path segment.
    pub url_pattern: String,
    /// Registration sequence; higher means more recently committed.
    seq: u64,
}

#[derive(Default)]
struct Inner {
    commitments: Vec<Commitment>,
    next_seq: u64,
}

/// Shared table of commitments.
///
/// Commits, uncommits, and lookups originate from different concurrent
/// connections, so every access goes through one mutex.
pub struct CommitmentTable {
    inner: Mutex<Inner>,
}

impl CommitmentTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Insert a commitment. Re-committing an identical `(connection,
    /// method, pattern)` triple refreshes its recency instead of
    /// duplicating it.
    pub fn commit(&self, connection_id: &ConnectionId, method: &str, url_pattern: &str) {
        let method = method.to_ascii_uppercase();
        let mut inner = self.inner.lock();
        inner.commitments.retain(|c| {
            !(c.connection_id == *connection_id
                && c.method == method
                && c.url_pattern == url_pattern)
        });
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.commitments.push(Commitment {
            connection_id: connection_id.clone(),
            method,
            url_pattern: url_pattern.to_owned(),
            seq,
        });
    }

    /// Remove the connection's commitments matching the given filters.
    /// Omitted filters match everything, so calling with neither removes
    /// every commitment the connection owns. Removing nothing is a no-op,
    /// not an error. Returns how many mappings were removed.
    pub fn uncommit(
        &self,
        connection_id: &ConnectionId,
        method: Option<&str>,
        url_pattern: Option<&str>,
    ) -> usize {
        let method = method.map(str::to_ascii_uppercase);
        let mut inner = self.inner.lock();
        let before = inner.commitments.len();
        inner.commitments.retain(|c| {
            !(c.connection_id == *connection_id
                && method.as_deref().is_none_or(|m| c.method == m)
                && url_pattern.is_none_or(|u| c.url_pattern == u))
        });
        before - inner.commitments.len()
    }

    /// Resolve a concrete `(method, url)` to the owning connection.
    ///
    /// Precedence: an exact literal pattern wins over any dynamic pattern;
    /// among matching dynamic patterns, the most recently committed wins.
    /// `None` means the request is unhandled.
    pub fn matching(&self, method: &str, url: &str) -> Option<ConnectionId> {
        let method = method.to_ascii_uppercase();
        let inner = self.inner.lock();
        let candidates = inner.commitments.iter().filter(|c| c.method == method);

        let mut literal: Option<&Commitment> = None;
        let mut dynamic: Option<&Commitment> = None;
        for c in candidates {
            if is_dynamic(&c.url_pattern) {
                if segments_match(&c.url_pattern, url)
                    && dynamic.is_none_or(|best| c.seq > best.seq)
                {
                    dynamic = Some(c);
                }
            } else if c.url_pattern == url {
                literal = Some(c);
            }
        }
        literal.or(dynamic).map(|c| c.connection_id.clone())
    }

    /// Number of registered commitments.
    pub fn count(&self) -> usize {
        self.inner.lock().commitments.len()
    }
}

impl Default for CommitmentTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether a pattern contains any `:param` segment.
fn is_dynamic(pattern: &str) -> bool {
    pattern.split('/').any(|seg| seg.starts_with(':'))
}

/// Segment-wise dynamic match: equal segment counts, `:seg` matches any
/// single non-empty segment, everything else matches literally.
fn segments_match(pattern: &str, url: &str) -> bool {
    let pattern_segs: Vec<&str> = pattern.split('/').collect();
    let url_segs: Vec<&str> = url.split('/').collect();
    if pattern_segs.len() != url_segs.len() {
        return false;
    }
    pattern_segs
        .iter()
        .zip(&url_segs)
        .all(|(p, u)| if p.starts_with(':') { !u.is_empty() } else { p == u })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> ConnectionId {
        ConnectionId::new()
    }

    #[test]
    fn literal_match() {
        let table = CommitmentTable::new();
        let owner = conn();
        table.commit(&owner, "GET", "/users");

        assert_eq!(table.matching("GET", "/users"), Some(owner));
        assert_eq!(table.matching("GET", "/orders"), None);
        assert_eq!(table.matching("POST", "/users"), None);
    }

    #[test]
    fn method_is_case_insensitive() {
        let table = CommitmentTable::new();
        let owner = conn();
        table.commit(&owner, "get", "/users");
        assert_eq!(table.matching("GET", "/users"), Some(owner));
    }

    #[test]
    fn dynamic_segment_semantics() {
        let table = CommitmentTable::new();
        let owner = conn();
        table.commit(&owner, "GET", "/users/:id");

        assert_eq!(table.matching("GET", "/users/1"), Some(owner.clone()));
        assert_eq!(table.matching("GET", "/users/2"), Some(owner));
        assert_eq!(table.matching("GET", "/users"), None);
        assert_eq!(table.matching("GET", "/users/1/posts"), None);
        // a dynamic segment never matches an empty segment
        assert_eq!(table.matching("GET", "/users/"), None);
    }

    #[test]
    fn literal_beats_dynamic() {
        let table = CommitmentTable::new();
        let dynamic_owner = conn();
        let literal_owner = conn();
        table.commit(&dynamic_owner, "GET", "/users/:id");
        table.commit(&literal_owner, "GET", "/users/1");

        assert_eq!(table.matching("GET", "/users/1"), Some(literal_owner));
        assert_eq!(table.matching("GET", "/users/2"), Some(dynamic_owner));
    }

    #[test]
    fn latest_dynamic_wins() {
        let table = CommitmentTable::new();
        let first = conn();
        let second = conn();
        table.commit(&first, "GET", "/users/:id");
        table.commit(&second, "GET", "/:resource/1");

        // both match /users/1; the later commit wins
        assert_eq!(table.matching("GET", "/users/1"), Some(second.clone()));

        // re-committing refreshes recency
        table.commit(&first, "GET", "/users/:id");
        assert_eq!(table.matching("GET", "/users/1"), Some(first));
    }

    #[test]
    fn uncommit_specific_mapping() {
        let table = CommitmentTable::new();
        let owner = conn();
        table.commit(&owner, "GET", "/users");
        table.commit(&owner, "GET", "/orders");

        assert_eq!(table.uncommit(&owner, Some("GET"), Some("/users")), 1);
        assert_eq!(table.matching("GET", "/users"), None);
        assert_eq!(table.matching("GET", "/orders"), Some(owner));
    }

    #[test]
    fn uncommit_all_for_connection() {
        let table = CommitmentTable::new();
        let owner = conn();
        let other = conn();
        table.commit(&owner, "GET", "/users");
        table.commit(&owner, "POST", "/users");
        table.commit(&other, "GET", "/orders");

        assert_eq!(table.uncommit(&owner, None, None), 2);
        assert_eq!(table.count(), 1);
        assert_eq!(table.matching("GET", "/orders"), Some(other));
    }

    #[test]
    fn uncommit_by_method_only() {
        let table = CommitmentTable::new();
        let owner = conn();
        table.commit(&owner, "GET", "/users");
        table.commit(&owner, "GET", "/orders");
        table.commit(&owner, "POST", "/users");

        assert_eq!(table.uncommit(&owner, Some("GET"), None), 2);
        assert_eq!(table.matching("POST", "/users"), Some(owner));
    }

    #[test]
    fn uncommit_missing_mapping_is_noop() {
        let table = CommitmentTable::new();
        let owner = conn();
        assert_eq!(table.uncommit(&owner, Some("GET"), Some("/nothing")), 0);
        assert_eq!(table.uncommit(&owner, None, None), 0);
    }

    #[test]
    fn uncommit_only_touches_own_connection() {
        let table = CommitmentTable::new();
        let owner = conn();
        let other = conn();
        table.commit(&owner, "GET", "/users");
        table.commit(&other, "GET", "/users");

        assert_eq!(table.uncommit(&owner, None, None), 1);
        assert_eq!(table.matching("GET", "/users"), Some(other));
    }

    #[test]
    fn overlapping_patterns_per_method_allowed() {
        let table = CommitmentTable::new();
        let owner = conn();
        table.commit(&owner, "GET", "/users/:id");
        table.commit(&owner, "GET", "/users/me");
        assert_eq!(table.count(), 2);
        assert_eq!(table.matching("GET", "/users/me"), Some(owner.clone()));
        assert_eq!(table.matching("GET", "/users/7"), Some(owner));
    }
}
