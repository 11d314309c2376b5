//! Token store error types.

use std::path::PathBuf;

/// Errors from token store maintenance operations (`create`, `list`,
/// `remove`).
#[derive(Debug, thiserror::Error)]
pub enum TokenStoreError {
    /// The supplied id is not a well-formed token id.
    #[error("invalid token id")]
    InvalidId,

    /// No token file exists for the given id.
    #[error("no token found with id: {id}")]
    NotFound {
        /// The id that was looked up.
        id: String,
    },

    /// A token file exists but does not parse or validate.
    #[error("malformed token file {}: {detail}", path.display())]
    MalformedFile {
        /// The offending file.
        path: PathBuf,
        /// What failed to parse or validate.
        detail: String,
    },

    /// File I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error while writing a token file.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Why a candidate token value was rejected. Internal detail: callers of
/// [`crate::verify`] only ever see the uniform [`InvalidToken`] outcome;
/// the reason exists for server-side logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The candidate value does not have the expected total length.
    BadLength,
    /// The candidate value contains non-hex characters.
    BadEncoding,
    /// No token is stored under the decoded id.
    UnknownId,
    /// The token file could not be read or parsed.
    Unreadable,
    /// The recomputed hash does not match the stored hash.
    HashMismatch,
}

impl RejectReason {
    /// Short classification string for logging.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BadLength => "bad_length",
            Self::BadEncoding => "bad_encoding",
            Self::UnknownId => "unknown_id",
            Self::Unreadable => "unreadable",
            Self::HashMismatch => "hash_mismatch",
        }
    }
}

/// Uniform verification failure. Every rejection cause maps to this one
/// outcome so callers cannot distinguish an unknown id from a wrong
/// secret; the underlying [`RejectReason`] stays available for logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid token")]
pub struct InvalidToken {
    reason: RejectReason,
}

impl InvalidToken {
    pub(crate) fn new(reason: RejectReason) -> Self {
        Self { reason }
    }

    /// The internal rejection cause, for logging only.
    pub fn reason(&self) -> RejectReason {
        self.reason
    }
}
