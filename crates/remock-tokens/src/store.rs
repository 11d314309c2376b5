//! Token store file I/O and verification.
//!
//! Layout: `<dir>/.gitignore` (a single `*` line) plus one JSON file per
//! token named by the token id. The directory is created `0o700` and token
//! files `0o600`.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha512;

use crate::errors::{InvalidToken, RejectReason, TokenStoreError};

/// Random bytes in a token id (16 hex chars on disk and on the wire).
pub const TOKEN_ID_BYTES: usize = 8;
/// Hex length of a token id.
pub const TOKEN_ID_LEN: usize = TOKEN_ID_BYTES * 2;
/// Default random bytes in a token secret.
pub const SECRET_BYTES: usize = 32;
/// Exact length of the opaque token value handed to clients
/// (`id_hex ++ secret_hex`).
pub const TOKEN_VALUE_LEN: usize = TOKEN_ID_LEN + SECRET_BYTES * 2;

/// Supported token file format version. The KDF parameters below are fixed
/// by this version; changing them requires a version bump.
pub const TOKEN_FILE_VERSION: u32 = 1;

const SALT_BYTES: usize = 16;
const HASH_BYTES: usize = 64; // SHA-512 output
const PBKDF2_ITERATIONS: u32 = 120_000;
const IGNORE_FILE: &str = ".gitignore";
const ID_COLLISION_ATTEMPTS: u32 = 16;

/// On-disk envelope: `{"version": 1, "token": {...}}`.
#[derive(Debug, Serialize, Deserialize)]
struct TokenFile {
    version: u32,
    token: TokenRecord,
}

/// A persisted token. The secret itself is never stored, only its salted
/// hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    /// Token id, 16 lowercase hex chars; also the file name.
    pub id: String,
    /// Hex-encoded PBKDF2-HMAC-SHA512 hash of the secret.
    pub hash: String,
    /// Hex-encoded random salt.
    pub salt: String,
    /// Optional human-readable label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Creation timestamp.
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

/// The result of [`create`]: the only moment the plaintext value exists.
#[derive(Debug, Clone)]
pub struct CreatedToken {
    /// Token id.
    pub id: String,
    /// The opaque value to hand to interceptor clients. Not retrievable
    /// again; only its hash is persisted.
    pub value: String,
    /// Optional label.
    pub name: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// Result of [`list`]: valid tokens plus files that failed validation.
#[derive(Debug, Default)]
pub struct TokenListing {
    /// Tokens that parsed and validated, ordered by creation time.
    pub tokens: Vec<TokenRecord>,
    /// Files that were skipped, with the validation detail.
    pub skipped: Vec<SkippedFile>,
}

/// A directory entry that could not be read as a token.
#[derive(Debug)]
pub struct SkippedFile {
    /// The offending file.
    pub path: PathBuf,
    /// Why it was skipped.
    pub detail: String,
}

/// Create a new token in `dir`, creating the directory (and its
/// `.gitignore`) if absent. Returns the plaintext value exactly once.
///
/// `secret_len` is the secret size in bytes; [`SECRET_BYTES`] is the
/// default and the only length [`verify`]'s fixed-length gate accepts.
pub fn create(
    name: Option<&str>,
    secret_len: usize,
    dir: &Path,
) -> Result<CreatedToken, TokenStoreError> {
    ensure_dir(dir)?;

    let mut rng = rand::rng();

    // Token ids are unique within a directory; regenerate on the rare
    // collision with an existing file.
    let (id, path) = {
        let mut attempt = 0;
        loop {
            let mut id_bytes = [0u8; TOKEN_ID_BYTES];
            rng.fill_bytes(&mut id_bytes);
            let id = hex::encode(id_bytes);
            let path = dir.join(&id);
            if !path.exists() {
                break (id, path);
            }
            attempt += 1;
            if attempt >= ID_COLLISION_ATTEMPTS {
                return Err(TokenStoreError::Io(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    "could not generate a unique token id",
                )));
            }
        }
    };

    let mut secret = vec![0u8; secret_len];
    rng.fill_bytes(&mut secret);
    let secret_hex = hex::encode(secret);

    let mut salt = [0u8; SALT_BYTES];
    rng.fill_bytes(&mut salt);

    let created_at = Utc::now();
    let record = TokenRecord {
        id: id.clone(),
        hash: derive_hash(&secret_hex, &salt),
        salt: hex::encode(salt),
        name: name.map(ToOwned::to_owned),
        created_at,
    };

    let file = TokenFile {
        version: TOKEN_FILE_VERSION,
        token: record,
    };
    let json = serde_json::to_string_pretty(&file)?;
    fs::write(&path, &json)?;
    restrict_file(&path);

    tracing::info!(token_id = %id, dir = %dir.display(), "interceptor token created");

    Ok(CreatedToken {
        value: format!("{id}{secret_hex}"),
        id,
        name: name.map(ToOwned::to_owned),
        created_at,
    })
}

/// List every token in `dir`. Malformed files are collected as skipped
/// entries without aborting the listing; a missing directory lists empty.
pub fn list(dir: &Path) -> Result<TokenListing, TokenStoreError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(TokenListing::default()),
        Err(e) => return Err(e.into()),
    };

    let mut listing = TokenListing::default();
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            listing.skipped.push(SkippedFile {
                path,
                detail: "file name is not valid UTF-8".into(),
            });
            continue;
        };
        if file_name == IGNORE_FILE {
            continue;
        }
        if !is_valid_id(file_name) {
            listing.skipped.push(SkippedFile {
                path,
                detail: "file name is not a token id".into(),
            });
            continue;
        }
        match read_record(dir, file_name) {
            Ok(record) => listing.tokens.push(record),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping malformed token file");
                listing.skipped.push(SkippedFile {
                    path,
                    detail: e.to_string(),
                });
            }
        }
    }

    listing.tokens.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    Ok(listing)
}

/// Remove the token named `id` from `dir`. A missing file is the distinct
/// [`TokenStoreError::NotFound`] condition.
pub fn remove(id: &str, dir: &Path) -> Result<(), TokenStoreError> {
    if !is_valid_id(id) {
        return Err(TokenStoreError::InvalidId);
    }
    match fs::remove_file(dir.join(id)) {
        Ok(()) => {
            tracing::info!(token_id = %id, "interceptor token removed");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(TokenStoreError::NotFound { id: id.to_owned() })
        }
        Err(e) => Err(e.into()),
    }
}

/// Verify a candidate token value against `dir`.
///
/// The exact expected length is enforced before any disk I/O. Every
/// failure mode collapses into the uniform [`InvalidToken`] outcome; the
/// precise cause is retained on it for logging.
pub fn verify(value: &str, dir: &Path) -> Result<TokenRecord, InvalidToken> {
    if value.len() != TOKEN_VALUE_LEN {
        return Err(InvalidToken::new(RejectReason::BadLength));
    }
    if !value
        .bytes()
        .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    {
        return Err(InvalidToken::new(RejectReason::BadEncoding));
    }

    let (id, secret_hex) = value.split_at(TOKEN_ID_LEN);
    let record = read_record(dir, id).map_err(|e| match e {
        TokenStoreError::NotFound { .. } => InvalidToken::new(RejectReason::UnknownId),
        _ => InvalidToken::new(RejectReason::Unreadable),
    })?;

    // Salt hex is validated by read_record.
    let salt = hex::decode(&record.salt).map_err(|_| InvalidToken::new(RejectReason::Unreadable))?;
    if derive_hash(secret_hex, &salt) != record.hash {
        return Err(InvalidToken::new(RejectReason::HashMismatch));
    }
    Ok(record)
}

/// PBKDF2-HMAC-SHA512 over the ASCII hex of the secret. Iteration count
/// and digest are fixed by [`TOKEN_FILE_VERSION`].
fn derive_hash(secret_hex: &str, salt: &[u8]) -> String {
    let mut out = [0u8; HASH_BYTES];
    pbkdf2_hmac::<Sha512>(secret_hex.as_bytes(), salt, PBKDF2_ITERATIONS, &mut out);
    hex::encode(out)
}

fn is_valid_id(id: &str) -> bool {
    id.len() == TOKEN_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Read and validate a single token file.
fn read_record(dir: &Path, id: &str) -> Result<TokenRecord, TokenStoreError> {
    let path = dir.join(id);
    let data = match fs::read_to_string(&path) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(TokenStoreError::NotFound { id: id.to_owned() });
        }
        Err(e) => return Err(e.into()),
    };

    let file: TokenFile = serde_json::from_str(&data).map_err(|e| {
        TokenStoreError::MalformedFile {
            path: path.clone(),
            detail: e.to_string(),
        }
    })?;

    let malformed = |detail: &str| TokenStoreError::MalformedFile {
        path: path.clone(),
        detail: detail.to_owned(),
    };
    if file.version != TOKEN_FILE_VERSION {
        return Err(malformed(&format!(
            "unsupported version: {}",
            file.version
        )));
    }
    let token = file.token;
    if token.id != id {
        return Err(malformed("token id does not match file name"));
    }
    if hex::decode(&token.hash).map_or(true, |h| h.len() != HASH_BYTES) {
        return Err(malformed("hash is not valid hex"));
    }
    if hex::decode(&token.salt).map_or(true, |s| s.len() != SALT_BYTES) {
        return Err(malformed("salt is not valid hex"));
    }
    Ok(token)
}

/// Create `dir` (restricted to the owner) and its `.gitignore` if absent.
fn ensure_dir(dir: &Path) -> Result<(), TokenStoreError> {
    fs::create_dir_all(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = fs::Permissions::from_mode(0o700);
        let _ = fs::set_permissions(dir, perms);
    }
    let ignore = dir.join(IGNORE_FILE);
    if !ignore.exists() {
        fs::write(&ignore, "*\n")?;
    }
    Ok(())
}

/// Restrict a token file to owner read/write.
fn restrict_file(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = fs::Permissions::from_mode(0o600);
        let _ = fs::set_permissions(path, perms);
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
}
