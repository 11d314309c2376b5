//! # remock-tokens
//!
//! Interceptor token persistence and verification.
//!
//! A tokens directory holds one JSON file per token, named by the token's
//! 16-hex-char id, plus a `.gitignore` so the directory is never committed
//! by accident. Secrets are never stored: only a salted PBKDF2-HMAC-SHA512
//! hash is persisted, and the plaintext token value is returned exactly
//! once from [`create`].

#![deny(unsafe_code)]

pub mod errors;
pub mod store;

pub use errors::{InvalidToken, RejectReason, TokenStoreError};
pub use store::{
    CreatedToken, SECRET_BYTES, TOKEN_VALUE_LEN, TokenListing, TokenRecord, create, list, remove,
    verify,
};
