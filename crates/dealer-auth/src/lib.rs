//! Credential handling for the dealer API client
//!
//! Holds the access/refresh credential pair, persists it through a pluggable
//! key-value backend, and performs the refresh-token exchange against the
//! auth server. This crate knows nothing about retries or request
//! coordination; `dealer-client` builds those on top.
//!
//! Credential flow:
//! 1. Login stores a pair via `CredentialStore::set()`
//! 2. The request pipeline reads it via `CredentialStore::get()` before each send
//! 3. On expiry the refresh coordinator calls `token::refresh_credentials()`
//! 4. The new pair replaces the old one atomically; failure calls `clear()`

pub mod constants;
pub mod credentials;
pub mod error;
pub mod kv;
pub mod token;

pub use constants::*;
pub use credentials::{CredentialPair, CredentialStore, now_millis};
pub use error::{Error, Result};
pub use kv::{FileKeyValueStore, KeyValueStore, MemoryKeyValueStore};
pub use token::{TokenResponse, jwt_expiry_millis, refresh_credentials};
