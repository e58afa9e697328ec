//! Authentication module for managing the client session.
//!
//! This module provides:
//! - `CredentialStore`: persistence for access/refresh tokens and the user
//!   profile (in-memory, file, or OS keychain)
//! - `SessionClient`: login, identity check, coalesced token refresh, logout

pub mod credentials;
pub mod session;

pub use credentials::{
    CredentialField, CredentialStore, Credentials, FileCredentialStore, KeyringCredentialStore,
    MemoryCredentialStore, StoreError, KEYRING_SERVICE,
};
pub use session::{SessionClient, SessionState, LOGIN_PATH, LOGOUT_PATH, ME_PATH, REFRESH_PATH};
