//! Core library for dispatchdesk.
//!
//! Holds the client session for the dispatch backend: credential storage,
//! the login/refresh/logout protocol, and the authenticated request wrapper
//! that resource clients call.

pub mod api;
pub mod auth;
pub mod config;
pub mod models;

pub use api::{ApiClient, ApiError, ApiRequest};
pub use auth::{CredentialStore, Credentials, SessionClient, SessionState};
pub use config::{Config, CredentialBackend, RefreshTransport};
pub use models::User;
