//! Data models exchanged with the dispatch backend's identity service.
//!
//! - `User`: the authenticated caller's profile returned by `/auth/me/`
//! - `LoginRequest`, `RefreshRequest`, `TokenResponse`: auth endpoint payloads

pub mod auth;
pub mod user;

pub use auth::{LoginRequest, RefreshRequest, TokenResponse};
pub use user::User;
