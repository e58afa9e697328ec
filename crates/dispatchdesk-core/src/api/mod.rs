//! Authenticated access to the dispatch backend's REST API.
//!
//! Resource clients (orders, vehicles, trip sheets) go through `ApiClient`,
//! which attaches the bearer token and handles a 401 by refreshing once.

pub mod client;
pub mod error;
pub mod request;

pub use client::ApiClient;
pub(crate) use client::parse_json;
pub use error::ApiError;
pub use request::ApiRequest;
