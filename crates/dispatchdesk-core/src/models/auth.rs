use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
pub struct LoginRequest<'a> {
    pub username: &'a str,
    pub password: &'a str,
}

/// Body of `/auth/refresh/`.
///
/// With cookie transport the refresh credential travels in the cookie jar
/// and the body is an empty object.
#[derive(Debug, Default, Serialize)]
pub struct RefreshRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<&'a str>,
}

/// Successful response of `/auth/login/` and `/auth/refresh/`.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

impl TokenResponse {
    /// The rotated refresh credential, if the server issued a usable one.
    pub fn refresh_token(&self) -> Option<&str> {
        self.refresh_token.as_deref().filter(|t| !t.is_empty())
    }
}
