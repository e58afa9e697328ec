//! Authenticated request wrapper used by every resource client.
//!
//! `ApiClient::call` attaches the current access token, and on a 401 joins
//! the session's single refresh and replays the request once.

use reqwest::{Response, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use super::{ApiError, ApiRequest};
use crate::auth::SessionClient;

/// Entry point for protected endpoints.
/// Clone is cheap - the session handle is reference counted.
#[derive(Clone)]
pub struct ApiClient {
    session: SessionClient,
}

impl ApiClient {
    pub fn new(session: SessionClient) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &SessionClient {
        &self.session
    }

    /// Issue `request`, refreshing the access token and retrying at most once
    /// if the server answers 401.
    ///
    /// Success statuses return the response. Any other status except 401 is
    /// returned as `ApiError::Upstream` untouched.
    pub async fn call(&self, request: &ApiRequest) -> Result<Response, ApiError> {
        let token = self
            .session
            .credentials()
            .await?
            .access_token()
            .map(str::to_string);

        let response = self.send(request, token.as_deref()).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Self::check_response(response).await;
        }

        debug!(method = %request.method(), path = request.path(), "Unauthorized, refreshing access token");
        let renewed = self.session.refresh_after(token.as_deref()).await?;

        let response = self.send(request, Some(&renewed)).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            warn!(method = %request.method(), path = request.path(), "Retry rejected after refresh");
            self.session.expire_rejected(&renewed).await;
            return Err(ApiError::SessionExpired);
        }
        Self::check_response(response).await
    }

    async fn send(&self, request: &ApiRequest, token: Option<&str>) -> Result<Response, ApiError> {
        let url = self.session.url(request.path());
        debug!(method = %request.method(), url = %url, authenticated = token.is_some(), "Sending request");
        let response = request
            .build(self.session.http(), url, token)
            .send()
            .await?;
        Ok(response)
    }

    /// Check if response is successful, returning an error with body if not.
    async fn check_response(response: Response) -> Result<Response, ApiError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    // ===== Typed helpers =====

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let response = self.call(&ApiRequest::get(path)).await?;
        parse_json(response).await
    }

    pub async fn post<T: DeserializeOwned, B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<T, ApiError> {
        let response = self.call(&ApiRequest::post(path).json(body)?).await?;
        parse_json(response).await
    }

    pub async fn put<T: DeserializeOwned, B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<T, ApiError> {
        let response = self.call(&ApiRequest::put(path).json(body)?).await?;
        parse_json(response).await
    }

    pub async fn patch<T: DeserializeOwned, B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<T, ApiError> {
        let response = self.call(&ApiRequest::patch(path).json(body)?).await?;
        parse_json(response).await
    }

    pub async fn delete(&self, path: &str) -> Result<(), ApiError> {
        self.call(&ApiRequest::delete(path)).await?;
        Ok(())
    }
}

/// Read a JSON body, reporting malformed payloads as `InvalidResponse`
/// rather than as a network failure.
pub(crate) async fn parse_json<T: DeserializeOwned>(response: Response) -> Result<T, ApiError> {
    let url = response.url().path().to_string();
    let text = response.text().await?;
    serde_json::from_str(&text)
        .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse JSON from {}: {}", url, e)))
}
