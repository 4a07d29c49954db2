//! Authenticated HTTP client for the license dashboard API
//!
//! Every request carries a valid access token from the session manager.
//! A 401 forces one refresh and one retry.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::{AbortHandle, Aborted};
use serde_json::Value as JsonValue;

use crate::auth::{RefreshError, SessionManager};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not signed in")]
    NotAuthenticated,
    #[error("session could not be refreshed: {0}")]
    Session(#[from] RefreshError),
    #[error("request {0} was cancelled")]
    Cancelled(String),
    #[error("request {0} is already in flight")]
    DuplicateRequest(String),
    #[error("request timed out")]
    Timeout,
    #[error("HTTP {status} for {url}: {body}")]
    Status { status: u16, url: String, body: String },
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    manager: Arc<SessionManager>,
    timeout: Duration,
    /// Request id to (registration serial, abort handle).
    in_flight: Mutex<HashMap<String, (u64, AbortHandle)>>,
    serial: AtomicU64,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, manager: Arc<SessionManager>, timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            manager,
            timeout,
            in_flight: Mutex::new(HashMap::new()),
            serial: AtomicU64::new(0),
        }
    }

    /// Fresh request id for [`Self::get_json`].
    pub fn request_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    /// GET `path` and decode the JSON body. Cancellable through
    /// [`Self::cancel`] with the same `request_id`, which must not belong to
    /// another outstanding request.
    ///
    /// The timeout covers the whole exchange, retry and body included.
    pub async fn get_json(&self, request_id: &str, path: &str) -> Result<JsonValue, ApiError> {
        let request = tokio::time::timeout(self.timeout, self.get_with_retry(path));
        let (request, handle) = futures::future::abortable(request);
        let serial = self.serial.fetch_add(1, Ordering::Relaxed);
        match self.requests().entry(request_id.to_string()) {
            Entry::Occupied(_) => {
                tracing::warn!("Request id {} is already in use", request_id);
                return Err(ApiError::DuplicateRequest(request_id.to_string()));
            }
            Entry::Vacant(slot) => {
                slot.insert((serial, handle));
            }
        }

        let outcome = request.await;
        {
            let mut requests = self.requests();
            if requests.get(request_id).is_some_and(|(s, _)| *s == serial) {
                requests.remove(request_id);
            }
        }

        match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                tracing::warn!("Request {} timed out after {:?}", request_id, self.timeout);
                Err(ApiError::Timeout)
            }
            Err(Aborted) => {
                tracing::debug!("Request {} cancelled", request_id);
                Err(ApiError::Cancelled(request_id.to_string()))
            }
        }
    }

    /// Cancel an outstanding request. Returns false if it already finished.
    pub fn cancel(&self, request_id: &str) -> bool {
        match self.requests().remove(request_id) {
            Some((_, handle)) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub fn is_pending(&self, request_id: &str) -> bool {
        self.requests().contains_key(request_id)
    }

    fn requests(&self) -> std::sync::MutexGuard<'_, HashMap<String, (u64, AbortHandle)>> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn get_with_retry(&self, path: &str) -> Result<JsonValue, ApiError> {
        let url = format!("{}{}", self.base_url.trim_end_matches('/'), path);
        let token = self
            .manager
            .get_valid_access_token()
            .await
            .ok_or(ApiError::NotAuthenticated)?;

        let mut resp = self.send(&url, &token).await?;
        if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
            tracing::info!("401 for {}, refreshing token and retrying", url);
            let tokens = self.manager.refresh_access_token().await?;
            resp = self.send(&url, &tokens.access_token).await?;
        }

        let resp = check_response(resp, &url).await?;
        Ok(resp.json().await?)
    }

    async fn send(&self, url: &str, token: &str) -> Result<reqwest::Response, ApiError> {
        tracing::debug!("GET {}", url);
        Ok(self.http.get(url).bearer_auth(token).send().await?)
    }
}

/// Check HTTP response status code and return a clear error on failure.
async fn check_response(resp: reqwest::Response, url: &str) -> Result<reqwest::Response, ApiError> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(ApiError::Status {
            status: status.as_u16(),
            url: url.to_string(),
            body,
        });
    }
    Ok(resp)
}
