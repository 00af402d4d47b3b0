//! Admin dashboard API client.
//!
//! Authenticated JSON transport for the sync endpoints (datasets, heartbeat,
//! offline-order ingestion) plus the lightweight connectivity probe used to
//! decide whether a sync tick should run at all.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// Default timeout for API requests (30 seconds).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout used specifically for the lightweight connectivity probe.
const CONNECTIVITY_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ApiError {
    #[error("cannot reach admin dashboard: {0}")]
    Unreachable(String),

    #[error("request timed out")]
    Timeout,

    #[error("{message} (HTTP {status})")]
    Status {
        status: u16,
        message: String,
        body: Option<Value>,
    },

    #[error("invalid JSON from admin dashboard: {0}")]
    InvalidJson(String),

    #[error("request failed: {0}")]
    Request(String),
}

impl ApiError {
    /// Connect failures, timeouts, 5xx, 408 and 429 are retried on the next
    /// tick; everything else is permanent.
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::Unreachable(_) | ApiError::Timeout => true,
            ApiError::Status { status, .. } => *status >= 500 || matches!(*status, 408 | 429),
            ApiError::InvalidJson(_) | ApiError::Request(_) => false,
        }
    }

    pub fn is_auth_failure(&self) -> bool {
        matches!(self, ApiError::Status { status: 401 | 403, .. })
    }

    fn from_reqwest(url: &str, err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            return ApiError::Timeout;
        }
        if err.is_connect() {
            return ApiError::Unreachable(url.to_string());
        }
        if err.is_builder() {
            return ApiError::Request(format!("invalid admin dashboard URL: {url}"));
        }
        ApiError::Request(format!("network error communicating with {url}: {err}"))
    }

    /// Build a status error, keeping the JSON body (if any) for rejection
    /// classification further up.
    pub fn from_response(status: StatusCode, body_text: &str) -> Self {
        let body = serde_json::from_str::<Value>(body_text).ok();
        let message = body
            .as_ref()
            .and_then(|json| {
                json.get("error")
                    .or_else(|| json.get("message"))
                    .and_then(Value::as_str)
                    .map(ToString::to_string)
            })
            .unwrap_or_else(|| status_error(status));
        ApiError::Status {
            status: status.as_u16(),
            message,
            body,
        }
    }
}

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the admin dashboard URL:
/// - strip trailing slashes
/// - strip a trailing `/api` segment
/// - ensure a scheme is present (https, or http for localhost)
pub fn normalize_admin_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }
    if url.ends_with("/api") {
        url.truncate(url.len() - 4);
    }
    while url.ends_with('/') {
        url.pop();
    }

    url
}

fn decode_connection_string_payload(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if trimmed.starts_with('{') {
        return serde_json::from_str::<Value>(trimmed).ok();
    }

    let compact: String = trimmed.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.len() < 20 {
        return None;
    }

    let base64 = compact.replace('-', "+").replace('_', "/");
    let padded = format!(
        "{}{}",
        base64,
        "=".repeat((4usize.wrapping_sub(base64.len() % 4)) % 4)
    );
    let decoded = BASE64_STANDARD.decode(padded).ok()?;
    serde_json::from_slice::<Value>(&decoded).ok()
}

fn connection_string_field(raw: &str, keys: &[&str]) -> Option<String> {
    let payload = decode_connection_string_payload(raw)?;
    crate::value_str(&payload, keys)
}

pub fn extract_api_key_from_connection_string(raw: &str) -> Option<String> {
    connection_string_field(raw, &["key"])
}

pub fn extract_admin_url_from_connection_string(raw: &str) -> Option<String> {
    connection_string_field(raw, &["url"]).map(|url| normalize_admin_url(&url))
}

pub fn extract_terminal_id_from_connection_string(raw: &str) -> Option<String> {
    connection_string_field(raw, &["tid", "terminalId"])
}

/// Convert an HTTP status code into a user-friendly message.
fn status_error(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "API key is invalid or expired".to_string(),
        403 => "Terminal not authorized".to_string(),
        404 => "Admin dashboard endpoint not found".to_string(),
        429 => "Admin dashboard rate limit reached".to_string(),
        s if s >= 500 => format!("Admin dashboard server error (HTTP {s})"),
        s => format!("Unexpected response from admin dashboard (HTTP {s})"),
    }
}

// ---------------------------------------------------------------------------
// Transport seam
// ---------------------------------------------------------------------------

/// JSON transport used by dataset sync, heartbeat and ingestion.
#[async_trait]
pub trait SyncApi: Send + Sync {
    async fn post_json(&self, path: &str, body: &Value) -> Result<Value, ApiError>;

    /// Cheap reachability probe; never errors.
    async fn is_reachable(&self) -> bool;
}

/// Result of a connectivity test.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ConnectivityResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct AdminClient {
    http: Client,
    probe: Client,
    base_url: String,
    api_key: Zeroizing<String>,
    terminal_id: String,
}

impl AdminClient {
    /// `api_key` may be a raw key or a connection string; a terminal id
    /// embedded in the connection string wins over the stored one.
    pub fn new(
        admin_url: &str,
        api_key: &str,
        terminal_id: &str,
        timeout: Duration,
    ) -> Result<Self, ApiError> {
        let resolved_key = extract_api_key_from_connection_string(api_key)
            .unwrap_or_else(|| api_key.trim().to_string());

        let mut terminal_id = terminal_id.trim().to_string();
        if let Some(decoded) = extract_terminal_id_from_connection_string(api_key) {
            if !terminal_id.is_empty() && terminal_id != decoded {
                warn!(
                    stored_terminal_id = %crate::logging::mask_terminal_id(&terminal_id),
                    decoded_terminal_id = %crate::logging::mask_terminal_id(&decoded),
                    "terminal_id mismatch detected, preferring decoded terminal id from connection string"
                );
            }
            terminal_id = decoded;
        }

        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ApiError::Request(format!("failed to create HTTP client: {e}")))?;
        let probe = Client::builder()
            .timeout(CONNECTIVITY_TIMEOUT)
            .build()
            .map_err(|e| ApiError::Request(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            http,
            probe,
            base_url: normalize_admin_url(admin_url),
            api_key: Zeroizing::new(resolved_key),
            terminal_id,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn terminal_id(&self) -> &str {
        &self.terminal_id
    }

    /// Perform an authenticated request. `path` includes the leading slash.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, ApiError> {
        let full_url = format!("{}{path}", self.base_url);
        let mut req = self
            .http
            .request(method.clone(), &full_url)
            .header("X-POS-API-Key", self.api_key.as_str())
            .header("x-terminal-id", &self.terminal_id)
            .header("Content-Type", "application/json");
        if let Some(body) = body {
            req = req.json(body);
        }

        let started = Instant::now();
        let resp = req
            .send()
            .await
            .map_err(|e| ApiError::from_reqwest(&self.base_url, &e))?;
        let status = resp.status();
        let body_text = resp
            .text()
            .await
            .map_err(|e| ApiError::from_reqwest(&self.base_url, &e))?;
        debug!(
            %method,
            path,
            status = status.as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "admin request"
        );

        if !status.is_success() {
            let err = ApiError::from_response(status, &body_text);
            if err.is_auth_failure() {
                warn!(
                    path,
                    status = status.as_u16(),
                    "admin dashboard rejected terminal credentials"
                );
            }
            return Err(err);
        }

        // Empty 204 responses come back as null.
        if body_text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body_text).map_err(|e| ApiError::InvalidJson(e.to_string()))
    }

    /// Lightweight health check against `/api/health`.
    pub async fn check_connectivity(&self) -> ConnectivityResult {
        let health_url = format!("{}/api/health", self.base_url);
        let start = Instant::now();

        let resp = match self
            .probe
            .head(&health_url)
            .header("X-POS-API-Key", self.api_key.as_str())
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                return ConnectivityResult {
                    success: false,
                    latency_ms: None,
                    error: Some(ApiError::from_reqwest(&self.base_url, &e).to_string()),
                };
            }
        };

        let latency = start.elapsed().as_millis() as u64;
        let status = resp.status();
        if status.is_success() {
            debug!(latency_ms = latency, "connectivity probe passed");
            ConnectivityResult {
                success: true,
                latency_ms: Some(latency),
                error: None,
            }
        } else {
            info!(status = status.as_u16(), "connectivity probe failed");
            ConnectivityResult {
                success: false,
                latency_ms: Some(latency),
                error: Some(status_error(status)),
            }
        }
    }
}

#[async_trait]
impl SyncApi for AdminClient {
    async fn post_json(&self, path: &str, body: &Value) -> Result<Value, ApiError> {
        self.request(Method::POST, path, Some(body)).await
    }

    async fn is_reachable(&self) -> bool {
        self.check_connectivity().await.success
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_admin_url() {
        assert_eq!(normalize_admin_url("admin.example.com/api/"), "https://admin.example.com");
        assert_eq!(normalize_admin_url("localhost:3001"), "http://localhost:3001");
        assert_eq!(normalize_admin_url(" https://x.io// "), "https://x.io");
    }

    #[test]
    fn test_connection_string_fields() {
        let payload = json!({
            "url": "pos.example.com/api",
            "key": "secret-key",
            "tid": "term-0042",
        });
        let encoded = BASE64_STANDARD.encode(payload.to_string());

        assert_eq!(
            extract_api_key_from_connection_string(&encoded).as_deref(),
            Some("secret-key")
        );
        assert_eq!(
            extract_admin_url_from_connection_string(&encoded).as_deref(),
            Some("https://pos.example.com")
        );
        assert_eq!(
            extract_terminal_id_from_connection_string(&encoded).as_deref(),
            Some("term-0042")
        );
        assert_eq!(extract_api_key_from_connection_string("plain-key"), None);
    }

    #[test]
    fn test_error_classification() {
        let unavailable = ApiError::from_response(StatusCode::SERVICE_UNAVAILABLE, "");
        assert!(unavailable.is_transient());
        assert!(ApiError::from_response(StatusCode::TOO_MANY_REQUESTS, "").is_transient());

        let unauthorized = ApiError::from_response(StatusCode::UNAUTHORIZED, "");
        assert!(!unauthorized.is_transient());
        assert!(unauthorized.is_auth_failure());
        assert_eq!(unauthorized.to_string(), "API key is invalid or expired (HTTP 401)");

        let conflict = ApiError::from_response(
            StatusCode::CONFLICT,
            r#"{"error":"Only 1 left","code":"INSUFFICIENT_STOCK"}"#,
        );
        match conflict {
            ApiError::Status { status, message, body } => {
                assert_eq!(status, 409);
                assert_eq!(message, "Only 1 left");
                assert_eq!(body.expect("json body")["code"], "INSUFFICIENT_STOCK");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_client_prefers_terminal_id_from_connection_string() {
        let payload = json!({
            "url": "pos.example.com",
            "key": "k-123",
            "tid": "term-from-string",
        });
        let encoded = BASE64_STANDARD.encode(payload.to_string());
        let client =
            AdminClient::new("pos.example.com", &encoded, "term-stored", DEFAULT_TIMEOUT).unwrap();
        assert_eq!(client.terminal_id(), "term-from-string");
        assert_eq!(client.base_url(), "https://pos.example.com");
        assert_eq!(client.api_key.as_str(), "k-123");
    }
}
