//! Provider-facing client.
//!
//! [`BillingApi`] is the narrow capability the executor depends on: list one
//! page of one resource kind. [`StripeClient`] implements it against the
//! Stripe REST API with `reqwest`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;
use zeroize::Zeroizing;

use crate::config::{ConnectionConfig, RequestParams};
use crate::error::{FetchError, ProviderError};
use crate::resource::ResourceKind;

pub const DEFAULT_API_BASE_URL: &str = "https://api.stripe.com";

/// One page of raw provider records.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawPage {
    pub records: Vec<Value>,
    pub next_cursor: Option<String>,
    pub has_more: bool
}

#[async_trait]
pub trait BillingApi: Send + Sync {
    /// Lists the page of `kind` that follows `cursor` (first page when `None`).
    async fn list_page(
        &self,
        kind: ResourceKind,
        cursor: Option<&str>,
        params: &RequestParams
    ) -> Result<RawPage, ProviderError>;
}

/// Creates clients bound to the credential of a connection config.
pub trait ClientFactory: Send + Sync {
    fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn BillingApi>, FetchError>;
}

pub struct StripeClient {
    client: Client,
    base_url: String,
    timeout: Duration
}

impl StripeClient {
    pub fn new(
        config: &ConnectionConfig,
        base_url: impl Into<String>,
        timeout: Duration
    ) -> Result<Self, FetchError> {
        let bearer = Zeroizing::new(format!("Bearer {}", config.credential().expose_secret()));
        let mut auth = HeaderValue::from_str(&bearer).map_err(|_| FetchError::ClientInit {
            message: "credential is not a valid header value".to_string()
        })?;
        auth.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);

        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .user_agent(concat!("stripe-fetcher/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FetchError::ClientInit {
                message: e.to_string()
            })?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout
        })
    }

    fn transport_error(&self, err: &reqwest::Error) -> ProviderError {
        if err.is_timeout() {
            ProviderError::Timeout {
                timeout_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX)
            }
        } else if err.is_decode() {
            ProviderError::MalformedResponse {
                message: err.to_string()
            }
        } else {
            ProviderError::Connection {
                message: err.to_string()
            }
        }
    }
}

#[async_trait]
impl BillingApi for StripeClient {
    async fn list_page(
        &self,
        kind: ResourceKind,
        cursor: Option<&str>,
        params: &RequestParams
    ) -> Result<RawPage, ProviderError> {
        let url = format!("{}{}", self.base_url, kind.list_path());

        let mut query: Vec<(&str, String)> = vec![("limit", params.page_size().to_string())];
        if let Some(cursor) = cursor {
            query.push(("starting_after", cursor.to_string()));
        }
        for field in &params.expand {
            query.push(("expand[]", field.clone()));
        }
        for (key, value) in params.query_filters() {
            query.push((key, value.to_string()));
        }

        let mut request = self.client.get(&url).query(&query);
        if let Some(account) = &params.stripe_account {
            request = request.header("Stripe-Account", account);
        }
        if let Some(version) = &params.stripe_version {
            request = request.header("Stripe-Version", version);
        }

        debug!(url = %url, resource = %kind, cursor = ?cursor, "Making Stripe API request");

        let response = request
            .send()
            .await
            .map_err(|e| self.transport_error(&e))?;
        let status = response.status();

        if status.is_success() {
            let body = response
                .bytes()
                .await
                .map_err(|e| self.transport_error(&e))?;
            let list: StripeList =
                serde_json::from_slice(&body).map_err(|e| ProviderError::MalformedResponse {
                    message: e.to_string()
                })?;
            return Ok(list.into_page());
        }

        let should_retry = header_str(response.headers(), "stripe-should-retry")
            .is_some_and(|v| v.eq_ignore_ascii_case("true"));
        let retry_after =
            header_str(response.headers(), "retry-after").and_then(|v| v.parse::<u64>().ok());
        let body = response.text().await.unwrap_or_default();

        Err(classify_status(
            status,
            error_message(&body),
            should_retry,
            retry_after
        ))
    }
}

/// Builds [`StripeClient`]s against a fixed API base URL.
#[derive(Debug, Clone)]
pub struct StripeClientFactory {
    base_url: String,
    request_timeout: Duration
}

impl Default for StripeClientFactory {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_BASE_URL.to_string(),
            request_timeout: Duration::from_secs(30)
        }
    }
}

impl StripeClientFactory {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Self {
        Self {
            base_url: base_url.into(),
            request_timeout
        }
    }

    /// Reads `STRIPE_API_BASE_URL` (default: https://api.stripe.com).
    #[must_use]
    pub fn from_env(request_timeout: Duration) -> Self {
        let base_url = std::env::var("STRIPE_API_BASE_URL")
            .unwrap_or_else(|_| DEFAULT_API_BASE_URL.to_string());
        Self::new(base_url, request_timeout)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

impl ClientFactory for StripeClientFactory {
    fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn BillingApi>, FetchError> {
        Ok(Box::new(StripeClient::new(
            config,
            self.base_url.clone(),
            self.request_timeout
        )?))
    }
}

/// Maps a non-success status to its error class.
pub fn classify_status(
    status: StatusCode,
    message: String,
    should_retry: bool,
    retry_after_seconds: Option<u64>
) -> ProviderError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited {
            retry_after_seconds
        },
        s if s.is_server_error() || should_retry => ProviderError::Unavailable {
            status: s.as_u16(),
            message
        },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProviderError::Unauthorized { message },
        StatusCode::NOT_FOUND => ProviderError::NotFound { message },
        s => ProviderError::BadRequest {
            status: s.as_u16(),
            message
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim)
}

fn error_message(body: &str) -> String {
    serde_json::from_str::<StripeErrorBody>(body)
        .ok()
        .and_then(|b| b.error.message)
        .unwrap_or_else(|| body.to_string())
}

#[derive(Debug, Deserialize)]
struct StripeList {
    data: Vec<Value>,
    #[serde(default)]
    has_more: bool
}

impl StripeList {
    fn into_page(self) -> RawPage {
        // Stripe paginates with `starting_after=<id of last object>`.
        let next_cursor = if self.has_more {
            self.data
                .last()
                .and_then(|record| record.get("id"))
                .and_then(Value::as_str)
                .map(ToString::to_string)
        } else {
            None
        };

        RawPage {
            records: self.data,
            next_cursor,
            has_more: self.has_more
        }
    }
}

#[derive(Debug, Deserialize)]
struct StripeErrorBody {
    error: StripeErrorDetail
}

#[derive(Debug, Deserialize)]
struct StripeErrorDetail {
    message: Option<String>
}
