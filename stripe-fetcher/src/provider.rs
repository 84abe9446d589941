//! OPAL-facing fetch provider.
//!
//! An OPAL client hands the provider a fetch event per data source entry:
//!
//! ```json
//! {
//!   "fetcher": "StripeFetchProvider",
//!   "url": "Subscription",
//!   "config": {
//!     "fetcher": "StripeFetchProvider",
//!     "connection_params": { "api_key": "sk_test_...", "max_network_retries": 3 },
//!     "request_params": { "expand": ["data.customer"] }
//!   }
//! }
//! ```
//!
//! The provider validates the connection parameters, fetches every page of the
//! resource named by `url`, and optionally folds the records into a
//! customer-keyed policy document.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::client::{ClientFactory, StripeClientFactory};
use crate::config::{ConfigValidator, ConnectionParams, FetchPolicy, RequestParams};
use crate::document::build_document;
use crate::error::{ConfigError, Result};
use crate::executor::{FetchExecutor, FetchRequest};
use crate::logging::{LogControl, NoopLogControl};
use crate::normalize::NormalizedRecord;
use crate::resource::ResourceKind;
use crate::telemetry::{MetricsTelemetrySink, TelemetrySink};

pub const FETCHER_NAME: &str = "StripeFetchProvider";

fn default_fetcher() -> String {
    FETCHER_NAME.to_string()
}

/// Fetcher config of a data source entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StripeFetcherConfig {
    #[serde(default = "default_fetcher")]
    pub fetcher: String,
    pub connection_params: ConnectionParams,
    #[serde(default)]
    pub request_params: Option<RequestParams>
}

/// Fetch event for this provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StripeFetchEvent {
    #[serde(default = "default_fetcher")]
    pub fetcher: String,
    /// Stripe resource name, e.g. `"Customer"`.
    pub url: String,
    #[serde(default)]
    pub config: Option<StripeFetcherConfig>,
    /// Cursor to resume after, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>
}

pub struct StripeFetchProvider {
    event: StripeFetchEvent,
    validator: ConfigValidator,
    executor: FetchExecutor
}

impl StripeFetchProvider {
    #[must_use]
    pub fn builder(event: StripeFetchEvent) -> StripeFetchProviderBuilder {
        StripeFetchProviderBuilder::new(event)
    }

    pub fn event(&self) -> &StripeFetchEvent {
        &self.event
    }

    /// Fetches and normalizes every record of the event's resource.
    pub async fn fetch(&self, cancel: &CancellationToken) -> Result<Vec<NormalizedRecord>> {
        let config = self
            .event
            .config
            .as_ref()
            .ok_or(ConfigError::MissingConfig)?;
        let connection = self.validator.validate(&config.connection_params)?;

        let request = FetchRequest {
            resource: self.event.url.clone(),
            cursor: self.event.cursor.clone(),
            params: config.request_params.clone().unwrap_or_default()
        };

        debug!(fetcher = %self.event.fetcher, resource = %request.resource, "Fetching from Stripe");
        Ok(self.executor.execute(&request, &connection, cancel).await?)
    }

    /// Folds fetched records into the customer-keyed policy document.
    pub fn process(&self, records: &[NormalizedRecord]) -> Result<Value> {
        let kind = ResourceKind::lookup(&self.event.url)?;
        Ok(build_document(kind, records))
    }

    pub async fn fetch_and_process(&self, cancel: &CancellationToken) -> Result<Value> {
        let records = self.fetch(cancel).await?;
        self.process(&records)
    }
}

/// Builder for [`StripeFetchProvider`].
pub struct StripeFetchProviderBuilder {
    event: StripeFetchEvent,
    factory: Option<Arc<dyn ClientFactory>>,
    log_control: Option<Arc<dyn LogControl>>,
    telemetry: Option<Arc<dyn TelemetrySink>>,
    policy: Option<FetchPolicy>
}

impl StripeFetchProviderBuilder {
    fn new(event: StripeFetchEvent) -> Self {
        Self {
            event,
            factory: None,
            log_control: None,
            telemetry: None,
            policy: None
        }
    }

    #[must_use]
    pub fn client_factory(mut self, factory: Arc<dyn ClientFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    #[must_use]
    pub fn log_control(mut self, log_control: Arc<dyn LogControl>) -> Self {
        self.log_control = Some(log_control);
        self
    }

    #[must_use]
    pub fn telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    #[must_use]
    pub fn policy(mut self, policy: FetchPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Builds the provider. Unset parts default to the Stripe HTTP client,
    /// no log control, `metrics` telemetry and [`FetchPolicy::default`].
    pub fn build(self) -> StripeFetchProvider {
        let policy = self.policy.unwrap_or_default();
        let factory = self.factory.unwrap_or_else(|| {
            Arc::new(StripeClientFactory::from_env(policy.request_timeout))
        });
        let log_control = self
            .log_control
            .unwrap_or_else(|| Arc::new(NoopLogControl));
        let telemetry = self
            .telemetry
            .unwrap_or_else(|| Arc::new(MetricsTelemetrySink));

        StripeFetchProvider {
            event: self.event,
            validator: ConfigValidator::new(log_control),
            executor: FetchExecutor::new(factory, policy).with_telemetry(telemetry)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FetcherError;
    use serde_json::json;

    #[test]
    fn test_event_deserialization() {
        let event: StripeFetchEvent = serde_json::from_value(json!({
            "url": "Customer",
            "config": {
                "connection_params": { "api_key": "sk_test_123" },
                "request_params": { "stripe_version": "2024-06-20" }
            }
        }))
        .unwrap();

        assert_eq!(event.fetcher, FETCHER_NAME);
        assert_eq!(event.url, "Customer");
        let config = event.config.unwrap();
        assert_eq!(config.fetcher, FETCHER_NAME);
        assert_eq!(
            config.request_params.unwrap().stripe_version.as_deref(),
            Some("2024-06-20")
        );
    }

    #[tokio::test]
    async fn test_missing_config_rejected() {
        let provider = StripeFetchProvider::builder(StripeFetchEvent {
            fetcher: FETCHER_NAME.to_string(),
            url: "Customer".to_string(),
            config: None,
            cursor: None
        })
        .build();

        let err = provider.fetch(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, FetcherError::Config(ConfigError::MissingConfig)));
    }

    #[test]
    fn test_process_rejects_unknown_resource() {
        let provider = StripeFetchProvider::builder(StripeFetchEvent {
            fetcher: FETCHER_NAME.to_string(),
            url: "Charge".to_string(),
            config: None,
            cursor: None
        })
        .build();

        assert!(provider.process(&[]).is_err());
    }
}
