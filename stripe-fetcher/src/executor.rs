//! Resilient fetch executor.
//!
//! One call to [`FetchExecutor::execute`] is one logical fetch: every page of
//! one resource kind, retried per page, all-or-nothing.
//!
//! ```text
//! FetchRequest ─► lookup kind ─► connect client ─┐
//!                                                ▼
//!                 ┌──────── page loop (cursor) ◄─────────┐
//!                 │   attempt ─► transient? ─► backoff ──┤
//!                 │      │                               │
//!                 │      └─► ok ─► normalize ─► has_more ┘
//!                 ▼
//!           Vec<NormalizedRecord>
//! ```

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{BillingApi, ClientFactory, RawPage};
use crate::config::{ConnectionConfig, FetchPolicy, RequestParams};
use crate::error::{FetchError, FetchResult, ProviderError};
use crate::normalize::{NormalizedRecord, normalize_page};
use crate::resource::ResourceKind;
use crate::retry::RetrySchedule;
use crate::telemetry::{FetchOutcome, FetchTelemetry, NoopTelemetrySink, TelemetrySink};

/// What to fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchRequest {
    /// Resource name, e.g. `"Customer"`.
    pub resource: String,
    /// Cursor to resume after, if any.
    pub cursor: Option<String>,
    pub params: RequestParams
}

impl FetchRequest {
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_cursor(mut self, cursor: impl Into<String>) -> Self {
        self.cursor = Some(cursor.into());
        self
    }

    #[must_use]
    pub fn with_params(mut self, params: RequestParams) -> Self {
        self.params = params;
        self
    }
}

#[derive(Debug, Default)]
struct Progress {
    pages: usize
}

pub struct FetchExecutor {
    factory: Arc<dyn ClientFactory>,
    policy: FetchPolicy,
    telemetry: Arc<dyn TelemetrySink>
}

impl FetchExecutor {
    pub fn new(factory: Arc<dyn ClientFactory>, policy: FetchPolicy) -> Self {
        Self {
            factory,
            policy,
            telemetry: Arc::new(NoopTelemetrySink)
        }
    }

    #[must_use]
    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn policy(&self) -> &FetchPolicy {
        &self.policy
    }

    /// Fetches every page of the requested resource.
    ///
    /// Records from earlier pages are discarded if a later page fails.
    pub async fn execute(
        &self,
        request: &FetchRequest,
        config: &ConnectionConfig,
        cancel: &CancellationToken
    ) -> FetchResult<Vec<NormalizedRecord>> {
        let kind = ResourceKind::lookup(&request.resource)?;
        if cancel.is_cancelled() {
            return Err(FetchError::Cancelled);
        }

        let started_at = Utc::now();
        let started = Instant::now();
        let mut progress = Progress::default();

        let result = match self.factory.connect(config) {
            Ok(client) => {
                self.fetch_all(client.as_ref(), kind, request, config, cancel, &mut progress)
                    .await
            }
            Err(e) => Err(e)
        };

        let outcome = match &result {
            Ok(_) => FetchOutcome::Success,
            Err(FetchError::Cancelled) => FetchOutcome::Cancelled,
            Err(_) => FetchOutcome::Failure
        };

        match &result {
            Ok(records) => info!(
                resource = %kind,
                pages = progress.pages,
                records = records.len(),
                elapsed_ms = started.elapsed().as_millis(),
                "Stripe fetch completed"
            ),
            Err(e) => warn!(
                resource = %kind,
                pages = progress.pages,
                error = %e,
                "Stripe fetch failed"
            )
        }

        if config.telemetry_enabled() {
            let event = FetchTelemetry {
                resource: kind,
                outcome,
                started_at,
                duration: started.elapsed(),
                pages: progress.pages,
                records: result.as_ref().map_or(0, Vec::len)
            };
            if let Err(e) = self.telemetry.record(&event) {
                debug!(error = %e, "Telemetry sink rejected fetch event");
            }
        }

        result
    }

    async fn fetch_all(
        &self,
        client: &dyn BillingApi,
        kind: ResourceKind,
        request: &FetchRequest,
        config: &ConnectionConfig,
        cancel: &CancellationToken,
        progress: &mut Progress
    ) -> FetchResult<Vec<NormalizedRecord>> {
        let mut records = Vec::new();
        let mut cursor = request.cursor.clone();

        loop {
            if let Some(limit) = self.policy.max_pages {
                if progress.pages >= limit {
                    return Err(FetchError::PageLimitExceeded { limit });
                }
            }

            let page = self
                .fetch_page(client, kind, cursor.as_deref(), &request.params, config, cancel)
                .await?;
            progress.pages += 1;

            let RawPage {
                records: raw,
                next_cursor,
                has_more
            } = page;
            debug!(
                resource = %kind,
                page = progress.pages,
                count = raw.len(),
                has_more,
                "Fetched page"
            );

            records.extend(normalize_page(kind, raw));

            if !has_more {
                break;
            }
            match next_cursor {
                Some(next) => cursor = Some(next),
                None => {
                    return Err(FetchError::MalformedPage {
                        message: format!(
                            "page {} of {kind} signals more data without a cursor",
                            progress.pages
                        )
                    });
                }
            }
        }

        Ok(records)
    }

    /// Requests one page, retrying transient failures.
    async fn fetch_page(
        &self,
        client: &dyn BillingApi,
        kind: ResourceKind,
        cursor: Option<&str>,
        params: &RequestParams,
        config: &ConnectionConfig,
        cancel: &CancellationToken
    ) -> FetchResult<RawPage> {
        let max_attempts = config.max_attempts();
        let timeout = self.policy.request_timeout;
        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        let mut schedule = RetrySchedule::new(&self.policy);
        let mut attempt = 0;

        loop {
            attempt += 1;

            let outcome = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(FetchError::Cancelled),
                result = tokio::time::timeout(timeout, client.list_page(kind, cursor, params)) => {
                    result.unwrap_or(Err(ProviderError::Timeout { timeout_ms }))
                }
            };

            let err = match outcome {
                Ok(page) => return Ok(page),
                Err(e) if !e.is_transient() => return Err(FetchError::permanent(e)),
                Err(e) => e
            };

            if attempt >= max_attempts {
                return Err(FetchError::RetriesExhausted {
                    attempts: attempt,
                    source: err
                });
            }

            let delay = schedule.next_delay(&err);
            warn!(
                resource = %kind,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis(),
                error = %err,
                "Transient Stripe error, retrying"
            );

            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(FetchError::Cancelled),
                () = tokio::time::sleep(delay) => {}
            }
        }
    }
}
