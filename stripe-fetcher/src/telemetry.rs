//! Best-effort fetch telemetry.

use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use serde::Serialize;

use crate::resource::ResourceKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchOutcome {
    Success,
    Failure,
    Cancelled
}

impl FetchOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Cancelled => "cancelled"
        }
    }
}

/// Summary of one logical fetch.
#[derive(Debug, Clone, Serialize)]
pub struct FetchTelemetry {
    pub resource: ResourceKind,
    pub outcome: FetchOutcome,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub pages: usize,
    pub records: usize
}

/// Receives fetch summaries. Errors are logged by the caller and dropped.
pub trait TelemetrySink: Send + Sync {
    fn record(&self, event: &FetchTelemetry) -> anyhow::Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTelemetrySink;

impl TelemetrySink for NoopTelemetrySink {
    fn record(&self, _event: &FetchTelemetry) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Emits fetch summaries through the `metrics` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsTelemetrySink;

impl TelemetrySink for MetricsTelemetrySink {
    fn record(&self, event: &FetchTelemetry) -> anyhow::Result<()> {
        let resource = event.resource.to_string();

        counter!(
            "stripe_fetcher_fetches_total",
            "resource" => resource.clone(),
            "outcome" => event.outcome.as_str()
        )
        .increment(1);
        histogram!("stripe_fetcher_fetch_duration_seconds", "resource" => resource.clone())
            .record(event.duration.as_secs_f64());
        counter!("stripe_fetcher_pages_total", "resource" => resource.clone())
            .increment(event.pages as u64);
        counter!("stripe_fetcher_records_total", "resource" => resource)
            .increment(event.records as u64);

        Ok(())
    }
}
