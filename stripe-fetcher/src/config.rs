//! Connection parameters, request parameters and executor policy.
//!
//! Connection parameters arrive as an untyped JSON mapping from the OPAL
//! data source entry. [`validate`] turns them into an immutable
//! [`ConnectionConfig`] or rejects them before any network activity.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use strum::{Display, EnumString};
use tracing::warn;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::ConfigError;
use crate::logging::{LogControl, NoopLogControl};

/// Raw connection parameters as supplied by the caller.
pub type ConnectionParams = serde_json::Map<String, Value>;

pub const DEFAULT_MAX_RETRIES: u32 = 2;
pub const DEFAULT_PAGE_SIZE: u32 = 100;
pub const MAX_PAGE_SIZE: u32 = 100;

const CREDENTIAL_KEYS: [&str; 2] = ["api_key", "credential"];
const RETRY_KEYS: [&str; 2] = ["max_network_retries", "max_retries"];
const LOG_LEVEL_KEYS: [&str; 1] = ["log_level"];
const TELEMETRY_KEYS: [&str; 2] = ["enable_telemetry", "telemetry_enabled"];

/// Query parameters owned by the pagination loop.
const RESERVED_QUERY_KEYS: [&str; 4] = ["limit", "starting_after", "ending_before", "expand"];

/// Logging verbosity accepted in connection parameters.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
    Critical
}

impl LogLevel {
    /// The `tracing` level this maps to. `critical` has no counterpart and
    /// folds into `error`.
    pub fn as_tracing_level(self) -> tracing::Level {
        match self {
            Self::Debug => tracing::Level::DEBUG,
            Self::Info => tracing::Level::INFO,
            Self::Warning => tracing::Level::WARN,
            Self::Error | Self::Critical => tracing::Level::ERROR
        }
    }
}

/// Stripe secret key. Wiped from memory on drop and never printed.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Credential(String);

impl Credential {
    pub fn expose_secret(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

/// Validated connection configuration for one fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    credential: Credential,
    max_retries: u32,
    log_level: LogLevel,
    telemetry_enabled: bool
}

impl ConnectionConfig {
    /// Creates a configuration with default retry, log and telemetry settings.
    pub fn new(credential: impl Into<String>) -> Result<Self, ConfigError> {
        let credential = credential.into();
        if credential.trim().is_empty() {
            return Err(ConfigError::MissingCredential);
        }

        Ok(Self {
            credential: Credential(credential),
            max_retries: DEFAULT_MAX_RETRIES,
            log_level: LogLevel::default(),
            telemetry_enabled: false
        })
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn with_log_level(mut self, log_level: LogLevel) -> Self {
        self.log_level = log_level;
        self
    }

    #[must_use]
    pub fn with_telemetry(mut self, enabled: bool) -> Self {
        self.telemetry_enabled = enabled;
        self
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Total attempts allowed per page request.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    pub fn log_level(&self) -> LogLevel {
        self.log_level
    }

    pub fn telemetry_enabled(&self) -> bool {
        self.telemetry_enabled
    }
}

/// Validates raw connection parameters.
///
/// Pure: no I/O and no global state. See [`ConfigValidator`] for the variant
/// that also applies the resolved log level.
pub fn validate(params: &ConnectionParams) -> Result<ConnectionConfig, ConfigError> {
    let credential = match lookup(params, &CREDENTIAL_KEYS) {
        Some(Value::String(s)) => s.clone(),
        _ => return Err(ConfigError::MissingCredential)
    };
    let mut config = ConnectionConfig::new(credential)?;

    if let Some(field) = params.keys().find(|key| !is_known_key(key)) {
        return Err(ConfigError::UnknownField {
            field: field.clone()
        });
    }

    if let Some(value) = lookup(params, &RETRY_KEYS) {
        config.max_retries = parse_retry_count(value)?;
    }
    if let Some(value) = lookup(params, &LOG_LEVEL_KEYS) {
        config.log_level = parse_log_level(value)?;
    }
    if let Some(value) = lookup(params, &TELEMETRY_KEYS) {
        config.telemetry_enabled = parse_telemetry_flag(value)?;
    }

    Ok(config)
}

fn lookup<'a>(params: &'a ConnectionParams, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|key| params.get(*key))
}

fn is_known_key(key: &str) -> bool {
    CREDENTIAL_KEYS
        .iter()
        .chain(RETRY_KEYS.iter())
        .chain(LOG_LEVEL_KEYS.iter())
        .chain(TELEMETRY_KEYS.iter())
        .any(|known| *known == key)
}

fn parse_retry_count(value: &Value) -> Result<u32, ConfigError> {
    let invalid = || ConfigError::InvalidRetryCount {
        value: value.to_string()
    };

    match value {
        Value::Null => Ok(DEFAULT_MAX_RETRIES),
        Value::Number(n) => n
            .as_u64()
            .or_else(|| {
                n.as_f64()
                    .filter(|f| f.is_finite() && *f >= 0.0 && f.fract() == 0.0)
                    .map(|f| f as u64)
            })
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(invalid),
        Value::String(s) => s.trim().parse::<u32>().map_err(|_| invalid()),
        _ => Err(invalid())
    }
}

fn parse_log_level(value: &Value) -> Result<LogLevel, ConfigError> {
    match value {
        Value::Null => Ok(LogLevel::default()),
        Value::String(s) => LogLevel::from_str(s.trim()).map_err(|_| ConfigError::InvalidLogLevel {
            value: s.clone()
        }),
        other => Err(ConfigError::InvalidLogLevel {
            value: other.to_string()
        })
    }
}

fn parse_telemetry_flag(value: &Value) -> Result<bool, ConfigError> {
    let invalid = || ConfigError::InvalidTelemetryFlag {
        value: value.to_string()
    };

    match value {
        Value::Null => Ok(false),
        Value::Bool(b) => Ok(*b),
        Value::Number(n) => match n.as_u64() {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            _ => Err(invalid())
        },
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            _ => Err(invalid())
        },
        _ => Err(invalid())
    }
}

/// Validator that applies the resolved log level to the process.
#[derive(Clone)]
pub struct ConfigValidator {
    log_control: Arc<dyn LogControl>
}

impl ConfigValidator {
    pub fn new(log_control: Arc<dyn LogControl>) -> Self {
        Self { log_control }
    }

    pub fn validate(&self, params: &ConnectionParams) -> Result<ConnectionConfig, ConfigError> {
        let config = validate(params)?;

        if let Err(e) = self.log_control.apply(config.log_level()) {
            warn!(error = %e, level = %config.log_level(), "Failed to apply log level");
        }

        Ok(config)
    }
}

impl Default for ConfigValidator {
    fn default() -> Self {
        Self::new(Arc::new(NoopLogControl))
    }
}

/// Optional Stripe request parameters of a data source entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestParams {
    /// Connected account to act on behalf of (`Stripe-Account` header).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stripe_account: Option<String>,
    /// Pinned API version (`Stripe-Version` header).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stripe_version: Option<String>,
    /// Expandable fields, sent as `expand[]`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub expand: Vec<String>,
    /// Page size. Stripe accepts 1 to 100.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    /// Extra list filters passed through as query parameters. Pagination
    /// keys (`limit`, `starting_after`, `ending_before`, `expand[]`) are
    /// rejected.
    #[serde(
        default,
        deserialize_with = "deserialize_filters",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub filters: BTreeMap<String, String>
}

/// Whether `key` is a query parameter the fetcher sets itself.
pub fn is_reserved_query_key(key: &str) -> bool {
    let base = key.split('[').next().unwrap_or(key);
    RESERVED_QUERY_KEYS.contains(&base)
}

fn deserialize_filters<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>
{
    let filters = BTreeMap::<String, String>::deserialize(deserializer)?;
    if let Some(key) = filters.keys().find(|key| is_reserved_query_key(key)) {
        return Err(serde::de::Error::custom(format!(
            "filter `{key}` is reserved for pagination"
        )));
    }
    Ok(filters)
}

impl RequestParams {
    pub fn page_size(&self) -> u32 {
        self.limit
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE)
    }

    /// Filters that are safe to send next to the pagination parameters.
    pub fn query_filters(&self) -> impl Iterator<Item = (&str, &str)> {
        self.filters
            .iter()
            .filter(|(key, _)| !is_reserved_query_key(key))
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }
}

/// Retry, timeout and pagination policy of the executor.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Growth factor applied per additional attempt.
    pub multiplier: f64,
    /// Upper bound of any single delay.
    pub max_delay: Duration,
    /// Randomization factor in `0.0..=1.0`; `0.0` disables jitter.
    pub jitter: f64,
    /// Bound on each individual page request.
    pub request_timeout: Duration,
    /// Optional safety cap on pages per fetch.
    pub max_pages: Option<usize>
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: 0.5,
            request_timeout: Duration::from_secs(30),
            max_pages: None
        }
    }
}

impl FetchPolicy {
    /// Reads overrides from the environment.
    ///
    /// Reads:
    /// - `STRIPE_FETCHER_BASE_DELAY_MS` (default: 500)
    /// - `STRIPE_FETCHER_MAX_DELAY_MS` (default: 30000)
    /// - `STRIPE_FETCHER_BACKOFF_MULTIPLIER` (default: 2.0)
    /// - `STRIPE_FETCHER_REQUEST_TIMEOUT_SECS` (default: 30)
    /// - `STRIPE_FETCHER_MAX_PAGES` (default: unlimited)
    #[must_use]
    pub fn from_env() -> Self {
        let mut policy = Self::default();

        if let Some(ms) = env_parse::<u64>("STRIPE_FETCHER_BASE_DELAY_MS") {
            policy.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("STRIPE_FETCHER_MAX_DELAY_MS") {
            policy.max_delay = Duration::from_millis(ms);
        }
        if let Some(multiplier) = env_parse::<f64>("STRIPE_FETCHER_BACKOFF_MULTIPLIER") {
            if multiplier >= 1.0 {
                policy.multiplier = multiplier;
            }
        }
        if let Some(secs) = env_parse::<u64>("STRIPE_FETCHER_REQUEST_TIMEOUT_SECS") {
            policy.request_timeout = Duration::from_secs(secs);
        }
        policy.max_pages = env_parse::<usize>("STRIPE_FETCHER_MAX_PAGES").filter(|n| *n > 0);

        policy
    }

    /// Near-zero delays and no jitter, for tests.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            base_delay: Duration::from_millis(1),
            multiplier: 2.0,
            max_delay: Duration::from_millis(10),
            jitter: 0.0,
            request_timeout: Duration::from_secs(5),
            max_pages: None
        }
    }

    #[must_use]
    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = Some(max_pages);
        self
    }

    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: Value) -> ConnectionParams {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object")
        }
    }

    #[test]
    fn test_validate_defaults() {
        let config = validate(&params(json!({ "api_key": "sk_test_123" }))).unwrap();

        assert_eq!(config.credential().expose_secret(), "sk_test_123");
        assert_eq!(config.max_retries(), DEFAULT_MAX_RETRIES);
        assert_eq!(config.max_attempts(), DEFAULT_MAX_RETRIES + 1);
        assert_eq!(config.log_level(), LogLevel::Info);
        assert!(!config.telemetry_enabled());
    }

    #[test]
    fn test_validate_all_fields() {
        let config = validate(&params(json!({
            "api_key": "sk_test_123",
            "max_network_retries": 5,
            "log_level": "DEBUG",
            "enable_telemetry": true
        })))
        .unwrap();

        assert_eq!(config.max_retries(), 5);
        assert_eq!(config.log_level(), LogLevel::Debug);
        assert!(config.telemetry_enabled());
    }

    #[test]
    fn test_validate_accepts_aliases() {
        let config = validate(&params(json!({
            "credential": "sk_test_123",
            "max_retries": "4",
            "telemetry_enabled": "yes"
        })))
        .unwrap();

        assert_eq!(config.max_retries(), 4);
        assert!(config.telemetry_enabled());
    }

    #[test]
    fn test_missing_credential() {
        for raw in [
            json!({}),
            json!({ "api_key": "" }),
            json!({ "api_key": "   " }),
            json!({ "api_key": null }),
            json!({ "api_key": 42 }),
            json!({ "log_level": "info", "unexpected": 1 })
        ] {
            assert_eq!(
                validate(&params(raw)).unwrap_err(),
                ConfigError::MissingCredential
            );
        }
    }

    #[test]
    fn test_invalid_retry_count() {
        for value in [json!(-1), json!(1.5), json!("three"), json!(true), json!([])] {
            let err = validate(&params(json!({
                "api_key": "sk_test_123",
                "max_network_retries": value
            })))
            .unwrap_err();
            assert!(matches!(err, ConfigError::InvalidRetryCount { .. }));
        }
    }

    #[test]
    fn test_integral_float_retry_count_accepted() {
        let config = validate(&params(json!({
            "api_key": "sk_test_123",
            "max_network_retries": 3.0
        })))
        .unwrap();
        assert_eq!(config.max_retries(), 3);

        for value in [json!(-2.0), json!(3.25), json!(1e20)] {
            let err = validate(&params(json!({
                "api_key": "sk_test_123",
                "max_network_retries": value
            })))
            .unwrap_err();
            assert!(matches!(err, ConfigError::InvalidRetryCount { .. }));
        }
    }

    #[test]
    fn test_null_retry_count_uses_default() {
        let config = validate(&params(json!({
            "api_key": "sk_test_123",
            "max_network_retries": null
        })))
        .unwrap();
        assert_eq!(config.max_retries(), DEFAULT_MAX_RETRIES);
    }

    #[test]
    fn test_log_levels_case_insensitive() {
        for (raw, expected) in [
            ("debug", LogLevel::Debug),
            ("Info", LogLevel::Info),
            ("WARNING", LogLevel::Warning),
            ("error", LogLevel::Error),
            ("Critical", LogLevel::Critical)
        ] {
            let config = validate(&params(json!({
                "api_key": "sk_test_123",
                "log_level": raw
            })))
            .unwrap();
            assert_eq!(config.log_level(), expected);
        }
    }

    #[test]
    fn test_invalid_log_level() {
        for value in [json!("verbose"), json!("notset"), json!(3)] {
            let err = validate(&params(json!({
                "api_key": "sk_test_123",
                "log_level": value
            })))
            .unwrap_err();
            assert!(matches!(err, ConfigError::InvalidLogLevel { .. }));
        }
    }

    #[test]
    fn test_telemetry_flag_coercion() {
        for (value, expected) in [
            (json!(false), false),
            (json!(1), true),
            (json!(0), false),
            (json!("ON"), true),
            (json!("off"), false),
            (json!(null), false)
        ] {
            let config = validate(&params(json!({
                "api_key": "sk_test_123",
                "enable_telemetry": value
            })))
            .unwrap();
            assert_eq!(config.telemetry_enabled(), expected);
        }
    }

    #[test]
    fn test_invalid_telemetry_flag() {
        for value in [json!("maybe"), json!(2), json!({ "on": true })] {
            let err = validate(&params(json!({
                "api_key": "sk_test_123",
                "enable_telemetry": value
            })))
            .unwrap_err();
            assert!(matches!(err, ConfigError::InvalidTelemetryFlag { .. }));
        }
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = validate(&params(json!({
            "api_key": "sk_test_123",
            "api_base": "https://example.com"
        })))
        .unwrap_err();
        assert_eq!(
            err,
            ConfigError::UnknownField {
                field: "api_base".to_string()
            }
        );
    }

    #[test]
    fn test_credential_debug_is_redacted() {
        let config = ConnectionConfig::new("sk_live_secret").unwrap();
        let printed = format!("{config:?}");
        assert!(!printed.contains("sk_live_secret"));
        assert!(printed.contains("***"));
    }

    #[test]
    fn test_log_level_tracing_mapping() {
        assert_eq!(LogLevel::Warning.as_tracing_level(), tracing::Level::WARN);
        assert_eq!(LogLevel::Critical.as_tracing_level(), tracing::Level::ERROR);
        assert_eq!(LogLevel::Warning.to_string(), "warning");
    }

    #[test]
    fn test_request_params_page_size() {
        assert_eq!(RequestParams::default().page_size(), DEFAULT_PAGE_SIZE);

        let params = RequestParams {
            limit: Some(500),
            ..Default::default()
        };
        assert_eq!(params.page_size(), MAX_PAGE_SIZE);

        let params = RequestParams {
            limit: Some(0),
            ..Default::default()
        };
        assert_eq!(params.page_size(), 1);
    }

    #[test]
    fn test_request_params_deserialize() {
        let params: RequestParams = serde_json::from_value(json!({
            "stripe_account": "acct_1",
            "expand": ["data.customer"],
            "filters": { "status": "active" }
        }))
        .unwrap();

        assert_eq!(params.stripe_account.as_deref(), Some("acct_1"));
        assert_eq!(params.expand, vec!["data.customer".to_string()]);
        assert_eq!(params.filters.get("status").map(String::as_str), Some("active"));

        let err = serde_json::from_value::<RequestParams>(json!({ "query": "SELECT" }));
        assert!(err.is_err());
    }

    #[test]
    fn test_pagination_filters_rejected() {
        for key in ["limit", "starting_after", "ending_before", "expand[]", "expand"] {
            let mut filters = serde_json::Map::new();
            filters.insert("status".to_string(), json!("active"));
            filters.insert(key.to_string(), json!("x"));

            let err = serde_json::from_value::<RequestParams>(json!({ "filters": filters }))
                .unwrap_err();
            assert!(err.to_string().contains("reserved for pagination"), "{key}: {err}");
        }
    }

    #[test]
    fn test_query_filters_skip_pagination_keys() {
        let params = RequestParams {
            filters: [
                ("limit".to_string(), "5".to_string()),
                ("starting_after".to_string(), "cus_0".to_string()),
                ("status".to_string(), "active".to_string()),
            ]
            .into_iter()
            .collect(),
            ..Default::default()
        };

        let sent: Vec<(&str, &str)> = params.query_filters().collect();
        assert_eq!(sent, vec![("status", "active")]);
    }

    #[test]
    fn test_policy_defaults() {
        let policy = FetchPolicy::default();
        assert_eq!(policy.base_delay, Duration::from_millis(500));
        assert_eq!(policy.request_timeout, Duration::from_secs(30));
        assert!(policy.max_pages.is_none());

        let policy = FetchPolicy::for_testing().with_max_pages(3);
        assert_eq!(policy.max_pages, Some(3));
        assert!(policy.jitter.abs() < f64::EPSILON);
    }
}
