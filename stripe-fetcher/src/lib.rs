//! # Stripe Fetch Provider
//!
//! Pulls billing state (customers, invoices, subscriptions, payment intents)
//! from the Stripe API and normalizes it into JSON that OPAL can push to the
//! policy engine.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌─────────────────┐
//! │   OPAL Client   │────►│ Stripe Fetcher  │────►│   Stripe API    │
//! │  (fetch event)  │     │  (This crate)   │     │ (paginated list)│
//! └─────────────────┘     └─────────────────┘     └─────────────────┘
//!         ▲                       │
//!         │ normalized records    │
//!         └───────────────────────┘
//! ```
//!
//! ## Flow
//!
//! 1. [`config::validate`] turns the raw `connection_params` into a
//!    [`ConnectionConfig`], failing before any network call.
//! 2. [`FetchExecutor`] binds a client to the credential, pages through the
//!    resource with bounded retries, and returns every normalized record or a
//!    [`FetchError`].
//! 3. [`StripeFetchProvider::process`] optionally folds the records into a
//!    customer-keyed policy document.

pub mod client;
pub mod config;
pub mod document;
pub mod error;
pub mod executor;
pub mod logging;
pub mod normalize;
pub mod provider;
pub mod resource;
pub mod retry;
pub mod telemetry;

pub use client::{BillingApi, ClientFactory, RawPage, StripeClient, StripeClientFactory};
pub use config::{ConfigValidator, ConnectionConfig, FetchPolicy, LogLevel, RequestParams};
pub use error::{ConfigError, FetchError, FetcherError, ProviderError, Result};
pub use executor::{FetchExecutor, FetchRequest};
pub use normalize::NormalizedRecord;
pub use provider::{StripeFetchEvent, StripeFetchProvider, StripeFetcherConfig};
pub use resource::ResourceKind;
