//! Supported Stripe resource kinds and the endpoints they list from.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoEnumIterator, IntoStaticStr};

use crate::error::FetchError;

/// A category of Stripe entity the provider can fetch.
///
/// Parsed from the event `url`, which carries the Stripe resource class name
/// (for example `"Customer"`).
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    AsRefStr,
    IntoStaticStr
)]
pub enum ResourceKind {
    Customer,
    Invoice,
    Subscription,
    PaymentIntent
}

impl ResourceKind {
    /// Looks up a resource name in the fixed table.
    pub fn lookup(name: &str) -> Result<Self, FetchError> {
        Self::from_str(name).map_err(|_| FetchError::UnsupportedResource {
            name: name.to_string()
        })
    }

    /// List endpoint of this resource, relative to the API base URL.
    pub fn list_path(self) -> &'static str {
        match self {
            Self::Customer => "/v1/customers",
            Self::Invoice => "/v1/invoices",
            Self::Subscription => "/v1/subscriptions",
            Self::PaymentIntent => "/v1/payment_intents"
        }
    }

    /// Names accepted by [`ResourceKind::lookup`].
    pub fn supported_names() -> Vec<&'static str> {
        Self::iter().map(Into::into).collect()
    }
}
