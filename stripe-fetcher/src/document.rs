//! Customer-keyed policy document built from normalized records.
//!
//! ```json
//! {
//!   "alice@example.com": { "id": "cus_1" },
//!   "cus_1": {
//!     "products": { "prod_1": { "type": "subscription", "amount": 1000, "description": "Pro" } },
//!     "subscriptions": { "sub_1": "active" },
//!     "payments": { "pi_1": "succeeded" }
//!   }
//! }
//! ```

use serde_json::{Map, Value, json};
use tracing::debug;

use crate::normalize::NormalizedRecord;
use crate::resource::ResourceKind;

/// Folds records of one resource kind into a policy document.
///
/// Only entitlement-granting states contribute: paid invoices, active
/// subscriptions and succeeded payment intents.
pub fn build_document(kind: ResourceKind, records: &[NormalizedRecord]) -> Value {
    let mut document = Map::new();

    for record in records {
        match kind {
            ResourceKind::Customer => {
                let Some(email) = record.get_str("email") else {
                    debug!(id = record.id(), "Customer without email, skipping");
                    continue;
                };
                document.insert(email.to_string(), json!({ "id": record.id() }));
            }
            ResourceKind::Invoice => {
                if record.get_str("status") != Some("paid") {
                    continue;
                }
                merge_customer_entry(&mut document, record, "products", invoice_products(record));
            }
            ResourceKind::Subscription => {
                if record.get_str("status") != Some("active") {
                    continue;
                }
                merge_customer_entry(&mut document, record, "subscriptions", status_entry(record));
            }
            ResourceKind::PaymentIntent => {
                if record.get_str("status") != Some("succeeded") {
                    continue;
                }
                merge_customer_entry(&mut document, record, "payments", status_entry(record));
            }
        }
    }

    Value::Object(document)
}

fn status_entry(record: &NormalizedRecord) -> Map<String, Value> {
    let mut entry = Map::new();
    entry.insert(
        record.id().to_string(),
        record.get("status").cloned().unwrap_or(Value::Null)
    );
    entry
}

fn invoice_products(record: &NormalizedRecord) -> Map<String, Value> {
    let mut products = Map::new();
    let Some(lines) = record.get("lines").and_then(Value::as_array) else {
        return products;
    };

    for line in lines {
        let Some(product) = line.get("price_product").and_then(Value::as_str) else {
            continue;
        };
        products.insert(
            product.to_string(),
            json!({
                "type": line.get("type").cloned().unwrap_or(Value::Null),
                "amount": line.get("amount").cloned().unwrap_or(Value::Null),
                "description": line.get("description").cloned().unwrap_or(Value::Null)
            })
        );
    }

    products
}

fn merge_customer_entry(
    document: &mut Map<String, Value>,
    record: &NormalizedRecord,
    section: &str,
    data: Map<String, Value>
) {
    let Some(customer) = record.get_str("customer") else {
        debug!(id = record.id(), section, "Record without customer, skipping");
        return;
    };

    let entry = document
        .entry(customer.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    let Value::Object(entry) = entry else {
        return;
    };
    let target = entry
        .entry(section.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if let Value::Object(target) = target {
        target.extend(data);
    }
}
