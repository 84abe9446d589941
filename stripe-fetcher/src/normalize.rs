//! Normalization of raw Stripe objects into flat policy records.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

use crate::resource::ResourceKind;

/// Provider bookkeeping that carries no policy meaning.
const DROPPED_FIELDS: [&str; 8] = [
    "object",
    "livemode",
    "client_secret",
    "test_clock",
    "request",
    "url",
    "has_more",
    "total_count"
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeError {
    #[error("record is not an object")]
    NotAnObject,

    #[error("record has no string id")]
    MissingId
}

/// One fetched entity in the shape the policy consumer expects.
///
/// Field order is the order the provider returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NormalizedRecord(Map<String, Value>);

impl NormalizedRecord {
    pub fn id(&self) -> &str {
        self.0.get("id").and_then(Value::as_str).unwrap_or_default()
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.0.get(field).and_then(Value::as_str)
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_inner(self) -> Map<String, Value> {
        self.0
    }
}

/// Normalizes one raw record.
pub fn normalize_record(raw: Value) -> Result<NormalizedRecord, NormalizeError> {
    let Value::Object(object) = raw else {
        return Err(NormalizeError::NotAnObject);
    };
    if !object.get("id").is_some_and(Value::is_string) {
        return Err(NormalizeError::MissingId);
    }

    Ok(NormalizedRecord(normalize_object(object)))
}

/// Normalizes a page, skipping records that fail.
///
/// A page where every record fails yields an empty vector.
pub fn normalize_page(kind: ResourceKind, records: Vec<Value>) -> Vec<NormalizedRecord> {
    let total = records.len();
    let normalized: Vec<NormalizedRecord> = records
        .into_iter()
        .enumerate()
        .filter_map(|(index, raw)| match normalize_record(raw) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(resource = %kind, index, error = %e, "Skipping malformed record");
                None
            }
        })
        .collect();

    if total > 0 && normalized.is_empty() {
        warn!(resource = %kind, total, "No record on page could be normalized");
    }

    normalized
}

fn normalize_object(object: Map<String, Value>) -> Map<String, Value> {
    let own: HashSet<String> = object.keys().cloned().collect();
    let mut out = Map::with_capacity(object.len());

    for (key, value) in object {
        if DROPPED_FIELDS.contains(&key.as_str()) {
            continue;
        }

        match value {
            Value::Object(nested) if is_list(&nested) => {
                out.insert(key, Value::Array(list_items(nested)));
            }
            Value::Object(nested) if reference_id(&nested).is_some() => {
                flatten_reference(&key, nested, &own, &mut out);
            }
            other => {
                out.insert(key, other);
            }
        }
    }

    out
}

fn is_list(object: &Map<String, Value>) -> bool {
    object.get("object").and_then(Value::as_str) == Some("list")
        && object.get("data").is_some_and(Value::is_array)
}

fn list_items(mut list: Map<String, Value>) -> Vec<Value> {
    let Some(Value::Array(items)) = list.remove("data") else {
        return Vec::new();
    };

    items
        .into_iter()
        .map(|item| match item {
            Value::Object(object) => Value::Object(normalize_object(object)),
            other => other
        })
        .collect()
}

fn reference_id(object: &Map<String, Value>) -> Option<&str> {
    object.get("id").and_then(Value::as_str)
}

/// Collapses an expanded object to its id and lifts its scalar fields to
/// `<key>_<field>`. A lifted key never replaces a field the record carries
/// itself.
fn flatten_reference(
    key: &str,
    nested: Map<String, Value>,
    own: &HashSet<String>,
    out: &mut Map<String, Value>
) {
    for (field, value) in nested {
        if field == "id" {
            out.insert(key.to_string(), value);
            continue;
        }
        if DROPPED_FIELDS.contains(&field.as_str()) {
            continue;
        }

        let lifted = match value {
            Value::Object(inner) => match reference_id(&inner) {
                Some(id) => Value::String(id.to_string()),
                None => continue
            },
            Value::Array(_) => continue,
            scalar => scalar
        };
        let lifted_key = format!("{key}_{field}");
        if own.contains(&lifted_key) || out.contains_key(&lifted_key) {
            continue;
        }
        out.insert(lifted_key, lifted);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_drops_internal_fields_and_keeps_order() {
        let record = normalize_record(json!({
            "id": "cus_1",
            "object": "customer",
            "email": "a@example.com",
            "livemode": false,
            "created": 1_700_000_000,
            "metadata": { "plan": "pro" }
        }))
        .unwrap();

        let fields: Vec<&str> = record.fields().collect();
        assert_eq!(fields, vec!["id", "email", "created", "metadata"]);
        assert_eq!(record.id(), "cus_1");
        assert_eq!(record.get("metadata"), Some(&json!({ "plan": "pro" })));
    }

    #[test]
    fn test_unexpanded_reference_kept() {
        let record = normalize_record(json!({
            "id": "sub_1",
            "customer": "cus_1",
            "status": "active"
        }))
        .unwrap();

        assert_eq!(record.get_str("customer"), Some("cus_1"));
    }

    #[test]
    fn test_expanded_reference_flattened() {
        let record = normalize_record(json!({
            "id": "pi_1",
            "customer": {
                "id": "cus_1",
                "object": "customer",
                "email": "a@example.com",
                "address": { "city": "Paris" },
                "invoice_settings": { "default_payment_method": { "id": "pm_1" } }
            },
            "status": "succeeded"
        }))
        .unwrap();

        assert_eq!(record.get_str("customer"), Some("cus_1"));
        assert_eq!(record.get_str("customer_email"), Some("a@example.com"));
        assert!(record.get("customer_object").is_none());
        assert!(record.get("customer_address").is_none());

        let fields: Vec<&str> = record.fields().collect();
        assert_eq!(fields, vec!["id", "customer", "customer_email", "status"]);
    }

    #[test]
    fn test_lifted_fields_never_replace_own_fields() {
        let record = normalize_record(json!({
            "id": "in_1",
            "customer_email": "billing@example.com",
            "customer": {
                "id": "cus_1",
                "email": "alice@example.com",
                "name": "Alice",
                "phone": "+33100000000"
            },
            "customer_name": "Alice Billing Dept",
            "status": "paid"
        }))
        .unwrap();

        assert_eq!(record.get_str("customer"), Some("cus_1"));
        assert_eq!(record.get_str("customer_email"), Some("billing@example.com"));
        assert_eq!(record.get_str("customer_name"), Some("Alice Billing Dept"));
        assert_eq!(record.get_str("customer_phone"), Some("+33100000000"));
    }

    #[test]
    fn test_list_objects_become_arrays() {
        let record = normalize_record(json!({
            "id": "in_1",
            "customer": "cus_1",
            "status": "paid",
            "lines": {
                "object": "list",
                "has_more": false,
                "url": "/v1/invoices/in_1/lines",
                "data": [{
                    "id": "il_1",
                    "object": "line_item",
                    "type": "subscription",
                    "amount": 1000,
                    "description": "Pro plan",
                    "price": {
                        "id": "price_1",
                        "object": "price",
                        "product": "prod_1",
                        "unit_amount": 1000
                    }
                }]
            }
        }))
        .unwrap();

        let lines = record.get("lines").and_then(Value::as_array).unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(
            lines[0],
            json!({
                "id": "il_1",
                "type": "subscription",
                "amount": 1000,
                "description": "Pro plan",
                "price": "price_1",
                "price_product": "prod_1",
                "price_unit_amount": 1000
            })
        );
    }

    #[test]
    fn test_expanded_nested_reference_lifted_as_id() {
        let record = normalize_record(json!({
            "id": "il_1",
            "price": {
                "id": "price_1",
                "product": { "id": "prod_1", "name": "Pro" }
            }
        }))
        .unwrap();

        assert_eq!(record.get_str("price_product"), Some("prod_1"));
    }

    #[test]
    fn test_malformed_records_rejected() {
        assert_eq!(
            normalize_record(json!("cus_1")).unwrap_err(),
            NormalizeError::NotAnObject
        );
        assert_eq!(
            normalize_record(json!({ "email": "a@example.com" })).unwrap_err(),
            NormalizeError::MissingId
        );
        assert_eq!(
            normalize_record(json!({ "id": 12 })).unwrap_err(),
            NormalizeError::MissingId
        );
    }

    #[test]
    fn test_normalize_page_skips_bad_records() {
        let records = normalize_page(
            ResourceKind::Customer,
            vec![json!({ "id": "cus_1" }), json!(null), json!({ "id": "cus_2" })]
        );

        let ids: Vec<&str> = records.iter().map(NormalizedRecord::id).collect();
        assert_eq!(ids, vec!["cus_1", "cus_2"]);
    }

    #[test]
    fn test_normalize_page_all_bad_is_empty() {
        let records = normalize_page(ResourceKind::Invoice, vec![json!(1), json!([])]);
        assert!(records.is_empty());
    }

    #[test]
    fn test_serializes_as_flat_object() {
        let record = normalize_record(json!({ "id": "cus_1", "email": "a@example.com" })).unwrap();
        let json = serde_json::to_string(&record).unwrap();
        assert_eq!(json, r#"{"id":"cus_1","email":"a@example.com"}"#);
    }
}
