//! Conversion between domain types and stored documents.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::DbError;

/// Projection that returns the record key as a plain string `id`.
pub(crate) const WITH_ID: &str = "*, record::id(id) AS id";

/// Serialize `value` into a document for `CONTENT`.
///
/// The `id` field is dropped because the record id is given explicitly, and
/// top-level nulls are dropped so absent optionals are stored as NONE.
pub(crate) fn content<T: Serialize>(value: &T) -> Result<Map<String, Value>, DbError> {
    match serde_json::to_value(value)? {
        Value::Object(mut map) => {
            map.remove("id");
            map.retain(|_, field| !field.is_null());
            Ok(map)
        }
        other => Err(DbError::Serialization(format!(
            "expected an object document, got {other}"
        ))),
    }
}

/// Collapse the per-statement errors of a response into one error.
///
/// Statements skipped because an earlier one in the same transaction failed
/// are reported alongside the failure that caused them.
pub(crate) fn statement_errors(errors: HashMap<usize, surrealdb::Error>) -> Option<String> {
    if errors.is_empty() {
        return None;
    }
    let mut errors: Vec<_> = errors.into_iter().collect();
    errors.sort_by_key(|(index, _)| *index);
    Some(
        errors
            .into_iter()
            .map(|(index, err)| format!("statement {index}: {err}"))
            .collect::<Vec<_>>()
            .join("; "),
    )
}

/// Whether a failure was an optimistic transaction conflict worth retrying.
pub(crate) fn is_conflict(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("conflict") || message.contains("can be retried")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Serialize)]
    struct Row {
        id: &'static str,
        name: &'static str,
        missing: Option<u32>,
        nested: Value,
    }

    #[test]
    fn content_strips_id_and_top_level_nulls() {
        let map = content(&Row {
            id: "01H",
            name: "x",
            missing: None,
            nested: json!({"inner": null}),
        })
        .unwrap();
        assert!(!map.contains_key("id"));
        assert!(!map.contains_key("missing"));
        assert_eq!(map["nested"], json!({"inner": null}));
    }
}
