//! Encode/decode for changes stored in the log.
//!
//! Each log row holds one change as a JSON object with the fields
//! `{stream, entity, entityId, kind, patch, tags, hlc}`; HLC values use
//! their canonical text form. This module is the single place that shape is
//! produced and consumed.

use crate::core::StoreError;
use data_types::Change;

/// Encode a [`Change`] into its log blob.
pub fn encode_change(change: &Change) -> Result<String, StoreError> {
    serde_json::to_string(change).map_err(StoreError::append_failed)
}

/// Decode a log blob back into a [`Change`].
pub fn decode_change(blob: &str) -> Result<Change, StoreError> {
    serde_json::from_str(blob).map_err(StoreError::pull_failed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StoreErrorKind;
    use data_types::ChangeKind;
    use serde_json::json;

    #[test]
    fn round_trip() {
        let change = Change::upsert(
            "user-1",
            "todos",
            "t1",
            [
                ("title".to_string(), json!("Buy milk")),
                ("done".to_string(), json!(false)),
            ]
            .into_iter()
            .collect(),
            "100:0:n1".parse().unwrap(),
        );

        let blob = encode_change(&change).unwrap();
        assert_eq!(decode_change(&blob).unwrap(), change);
    }

    #[test]
    fn blob_shape_is_stable() {
        let change = Change::delete("user-1", "todos", "t1", "101:2:n2".parse().unwrap());
        let blob = encode_change(&change).unwrap();

        let value: serde_json::Value = serde_json::from_str(&blob).unwrap();
        assert_eq!(
            value,
            json!({
                "stream": "user-1",
                "entity": "todos",
                "entityId": "t1",
                "kind": "delete",
                "patch": {},
                "tags": {},
                "hlc": "101:2:n2",
            })
        );
    }

    #[test]
    fn decode_accepts_external_blobs() {
        let blob = r#"{
            "stream": "user-1",
            "entity": "todos",
            "entityId": "t9",
            "kind": "upsert",
            "patch": {"title": "hi"},
            "tags": {"title": "100:0:n1"},
            "hlc": "100:0:n1"
        }"#;

        let change = decode_change(blob).unwrap();
        assert_eq!(change.kind, ChangeKind::Upsert);
        assert_eq!(change.entity_id, "t9");
        change.validate().unwrap();
    }

    #[test]
    fn decode_rejects_junk() {
        let err = decode_change("not json").unwrap_err();
        assert_eq!(err.kind(), StoreErrorKind::PullFailed);

        let err = decode_change(r#"{"kind": "upsert"}"#).unwrap_err();
        assert_eq!(err.kind(), StoreErrorKind::PullFailed);
    }
}
