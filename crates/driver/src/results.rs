use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsertOneResult {
    pub inserted_id: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsertManyResult {
    /// Keyed by the index of the document in the request.
    pub inserted_ids: BTreeMap<usize, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateResult {
    pub matched_count: u64,
    pub modified_count: u64,
    pub upserted_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upserted_id: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteResult {
    pub deleted_count: u64,
}

/// Aggregate counts of a bulk write, index-keyed ids included.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkWriteResult {
    pub inserted_count: u64,
    pub matched_count: u64,
    pub modified_count: u64,
    pub deleted_count: u64,
    pub upserted_count: u64,
    pub inserted_ids: BTreeMap<usize, Value>,
    pub upserted_ids: BTreeMap<usize, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn insert_many_result_serializes_index_keys_as_strings() {
        let mut ids = BTreeMap::new();
        ids.insert(0, json!(1));
        ids.insert(1, json!(2));
        let v = serde_json::to_value(InsertManyResult { inserted_ids: ids }).unwrap();
        assert_eq!(v, json!({ "insertedIds": { "0": 1, "1": 2 } }));
    }

    #[test]
    fn update_result_omits_missing_upserted_id() {
        let v = serde_json::to_value(UpdateResult {
            matched_count: 1,
            modified_count: 1,
            upserted_count: 0,
            upserted_id: None,
        })
        .unwrap();
        assert_eq!(
            v,
            json!({ "matchedCount": 1, "modifiedCount": 1, "upsertedCount": 0 })
        );
    }
}
