//! Conversions between the boundary's extended-JSON documents and BSON, and
//! from driver errors and write replies to [`DriverError`].

use std::time::Duration;

use bson::Bson;
use mongodb::error::{Error as MongoError, ErrorKind, WriteFailure};
use mongodb::options::{
    Acknowledgment as MongoAcknowledgment, HedgedReadOptions, ReadConcern as MongoReadConcern,
    ReadConcernLevel, ReadPreference as MongoReadPreference, ReadPreferenceOptions,
    SelectionCriteria, TagSet, TransactionOptions as MongoTransactionOptions,
    WriteConcern as MongoWriteConcern,
};
use serde_json::Value;

use crate::error::{DriverError, DriverResult};
use crate::options::{
    Acknowledgment, ReadConcern, ReadPreference, ReadPreferenceMode, TransactionOptions,
    WriteConcern,
};
use crate::Document;

pub(crate) fn to_bson(doc: Document) -> DriverResult<bson::Document> {
    match Bson::try_from(Value::Object(doc)) {
        Ok(Bson::Document(doc)) => Ok(doc),
        Ok(other) => Err(DriverError::invalid_argument(format!(
            "expected a document, got {}",
            other
        ))),
        Err(e) => Err(DriverError::invalid_argument(format!("invalid extended JSON: {}", e))),
    }
}

pub(crate) fn from_bson(doc: bson::Document) -> Document {
    match Bson::Document(doc).into_relaxed_extjson() {
        Value::Object(map) => map,
        _ => Document::new(),
    }
}

pub(crate) fn object_id_json(id: &bson::oid::ObjectId) -> Value {
    serde_json::json!({ "$oid": id.to_hex() })
}

fn labels(err: &MongoError) -> Vec<String> {
    let mut labels: Vec<String> = err.labels().iter().cloned().collect();
    labels.sort();
    labels
}

pub(crate) fn from_mongo_error(err: MongoError) -> DriverError {
    let labels = labels(&err);
    match err.kind.as_ref() {
        ErrorKind::Command(command) => DriverError::Command {
            code: command.code,
            code_name: command.code_name.clone(),
            message: command.message.clone(),
            labels,
        },
        ErrorKind::Write(WriteFailure::WriteError(write)) => DriverError::Command {
            code: write.code,
            code_name: write.code_name.clone().unwrap_or_default(),
            message: write.message.clone(),
            labels,
        },
        ErrorKind::Write(WriteFailure::WriteConcernError(wce)) => DriverError::Command {
            code: wce.code,
            code_name: wce.code_name.clone(),
            message: wce.message.clone(),
            labels,
        },
        ErrorKind::Io(_) | ErrorKind::ConnectionPoolCleared { .. } | ErrorKind::ServerSelection { .. } => {
            DriverError::Network {
                message: err.to_string(),
                labels,
            }
        }
        ErrorKind::Transaction { message, .. } => DriverError::transaction(message.clone()),
        _ => DriverError::invalid_argument(err.to_string()),
    }
}

fn string_field(doc: &Document, key: &str) -> String {
    doc.get(key).and_then(Value::as_str).unwrap_or_default().to_string()
}

fn code_field(doc: &Document) -> i32 {
    doc.get("code")
        .and_then(Value::as_i64)
        .and_then(|c| i32::try_from(c).ok())
        .unwrap_or_default()
}

fn reply_labels(reply: &Document) -> Vec<String> {
    reply
        .get("errorLabels")
        .and_then(Value::as_array)
        .map(|labels| labels.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default()
}

/// Write errors of a write command reply, as `(position in batch, error)`.
pub(crate) fn write_errors(reply: &Document) -> Vec<(usize, DriverError)> {
    reply
        .get("writeErrors")
        .and_then(Value::as_array)
        .map(|errors| {
            errors
                .iter()
                .filter_map(Value::as_object)
                .map(|e| {
                    let index = e.get("index").and_then(Value::as_u64).unwrap_or(0) as usize;
                    let err = DriverError::command(
                        code_field(e),
                        string_field(e, "codeName"),
                        string_field(e, "errmsg"),
                    );
                    (index, err)
                })
                .collect()
        })
        .unwrap_or_default()
}

/// The reply's `writeConcernError`, carrying the reply's error labels.
pub(crate) fn write_concern_error(reply: &Document) -> Option<DriverError> {
    let wce = reply.get("writeConcernError")?.as_object()?;
    Some(DriverError::Command {
        code: code_field(wce),
        code_name: string_field(wce, "codeName"),
        message: string_field(wce, "errmsg"),
        labels: reply_labels(reply),
    })
}

// ── Option types ─────────────────────────────────────────────────────────────

pub(crate) fn read_concern(rc: &ReadConcern) -> MongoReadConcern {
    match rc.level.as_str() {
        "local" => MongoReadConcern::local(),
        "majority" => MongoReadConcern::majority(),
        "linearizable" => MongoReadConcern::linearizable(),
        "available" => MongoReadConcern::available(),
        "snapshot" => MongoReadConcern::snapshot(),
        other => MongoReadConcern::from(ReadConcernLevel::Custom(other.to_string())),
    }
}

pub(crate) fn write_concern(wc: &WriteConcern) -> MongoWriteConcern {
    let w = wc.w.as_ref().map(|w| match w {
        Acknowledgment::Nodes(n) => MongoAcknowledgment::Nodes(*n),
        Acknowledgment::Majority => MongoAcknowledgment::Majority,
        Acknowledgment::Custom(tag) => MongoAcknowledgment::Custom(tag.clone()),
    });
    MongoWriteConcern::builder()
        .w(w)
        .w_timeout(wc.w_timeout_ms.map(Duration::from_millis))
        .journal(wc.journal)
        .build()
}

pub(crate) fn selection_criteria(rp: &ReadPreference) -> SelectionCriteria {
    let tag_sets: Option<Vec<TagSet>> = (!rp.tags.is_empty()).then(|| {
        rp.tags
            .iter()
            .map(|tags| {
                tags.iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .collect()
    });
    let options = ReadPreferenceOptions::builder()
        .tag_sets(tag_sets)
        .max_staleness(
            rp.max_staleness_seconds
                .and_then(|s| u64::try_from(s).ok())
                .map(Duration::from_secs),
        )
        .hedge(rp.hedge.map(|enabled| HedgedReadOptions::builder().enabled(enabled).build()))
        .build();
    let preference = match rp.mode {
        ReadPreferenceMode::Primary => MongoReadPreference::Primary,
        ReadPreferenceMode::PrimaryPreferred => MongoReadPreference::PrimaryPreferred { options },
        ReadPreferenceMode::Secondary => MongoReadPreference::Secondary { options },
        ReadPreferenceMode::SecondaryPreferred => MongoReadPreference::SecondaryPreferred { options },
        ReadPreferenceMode::Nearest => MongoReadPreference::Nearest { options },
    };
    SelectionCriteria::ReadPreference(preference)
}

pub(crate) fn transaction_options(options: &TransactionOptions) -> MongoTransactionOptions {
    MongoTransactionOptions::builder()
        .read_concern(options.read_concern.as_ref().map(read_concern))
        .write_concern(options.write_concern.as_ref().map(write_concern))
        .selection_criteria(options.read_preference.as_ref().map(selection_criteria))
        .max_commit_time(options.max_commit_time_ms.map(Duration::from_millis))
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(v: Value) -> Document {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn extended_json_survives_the_trip_through_bson() {
        let original = doc(json!({
            "insert": "coll",
            "_id": { "$oid": "5f1a2b3c4d5e6f7081920a1b" },
            "n": 3,
            "big": { "$numberLong": "9000000000" },
            "nested": { "a": [1, 2.5, "x"] }
        }));
        let bson = to_bson(original.clone()).unwrap();
        assert_eq!(bson.keys().next().map(String::as_str), Some("insert"));
        assert!(matches!(bson.get("n"), Some(Bson::Int32(3))));
        assert!(matches!(bson.get("big"), Some(Bson::Int64(9_000_000_000))));

        let back = from_bson(bson);
        assert_eq!(back["_id"], json!({ "$oid": "5f1a2b3c4d5e6f7081920a1b" }));
        assert_eq!(back["n"], json!(3));
        assert_eq!(back["nested"], json!({ "a": [1, 2.5, "x"] }));
    }

    #[test]
    fn malformed_extended_json_is_rejected() {
        let err = to_bson(doc(json!({ "_id": { "$oid": "not hex" } }))).unwrap_err();
        assert!(err.is_client_error());
    }

    #[test]
    fn write_errors_keep_batch_positions() {
        let reply = doc(json!({
            "n": 1,
            "writeErrors": [{ "index": 1, "code": 11000, "codeName": "DuplicateKey", "errmsg": "dup" }],
            "ok": 1
        }));
        let errors = write_errors(&reply);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, 1);
        assert_eq!(errors[0].1.code(), Some(11000));
        assert_eq!(errors[0].1.code_name(), Some("DuplicateKey"));
        assert!(write_concern_error(&reply).is_none());
    }

    #[test]
    fn write_concern_error_carries_reply_labels() {
        let reply = doc(json!({
            "n": 1,
            "writeConcernError": { "code": 64, "codeName": "WriteConcernFailed", "errmsg": "timed out" },
            "errorLabels": ["RetryableWriteError"],
            "ok": 1
        }));
        let err = write_concern_error(&reply).unwrap();
        assert_eq!(err.code(), Some(64));
        assert!(err.has_label("RetryableWriteError"));
    }

    #[test]
    fn read_preference_modes_map_across() {
        let rp = ReadPreference {
            mode: ReadPreferenceMode::SecondaryPreferred,
            max_staleness_seconds: Some(120),
            tags: vec![doc(json!({ "dc": "east" }))],
            hedge: None,
        };
        match selection_criteria(&rp) {
            SelectionCriteria::ReadPreference(MongoReadPreference::SecondaryPreferred { options }) => {
                assert_eq!(options.max_staleness, Some(Duration::from_secs(120)));
                assert_eq!(options.tag_sets.map(|t| t.len()), Some(1));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            selection_criteria(&ReadPreference::primary()),
            SelectionCriteria::ReadPreference(MongoReadPreference::Primary)
        ));
    }

    #[test]
    fn write_concern_maps_every_component() {
        let wc = write_concern(&WriteConcern {
            w: Some(Acknowledgment::Majority),
            w_timeout_ms: Some(500),
            journal: Some(true),
        });
        assert_eq!(wc.w, Some(MongoAcknowledgment::Majority));
        assert_eq!(wc.w_timeout, Some(Duration::from_millis(500)));
        assert_eq!(wc.journal, Some(true));
    }
}
