//! Conversions from suite option shapes to driver option types.

use serde::de::DeserializeOwned;
use serde_json::Value;
use unified_driver::{
    Acknowledgment, BucketOptions, Document, HandleOptions, ReadConcern, ReadPreference,
    ReadPreferenceMode, ServerApiOptions, SessionOptions, TransactionOptions, WriteConcern,
};
use unified_format::{
    CollectionOrDatabaseOptions, ReadConcernSpec, ReadPreferenceSpec, ServerApi, WriteConcernSpec,
};

use crate::error::{RunnerError, RunnerResult};

fn parse<T: DeserializeOwned>(field: &str, value: &Value) -> RunnerResult<T> {
    serde_json::from_value(value.clone())
        .map_err(|e| RunnerError::configuration(format!("invalid {}: {}", field, e)))
}

pub fn read_concern(spec: &ReadConcernSpec) -> ReadConcern {
    ReadConcern {
        level: spec.level.clone(),
    }
}

pub fn read_preference(spec: &ReadPreferenceSpec) -> RunnerResult<ReadPreference> {
    let mode = ReadPreferenceMode::parse(&spec.mode).ok_or_else(|| {
        RunnerError::configuration(format!("unknown read preference mode '{}'", spec.mode))
    })?;
    Ok(ReadPreference {
        mode,
        max_staleness_seconds: spec.max_staleness_seconds,
        tags: spec.tags.clone(),
        hedge: spec.hedge.as_ref().map(|h| h.enabled),
    })
}

pub fn write_concern(spec: &WriteConcernSpec) -> RunnerResult<WriteConcern> {
    let w = match &spec.w {
        None => None,
        Some(Value::String(tag)) if tag == "majority" => Some(Acknowledgment::Majority),
        Some(Value::String(tag)) => Some(Acknowledgment::Custom(tag.clone())),
        Some(Value::Number(n)) => {
            let n = n
                .as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .ok_or_else(|| RunnerError::configuration(format!("invalid write concern w: {}", n)))?;
            Some(Acknowledgment::Nodes(n))
        }
        Some(other) => {
            return Err(RunnerError::configuration(format!(
                "invalid write concern w: {}",
                other
            )))
        }
    };
    Ok(WriteConcern {
        w,
        w_timeout_ms: spec.wtimeout_ms,
        journal: spec.journal,
    })
}

/// Handle options declared on a database or collection entity.
pub fn handle_options(spec: Option<&CollectionOrDatabaseOptions>) -> RunnerResult<HandleOptions> {
    let Some(spec) = spec else {
        return Ok(HandleOptions::default());
    };
    Ok(HandleOptions {
        read_concern: spec.read_concern.as_ref().map(read_concern),
        read_preference: spec.read_preference.as_ref().map(read_preference).transpose()?,
        write_concern: spec.write_concern.as_ref().map(write_concern).transpose()?,
    })
}

pub fn server_api(spec: &ServerApi) -> ServerApiOptions {
    ServerApiOptions {
        version: spec.version.clone(),
        strict: spec.strict,
        deprecation_errors: spec.deprecation_errors,
    }
}

/// `readConcern`, `writeConcern`, `readPreference` and `maxCommitTimeMS`
/// read from a transaction options document.
pub fn transaction_options(doc: &Document) -> RunnerResult<TransactionOptions> {
    let concern = doc
        .get("readConcern")
        .map(|v| parse::<ReadConcernSpec>("readConcern", v))
        .transpose()?;
    let write_concern = doc
        .get("writeConcern")
        .map(|v| parse::<WriteConcernSpec>("writeConcern", v).and_then(|s| write_concern(&s)))
        .transpose()?;
    let read_preference = doc
        .get("readPreference")
        .map(|v| parse::<ReadPreferenceSpec>("readPreference", v).and_then(|s| read_preference(&s)))
        .transpose()?;
    Ok(TransactionOptions {
        read_concern: concern.as_ref().map(read_concern),
        write_concern,
        read_preference,
        max_commit_time_ms: doc.get("maxCommitTimeMS").and_then(Value::as_u64),
    })
}

pub fn session_options(doc: Option<&Document>) -> RunnerResult<SessionOptions> {
    let Some(doc) = doc else {
        return Ok(SessionOptions::default());
    };
    let defaults = match doc.get("defaultTransactionOptions") {
        Some(Value::Object(d)) => Some(transaction_options(d)?),
        Some(other) => {
            return Err(RunnerError::configuration(format!(
                "invalid defaultTransactionOptions: {}",
                other
            )))
        }
        None => None,
    };
    Ok(SessionOptions {
        causal_consistency: doc.get("causalConsistency").and_then(Value::as_bool),
        snapshot: doc.get("snapshot").and_then(Value::as_bool),
        default_transaction_options: defaults,
    })
}

pub fn bucket_options(doc: Option<&Document>) -> RunnerResult<BucketOptions> {
    let mut options = BucketOptions::default();
    let Some(doc) = doc else {
        return Ok(options);
    };
    if let Some(name) = doc.get("bucketName").and_then(Value::as_str) {
        options.bucket_name = name.to_string();
    }
    if let Some(size) = doc.get("chunkSizeBytes").and_then(Value::as_u64) {
        options.chunk_size_bytes = u32::try_from(size)
            .map_err(|_| RunnerError::configuration(format!("chunkSizeBytes {} is too large", size)))?;
    }
    if let Some(wc) = doc.get("writeConcern") {
        options.write_concern = Some(write_concern(&parse::<WriteConcernSpec>("writeConcern", wc)?)?);
    }
    Ok(options)
}
