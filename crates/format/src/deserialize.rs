//! Deserialization of suite documents into typed structs.
//!
//! The entry points are [`from_json`] and [`from_str`]. Both refuse suites
//! whose `schemaVersion` falls outside [`SUPPORTED_SCHEMA_VERSION`], so an
//! unsupported suite never reaches the runner.

use semver::{Version, VersionReq};

use crate::types::Suite;

/// Range of schema versions this interpreter understands.
pub const SUPPORTED_SCHEMA_VERSION: &str = "^1.0";

/// Errors raised while reading a suite document.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FormatError {
    /// The document is not valid JSON or does not have the suite shape.
    #[error("malformed suite: {0}")]
    Malformed(String),

    /// A nested field failed validation.
    #[error("invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    /// `schemaVersion` could not be parsed as a version.
    #[error("invalid schema version '{version}': {message}")]
    InvalidSchemaVersion { version: String, message: String },

    /// `schemaVersion` parsed but is outside the supported range.
    #[error("unsupported schema version '{version}' (supported: {supported})")]
    UnsupportedSchemaVersion { version: String, supported: String },
}

/// Pad a `major` or `major.minor` version string out to `major.minor.patch`.
pub fn patch_version(version: &str) -> String {
    let parts = version.split('.').count();
    match parts {
        1 => format!("{}.0.0", version),
        2 => format!("{}.0", version),
        _ => version.to_string(),
    }
}

/// Check a suite's `schemaVersion` against [`SUPPORTED_SCHEMA_VERSION`].
pub fn check_schema_version(version: &str) -> Result<Version, FormatError> {
    let patched = patch_version(version.trim());
    let parsed = Version::parse(&patched).map_err(|e| FormatError::InvalidSchemaVersion {
        version: version.to_string(),
        message: e.to_string(),
    })?;
    let supported = VersionReq::parse(SUPPORTED_SCHEMA_VERSION).map_err(|e| {
        FormatError::InvalidSchemaVersion {
            version: SUPPORTED_SCHEMA_VERSION.to_string(),
            message: e.to_string(),
        }
    })?;
    if !supported.matches(&parsed) {
        return Err(FormatError::UnsupportedSchemaVersion {
            version: version.to_string(),
            supported: SUPPORTED_SCHEMA_VERSION.to_string(),
        });
    }
    Ok(parsed)
}

/// Deserialize a suite from an already-parsed JSON value.
pub fn from_json(document: &serde_json::Value) -> Result<Suite, FormatError> {
    let suite: Suite = serde_json::from_value(document.clone())
        .map_err(|e| FormatError::Malformed(e.to_string()))?;
    check_schema_version(&suite.schema_version)?;
    check_unique_entity_ids(&suite)?;
    Ok(suite)
}

/// Deserialize a suite from JSON text.
pub fn from_str(source: &str) -> Result<Suite, FormatError> {
    let document: serde_json::Value =
        serde_json::from_str(source).map_err(|e| FormatError::Malformed(e.to_string()))?;
    from_json(&document)
}

fn check_unique_entity_ids(suite: &Suite) -> Result<(), FormatError> {
    let mut seen = std::collections::BTreeSet::new();
    for (i, entity) in suite.create_entities.iter().enumerate() {
        if !seen.insert(entity.id()) {
            return Err(FormatError::InvalidField {
                field: format!("createEntities[{}]", i),
                message: format!("duplicate entity id '{}'", entity.id()),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn minimal_suite(version: &str) -> serde_json::Value {
        json!({
            "description": "minimal",
            "schemaVersion": version,
            "tests": [
                { "description": "noop", "operations": [] }
            ]
        })
    }

    #[test]
    fn patch_version_pads_short_forms() {
        assert_eq!(patch_version("1"), "1.0.0");
        assert_eq!(patch_version("1.7"), "1.7.0");
        assert_eq!(patch_version("1.7.2"), "1.7.2");
    }

    #[test]
    fn accepts_versions_in_range() {
        for v in ["1.0", "1.5", "1.13.1"] {
            let suite = from_json(&minimal_suite(v)).unwrap();
            assert_eq!(suite.tests.len(), 1);
        }
    }

    #[test]
    fn rejects_versions_out_of_range() {
        let err = from_json(&minimal_suite("2.0")).unwrap_err();
        assert!(matches!(err, FormatError::UnsupportedSchemaVersion { .. }));

        let err = from_json(&minimal_suite("0.9")).unwrap_err();
        assert!(matches!(err, FormatError::UnsupportedSchemaVersion { .. }));
    }

    #[test]
    fn rejects_unparseable_version() {
        let err = from_json(&minimal_suite("one.oh")).unwrap_err();
        assert!(matches!(err, FormatError::InvalidSchemaVersion { .. }));
    }

    #[test]
    fn rejects_duplicate_entity_ids() {
        let mut doc = minimal_suite("1.0");
        doc["createEntities"] = json!([
            { "client": { "id": "client0" } },
            { "database": { "id": "client0", "client": "client0", "databaseName": "db" } }
        ]);
        let err = from_json(&doc).unwrap_err();
        assert!(matches!(err, FormatError::InvalidField { .. }), "{}", err);
    }

    #[test]
    fn missing_tests_is_malformed() {
        let err = from_str(r#"{"description": "x", "schemaVersion": "1.0"}"#).unwrap_err();
        assert!(matches!(err, FormatError::Malformed(_)));
    }
}
