//! unified-format: typed model of the unified test format.
//!
//! Provides typed structs for every part of a suite document (requirements,
//! entity descriptions, operations, expected errors and events, collection
//! data) and the [`from_json`] / [`from_str`] entry points that deserialize
//! a suite and enforce the supported schema version.
//!
//! This crate has no behavior beyond parsing. The runner interprets the
//! model; the driver boundary never sees it.

pub mod deserialize;
pub mod types;

pub use deserialize::{
    check_schema_version, from_json, from_str, patch_version, FormatError,
    SUPPORTED_SCHEMA_VERSION,
};
pub use types::*;
