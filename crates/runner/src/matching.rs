//! Value matching for `expectResult`, expected event documents and outcomes.
//!
//! Matching is a subset check. Every key of an expected document must be
//! present in the actual document and match recursively; keys the
//! expectation does not mention are ignored at every level. Arrays match
//! element-wise and must have the same length. Numbers compare by value.
//!
//! Outcome documents use [`assert_includes`] instead, which tolerates extra
//! keys only at the top level. Nested documents must have exactly the
//! expected keys.
//!
//! Expected values may embed `$$` operators:
//!
//! | operator                  | holds when                                   |
//! |---------------------------|----------------------------------------------|
//! | `$$exists: bool`          | the key is present / absent                  |
//! | `$$type: name or [names]` | the actual value has one of the named types  |
//! | `$$unsetOrMatches: v`     | the key is absent, or its value matches `v`  |
//! | `$$matchesHexBytes: hex`  | the actual bytes equal `hex`                 |
//! | `$$lte: n`                | the actual number is at most `n`             |
//!
//! `$$matchesEntity` and `$$sessionLsid` refer to entities. They are
//! substituted by [`resolve_placeholders`] before matching starts.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::{Map, Value};

use crate::entities::EntityMap;
use crate::error::{RunnerError, RunnerResult};

/// Where a matched document may carry keys the expectation leaves out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Extras {
    Everywhere,
    RootOnly,
    Nowhere,
}

impl Extras {
    fn nested(self) -> Extras {
        match self {
            Extras::Everywhere => Extras::Everywhere,
            Extras::RootOnly | Extras::Nowhere => Extras::Nowhere,
        }
    }
}

/// Check `actual` against `expected`; `context` prefixes the failure message.
pub fn assert_matches(expected: &Value, actual: Option<&Value>, context: &str) -> RunnerResult<()> {
    check(expected, actual, "$", Extras::Everywhere).map_err(|message| {
        RunnerError::mismatch(format!("{}: {}", context, message))
    })
}

/// Check that the document `actual` includes `expected`: extra keys are
/// allowed at the top level only, nested values must be equal.
pub fn assert_includes(expected: &Value, actual: &Value, context: &str) -> RunnerResult<()> {
    check(expected, Some(actual), "$", Extras::RootOnly).map_err(|message| {
        RunnerError::mismatch(format!("{}: {}", context, message))
    })
}

/// Like [`assert_matches`] but returns the failure text instead of an error.
pub fn matches(expected: &Value, actual: Option<&Value>) -> Result<(), String> {
    check(expected, actual, "$", Extras::Everywhere)
}

/// Replace `$$matchesEntity` and `$$sessionLsid` with the values they name.
pub fn resolve_placeholders(expected: &Value, entities: &EntityMap) -> RunnerResult<Value> {
    match expected {
        Value::Object(map) => {
            if let Some((op, arg)) = single_operator(map) {
                match op {
                    "$$matchesEntity" => {
                        let id = operator_id(op, arg)?;
                        return entities.value(id).cloned();
                    }
                    "$$sessionLsid" => {
                        let id = operator_id(op, arg)?;
                        return Ok(Value::Object(entities.session(id)?.session.lsid()));
                    }
                    _ => {}
                }
            }
            let mut resolved = Map::with_capacity(map.len());
            for (k, v) in map {
                resolved.insert(k.clone(), resolve_placeholders(v, entities)?);
            }
            Ok(Value::Object(resolved))
        }
        Value::Array(items) => items
            .iter()
            .map(|v| resolve_placeholders(v, entities))
            .collect::<RunnerResult<Vec<_>>>()
            .map(Value::Array),
        other => Ok(other.clone()),
    }
}

fn operator_id<'a>(op: &str, arg: &'a Value) -> RunnerResult<&'a str> {
    arg.as_str()
        .ok_or_else(|| RunnerError::configuration(format!("{} expects an entity id, got {}", op, arg)))
}

fn single_operator(map: &Map<String, Value>) -> Option<(&str, &Value)> {
    if map.len() != 1 {
        return None;
    }
    let (key, value) = map.iter().next()?;
    key.starts_with("$$").then_some((key.as_str(), value))
}

fn check(expected: &Value, actual: Option<&Value>, path: &str, extras: Extras) -> Result<(), String> {
    if let Value::Object(map) = expected {
        if let Some((op, arg)) = single_operator(map) {
            return check_operator(op, arg, actual, path, extras);
        }
    }
    let Some(actual) = actual else {
        return Err(format!("{}: expected {}, but the key is missing", path, expected));
    };
    match expected {
        Value::Object(exp) => {
            let Value::Object(act) = actual else {
                return Err(format!("{}: expected a document, got {}", path, actual));
            };
            for (key, value) in exp {
                check(value, act.get(key), &format!("{}.{}", path, key), extras.nested())?;
            }
            if extras == Extras::Nowhere {
                if let Some(key) = act.keys().find(|k| !exp.contains_key(*k)) {
                    return Err(format!("{}: unexpected key '{}' in {}", path, key, actual));
                }
            }
            Ok(())
        }
        Value::Array(exp) => {
            let Value::Array(act) = actual else {
                return Err(format!("{}: expected an array, got {}", path, actual));
            };
            if exp.len() != act.len() {
                return Err(format!(
                    "{}: expected {} elements, got {} ({})",
                    path,
                    exp.len(),
                    act.len(),
                    actual
                ));
            }
            for (i, (e, a)) in exp.iter().zip(act).enumerate() {
                check(e, Some(a), &format!("{}[{}]", path, i), extras.nested())?;
            }
            Ok(())
        }
        Value::Number(_) => match (as_number(expected), as_number(actual)) {
            (Some(e), Some(a)) if e == a => Ok(()),
            _ => Err(format!("{}: expected {}, got {}", path, expected, actual)),
        },
        _ if expected == actual => Ok(()),
        _ => Err(format!("{}: expected {}, got {}", path, expected, actual)),
    }
}

fn check_operator(
    op: &str,
    arg: &Value,
    actual: Option<&Value>,
    path: &str,
    extras: Extras,
) -> Result<(), String> {
    match op {
        "$$exists" => {
            let want = arg
                .as_bool()
                .ok_or_else(|| format!("{}: $$exists expects a boolean", path))?;
            let present = actual.is_some_and(|v| !v.is_null());
            if want == present {
                Ok(())
            } else if want {
                Err(format!("{}: expected the key to exist", path))
            } else {
                Err(format!("{}: expected the key to be absent, got {}", path, actual.unwrap_or(&Value::Null)))
            }
        }
        "$$type" => {
            let actual = actual.ok_or_else(|| format!("{}: expected a value of type {}, but the key is missing", path, arg))?;
            let names: Vec<&str> = match arg {
                Value::String(name) => vec![name.as_str()],
                Value::Array(names) => names.iter().filter_map(Value::as_str).collect(),
                _ => return Err(format!("{}: $$type expects a type name or list of names", path)),
            };
            if names.iter().any(|name| has_type(actual, name)) {
                Ok(())
            } else {
                Err(format!("{}: expected type {}, got {}", path, arg, actual))
            }
        }
        "$$unsetOrMatches" => match actual {
            None => Ok(()),
            Some(_) => check(arg, actual, path, extras),
        },
        "$$matchesHexBytes" => {
            let hex = arg
                .as_str()
                .ok_or_else(|| format!("{}: $$matchesHexBytes expects a hex string", path))?;
            let want = decode_hex(hex).map_err(|e| format!("{}: {}", path, e))?;
            let got = actual
                .and_then(binary_bytes)
                .ok_or_else(|| format!("{}: expected binary data, got {}", path, actual.unwrap_or(&Value::Null)))?;
            if got == want {
                Ok(())
            } else {
                Err(format!("{}: expected bytes {}, got {}", path, hex, encode_hex(&got)))
            }
        }
        "$$lte" => {
            let limit = as_number(arg).ok_or_else(|| format!("{}: $$lte expects a number", path))?;
            match actual.and_then(as_number) {
                Some(n) if n <= limit => Ok(()),
                _ => Err(format!("{}: expected a number <= {}, got {}", path, arg, actual.unwrap_or(&Value::Null))),
            }
        }
        "$$matchesEntity" | "$$sessionLsid" => Err(format!("{}: unresolved {} placeholder", path, op)),
        other => Err(format!("{}: unsupported operator {}", path, other)),
    }
}

/// Numeric value of a plain JSON number or an extended-JSON numeric wrapper.
fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Object(map) if map.len() == 1 => {
            let (key, inner) = map.iter().next()?;
            match key.as_str() {
                "$numberInt" | "$numberLong" | "$numberDouble" | "$numberDecimal" => {
                    inner.as_str()?.parse().ok()
                }
                _ => None,
            }
        }
        _ => None,
    }
}

fn wrapper(value: &Value) -> Option<&str> {
    match value {
        Value::Object(map) => map.keys().next().filter(|k| k.starts_with('$')).map(String::as_str),
        _ => None,
    }
}

fn has_key(value: &Value, key: &str) -> bool {
    value.as_object().is_some_and(|map| map.contains_key(key))
}

fn is_hex_id(s: &str) -> bool {
    s.len() == 24 && s.chars().all(|c| c.is_ascii_hexdigit())
}

fn has_type(value: &Value, name: &str) -> bool {
    match name {
        "objectId" => match value {
            Value::String(s) => is_hex_id(s),
            Value::Object(map) => map.get("$oid").and_then(Value::as_str).is_some_and(is_hex_id),
            _ => false,
        },
        "string" => value.is_string(),
        "int" => {
            value.as_i64().is_some_and(|n| i32::try_from(n).is_ok()) || wrapper(value) == Some("$numberInt")
        }
        "long" => value.is_i64() || value.is_u64() || wrapper(value) == Some("$numberLong"),
        "double" => value.is_f64() || wrapper(value) == Some("$numberDouble"),
        "number" => as_number(value).is_some(),
        "bool" => value.is_boolean(),
        "null" => value.is_null(),
        "array" => value.is_array(),
        "date" => wrapper(value) == Some("$date"),
        "binData" => wrapper(value) == Some("$binary"),
        "timestamp" => wrapper(value) == Some("$timestamp"),
        "decimal" => wrapper(value) == Some("$numberDecimal"),
        "regex" => wrapper(value) == Some("$regularExpression"),
        "javascript" => wrapper(value) == Some("$code") && !has_key(value, "$scope"),
        "javascriptWithScope" => wrapper(value) == Some("$code") && has_key(value, "$scope"),
        "symbol" => wrapper(value) == Some("$symbol"),
        "minKey" => wrapper(value) == Some("$minKey"),
        "maxKey" => wrapper(value) == Some("$maxKey"),
        "undefined" => wrapper(value) == Some("$undefined"),
        "dbPointer" => wrapper(value) == Some("$dbPointer"),
        "object" => value.is_object() && wrapper(value).is_none(),
        _ => false,
    }
}

fn binary_bytes(value: &Value) -> Option<Vec<u8>> {
    match value {
        Value::String(s) => decode_hex(s).ok(),
        Value::Object(map) => {
            let encoded = map.get("$binary")?.get("base64")?.as_str()?;
            STANDARD.decode(encoded).ok()
        }
        _ => None,
    }
}

pub(crate) fn decode_hex(hex: &str) -> Result<Vec<u8>, String> {
    if hex.len() % 2 != 0 {
        return Err(format!("odd-length hex string '{}'", hex));
    }
    hex.as_bytes()
        .chunks(2)
        .map(|pair| match (nibble(pair[0]), nibble(pair[1])) {
            (Some(high), Some(low)) => Ok((high << 4) | low),
            _ => Err(format!("invalid hex string '{}'", hex)),
        })
        .collect()
}

fn nibble(byte: u8) -> Option<u8> {
    char::from(byte).to_digit(16).and_then(|d| u8::try_from(d).ok())
}

pub(crate) fn encode_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
