//! Normalization of QEMU style block graph JSON.
//!
//! The same graph can be spelled with nested objects or with dotted keys,
//! `{"file":{"driver":"file"}}` versus `{"file.driver":"file"}`, and numbers
//! may be quoted. Everything is brought into one nested form before drivers
//! are decoded.

use serde_json::{Map, Number, Value};

use imgchain_api::error::ParseError;

/// Keys whose values are integers even when written as strings.
const INTEGER_KEYS: &[&str] = &[
    "port",
    "lun",
    "user",
    "group",
    "offset",
    "size",
    "timeout",
    "namespace",
];

/// Keys whose values are booleans even when written as `on`/`off`.
const BOOLEAN_KEYS: &[&str] = &["sslverify"];

/// Key holding server addresses, always turned into an array.
const SERVER_KEY: &str = "server";

/// Parses `text` and returns the normalized top level object.
pub fn normalize(text: &str) -> Result<Map<String, Value>, ParseError> {
    let value: Value = serde_json::from_str(text).map_err(|e| ParseError::MalformedJson {
        reason: e.to_string(),
    })?;

    if !value.is_object() {
        return Err(ParseError::JsonNotObject);
    }

    match normalize_value(None, value)? {
        Value::Object(map) => Ok(map),
        _ => Err(ParseError::JsonNotObject),
    }
}

fn normalize_value(key: Option<&str>, value: Value) -> Result<Value, ParseError> {
    match value {
        Value::Object(map) => {
            let mut deflattened = Map::new();
            for (key, value) in map {
                insert_dotted(&mut deflattened, &key, &key, value)?;
            }

            let mut normalized = Map::new();
            for (key, value) in deflattened {
                let value = normalize_value(Some(&key), value)?;
                normalized.insert(key, value);
            }

            let value = indexed_to_array(normalized);
            Ok(match (key, value) {
                (Some(SERVER_KEY), value @ Value::Object(_)) => Value::Array(vec![value]),
                (_, value) => value,
            })
        }
        Value::Array(items) => Ok(Value::Array(
            items
                .into_iter()
                .map(|item| normalize_value(None, item))
                .collect::<Result<_, _>>()?,
        )),
        Value::String(text) => Ok(coerce_string(key, text)),
        value => Ok(value),
    }
}

/// Inserts `value` under a possibly dotted `key`, creating intermediate
/// objects. `full_key` is only used for error reporting.
fn insert_dotted(
    target: &mut Map<String, Value>,
    full_key: &str,
    key: &str,
    value: Value,
) -> Result<(), ParseError> {
    let conflict = || ParseError::DeflattenConflict {
        key: full_key.to_string(),
    };

    if let Some((prefix, rest)) = key.split_once('.') {
        let entry = target
            .entry(prefix)
            .or_insert_with(|| Value::Object(Map::new()));
        let Value::Object(nested) = entry else {
            return Err(conflict());
        };
        return insert_dotted(nested, full_key, rest, value);
    }

    if !target.contains_key(key) {
        target.insert(key.to_string(), value);
        return Ok(());
    }

    // Both spellings of the same object were used, merge them
    match (target.get_mut(key), value) {
        (Some(Value::Object(existing)), Value::Object(incoming)) => {
            for (nested_key, nested_value) in incoming {
                insert_dotted(existing, full_key, &nested_key, nested_value)?;
            }
            Ok(())
        }
        _ => Err(conflict()),
    }
}

/// Turns an object with keys `"0"` to `"n-1"` into an array.
fn indexed_to_array(map: Map<String, Value>) -> Value {
    let is_indexed = !map.is_empty()
        && (0..map.len()).all(|index| map.contains_key(index.to_string().as_str()));
    if !is_indexed {
        return Value::Object(map);
    }

    let mut map = map;
    Value::Array(
        (0..map.len())
            .filter_map(|index| map.remove(index.to_string().as_str()))
            .collect(),
    )
}

fn coerce_string(key: Option<&str>, text: String) -> Value {
    let Some(key) = key else {
        return Value::String(text);
    };

    if INTEGER_KEYS.contains(&key) && !text.is_empty() && text.bytes().all(|b| b.is_ascii_digit())
    {
        if let Ok(number) = text.parse::<u64>() {
            return Value::Number(Number::from(number));
        }
    }

    if BOOLEAN_KEYS.contains(&key) {
        match text.as_str() {
            "on" => return Value::Bool(true),
            "off" => return Value::Bool(false),
            _ => {}
        }
    }

    Value::String(text)
}
