//! Purpose: Convert between CLI JSON and stored pool values.
//! Exports: `value_from_json`, `value_to_json`.
//! Role: Keep the JSON shape of every value type in one place.
//! Invariants: Integral JSON numbers that fit i64 become `Int`; all others become `Float`.
//! Invariants: Types JSON cannot express (bytes, opaque, non-finite floats) render as tagged objects.

use std::collections::BTreeMap;

use latzero::api::{Error, ErrorKind, Value};
use serde_json::{Map, Number, Value as Json, json};

pub(crate) fn value_from_json(json: &Json) -> Result<Value, Error> {
    Ok(match json {
        Json::Null => Value::Null,
        Json::Bool(flag) => Value::Bool(*flag),
        Json::Number(number) => match number.as_i64() {
            Some(int) => Value::Int(int),
            None => Value::Float(number.as_f64().ok_or_else(|| {
                Error::new(ErrorKind::Usage).with_message(format!("unsupported number {number}"))
            })?),
        },
        Json::String(text) => Value::Text(text.clone()),
        Json::Array(items) => Value::List(items.iter().map(value_from_json).collect::<Result<_, _>>()?),
        Json::Object(fields) => Value::Map(
            fields
                .iter()
                .map(|(key, item)| Ok((key.clone(), value_from_json(item)?)))
                .collect::<Result<BTreeMap<_, _>, Error>>()?,
        ),
    })
}

pub(crate) fn value_to_json(value: &Value) -> Json {
    match value {
        Value::Null => Json::Null,
        Value::Bool(flag) => json!(flag),
        Value::Int(int) => json!(int),
        Value::Float(float) => match Number::from_f64(*float) {
            Some(number) => Json::Number(number),
            None => json!({ "$float": float.to_string() }),
        },
        Value::Text(text) => json!(text),
        Value::Bytes(data) => json!({ "$bytes": hex(data) }),
        Value::List(items) => Json::Array(items.iter().map(value_to_json).collect()),
        Value::Map(fields) => {
            let mut map = Map::new();
            for (key, item) in fields {
                map.insert(key.clone(), value_to_json(item));
            }
            Json::Object(map)
        }
        Value::Opaque { type_name, data } => json!({ "$opaque": type_name, "hex": hex(data) }),
    }
}

fn hex(data: &[u8]) -> String {
    data.iter().map(|byte| format!("{byte:02x}")).collect()
}
