// ── Firestore typed-value encoding ──
//
// Firestore's REST surface wraps every value in a single-key object naming
// its type (`{"stringValue": "x"}`, `{"mapValue": {"fields": {...}}}`).
// Callers work in plain `serde_json::Value`; these helpers translate.

use serde_json::{Map, Number, Value, json};

use crate::error::Error;

/// Encode a plain JSON object into a Firestore `fields` map.
pub fn encode_fields(data: &Map<String, Value>) -> Result<Map<String, Value>, Error> {
    data.iter()
        .map(|(k, v)| Ok((k.clone(), encode_value(v)?)))
        .collect()
}

/// Encode one plain JSON value into its Firestore typed form.
pub fn encode_value(value: &Value) -> Result<Value, Error> {
    Ok(match value {
        Value::Null => json!({ "nullValue": null }),
        Value::Bool(b) => json!({ "booleanValue": b }),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                // int64 travels as a decimal string
                json!({ "integerValue": i.to_string() })
            } else if n.is_u64() {
                return Err(Error::InvalidData(format!(
                    "integer {n} does not fit in a signed 64-bit value"
                )));
            } else {
                json!({ "doubleValue": n })
            }
        }
        Value::String(s) => json!({ "stringValue": s }),
        Value::Array(items) => {
            let values = items.iter().map(encode_value).collect::<Result<Vec<_>, _>>()?;
            json!({ "arrayValue": { "values": values } })
        }
        Value::Object(map) => json!({ "mapValue": { "fields": encode_fields(map)? } }),
    })
}

/// Decode a Firestore `fields` map back into a plain JSON object.
pub fn decode_fields(fields: &Map<String, Value>) -> Result<Map<String, Value>, Error> {
    fields
        .iter()
        .map(|(k, v)| Ok((k.clone(), decode_value(v)?)))
        .collect()
}

/// Decode one Firestore typed value.
///
/// Timestamps, references and bytes come back as their string forms;
/// geo points as `{latitude, longitude}` objects.
pub fn decode_value(value: &Value) -> Result<Value, Error> {
    let Some(obj) = value.as_object() else {
        return Err(invalid(value));
    };
    let Some((kind, inner)) = obj.iter().next() else {
        return Err(invalid(value));
    };

    Ok(match kind.as_str() {
        "nullValue" => Value::Null,
        "booleanValue" => Value::Bool(inner.as_bool().ok_or_else(|| invalid(value))?),
        "integerValue" => {
            let parsed = match inner {
                Value::String(s) => s.parse::<i64>().ok(),
                other => other.as_i64(),
            };
            Value::Number(parsed.ok_or_else(|| invalid(value))?.into())
        }
        "doubleValue" => match inner {
            Value::Number(_) => inner.clone(),
            // "NaN", "Infinity" and "-Infinity" have no JSON number form
            Value::String(s) => s
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map_or_else(|| Value::String(s.clone()), Value::Number),
            _ => return Err(invalid(value)),
        },
        "stringValue" | "timestampValue" | "referenceValue" | "bytesValue" | "geoPointValue" => {
            inner.clone()
        }
        "arrayValue" => {
            let values = match inner.get("values") {
                Some(Value::Array(items)) => items
                    .iter()
                    .map(decode_value)
                    .collect::<Result<Vec<_>, _>>()?,
                Some(_) => return Err(invalid(value)),
                None => Vec::new(),
            };
            Value::Array(values)
        }
        "mapValue" => match inner.get("fields") {
            Some(Value::Object(fields)) => Value::Object(decode_fields(fields)?),
            Some(_) => return Err(invalid(value)),
            None => Value::Object(Map::new()),
        },
        _ => return Err(invalid(value)),
    })
}

fn invalid(value: &Value) -> Error {
    Error::InvalidData(format!("unrecognized Firestore value: {value}"))
}
