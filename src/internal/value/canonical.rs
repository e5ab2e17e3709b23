//! Canonical JSON encoding of structured values.
//!
//! The canonical form is what gets hashed, signed, written to the commit
//! log, and sent over the wire. It must be byte-identical across peers:
//! object keys are sorted (the default `serde_json::Map` is ordered), and
//! numeric forms are normalized so `5.0` and `5` encode identically.
//!
//! Typed values that JSON cannot represent natively are wrapped in a
//! single-key tag object: `{"$ts": ms}`, `{"$b64": "..."}`, `{"$set":
//! [...]}`, `{"$map": {...}}`, `{"$rt": tree}`. Plain JSON objects never
//! appear outside a tag body, so decoding is unambiguous.

use base64::{Engine as _, engine::general_purpose::STANDARD as B64};
use serde_json::{Map, Number, Value as Json};

use super::{Value, richtext::RichText};
use crate::errors::SchemaError;

const TAG_TS: &str = "$ts";
const TAG_B64: &str = "$b64";
const TAG_SET: &str = "$set";
const TAG_MAP: &str = "$map";
const TAG_RT: &str = "$rt";

/// Encode a value into its canonical JSON form.
///
/// Fails with `SchemaError::TypeMismatch` on NaN or infinite numbers; those
/// have no canonical encoding and are rejected before they can poison a
/// commit id.
pub fn to_canonical_json(value: &Value) -> Result<Json, SchemaError> {
    match value {
        Value::Null => Ok(Json::Null),
        Value::Bool(b) => Ok(Json::Bool(*b)),
        Value::Int(i) => Ok(Json::Number((*i).into())),
        Value::Num(f) => {
            if !f.is_finite() {
                return Err(SchemaError::TypeMismatch {
                    field: String::new(),
                    expected: "finite number".to_string(),
                    actual: f.to_string(),
                });
            }
            if f.fract() == 0.0 && *f >= i64::MIN as f64 && *f <= i64::MAX as f64 {
                Ok(Json::Number((*f as i64).into()))
            } else {
                // Finite non-integral floats always have a Number form.
                Ok(Json::Number(Number::from_f64(*f).expect("finite")))
            }
        }
        Value::Str(s) => Ok(Json::String(s.clone())),
        Value::Ts(ms) => Ok(tag(TAG_TS, Json::Number((*ms).into()))),
        Value::Blob(bytes) => Ok(tag(TAG_B64, Json::String(B64.encode(bytes)))),
        Value::RichText(rt) => {
            let tree = serde_json::to_value(rt).map_err(|e| SchemaError::TypeMismatch {
                field: String::new(),
                expected: "serializable rich text".to_string(),
                actual: e.to_string(),
            })?;
            Ok(tag(TAG_RT, tree))
        }
        Value::List(items) => Ok(Json::Array(
            items
                .iter()
                .map(to_canonical_json)
                .collect::<Result<_, _>>()?,
        )),
        Value::Set(items) => {
            let members = items
                .iter()
                .map(to_canonical_json)
                .collect::<Result<_, _>>()?;
            Ok(tag(TAG_SET, Json::Array(members)))
        }
        Value::Map(map) => {
            let mut body = Map::with_capacity(map.len());
            for (k, v) in map {
                body.insert(k.clone(), to_canonical_json(v)?);
            }
            Ok(tag(TAG_MAP, Json::Object(body)))
        }
    }
}

/// Decode a canonical JSON form back into a value.
pub fn from_canonical_json(json: &Json) -> Result<Value, SchemaError> {
    let decode_err = |what: &str, got: &Json| SchemaError::TypeMismatch {
        field: String::new(),
        expected: what.to_string(),
        actual: got.to_string(),
    };

    match json {
        Json::Null => Ok(Value::Null),
        Json::Bool(b) => Ok(Value::Bool(*b)),
        Json::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Value::Int(i))
            } else if let Some(f) = n.as_f64() {
                Ok(Value::Num(f))
            } else {
                Err(decode_err("representable number", json))
            }
        }
        Json::String(s) => Ok(Value::Str(s.clone())),
        Json::Array(items) => Ok(Value::List(
            items
                .iter()
                .map(from_canonical_json)
                .collect::<Result<_, _>>()?,
        )),
        Json::Object(map) => {
            if map.len() != 1 {
                return Err(decode_err("single-key tag object", json));
            }
            let (key, body) = map.iter().next().expect("len checked");
            match key.as_str() {
                TAG_TS => body
                    .as_i64()
                    .map(Value::Ts)
                    .ok_or_else(|| decode_err("integer timestamp", body)),
                TAG_B64 => {
                    let s = body
                        .as_str()
                        .ok_or_else(|| decode_err("base64 string", body))?;
                    let bytes = B64
                        .decode(s)
                        .map_err(|_| decode_err("valid base64", body))?;
                    Ok(Value::Blob(bytes))
                }
                TAG_SET => {
                    let items = body
                        .as_array()
                        .ok_or_else(|| decode_err("set array", body))?;
                    let mut set = Value::Set(vec![]);
                    for item in items {
                        set.set_insert(from_canonical_json(item)?);
                    }
                    Ok(set)
                }
                TAG_MAP => {
                    let obj = body
                        .as_object()
                        .ok_or_else(|| decode_err("map object", body))?;
                    let mut out = std::collections::BTreeMap::new();
                    for (k, v) in obj {
                        out.insert(k.clone(), from_canonical_json(v)?);
                    }
                    Ok(Value::Map(out))
                }
                TAG_RT => {
                    let rt: RichText = serde_json::from_value(body.clone())
                        .map_err(|_| decode_err("rich text tree", body))?;
                    Ok(Value::RichText(rt))
                }
                other => Err(decode_err("known tag", &Json::String(other.to_string()))),
            }
        }
    }
}

fn tag(name: &str, body: Json) -> Json {
    let mut map = Map::with_capacity(1);
    map.insert(name.to_string(), body);
    Json::Object(map)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn round_trip(v: Value) -> Value {
        let json = to_canonical_json(&v).unwrap();
        from_canonical_json(&json).unwrap()
    }

    #[test]
    fn scalar_round_trips() {
        assert_eq!(round_trip(Value::Null), Value::Null);
        assert_eq!(round_trip(Value::Bool(true)), Value::Bool(true));
        assert_eq!(round_trip(Value::Int(-3)), Value::Int(-3));
        assert_eq!(round_trip(Value::Num(2.5)), Value::Num(2.5));
        assert_eq!(round_trip(Value::Str("x".into())), Value::Str("x".into()));
        assert_eq!(round_trip(Value::Ts(1700000000000)), Value::Ts(1700000000000));
        assert_eq!(round_trip(Value::Blob(vec![0, 1, 255])), Value::Blob(vec![0, 1, 255]));
    }

    #[test]
    fn integral_float_encodes_as_int() {
        let json = to_canonical_json(&Value::Num(4.0)).unwrap();
        assert_eq!(json, serde_json::json!(4));
        assert_eq!(from_canonical_json(&json).unwrap(), Value::Int(4));
    }

    #[test]
    fn timestamp_distinct_from_int() {
        let ts = to_canonical_json(&Value::Ts(42)).unwrap();
        let int = to_canonical_json(&Value::Int(42)).unwrap();
        assert_ne!(ts, int);
        assert_eq!(from_canonical_json(&ts).unwrap(), Value::Ts(42));
    }

    #[test]
    fn nested_containers_round_trip() {
        let mut map = BTreeMap::new();
        map.insert("k".to_string(), Value::List(vec![Value::Int(1), Value::Null]));
        let mut set = Value::Set(vec![]);
        set.set_insert(Value::Str("b".into()));
        set.set_insert(Value::Str("a".into()));
        map.insert("s".to_string(), set);
        let v = Value::Map(map);
        assert_eq!(round_trip(v.clone()), v);
    }

    #[test]
    fn nan_is_rejected() {
        assert!(to_canonical_json(&Value::Num(f64::NAN)).is_err());
        assert!(to_canonical_json(&Value::Num(f64::INFINITY)).is_err());
    }

    #[test]
    fn plain_object_is_rejected_on_decode() {
        let json = serde_json::json!({"a": 1, "b": 2});
        assert!(from_canonical_json(&json).is_err());
    }
}
