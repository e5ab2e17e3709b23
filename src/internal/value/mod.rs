//! The structured document value model.
//!
//! A document value is a mapping from field name to [`Value`], a tagged sum
//! type covering scalars, blobs, rich text, and the three container shapes.
//! Values have a canonical serialization (stable key order, normalized
//! numeric forms) defined in [`canonical`]; that form is the basis for
//! equality, checksums, commit ids and signatures.

pub mod canonical;
pub mod richtext;

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::SchemaError;
use crate::hash::ContentHash;

pub use richtext::RichText;

/// A single structured value.
///
/// `Set` members are kept normalized, deduplicated and sorted by
/// [`cmp_values`]; use [`Value::set_insert`] / [`Value::set_remove`] rather
/// than pushing into the vector directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Num(f64),
    Str(String),
    /// Milliseconds since the Unix epoch.
    Ts(i64),
    Blob(Vec<u8>),
    RichText(RichText),
    List(Vec<Value>),
    Set(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

/// The type tag of a [`Value`], used by schema field declarations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueKind {
    Bool,
    Int,
    Num,
    Str,
    Ts,
    Blob,
    RichText,
    List,
    Set,
    Map,
}

impl ValueKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ValueKind::Bool => "bool",
            ValueKind::Int => "int",
            ValueKind::Num => "number",
            ValueKind::Str => "string",
            ValueKind::Ts => "timestamp",
            ValueKind::Blob => "blob",
            ValueKind::RichText => "richtext",
            ValueKind::List => "list",
            ValueKind::Set => "set",
            ValueKind::Map => "map",
        }
    }
}

impl std::fmt::Display for ValueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Value {
    /// The kind tag, or `None` for `Null` (null matches any nullable field).
    pub fn kind(&self) -> Option<ValueKind> {
        match self {
            Value::Null => None,
            Value::Bool(_) => Some(ValueKind::Bool),
            Value::Int(_) => Some(ValueKind::Int),
            Value::Num(_) => Some(ValueKind::Num),
            Value::Str(_) => Some(ValueKind::Str),
            Value::Ts(_) => Some(ValueKind::Ts),
            Value::Blob(_) => Some(ValueKind::Blob),
            Value::RichText(_) => Some(ValueKind::RichText),
            Value::List(_) => Some(ValueKind::List),
            Value::Set(_) => Some(ValueKind::Set),
            Value::Map(_) => Some(ValueKind::Map),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Normalize numeric forms recursively: a `Num` with zero fractional
    /// part collapses to `Int`, `-0.0` collapses to `0`. Set members are
    /// re-sorted after normalization.
    pub fn normalized(self) -> Value {
        match self {
            Value::Num(f) if f.is_finite() && f.fract() == 0.0 && in_i64_range(f) => {
                Value::Int(f as i64)
            }
            Value::List(items) => Value::List(items.into_iter().map(Value::normalized).collect()),
            Value::Set(items) => {
                let mut members: Vec<Value> = items.into_iter().map(Value::normalized).collect();
                members.sort_by(cmp_values);
                members.dedup_by(|a, b| cmp_values(a, b) == Ordering::Equal);
                Value::Set(members)
            }
            Value::Map(map) => Value::Map(
                map.into_iter()
                    .map(|(k, v)| (k, v.normalized()))
                    .collect(),
            ),
            other => other,
        }
    }

    /// Canonical serialization of this value. Fails on non-finite numbers.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, SchemaError> {
        let json = canonical::to_canonical_json(self)?;
        Ok(serde_json::to_vec(&json).expect("canonical json never fails to serialize"))
    }

    /// Canonical-form equality.
    pub fn canonical_eq(&self, other: &Value) -> bool {
        cmp_values(&self.clone().normalized(), &other.clone().normalized()) == Ordering::Equal
    }

    /// Stable digest of the canonical form.
    pub fn checksum(&self) -> Result<ContentHash, SchemaError> {
        Ok(ContentHash::compute(&self.canonical_bytes()?))
    }

    /// Insert into a `Set` value, keeping members sorted and unique.
    /// Returns true if the member was not already present.
    pub fn set_insert(&mut self, member: Value) -> bool {
        if let Value::Set(items) = self {
            let member = member.normalized();
            match items.binary_search_by(|m| cmp_values(m, &member)) {
                Ok(_) => false,
                Err(idx) => {
                    items.insert(idx, member);
                    true
                }
            }
        } else {
            false
        }
    }

    /// Remove from a `Set` value. Returns true if the member was present.
    pub fn set_remove(&mut self, member: &Value) -> bool {
        if let Value::Set(items) = self {
            let member = member.clone().normalized();
            match items.binary_search_by(|m| cmp_values(m, &member)) {
                Ok(idx) => {
                    items.remove(idx);
                    true
                }
                Err(_) => false,
            }
        } else {
            false
        }
    }
}

fn in_i64_range(f: f64) -> bool {
    f >= i64::MIN as f64 && f <= i64::MAX as f64
}

/// Total, deterministic ordering over values: variant rank first, then the
/// natural ordering of the payload. Floats order by IEEE `total_cmp`, so the
/// result is identical on every peer. Used for set membership and anywhere a
/// stable ordering over heterogeneous values is needed.
pub fn cmp_values(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int(_) => 2,
            Value::Num(_) => 3,
            Value::Str(_) => 4,
            Value::Ts(_) => 5,
            Value::Blob(_) => 6,
            Value::RichText(_) => 7,
            Value::List(_) => 8,
            Value::Set(_) => 9,
            Value::Map(_) => 10,
        }
    }

    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Int(x), Value::Int(y)) => x.cmp(y),
        (Value::Num(x), Value::Num(y)) => x.total_cmp(y),
        // Mixed numerics compare by value so Int(5) == Num(5.0) after
        // normalization and orders sensibly before it.
        (Value::Int(x), Value::Num(y)) => (*x as f64).total_cmp(y),
        (Value::Num(x), Value::Int(y)) => x.total_cmp(&(*y as f64)),
        (Value::Str(x), Value::Str(y)) => x.cmp(y),
        (Value::Ts(x), Value::Ts(y)) => x.cmp(y),
        (Value::Blob(x), Value::Blob(y)) => x.cmp(y),
        (Value::RichText(x), Value::RichText(y)) => x.flat_tokens().cmp(&y.flat_tokens()),
        (Value::List(x), Value::List(y)) | (Value::Set(x), Value::Set(y)) => {
            for (xi, yi) in x.iter().zip(y.iter()) {
                match cmp_values(xi, yi) {
                    Ordering::Equal => continue,
                    other => return other,
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Map(x), Value::Map(y)) => {
            for ((xk, xv), (yk, yv)) in x.iter().zip(y.iter()) {
                match xk.cmp(yk) {
                    Ordering::Equal => {}
                    other => return other,
                }
                match cmp_values(xv, yv) {
                    Ordering::Equal => {}
                    other => return other,
                }
            }
            x.len().cmp(&y.len())
        }
        _ => rank(a).cmp(&rank(b)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_collapses_integral_floats() {
        assert_eq!(Value::Num(5.0).normalized(), Value::Int(5));
        assert_eq!(Value::Num(-0.0).normalized(), Value::Int(0));
        assert_eq!(Value::Num(5.5).normalized(), Value::Num(5.5));
    }

    #[test]
    fn canonical_eq_across_numeric_forms() {
        assert!(Value::Int(7).canonical_eq(&Value::Num(7.0)));
        assert!(!Value::Int(7).canonical_eq(&Value::Num(7.5)));
    }

    #[test]
    fn set_insert_keeps_sorted_unique() {
        let mut set = Value::Set(vec![]);
        assert!(set.set_insert(Value::Int(3)));
        assert!(set.set_insert(Value::Int(1)));
        assert!(!set.set_insert(Value::Num(3.0)));
        assert_eq!(set, Value::Set(vec![Value::Int(1), Value::Int(3)]));
        assert!(set.set_remove(&Value::Int(1)));
        assert!(!set.set_remove(&Value::Int(1)));
    }

    #[test]
    fn cmp_is_total_over_kinds() {
        let values = [
            Value::Null,
            Value::Bool(false),
            Value::Int(0),
            Value::Str("a".into()),
            Value::Map(BTreeMap::new()),
        ];
        for (i, a) in values.iter().enumerate() {
            for (j, b) in values.iter().enumerate() {
                let ord = cmp_values(a, b);
                if i == j {
                    assert_eq!(ord, Ordering::Equal);
                } else {
                    assert_ne!(ord, Ordering::Equal);
                }
            }
        }
    }

    #[test]
    fn checksum_stable_over_map_insertion_order() {
        let mut m1 = BTreeMap::new();
        m1.insert("b".to_string(), Value::Int(2));
        m1.insert("a".to_string(), Value::Int(1));
        let mut m2 = BTreeMap::new();
        m2.insert("a".to_string(), Value::Int(1));
        m2.insert("b".to_string(), Value::Int(2));
        assert_eq!(
            Value::Map(m1).checksum().unwrap(),
            Value::Map(m2).checksum().unwrap()
        );
    }

    #[test]
    fn checksum_rejects_nan() {
        assert!(Value::Num(f64::NAN).checksum().is_err());
    }
}
