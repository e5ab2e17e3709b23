//! Versioned document schemas and the schema registry.
//!
//! A schema is identified by `(namespace, version)` and declares the typed
//! fields of a document. Schemas are immutable once registered; changing a
//! field requires a version bump plus a registered upgrade function, which
//! the registry chains when an item recorded under an older version is read
//! back. The registry itself is read-mostly shared state: registrations
//! happen at process init, lookups happen everywhere, so it rides on
//! `DashMap` and is passed around inside the [`crate::config::Context`]
//! rather than living in a process-wide singleton.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::errors::SchemaError;
use crate::internal::item::Item;
use crate::internal::value::{Value, ValueKind};

/// Declaration of a single schema field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub kind: ValueKind,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub nullable: bool,
    #[serde(default)]
    pub default: Option<Value>,
}

impl FieldSpec {
    pub fn new(kind: ValueKind) -> Self {
        FieldSpec {
            kind,
            required: false,
            nullable: false,
            default: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }
}

/// An immutable, versioned field layout for one document namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub namespace: String,
    pub version: u32,
    pub fields: BTreeMap<String, FieldSpec>,
}

impl Schema {
    pub fn new(namespace: impl Into<String>, version: u32) -> Self {
        Schema {
            namespace: namespace.into(),
            version,
            fields: BTreeMap::new(),
        }
    }

    pub fn field(mut self, name: impl Into<String>, spec: FieldSpec) -> Self {
        self.fields.insert(name.into(), spec);
        self
    }

    pub fn field_spec(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.get(name)
    }

    /// Check one value against a field declaration.
    pub fn check_value(&self, field: &str, value: &Value) -> Result<(), SchemaError> {
        let spec = self
            .fields
            .get(field)
            .ok_or_else(|| SchemaError::TypeMismatch {
                field: field.to_string(),
                expected: "a declared field".to_string(),
                actual: "undeclared".to_string(),
            })?;
        match value.kind() {
            None => {
                if spec.nullable || !spec.required {
                    Ok(())
                } else {
                    Err(SchemaError::TypeMismatch {
                        field: field.to_string(),
                        expected: spec.kind.to_string(),
                        actual: "null".to_string(),
                    })
                }
            }
            Some(kind) => {
                // Int is accepted where Num is declared; normalization
                // collapses integral floats the other way.
                let ok = kind == spec.kind
                    || (kind == ValueKind::Int && spec.kind == ValueKind::Num);
                if ok {
                    Ok(())
                } else {
                    Err(SchemaError::TypeMismatch {
                        field: field.to_string(),
                        expected: spec.kind.to_string(),
                        actual: kind.to_string(),
                    })
                }
            }
        }
    }
}

/// Upgrade function from one schema version to the next.
pub type UpgradeFn = Arc<dyn Fn(&mut Item) + Send + Sync>;

/// Process-shared registry of schemas and upgrade chains.
///
/// `register` is idempotent per `(namespace, version)`: re-registering the
/// identical definition is a no-op, a conflicting one is rejected.
#[derive(Default)]
pub struct SchemaRegistry {
    schemas: DashMap<(String, u32), Arc<Schema>>,
    upgrades: DashMap<(String, u32), UpgradeFn>,
    latest: DashMap<String, u32>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, schema: Schema) -> Result<Arc<Schema>, SchemaError> {
        let key = (schema.namespace.clone(), schema.version);
        if let Some(existing) = self.schemas.get(&key) {
            if **existing == schema {
                return Ok(existing.clone());
            }
            return Err(SchemaError::VersionConflict {
                namespace: schema.namespace,
                version: schema.version,
            });
        }
        let arc = Arc::new(schema);
        self.schemas.insert(key.clone(), arc.clone());
        self.latest
            .entry(key.0)
            .and_modify(|v| *v = (*v).max(key.1))
            .or_insert(key.1);
        Ok(arc)
    }

    /// Register the upgrade that lifts items from `from_version` to
    /// `from_version + 1`.
    pub fn register_upgrade(
        &self,
        namespace: impl Into<String>,
        from_version: u32,
        upgrade: UpgradeFn,
    ) {
        self.upgrades.insert((namespace.into(), from_version), upgrade);
    }

    pub fn get(&self, namespace: &str, version: u32) -> Result<Arc<Schema>, SchemaError> {
        self.schemas
            .get(&(namespace.to_string(), version))
            .map(|s| s.clone())
            .ok_or_else(|| SchemaError::Unknown {
                namespace: namespace.to_string(),
                version,
            })
    }

    pub fn latest_version(&self, namespace: &str) -> Result<u32, SchemaError> {
        self.latest
            .get(namespace)
            .map(|v| *v)
            .ok_or_else(|| SchemaError::Unknown {
                namespace: namespace.to_string(),
                version: 0,
            })
    }

    /// Run each intermediate upgrade function to bring `item` to
    /// `target_version`. Items already at or past the target pass through.
    pub fn upgrade(&self, mut item: Item, target_version: u32) -> Result<Item, SchemaError> {
        while item.schema().version < target_version {
            let ns = item.schema().namespace.clone();
            let from = item.schema().version;
            let next = self.get(&ns, from + 1)?;
            let upgrade = self
                .upgrades
                .get(&(ns.clone(), from))
                .map(|u| u.clone())
                .ok_or(SchemaError::Unknown {
                    namespace: ns,
                    version: from + 1,
                })?;
            item.rebind_schema(next);
            (*upgrade)(&mut item);
        }
        Ok(item)
    }

    /// The canonical zero document for a namespace's latest schema:
    /// declared defaults where present, null elsewhere.
    pub fn null_item(&self, namespace: &str) -> Result<Item, SchemaError> {
        let version = self.latest_version(namespace)?;
        let schema = self.get(namespace, version)?;
        Ok(Item::null_of(schema))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task_schema(version: u32) -> Schema {
        Schema::new("task", version)
            .field("text", FieldSpec::new(ValueKind::Str).required())
            .field(
                "done",
                FieldSpec::new(ValueKind::Bool).with_default(Value::Bool(false)),
            )
    }

    #[test]
    fn register_is_idempotent() {
        let reg = SchemaRegistry::new();
        reg.register(task_schema(1)).unwrap();
        reg.register(task_schema(1)).unwrap();
        assert_eq!(reg.latest_version("task").unwrap(), 1);
    }

    #[test]
    fn conflicting_definition_is_rejected() {
        let reg = SchemaRegistry::new();
        reg.register(task_schema(1)).unwrap();
        let conflicting =
            Schema::new("task", 1).field("text", FieldSpec::new(ValueKind::Str));
        assert!(matches!(
            reg.register(conflicting),
            Err(SchemaError::VersionConflict { .. })
        ));
    }

    #[test]
    fn unknown_schema_lookup_fails() {
        let reg = SchemaRegistry::new();
        assert!(matches!(
            reg.get("nope", 1),
            Err(SchemaError::Unknown { .. })
        ));
    }

    #[test]
    fn null_item_uses_defaults() {
        let reg = SchemaRegistry::new();
        reg.register(task_schema(1)).unwrap();
        let item = reg.null_item("task").unwrap();
        assert_eq!(item.get("done"), Some(&Value::Bool(false)));
        assert_eq!(item.get("text"), None);
    }

    #[test]
    fn upgrade_chains_through_versions() {
        let reg = SchemaRegistry::new();
        reg.register(task_schema(1)).unwrap();
        reg.register(
            task_schema(2).field("priority", FieldSpec::new(ValueKind::Int)),
        )
        .unwrap();
        reg.register_upgrade(
            "task",
            1,
            Arc::new(|item: &mut Item| {
                let _ = item.set("priority", Value::Int(0));
            }),
        );

        let schema_v1 = reg.get("task", 1).unwrap();
        let mut item = Item::new(schema_v1);
        item.set("text", Value::Str("a".into())).unwrap();
        let upgraded = reg.upgrade(item, 2).unwrap();
        assert_eq!(upgraded.schema().version, 2);
        assert_eq!(upgraded.get("priority"), Some(&Value::Int(0)));
        assert_eq!(upgraded.get("text"), Some(&Value::Str("a".into())));
    }
}
