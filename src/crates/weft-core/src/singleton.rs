//! Label-scoped singleton stores
//!
//! The reference discipline here is a per-class registry of named instances:
//! within one store a label maps to exactly one instance, registration of a
//! taken label fails without side effects, and `get` is idempotent until the
//! store is cleared. Where the source system hung these registries off
//! metaclasses, this crate uses explicit [`SingletonStore`] handles — one per
//! logical class — as the design note for static targets prescribes.
//!
//! Inheriting construction (`from_ref`) deep-copies the referenced instance's
//! payload before explicit overrides apply, with the merge rules shared by
//! template evolution: maps merge (override wins on conflicts), lists are
//! replaced, scalars are replaced. See [`merge_inherited`].

use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::entity::{Entity, Matchable};
use crate::error::{EngineError, Result};

/// A labeled instance held by a [`SingletonStore`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Singleton {
    pub entity: Entity,
    /// Declarative payload; the unit of `from_ref` inheritance.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub payload: Map<String, Value>,
}

impl Singleton {
    /// A singleton must carry a label; it is the registration key.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            entity: Entity::new().labeled(label),
            payload: Map::new(),
        }
    }

    pub fn with_payload(mut self, payload: Map<String, Value>) -> Self {
        self.payload = payload;
        self
    }

    pub fn label(&self) -> &str {
        self.entity.label.as_deref().unwrap_or_default()
    }
}

impl Matchable for Singleton {
    fn entity(&self) -> &Entity {
        &self.entity
    }
}

/// Deep-merge `overrides` onto `base`.
///
/// Maps merge recursively with the override winning on conflicts; lists and
/// scalars are replaced wholesale.
pub fn merge_inherited(base: &Value, overrides: &Value) -> Value {
    match (base, overrides) {
        (Value::Object(base_map), Value::Object(override_map)) => {
            let mut merged = base_map.clone();
            for (key, override_value) in override_map {
                match merged.get(key) {
                    Some(base_value) => {
                        let value = merge_inherited(base_value, override_value);
                        merged.insert(key.clone(), value);
                    }
                    None => {
                        merged.insert(key.clone(), override_value.clone());
                    }
                }
            }
            Value::Object(merged)
        }
        _ => overrides.clone(),
    }
}

/// One logical class's registry of named instances.
#[derive(Debug, Clone, Default)]
pub struct SingletonStore {
    class: String,
    instances: IndexMap<String, Arc<Singleton>>,
}

impl SingletonStore {
    /// `class` names the logical class the store is scoped to; it only
    /// appears in error messages.
    pub fn new(class: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            instances: IndexMap::new(),
        }
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    /// Register an instance under its label. A taken label fails with
    /// [`EngineError::DuplicateIdentity`] and registers nothing.
    pub fn register(&mut self, instance: Singleton) -> Result<Arc<Singleton>> {
        let label = instance.label().to_string();
        if label.is_empty() {
            return Err(EngineError::DuplicateIdentity(format!(
                "{}: singleton requires a non-empty label",
                self.class
            )));
        }
        if self.instances.contains_key(&label) {
            return Err(EngineError::DuplicateIdentity(format!(
                "{}: instance {label:?} already registered",
                self.class
            )));
        }
        let instance = Arc::new(instance);
        self.instances.insert(label, Arc::clone(&instance));
        Ok(instance)
    }

    /// Register a new instance whose payload inherits from `from_ref`'s
    /// payload, with `overrides` layered on per [`merge_inherited`].
    pub fn register_inheriting(
        &mut self,
        label: impl Into<String>,
        from_ref: &str,
        overrides: Map<String, Value>,
    ) -> Result<Arc<Singleton>> {
        let base = self.get(from_ref).ok_or_else(|| {
            EngineError::NotFound(format!("{}: from_ref {from_ref:?} is not registered", self.class))
        })?;
        let merged = merge_inherited(&Value::Object(base.payload.clone()), &Value::Object(overrides));
        let payload = match merged {
            Value::Object(map) => map,
            _ => unreachable!("merging two objects yields an object"),
        };
        self.register(Singleton::new(label).with_payload(payload))
    }

    /// Idempotent label lookup; same `Arc` until [`SingletonStore::clear`].
    pub fn get(&self, label: &str) -> Option<Arc<Singleton>> {
        self.instances.get(label).cloned()
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.instances.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Drop every instance. Labels become available again.
    pub fn clear(&mut self) {
        self.instances.clear();
    }
}
