//! Singleton-backed token forge
//!
//! [`SingletonForge`] is the default [`TokenForge`]: each token type owns a
//! [`SingletonStore`] of named base instances, and materializing a token
//! builds a node from the base payload with the request overlay merged on
//! top (the shared inheritance rules: maps merge, lists and scalars are
//! replaced). The node lands in the target graph tagged with its token type.

use indexmap::IndexMap;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::collab::TokenForge;
use crate::error::{EngineError, Result};
use crate::graph::Graph;
use crate::singleton::{merge_inherited, Singleton, SingletonStore};
use crate::template::Template;

/// Token factory keyed by type name, each type a singleton store of bases.
#[derive(Debug, Clone, Default)]
pub struct SingletonForge {
    types: IndexMap<String, SingletonStore>,
}

impl SingletonForge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a token type. Idempotent.
    pub fn add_type(&mut self, token_type: impl Into<String>) -> &mut SingletonStore {
        let token_type = token_type.into();
        self.types
            .entry(token_type.clone())
            .or_insert_with(|| SingletonStore::new(token_type))
    }

    /// Register a base instance under `token_type`.
    pub fn register_base(
        &mut self,
        token_type: impl Into<String>,
        label: impl Into<String>,
        payload: Map<String, Value>,
    ) -> Result<()> {
        self.add_type(token_type)
            .register(Singleton::new(label).with_payload(payload))?;
        Ok(())
    }

    pub fn types(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }
}

impl TokenForge for SingletonForge {
    fn has_type(&self, token_type: &str) -> bool {
        self.types.contains_key(token_type)
    }

    fn resolve_base(&self, token_type: &str, label: &str) -> Option<Map<String, Value>> {
        self.types
            .get(token_type)?
            .get(label)
            .map(|base| base.payload.clone())
    }

    fn materialize_token(
        &self,
        token_type: &str,
        label: &str,
        overlay: &Map<String, Value>,
        graph: &mut Graph,
    ) -> Result<Uuid> {
        let base = self.resolve_base(token_type, label).ok_or_else(|| {
            EngineError::NotFound(format!("token base {label:?} of type {token_type:?}"))
        })?;
        let merged = merge_inherited(&Value::Object(base), &Value::Object(overlay.clone()));
        let mut template = Template::from_value(merged)?;
        if template.label.is_none() {
            template.label = Some(label.to_string());
        }
        let node = template.build_node().tagged([format!("token:{token_type}")]);
        graph.add_node(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Criteria, Matchable};
    use serde_json::json;

    fn payload(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_materialize_token_merges_overlay() {
        let mut forge = SingletonForge::new();
        forge
            .register_base("coin", "gold", payload(json!({"value": 10, "metal": "gold"})))
            .unwrap();

        let mut graph = Graph::new();
        let uid = forge
            .materialize_token("coin", "gold", &payload(json!({"value": 25})), &mut graph)
            .unwrap();

        let node = graph.get_node(uid).unwrap();
        assert_eq!(node.entity().label.as_deref(), Some("gold"));
        assert_eq!(node.entity().attr("value"), Some(&json!(25)));
        assert_eq!(node.entity().attr("metal"), Some(&json!("gold")));
        assert!(node.entity().tags.contains("token:coin"));
    }

    #[test]
    fn test_unknown_base_errors() {
        let forge = SingletonForge::new();
        let mut graph = Graph::new();
        let err = forge
            .materialize_token("coin", "gold", &Map::new(), &mut graph)
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[test]
    fn test_duplicate_base_label_rejected() {
        let mut forge = SingletonForge::new();
        forge.register_base("coin", "gold", Map::new()).unwrap();
        let err = forge.register_base("coin", "gold", Map::new()).unwrap_err();
        assert!(matches!(err, EngineError::DuplicateIdentity(_)));
        // same label under a different type is a different store
        forge.register_base("gem", "gold", Map::new()).unwrap();
    }

    #[test]
    fn test_token_node_findable_by_tag() {
        let mut forge = SingletonForge::new();
        forge.register_base("key", "brass", Map::new()).unwrap();
        let mut graph = Graph::new();
        forge.materialize_token("key", "brass", &Map::new(), &mut graph).unwrap();
        let found = graph.find_node(&Criteria::new().has_tags(["token:key"]));
        assert!(found.is_some());
    }
}
