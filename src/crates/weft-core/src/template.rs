//! Declarative templates for CREATE / UPDATE / CLONE provisioning
//!
//! A [`Template`] is a validated payload that can materialize a fresh node,
//! update one in place, or evolve a clone. Payload shape: the reserved keys
//! `label`, `tags`, and `node_type` map onto the node's identity; every other
//! top-level key becomes a node attribute. Application follows the shared
//! inheritance rules ([`merge_inherited`]): maps merge with the template
//! winning, lists and scalars are replaced.
//!
//! Templates carry an optional [`ScopeSelector`] restricting where they
//! apply (path glob, ancestor tags, parent label, evaluated against the
//! cursor node) and expose a content id derived from the canonical payload
//! for provenance tracking on offers and build receipts.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::entity::Criteria;
use crate::error::{EngineError, Result};
use crate::graph::{Graph, Node};
use crate::singleton::merge_inherited;

/// Where a template (or behavior) applies, evaluated against a node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScopeSelector {
    /// Glob over the node's dotted label path.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Tags that must appear on the node or its ancestors.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub ancestor_tags: BTreeSet<String>,
    /// Required label of the node's immediate parent subgraph.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_label: Option<String>,
}

impl ScopeSelector {
    /// A selector with no constraints applies everywhere.
    pub fn is_global(&self) -> bool {
        self.path.is_none() && self.ancestor_tags.is_empty() && self.parent_label.is_none()
    }

    /// The criteria form of this selector, evaluated under a graph scope.
    pub fn to_criteria(&self) -> Criteria {
        let mut criteria = Criteria::new();
        if let Some(path) = &self.path {
            criteria = criteria.with("has_path", Value::String(path.clone()));
        }
        if !self.ancestor_tags.is_empty() {
            let tags: Vec<Value> = self.ancestor_tags.iter().cloned().map(Value::String).collect();
            criteria = criteria.with("has_ancestor_tags", Value::Array(tags));
        }
        if let Some(parent) = &self.parent_label {
            criteria = criteria.with("has_parent_label", Value::String(parent.clone()));
        }
        criteria
    }

    /// Does the selector admit `node` in `graph`?
    pub fn admits(&self, graph: &Graph, node: Uuid) -> bool {
        use crate::entity::{Matchable, MatchScope};
        if self.is_global() {
            return true;
        }
        match graph.get(node) {
            Some(item) => item.matches(&self.to_criteria(), MatchScope::in_graph(graph)),
            None => false,
        }
    }
}

/// Validated declarative payload for provisioning operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub label: Option<String>,
    /// Symbolic kind reference resolved through the kind resolver.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub obj_kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<ScopeSelector>,
    /// Everything applied onto the target node; see the module docs for the
    /// reserved keys.
    #[serde(default)]
    pub payload: Map<String, Value>,
}

impl Template {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: Some(label.into()),
            obj_kind: None,
            scope: None,
            payload: Map::new(),
        }
    }

    pub fn with_payload(mut self, payload: Map<String, Value>) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_scope(mut self, scope: ScopeSelector) -> Self {
        self.scope = Some(scope);
        self
    }

    pub fn with_kind(mut self, obj_kind: impl Into<String>) -> Self {
        self.obj_kind = Some(obj_kind.into());
        self
    }

    /// Coerce an unstructured value into a template.
    ///
    /// Accepts either the full template shape (`label` / `obj_kind` / `scope`
    /// / `payload`) or a bare payload object, in which case every key is
    /// treated as payload. Anything other than an object, or a malformed
    /// reserved key, is a [`EngineError::TemplateValidation`].
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(map) = value else {
            return Err(EngineError::TemplateValidation(format!(
                "template must be an object, got {}",
                value_kind(&value)
            )));
        };

        if map.contains_key("payload") {
            return serde_json::from_value(Value::Object(map))
                .map_err(|e| EngineError::TemplateValidation(e.to_string()));
        }

        // bare payload form: lift reserved keys, keep the rest as payload
        let mut payload = map;
        let label = match payload.remove("label") {
            None => None,
            Some(Value::String(s)) => Some(s),
            Some(other) => {
                return Err(EngineError::TemplateValidation(format!(
                    "label must be a string, got {}",
                    value_kind(&other)
                )))
            }
        };
        let obj_kind = match payload.remove("obj_kind") {
            None => None,
            Some(Value::String(s)) => Some(s),
            Some(other) => {
                return Err(EngineError::TemplateValidation(format!(
                    "obj_kind must be a string, got {}",
                    value_kind(&other)
                )))
            }
        };
        if let Some(tags) = payload.get("tags") {
            if crate::entity::value_as_strings(tags).is_none() {
                return Err(EngineError::TemplateValidation(
                    "tags must be a list of strings".into(),
                ));
            }
        }
        Ok(Self {
            label,
            obj_kind,
            scope: None,
            payload,
        })
    }

    /// Deterministic content id over the canonical serialized form.
    pub fn content_id(&self) -> Uuid {
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        Uuid::new_v5(&Uuid::NAMESPACE_OID, &canonical)
    }

    /// Hex form of [`Template::content_id`] for receipts.
    pub fn content_hash(&self) -> String {
        self.content_id().simple().to_string()
    }

    /// Does this template apply at `node`?
    pub fn applies_at(&self, graph: &Graph, node: Uuid) -> bool {
        self.scope.as_ref().map(|s| s.admits(graph, node)).unwrap_or(true)
    }

    /// Materialize a fresh node from this template.
    pub fn build_node(&self) -> Node {
        let mut node = Node::new();
        if let Some(label) = &self.label {
            node = node.labeled(label.clone());
        }
        if let Some(kind) = &self.obj_kind {
            node = node.typed(kind.clone());
        }
        apply_payload(&mut node, &self.payload);
        node
    }

    /// Apply this template onto an existing node (UPDATE / CLONE-evolve).
    pub fn apply_to(&self, node: &mut Node) {
        if let Some(label) = &self.label {
            node.entity_mut().label = Some(label.clone());
        }
        if let Some(kind) = &self.obj_kind {
            node.node_type = Some(kind.clone());
        }
        apply_payload(node, &self.payload);
    }
}

/// Apply a payload map onto a node: reserved keys shape identity, the rest
/// merge into attributes per the inheritance rules.
fn apply_payload(node: &mut Node, payload: &Map<String, Value>) {
    for (key, value) in payload {
        match key.as_str() {
            "label" => {
                if let Value::String(s) = value {
                    node.entity_mut().label = Some(s.clone());
                }
            }
            "tags" => {
                if let Some(tags) = crate::entity::value_as_strings(value) {
                    node.entity_mut().tags = tags.into_iter().collect();
                }
            }
            "node_type" => {
                if let Value::String(s) = value {
                    node.node_type = Some(s.clone());
                }
            }
            _ => {
                let merged = match node.entity_mut().attrs.get(key) {
                    Some(existing) => merge_inherited(existing, value),
                    None => value.clone(),
                };
                node.entity_mut().attrs.insert(key.clone(), merged);
            }
        }
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
