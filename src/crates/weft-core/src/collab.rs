//! Collaborator contracts
//!
//! The core imports these seams from external code and defines no file
//! format, network protocol, or CLI of its own. Script loading, class
//! resolution, and asset management live outside the engine; provisioners
//! talk to them through the traits here. [`TemplateLibrary`] is the
//! in-memory reference implementation used by tests and small worlds.

use std::collections::BTreeSet;

use serde_json::{Map, Value};
use uuid::Uuid;

use crate::entity::Criteria;
use crate::error::Result;
use crate::graph::Graph;
use crate::template::Template;

/// Produces template records from loaded scripts.
///
/// `selector`, when given, names the cursor node; implementations restrict
/// results to templates whose scope admits it.
pub trait ScriptSource {
    fn find_template(
        &self,
        identifier: &str,
        graph: &Graph,
        selector: Option<Uuid>,
        criteria: &Criteria,
    ) -> Option<Template>;

    fn find_templates(&self, graph: &Graph, selector: Option<Uuid>, criteria: &Criteria)
        -> Vec<Template>;
}

/// Resolves a symbolic kind reference (`obj_kind`) to a concrete node type.
/// Unresolved kinds fall back to a plain node.
pub trait KindResolver {
    fn resolve_kind(&self, name: &str) -> Option<String>;
}

/// Asset-backed token creation, consulted only for explicit asset refs.
pub trait AssetStore {
    fn has_asset(&self, asset_ref: &str) -> bool;

    /// Materialize a token node for `asset_ref` into `graph`, with
    /// requirement template data as `overlay`. Returns the node uid.
    fn create_token(
        &self,
        asset_ref: &str,
        graph: &mut Graph,
        overlay: &Map<String, Value>,
    ) -> Result<Uuid>;
}

/// Singleton-backed token materialization (see [`crate::token`] for the
/// default implementation).
pub trait TokenForge {
    fn has_type(&self, token_type: &str) -> bool;

    /// The registered base instance a token of `token_type`/`label` would be
    /// built from, if any.
    fn resolve_base(&self, token_type: &str, label: &str) -> Option<Map<String, Value>>;

    /// Build the token node into `graph` and return its uid.
    fn materialize_token(
        &self,
        token_type: &str,
        label: &str,
        overlay: &Map<String, Value>,
        graph: &mut Graph,
    ) -> Result<Uuid>;
}

/// In-memory [`ScriptSource`]: a flat shelf of templates looked up by label
/// (or trailing path segment) and filtered by scope.
#[derive(Debug, Clone, Default)]
pub struct TemplateLibrary {
    templates: Vec<Template>,
}

impl TemplateLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, template: Template) {
        self.templates.push(template);
    }

    pub fn with(mut self, template: Template) -> Self {
        self.add(template);
        self
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    fn label_matches(template: &Template, identifier: &str) -> bool {
        let Some(label) = template.label.as_deref() else {
            return false;
        };
        if label == identifier {
            return true;
        }
        // dotted identifiers fall back to their trailing segment
        identifier.rsplit('.').next() == Some(label)
    }
}

impl ScriptSource for TemplateLibrary {
    fn find_template(
        &self,
        identifier: &str,
        graph: &Graph,
        selector: Option<Uuid>,
        _criteria: &Criteria,
    ) -> Option<Template> {
        self.templates
            .iter()
            .find(|t| {
                Self::label_matches(t, identifier)
                    && selector.map(|node| t.applies_at(graph, node)).unwrap_or(true)
            })
            .cloned()
    }

    fn find_templates(
        &self,
        graph: &Graph,
        selector: Option<Uuid>,
        _criteria: &Criteria,
    ) -> Vec<Template> {
        self.templates
            .iter()
            .filter(|t| selector.map(|node| t.applies_at(graph, node)).unwrap_or(true))
            .cloned()
            .collect()
    }
}

/// Static name→type table implementing [`KindResolver`].
#[derive(Debug, Clone, Default)]
pub struct KindTable {
    kinds: BTreeSet<String>,
}

impl KindTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, kind: impl Into<String>) -> Self {
        self.kinds.insert(kind.into());
        self
    }
}

impl KindResolver for KindTable {
    fn resolve_kind(&self, name: &str) -> Option<String> {
        self.kinds.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Node, Subgraph};
    use crate::template::ScopeSelector;
    use serde_json::json;

    #[test]
    fn test_library_lookup_by_label_and_path_tail() {
        let library = TemplateLibrary::new()
            .with(Template::from_value(json!({"label": "hero", "color": "red"})).unwrap());
        let graph = Graph::new();
        assert!(library
            .find_template("hero", &graph, None, &Criteria::new())
            .is_some());
        assert!(library
            .find_template("cast.hero", &graph, None, &Criteria::new())
            .is_some());
        assert!(library
            .find_template("villain", &graph, None, &Criteria::new())
            .is_none());
    }

    #[test]
    fn test_library_scope_filtering() {
        let mut graph = Graph::new();
        let node = graph.add_node(Node::new().labeled("n")).unwrap();
        let scene = graph.add_subgraph(Subgraph::new().labeled("scene1")).unwrap();
        graph.add_member(scene, node).unwrap();

        let scoped = Template::new("hero").with_scope(ScopeSelector {
            parent_label: Some("scene2".into()),
            ..ScopeSelector::default()
        });
        let library = TemplateLibrary::new().with(scoped);

        assert!(library
            .find_template("hero", &graph, Some(node), &Criteria::new())
            .is_none());
        assert!(library
            .find_template("hero", &graph, None, &Criteria::new())
            .is_some());
    }

    #[test]
    fn test_kind_table() {
        let table = KindTable::new().with("actor");
        assert_eq!(table.resolve_kind("actor").as_deref(), Some("actor"));
        assert!(table.resolve_kind("prop").is_none());
    }
}
