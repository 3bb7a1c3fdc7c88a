//! Execution context: tiered namespaces and the dispatch context
//!
//! The gather phase of a cursor step assembles a [`ScopedMap`]: a layered
//! read view over globals, domain values, graph attributes, ancestor
//! attributes, and the node's own attributes. Nearer tiers shadow farther
//! ones on key conflicts, and the whole map can be flattened for handlers
//! that want a plain object.
//!
//! [`DispatchCtx`] is what behavior handlers receive: mutable access to the
//! graph (single-writer discipline), the gathered namespace, a scratch
//! locals map, and the step's accumulating receipt log.

use serde_json::{Map, Value};
use uuid::Uuid;

use crate::graph::Graph;
use crate::record::CallReceipt;

/// Namespace tiers, outermost first. Higher tiers shadow lower ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Tier {
    Global = 0,
    Domain = 1,
    Graph = 2,
    Ancestor = 3,
    Node = 4,
    Inline = 5,
}

/// Layered key→value view; lookups walk from the innermost tier outward.
#[derive(Debug, Clone, Default)]
pub struct ScopedMap {
    // kept in push order; lookups scan back-to-front so later injections at
    // the same tier shadow earlier ones
    layers: Vec<(Tier, Map<String, Value>)>,
}

impl ScopedMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a layer at `tier`. Layers are consulted innermost-tier first;
    /// within a tier, the latest injection wins.
    pub fn inject(&mut self, tier: Tier, values: Map<String, Value>) {
        if values.is_empty() {
            return;
        }
        let at = self.layers.partition_point(|(t, _)| *t <= tier);
        self.layers.insert(at, (tier, values));
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.layers.iter().rev().find_map(|(_, map)| map.get(key))
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// The tier a key currently resolves from.
    pub fn tier_of(&self, key: &str) -> Option<Tier> {
        self.layers
            .iter()
            .rev()
            .find(|(_, map)| map.contains_key(key))
            .map(|(tier, _)| *tier)
    }

    /// Collapse to a single map with shadowing applied.
    pub fn flatten(&self) -> Map<String, Value> {
        let mut out = Map::new();
        for (_, map) in &self.layers {
            for (key, value) in map {
                out.insert(key.clone(), value.clone());
            }
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

/// Mutable execution context handed to behavior handlers.
pub struct DispatchCtx<'g> {
    /// The single-writer graph.
    pub graph: &'g mut Graph,
    /// Namespace gathered for the current step.
    pub ns: ScopedMap,
    /// Step counter of the driving cursor.
    pub step: u64,
    /// Receipts accumulated across the step's phases, in invocation order.
    pub receipts: Vec<CallReceipt>,
    /// Scratch space shared by handlers within one step.
    pub locals: Map<String, Value>,
    /// Node the cursor is parked on, when driven by a cursor.
    pub position: Option<Uuid>,
}

impl<'g> DispatchCtx<'g> {
    pub fn new(graph: &'g mut Graph) -> Self {
        Self {
            graph,
            ns: ScopedMap::new(),
            step: 0,
            receipts: Vec::new(),
            locals: Map::new(),
            position: None,
        }
    }

    pub fn with_ns(mut self, ns: ScopedMap) -> Self {
        self.ns = ns;
        self
    }

    pub fn at_step(mut self, step: u64) -> Self {
        self.step = step;
        self
    }

    pub fn at_position(mut self, position: Uuid) -> Self {
        self.position = Some(position);
        self
    }
}

impl std::fmt::Debug for DispatchCtx<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchCtx")
            .field("step", &self.step)
            .field("position", &self.position)
            .field("receipts", &self.receipts.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(m) => m,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_inner_tier_shadows_outer() {
        let mut ns = ScopedMap::new();
        ns.inject(Tier::Global, map(json!({"mood": "calm", "score": 1})));
        ns.inject(Tier::Node, map(json!({"mood": "tense"})));

        assert_eq!(ns.get("mood"), Some(&json!("tense")));
        assert_eq!(ns.get("score"), Some(&json!(1)));
        assert_eq!(ns.tier_of("mood"), Some(Tier::Node));
        assert_eq!(ns.tier_of("score"), Some(Tier::Global));
    }

    #[test]
    fn test_injection_order_within_tier() {
        let mut ns = ScopedMap::new();
        ns.inject(Tier::Ancestor, map(json!({"theme": "forest"})));
        ns.inject(Tier::Ancestor, map(json!({"theme": "cave"})));
        assert_eq!(ns.get("theme"), Some(&json!("cave")));
    }

    #[test]
    fn test_tiers_interleaved_out_of_order() {
        let mut ns = ScopedMap::new();
        ns.inject(Tier::Node, map(json!({"k": "node"})));
        ns.inject(Tier::Global, map(json!({"k": "global"})));
        // node tier still wins even though it was injected first
        assert_eq!(ns.get("k"), Some(&json!("node")));
    }

    #[test]
    fn test_flatten_applies_shadowing() {
        let mut ns = ScopedMap::new();
        ns.inject(Tier::Global, map(json!({"a": 1, "b": 1})));
        ns.inject(Tier::Node, map(json!({"b": 2})));
        let flat = ns.flatten();
        assert_eq!(flat["a"], json!(1));
        assert_eq!(flat["b"], json!(2));
    }
}
