//! Graph substrate: nodes, edges, subgraphs
//!
//! A [`Graph`] is a [`Registry`] of [`GraphItem`]s — nodes, edges, subgraphs,
//! and requirements — addressed by uid. Items hold ids rather than references;
//! the graph dereferences them on demand, which keeps the topology a plain
//! searchable registry while the borrow checker enforces the single-writer
//! discipline.
//!
//! # Structure
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                       Graph                          │
//! │                                                      │
//! │   Subgraph "scene1"                                  │
//! │   ┌───────────────────────────────┐                  │
//! │   │  Node A ── Edge ──> Node B    │     Node C       │
//! │   │     │                         │        ▲         │
//! │   └─────┼─────────────────────────┘        │         │
//! │         └── Dependency(requirement) ───────┘         │
//! │                  (open destination)                  │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! # Integrity
//!
//! Wiring an edge requires both endpoints to already be registered in the
//! same graph ([`EngineError::Linkage`] otherwise); open endpoints (`None`)
//! are allowed and are the carrier mechanism for dependencies and
//! affordances. Subgraph membership re-parents: adding a member removes it
//! from any prior subgraph and invalidates its cached parent.
//!
//! # Scope selectors
//!
//! Graph items answer the scope capabilities used by templates and behaviors:
//! `has_path` (dotted-label glob), `has_ancestor_tags`, `has_ancestor_labels`,
//! `has_parent_label`. These need the owning graph and therefore only match
//! under [`MatchScope::in_graph`].

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};

use serde_json::Value;
use uuid::Uuid;
use wildmatch::WildMatch;

use crate::entity::{value_as_strings, Criteria, Entity, ItemKind, Matchable, MatchScope, Selectable};
use crate::error::{EngineError, Result};
use crate::registry::Registry;
use crate::requirement::Requirement;

/// A vertex in the topology.
#[derive(Debug, Clone)]
pub struct Node {
    base: Entity,
    /// Domain-level discriminator resolved by the kind resolver, if any.
    pub node_type: Option<String>,
}

impl Node {
    pub fn new() -> Self {
        Self { base: Entity::new(), node_type: None }
    }

    pub fn labeled(mut self, label: impl Into<String>) -> Self {
        self.base = self.base.labeled(label);
        self
    }

    pub fn tagged<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.base = self.base.tagged(tags);
        self
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: Value) -> Self {
        self.base = self.base.with_attr(key, value);
        self
    }

    pub fn typed(mut self, node_type: impl Into<String>) -> Self {
        self.node_type = Some(node_type.into());
        self
    }

    pub fn uid(&self) -> Uuid {
        self.base.uid()
    }

    pub fn entity_mut(&mut self) -> &mut Entity {
        &mut self.base
    }
}

impl Default for Node {
    fn default() -> Self {
        Self::new()
    }
}

impl Matchable for Node {
    fn entity(&self) -> &Entity {
        &self.base
    }

    fn kind(&self) -> ItemKind {
        ItemKind::Node
    }

    fn capability(&self, key: &str, expected: &Value, scope: MatchScope<'_>) -> Option<bool> {
        self.base.base_capability(key, expected).or_else(|| {
            scope.graph.and_then(|g| g.scope_capability(self.uid(), key, expected))
        })
    }

    fn attr(&self, key: &str) -> Option<Value> {
        match key {
            "node_type" => self.node_type.clone().map(Value::String),
            "label" => self.base.label.clone().map(Value::String),
            "uid" => Some(Value::String(self.base.uid().to_string())),
            other => self.base.attr(other).cloned(),
        }
    }
}

/// Discriminates plain links from the open-edge carriers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    /// Both endpoints fixed at wiring time.
    Link,
    /// Fixed source, destination resolved through the carried requirement.
    Dependency,
    /// Fixed destination, source resolved through the carried requirement.
    Affordance,
}

/// A directed connection between two graph items.
///
/// Endpoints may be open (`None`). Dependency and affordance edges carry a
/// [`Requirement`] by uid; their open endpoint aliases the requirement's
/// bound provider.
#[derive(Debug, Clone)]
pub struct Edge {
    base: Entity,
    pub kind: EdgeKind,
    pub edge_type: Option<String>,
    pub(crate) source_id: Option<Uuid>,
    pub(crate) destination_id: Option<Uuid>,
    pub(crate) requirement_id: Option<Uuid>,
}

impl Edge {
    /// A plain link; endpoints validated when the edge is added to a graph.
    pub fn link(source: Option<Uuid>, destination: Option<Uuid>) -> Self {
        Self {
            base: Entity::new(),
            kind: EdgeKind::Link,
            edge_type: None,
            source_id: source,
            destination_id: destination,
            requirement_id: None,
        }
    }

    /// A dependency: fixed `source`, destination provisioned on demand.
    pub fn dependency(source: Uuid, requirement: Uuid) -> Self {
        Self {
            base: Entity::new(),
            kind: EdgeKind::Dependency,
            edge_type: None,
            source_id: Some(source),
            destination_id: None,
            requirement_id: Some(requirement),
        }
    }

    /// An affordance: fixed `destination`, source provisioned on demand.
    pub fn affordance(destination: Uuid, requirement: Uuid) -> Self {
        Self {
            base: Entity::new(),
            kind: EdgeKind::Affordance,
            edge_type: None,
            source_id: None,
            destination_id: Some(destination),
            requirement_id: Some(requirement),
        }
    }

    pub fn labeled(mut self, label: impl Into<String>) -> Self {
        self.base = self.base.labeled(label);
        self
    }

    pub fn typed(mut self, edge_type: impl Into<String>) -> Self {
        self.edge_type = Some(edge_type.into());
        self
    }

    pub fn uid(&self) -> Uuid {
        self.base.uid()
    }

    pub fn source_id(&self) -> Option<Uuid> {
        self.source_id
    }

    pub fn destination_id(&self) -> Option<Uuid> {
        self.destination_id
    }

    pub fn requirement_id(&self) -> Option<Uuid> {
        self.requirement_id
    }
}

impl Matchable for Edge {
    fn entity(&self) -> &Entity {
        &self.base
    }

    fn kind(&self) -> ItemKind {
        ItemKind::Edge
    }

    fn capability(&self, key: &str, expected: &Value, scope: MatchScope<'_>) -> Option<bool> {
        let uid_eq = |id: Option<Uuid>| {
            expected
                .as_str()
                .and_then(|s| Uuid::parse_str(s).ok())
                .map(|u| id == Some(u))
                .unwrap_or(false)
        };
        match key {
            "has_source" => Some(uid_eq(self.source_id)),
            "has_destination" => Some(uid_eq(self.destination_id)),
            "has_requirement" => Some(uid_eq(self.requirement_id)),
            _ => self.base.base_capability(key, expected).or_else(|| {
                scope.graph.and_then(|g| g.scope_capability(self.uid(), key, expected))
            }),
        }
    }

    fn attr(&self, key: &str) -> Option<Value> {
        match key {
            "edge_type" => self.edge_type.clone().map(Value::String),
            _ => match key {
                "label" => self.base.label.clone().map(Value::String),
                "uid" => Some(Value::String(self.base.uid().to_string())),
                other => self.base.attr(other).cloned(),
            },
        }
    }
}

/// An ordered grouping of graph items addressed by membership.
#[derive(Debug, Clone)]
pub struct Subgraph {
    base: Entity,
    pub subgraph_type: Option<String>,
    pub(crate) member_ids: Vec<Uuid>,
}

impl Subgraph {
    pub fn new() -> Self {
        Self {
            base: Entity::new(),
            subgraph_type: None,
            member_ids: Vec::new(),
        }
    }

    pub fn labeled(mut self, label: impl Into<String>) -> Self {
        self.base = self.base.labeled(label);
        self
    }

    pub fn tagged<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.base = self.base.tagged(tags);
        self
    }

    pub fn typed(mut self, subgraph_type: impl Into<String>) -> Self {
        self.subgraph_type = Some(subgraph_type.into());
        self
    }

    pub fn uid(&self) -> Uuid {
        self.base.uid()
    }

    /// Member uids in insertion order.
    pub fn member_ids(&self) -> &[Uuid] {
        &self.member_ids
    }

    pub fn has_member(&self, uid: Uuid) -> bool {
        self.member_ids.contains(&uid)
    }
}

impl Default for Subgraph {
    fn default() -> Self {
        Self::new()
    }
}

impl Matchable for Subgraph {
    fn entity(&self) -> &Entity {
        &self.base
    }

    fn kind(&self) -> ItemKind {
        ItemKind::Subgraph
    }

    fn capability(&self, key: &str, expected: &Value, scope: MatchScope<'_>) -> Option<bool> {
        match key {
            "has_member" => Some(
                expected
                    .as_str()
                    .and_then(|s| Uuid::parse_str(s).ok())
                    .map(|u| self.has_member(u))
                    .unwrap_or(false),
            ),
            _ => self.base.base_capability(key, expected).or_else(|| {
                scope.graph.and_then(|g| g.scope_capability(self.uid(), key, expected))
            }),
        }
    }
}

/// Any item a graph can hold.
#[derive(Debug, Clone)]
pub enum GraphItem {
    Node(Node),
    Edge(Edge),
    Subgraph(Subgraph),
    Requirement(Requirement),
}

impl GraphItem {
    pub fn uid(&self) -> Uuid {
        self.entity().uid()
    }

    pub(crate) fn entity_mut(&mut self) -> &mut Entity {
        match self {
            GraphItem::Node(n) => n.entity_mut(),
            GraphItem::Edge(e) => &mut e.base,
            GraphItem::Subgraph(s) => &mut s.base,
            GraphItem::Requirement(r) => r.entity_mut(),
        }
    }

    pub fn display_label(&self) -> String {
        self.entity().display_label()
    }

    pub fn as_node(&self) -> Option<&Node> {
        match self {
            GraphItem::Node(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_node_mut(&mut self) -> Option<&mut Node> {
        match self {
            GraphItem::Node(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_edge(&self) -> Option<&Edge> {
        match self {
            GraphItem::Edge(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_edge_mut(&mut self) -> Option<&mut Edge> {
        match self {
            GraphItem::Edge(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_subgraph(&self) -> Option<&Subgraph> {
        match self {
            GraphItem::Subgraph(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_requirement(&self) -> Option<&Requirement> {
        match self {
            GraphItem::Requirement(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_requirement_mut(&mut self) -> Option<&mut Requirement> {
        match self {
            GraphItem::Requirement(r) => Some(r),
            _ => None,
        }
    }

    /// Structural identity folding in the owning graph's uid.
    pub fn structural_id(&self, graph: &Graph) -> Uuid {
        Uuid::new_v5(&graph.uid(), self.uid().as_bytes())
    }
}

impl Matchable for GraphItem {
    fn entity(&self) -> &Entity {
        match self {
            GraphItem::Node(n) => n.entity(),
            GraphItem::Edge(e) => e.entity(),
            GraphItem::Subgraph(s) => s.entity(),
            GraphItem::Requirement(r) => r.entity(),
        }
    }

    fn kind(&self) -> ItemKind {
        match self {
            GraphItem::Node(_) => ItemKind::Node,
            GraphItem::Edge(_) => ItemKind::Edge,
            GraphItem::Subgraph(_) => ItemKind::Subgraph,
            GraphItem::Requirement(_) => ItemKind::Requirement,
        }
    }

    fn capability(&self, key: &str, expected: &Value, scope: MatchScope<'_>) -> Option<bool> {
        match self {
            GraphItem::Node(n) => n.capability(key, expected, scope),
            GraphItem::Edge(e) => e.capability(key, expected, scope),
            GraphItem::Subgraph(s) => s.capability(key, expected, scope),
            GraphItem::Requirement(r) => r.capability(key, expected, scope),
        }
    }

    fn attr(&self, key: &str) -> Option<Value> {
        match self {
            GraphItem::Edge(e) => e.attr(key),
            other => match key {
                "label" => other.entity().label.clone().map(Value::String),
                "uid" => Some(Value::String(other.entity().uid().to_string())),
                k => other.entity().attr(k).cloned(),
            },
        }
    }
}

impl Selectable for GraphItem {}

/// Registry of graph items with linkage integrity and ancestry queries.
#[derive(Debug, Clone)]
pub struct Graph {
    uid: Uuid,
    pub label: Option<String>,
    items: Registry<GraphItem>,
    // parent lookups are hot during provisioning; cache per item and
    // invalidate on re-parenting
    parent_cache: RefCell<HashMap<Uuid, Option<Uuid>>>,
}

impl Graph {
    pub fn new() -> Self {
        Self {
            uid: Uuid::new_v4(),
            label: None,
            items: Registry::new(),
            parent_cache: RefCell::new(HashMap::new()),
        }
    }

    pub fn labeled(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn uid(&self) -> Uuid {
        self.uid
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains(&self, uid: Uuid) -> bool {
        self.items.contains(uid)
    }

    pub fn items(&self) -> impl Iterator<Item = &GraphItem> {
        self.items.values()
    }

    // ---- adds ----

    /// Register any graph item. Edges are linkage-checked; requirements are
    /// policy-validated before registration.
    pub fn add(&mut self, item: GraphItem) -> Result<Uuid> {
        match &item {
            GraphItem::Edge(edge) => {
                self.validate_endpoint(edge.source_id)?;
                self.validate_endpoint(edge.destination_id)?;
                if matches!(edge.kind, EdgeKind::Dependency | EdgeKind::Affordance) {
                    let req = edge.requirement_id.ok_or_else(|| {
                        EngineError::Linkage("open edge requires a requirement".into())
                    })?;
                    if self.get_requirement(req).is_none() {
                        return Err(EngineError::Linkage(format!(
                            "requirement {req} must be added to the graph first"
                        )));
                    }
                }
            }
            GraphItem::Requirement(req) => req.validate()?,
            _ => {}
        }
        self.items.add(item)
    }

    pub fn add_node(&mut self, node: Node) -> Result<Uuid> {
        self.add(GraphItem::Node(node))
    }

    pub fn add_edge(&mut self, edge: Edge) -> Result<Uuid> {
        self.add(GraphItem::Edge(edge))
    }

    pub fn add_subgraph(&mut self, subgraph: Subgraph) -> Result<Uuid> {
        for member in &subgraph.member_ids {
            self.validate_linkable(*member)?;
        }
        self.add(GraphItem::Subgraph(subgraph))
    }

    pub fn add_requirement(&mut self, requirement: Requirement) -> Result<Uuid> {
        self.add(GraphItem::Requirement(requirement))
    }

    /// Register `requirement` and wire a dependency edge from `source` to it.
    /// Returns `(edge_uid, requirement_uid)`.
    pub fn add_dependency(&mut self, source: Uuid, requirement: Requirement) -> Result<(Uuid, Uuid)> {
        self.validate_linkable(source)?;
        let req_uid = self.add_requirement(requirement)?;
        let edge_uid = self.add_edge(Edge::dependency(source, req_uid))?;
        Ok((edge_uid, req_uid))
    }

    /// Register `requirement` and wire an affordance edge into `destination`.
    /// Returns `(edge_uid, requirement_uid)`.
    pub fn add_affordance(
        &mut self,
        destination: Uuid,
        requirement: Requirement,
    ) -> Result<(Uuid, Uuid)> {
        self.validate_linkable(destination)?;
        let req_uid = self.add_requirement(requirement)?;
        let edge_uid = self.add_edge(Edge::affordance(destination, req_uid))?;
        Ok((edge_uid, req_uid))
    }

    /// Wire a plain link between two registered items.
    pub fn link(&mut self, source: Uuid, destination: Uuid) -> Result<Uuid> {
        self.add_edge(Edge::link(Some(source), Some(destination)))
    }

    /// Remove the first plain link from `source` to `destination`, if any.
    pub fn unlink(&mut self, source: Uuid, destination: Uuid) {
        let found = self.items.values().find_map(|item| match item {
            GraphItem::Edge(e)
                if e.kind == EdgeKind::Link
                    && e.source_id == Some(source)
                    && e.destination_id == Some(destination) =>
            {
                Some(e.uid())
            }
            _ => None,
        });
        if let Some(uid) = found {
            self.items.remove(uid);
        }
    }

    // ---- gets ----

    pub fn get(&self, uid: Uuid) -> Option<&GraphItem> {
        self.items.get(uid)
    }

    pub fn get_mut(&mut self, uid: Uuid) -> Option<&mut GraphItem> {
        self.items.get_mut(uid)
    }

    /// Lookup by uid string, label, or dotted path.
    pub fn resolve(&self, key: &str) -> Option<&GraphItem> {
        self.items
            .resolve(key)
            .or_else(|| self.items.values().find(|item| self.path(item.uid()) == key))
    }

    pub fn get_node(&self, uid: Uuid) -> Option<&Node> {
        self.get(uid).and_then(GraphItem::as_node)
    }

    pub fn get_node_mut(&mut self, uid: Uuid) -> Option<&mut Node> {
        self.items.get_mut(uid).and_then(GraphItem::as_node_mut)
    }

    pub fn get_edge(&self, uid: Uuid) -> Option<&Edge> {
        self.get(uid).and_then(GraphItem::as_edge)
    }

    pub fn get_edge_mut(&mut self, uid: Uuid) -> Option<&mut Edge> {
        self.items.get_mut(uid).and_then(GraphItem::as_edge_mut)
    }

    pub fn get_subgraph(&self, uid: Uuid) -> Option<&Subgraph> {
        self.get(uid).and_then(GraphItem::as_subgraph)
    }

    pub fn get_requirement(&self, uid: Uuid) -> Option<&Requirement> {
        self.get(uid).and_then(GraphItem::as_requirement)
    }

    pub fn get_requirement_mut(&mut self, uid: Uuid) -> Option<&mut Requirement> {
        self.items.get_mut(uid).and_then(GraphItem::as_requirement_mut)
    }

    // ---- finds ----

    pub fn find_nodes<'a, 'b>(&'a self, criteria: &'b Criteria) -> impl Iterator<Item = &'a Node> + 'b
    where
        'a: 'b,
    {
        let scope = MatchScope::in_graph(self);
        self.items
            .values()
            .filter_map(GraphItem::as_node)
            .filter(move |n| n.matches(criteria, scope))
    }

    pub fn find_node<'a>(&'a self, criteria: &Criteria) -> Option<&'a Node> {
        self.find_nodes(criteria).next()
    }

    pub fn find_edges<'a, 'b>(&'a self, criteria: &'b Criteria) -> impl Iterator<Item = &'a Edge> + 'b
    where
        'a: 'b,
    {
        let scope = MatchScope::in_graph(self);
        self.items
            .values()
            .filter_map(GraphItem::as_edge)
            .filter(move |e| e.matches(criteria, scope))
    }

    pub fn find_edge<'a>(&'a self, criteria: &Criteria) -> Option<&'a Edge> {
        self.find_edges(criteria).next()
    }

    pub fn find_subgraphs<'a, 'b>(
        &'a self,
        criteria: &'b Criteria,
    ) -> impl Iterator<Item = &'a Subgraph> + 'b
    where
        'a: 'b,
    {
        let scope = MatchScope::in_graph(self);
        self.items
            .values()
            .filter_map(GraphItem::as_subgraph)
            .filter(move |s| s.matches(criteria, scope))
    }

    pub fn find_subgraph<'a>(&'a self, criteria: &Criteria) -> Option<&'a Subgraph> {
        self.find_subgraphs(criteria).next()
    }

    /// Search restricted to a subgraph's members, in membership order.
    pub fn find_members<'a>(
        &'a self,
        subgraph: Uuid,
        criteria: &'a Criteria,
    ) -> impl Iterator<Item = &'a GraphItem> {
        let scope = MatchScope::in_graph(self);
        let member_ids = self
            .get_subgraph(subgraph)
            .map(|sg| sg.member_ids.clone())
            .unwrap_or_default();
        member_ids
            .into_iter()
            .filter_map(move |uid| self.get(uid))
            .filter(move |item| item.matches(criteria, scope))
    }

    // ---- edges of a node ----

    pub fn edges_in<'a>(&'a self, node: Uuid, criteria: &'a Criteria) -> impl Iterator<Item = &'a Edge> {
        let scope = MatchScope::in_graph(self);
        self.items
            .values()
            .filter_map(GraphItem::as_edge)
            .filter(move |e| self.edge_destination(e) == Some(node))
            .filter(move |e| e.matches(criteria, scope))
    }

    pub fn edges_out<'a>(&'a self, node: Uuid, criteria: &'a Criteria) -> impl Iterator<Item = &'a Edge> {
        let scope = MatchScope::in_graph(self);
        self.items
            .values()
            .filter_map(GraphItem::as_edge)
            .filter(move |e| self.edge_source(e) == Some(node))
            .filter(move |e| e.matches(criteria, scope))
    }

    pub fn edges_of<'a>(&'a self, node: Uuid, criteria: &'a Criteria) -> Vec<&'a Edge> {
        let mut edges: Vec<&Edge> = self.edges_in(node, criteria).collect();
        for edge in self.edges_out(node, criteria) {
            if !edges.iter().any(|e| e.uid() == edge.uid()) {
                edges.push(edge);
            }
        }
        edges
    }

    /// Unresolved-aware source of an edge: affordances resolve through their
    /// requirement's bound provider.
    pub fn edge_source(&self, edge: &Edge) -> Option<Uuid> {
        match edge.kind {
            EdgeKind::Affordance => edge.source_id.or_else(|| {
                edge.requirement_id
                    .and_then(|r| self.get_requirement(r))
                    .and_then(Requirement::provider_id)
            }),
            _ => edge.source_id,
        }
    }

    /// Unresolved-aware destination of an edge: dependencies resolve through
    /// their requirement's bound provider.
    pub fn edge_destination(&self, edge: &Edge) -> Option<Uuid> {
        match edge.kind {
            EdgeKind::Dependency => edge.destination_id.or_else(|| {
                edge.requirement_id
                    .and_then(|r| self.get_requirement(r))
                    .and_then(Requirement::provider_id)
            }),
            _ => edge.destination_id,
        }
    }

    /// Re-point an edge's source at a registered item.
    pub fn set_edge_source(&mut self, edge: Uuid, source: Option<Uuid>) -> Result<()> {
        if let Some(uid) = source {
            self.validate_linkable(uid)?;
        }
        let e = self
            .get_edge_mut(edge)
            .ok_or_else(|| EngineError::NotFound(format!("edge {edge}")))?;
        e.source_id = source;
        Ok(())
    }

    /// Re-point an edge's destination at a registered item.
    pub fn set_edge_destination(&mut self, edge: Uuid, destination: Option<Uuid>) -> Result<()> {
        if let Some(uid) = destination {
            self.validate_linkable(uid)?;
        }
        let e = self
            .get_edge_mut(edge)
            .ok_or_else(|| EngineError::NotFound(format!("edge {edge}")))?;
        e.destination_id = destination;
        Ok(())
    }

    /// Bind `provider` to `requirement` and mirror the binding onto every
    /// open edge carrying it (dependency destinations, affordance sources).
    pub fn bind_provider(&mut self, requirement: Uuid, provider: Uuid) -> Result<()> {
        self.validate_linkable(provider)?;
        {
            let req = self
                .get_requirement_mut(requirement)
                .ok_or_else(|| EngineError::NotFound(format!("requirement {requirement}")))?;
            req.set_provider(Some(provider));
        }
        let carriers: Vec<(Uuid, EdgeKind)> = self
            .items
            .values()
            .filter_map(GraphItem::as_edge)
            .filter(|e| e.requirement_id == Some(requirement))
            .map(|e| (e.uid(), e.kind))
            .collect();
        for (uid, kind) in carriers {
            if let Some(edge) = self.get_edge_mut(uid) {
                match kind {
                    EdgeKind::Dependency => edge.destination_id = Some(provider),
                    EdgeKind::Affordance => edge.source_id = Some(provider),
                    EdgeKind::Link => {}
                }
            }
        }
        Ok(())
    }

    // ---- ancestry ----

    /// Nearest containing subgraph, cached until membership changes.
    pub fn parent_of(&self, uid: Uuid) -> Option<Uuid> {
        if let Some(hit) = self.parent_cache.borrow().get(&uid) {
            return *hit;
        }
        let parent = self.items.values().find_map(|item| match item {
            GraphItem::Subgraph(sg) if sg.has_member(uid) => Some(sg.uid()),
            _ => None,
        });
        self.parent_cache.borrow_mut().insert(uid, parent);
        parent
    }

    /// Containing subgraphs, nearest first.
    pub fn ancestors_of(&self, uid: Uuid) -> Vec<Uuid> {
        let mut out = Vec::new();
        let mut current = self.parent_of(uid);
        while let Some(parent) = current {
            if out.contains(&parent) {
                break; // membership cycle; stop rather than spin
            }
            out.push(parent);
            current = self.parent_of(parent);
        }
        out
    }

    /// Top-most containing subgraph, if any.
    pub fn root_of(&self, uid: Uuid) -> Option<Uuid> {
        self.ancestors_of(uid).last().copied()
    }

    /// Dotted display-label path from root to the item (inclusive).
    pub fn path(&self, uid: Uuid) -> String {
        let mut labels: Vec<String> = self
            .ancestors_of(uid)
            .into_iter()
            .filter_map(|a| self.get(a).map(|i| i.display_label()))
            .collect();
        labels.reverse();
        if let Some(item) = self.get(uid) {
            labels.push(item.display_label());
        }
        labels.join(".")
    }

    // ---- subgraph membership ----

    /// Add `member` to `subgraph`, re-parenting it away from any prior
    /// subgraph and invalidating its cached parent.
    pub fn add_member(&mut self, subgraph: Uuid, member: Uuid) -> Result<()> {
        self.validate_linkable(member)?;
        if self.get_subgraph(subgraph).is_none() {
            return Err(EngineError::NotFound(format!("subgraph {subgraph}")));
        }
        if let Some(prior) = self.parent_of(member) {
            if prior != subgraph {
                if let Some(GraphItem::Subgraph(sg)) = self.items.get_mut(prior) {
                    sg.member_ids.retain(|m| *m != member);
                }
            }
        }
        if let Some(GraphItem::Subgraph(sg)) = self.items.get_mut(subgraph) {
            if !sg.member_ids.contains(&member) {
                sg.member_ids.push(member);
            }
        }
        self.invalidate_parent(member);
        Ok(())
    }

    /// Remove `member` from `subgraph` and invalidate its cached parent.
    pub fn remove_member(&mut self, subgraph: Uuid, member: Uuid) -> Result<()> {
        match self.items.get_mut(subgraph) {
            Some(GraphItem::Subgraph(sg)) => {
                sg.member_ids.retain(|m| *m != member);
                self.invalidate_parent(member);
                Ok(())
            }
            _ => Err(EngineError::NotFound(format!("subgraph {subgraph}"))),
        }
    }

    fn invalidate_parent(&self, uid: Uuid) {
        self.parent_cache.borrow_mut().remove(&uid);
    }

    /// Relabel a registered item.
    pub fn set_label(&mut self, uid: Uuid, label: impl Into<String>) -> Result<()> {
        let item = self
            .items
            .get_mut(uid)
            .ok_or_else(|| EngineError::NotFound(format!("item {uid}")))?;
        item.entity_mut().label = Some(label.into());
        Ok(())
    }

    // ---- scope capabilities ----

    /// Graph-scoped capability evaluation shared by every item variant.
    pub(crate) fn scope_capability(&self, uid: Uuid, key: &str, expected: &Value) -> Option<bool> {
        match key {
            "has_path" => {
                let pattern = expected.as_str()?;
                Some(WildMatch::new(pattern).matches(&self.path(uid)))
            }
            "has_ancestor_tags" => {
                let wanted = value_as_strings(expected)?;
                let mut pool: BTreeSet<String> = self
                    .get(uid)
                    .map(|i| i.entity().tags.iter().cloned().collect())
                    .unwrap_or_default();
                for ancestor in self.ancestors_of(uid) {
                    if let Some(item) = self.get(ancestor) {
                        pool.extend(item.entity().tags.iter().cloned());
                    }
                }
                Some(wanted.iter().all(|t| pool.contains(t)))
            }
            "has_ancestor_labels" => {
                let wanted = value_as_strings(expected)?;
                let pool: BTreeSet<String> = self
                    .ancestors_of(uid)
                    .into_iter()
                    .filter_map(|a| self.get(a).and_then(|i| i.entity().label.clone()))
                    .collect();
                Some(wanted.iter().all(|l| pool.contains(l)))
            }
            "has_parent_label" => {
                let wanted = expected.as_str()?;
                Some(
                    self.parent_of(uid)
                        .and_then(|p| self.get(p))
                        .and_then(|i| i.entity().label.clone())
                        .as_deref()
                        == Some(wanted),
                )
            }
            _ => None,
        }
    }

    // ---- integrity ----

    /// A linkable endpoint must already be registered in this graph.
    pub fn validate_linkable(&self, uid: Uuid) -> Result<()> {
        if self.items.contains(uid) {
            Ok(())
        } else {
            Err(EngineError::Linkage(format!(
                "item {uid} must be added to the graph before linking"
            )))
        }
    }

    fn validate_endpoint(&self, endpoint: Option<Uuid>) -> Result<()> {
        match endpoint {
            Some(uid) => self.validate_linkable(uid),
            None => Ok(()),
        }
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::requirement::ProvisioningPolicy;
    use serde_json::json;

    fn scene_fixture() -> (Graph, Uuid, Uuid, Uuid) {
        let mut graph = Graph::new();
        let a = graph.add_node(Node::new().labeled("a").tagged(["start"])).unwrap();
        let b = graph.add_node(Node::new().labeled("b")).unwrap();
        let scene = graph
            .add_subgraph(Subgraph::new().labeled("scene1").tagged(["intro"]))
            .unwrap();
        graph.add_member(scene, a).unwrap();
        graph.add_member(scene, b).unwrap();
        (graph, a, b, scene)
    }

    #[test]
    fn test_linkage_requires_registration() {
        let mut graph = Graph::new();
        let a = graph.add_node(Node::new()).unwrap();
        let stray = Uuid::new_v4();
        let err = graph.add_edge(Edge::link(Some(a), Some(stray))).unwrap_err();
        assert!(matches!(err, EngineError::Linkage(_)));

        let b = graph.add_node(Node::new()).unwrap();
        graph.link(a, b).unwrap();
    }

    #[test]
    fn test_open_endpoints_allowed() {
        let mut graph = Graph::new();
        let a = graph.add_node(Node::new()).unwrap();
        graph.add_edge(Edge::link(Some(a), None)).unwrap();
    }

    #[test]
    fn test_edges_in_out() {
        let (mut graph, a, b, _) = scene_fixture();
        graph.link(a, b).unwrap();
        assert_eq!(graph.edges_out(a, &Criteria::new()).count(), 1);
        assert_eq!(graph.edges_in(b, &Criteria::new()).count(), 1);
        assert_eq!(graph.edges_in(a, &Criteria::new()).count(), 0);
        assert_eq!(graph.edges_of(a, &Criteria::new()).len(), 1);
    }

    #[test]
    fn test_parent_ancestors_path() {
        let (mut graph, a, _, scene) = scene_fixture();
        let act = graph.add_subgraph(Subgraph::new().labeled("act1")).unwrap();
        graph.add_member(act, scene).unwrap();

        assert_eq!(graph.parent_of(a), Some(scene));
        assert_eq!(graph.ancestors_of(a), vec![scene, act]);
        assert_eq!(graph.root_of(a), Some(act));
        assert_eq!(graph.path(a), "act1.scene1.a");
    }

    #[test]
    fn test_reparent_invalidates_cache() {
        let (mut graph, a, _, scene) = scene_fixture();
        assert_eq!(graph.parent_of(a), Some(scene));

        let other = graph.add_subgraph(Subgraph::new().labeled("scene2")).unwrap();
        graph.add_member(other, a).unwrap();
        assert_eq!(graph.parent_of(a), Some(other));
        assert!(!graph.get_subgraph(scene).unwrap().has_member(a));
    }

    #[test]
    fn test_scope_selectors() {
        let (graph, a, _, _) = scene_fixture();
        let scope = MatchScope::in_graph(&graph);
        let node = graph.get(a).unwrap();

        assert!(node.matches(&Criteria::new().with("has_path", json!("scene1.*")), scope));
        assert!(!node.matches(&Criteria::new().with("has_path", json!("scene2.*")), scope));
        assert!(node.matches(&Criteria::new().with("has_ancestor_tags", json!(["intro"])), scope));
        assert!(node.matches(&Criteria::new().with("has_parent_label", json!("scene1")), scope));
        // graph-scoped keys do not match without a graph in scope
        assert!(!node.matches(
            &Criteria::new().with("has_parent_label", json!("scene1")),
            MatchScope::bare()
        ));
    }

    #[test]
    fn test_find_members_restricted() {
        let (mut graph, _, _, scene) = scene_fixture();
        graph.add_node(Node::new().labeled("outsider")).unwrap();
        let labels: Vec<_> = graph
            .find_members(scene, &Criteria::new())
            .map(|i| i.display_label())
            .collect();
        assert_eq!(labels, ["a", "b"]);
    }

    #[test]
    fn test_dependency_requires_requirement_in_graph() {
        let (mut graph, a, _, _) = scene_fixture();
        let stray_req = Uuid::new_v4();
        let err = graph.add_edge(Edge::dependency(a, stray_req)).unwrap_err();
        assert!(matches!(err, EngineError::Linkage(_)));
    }

    #[test]
    fn test_bind_provider_mirrors_open_edges() {
        let (mut graph, a, b, _) = scene_fixture();
        let requirement = Requirement::new(ProvisioningPolicy::EXISTING)
            .with_criteria(Criteria::new().has_tags(["start"]));
        let (edge_uid, req_uid) = graph.add_dependency(b, requirement).unwrap();

        assert_eq!(graph.edge_destination(graph.get_edge(edge_uid).unwrap()), None);
        graph.bind_provider(req_uid, a).unwrap();
        let edge = graph.get_edge(edge_uid).unwrap();
        assert_eq!(edge.destination_id(), Some(a));
        assert_eq!(graph.edge_destination(edge), Some(a));
        assert_eq!(graph.get_requirement(req_uid).unwrap().provider_id(), Some(a));
    }

    #[test]
    fn test_structural_id_folds_graph_uid() {
        let (graph, a, _, _) = scene_fixture();
        let other = Graph::new();
        let item = graph.get(a).unwrap();
        assert_ne!(item.structural_id(&graph), item.structural_id(&other));
    }
}
