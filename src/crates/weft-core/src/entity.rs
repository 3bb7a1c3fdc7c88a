//! Entity identity and criteria matching
//!
//! Every runtime object shares one identity discipline: a stable 128-bit uid,
//! an optional human label, a set of string tags, and a bag of serde_json
//! attributes. Equality and hashing derive from the uid alone.
//!
//! Matching is CSS-like. A [`Criteria`] map pairs string keys with
//! [`Criterion`] values; keys beginning with `has_` or `is_` dispatch to a
//! *capability* hook on the candidate ([`Matchable::capability`]), the
//! reserved keys `is_instance` and `predicate` check the candidate's
//! [`ItemKind`] or run an arbitrary closure, and every other key compares an
//! attribute for equality. An unknown capability key or a missing attribute
//! fails the match — never panics.
//!
//! # Selector-side filtering
//!
//! [`Selectable`] items carry their own `selection_criteria`, consulted when
//! the item is matched *against* a selector entity (the dispatch caller).
//! [`filter_for_selector`] merges inline criteria over each item's own
//! criteria and evaluates every criterion against the selector first, falling
//! back to the item itself for keys the selector does not understand (this is
//! how `has_task` reaches the behavior while `is_instance` constrains the
//! caller).
//!
//! # Specificity
//!
//! [`Criteria::specificity`] returns the `(id, class, other)` triple used by
//! the dispatch sort: `has_identifier` counts as an id specifier,
//! `is_instance` as a class specifier, everything else as an association
//! specifier.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::graph::Graph;

/// Static kind tag standing in for the reference system's class hierarchy.
///
/// `is_instance` criteria and behavior caller constraints are expressed
/// against these kinds; [`ItemKind::distance_to`] plays the role of MRO
/// distance in the dispatch sort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Entity,
    GraphItem,
    Node,
    Edge,
    Subgraph,
    Requirement,
    Record,
    Behavior,
}

impl ItemKind {
    /// The immediate supertype, if any.
    pub fn parent(self) -> Option<ItemKind> {
        match self {
            ItemKind::Entity => None,
            ItemKind::GraphItem | ItemKind::Record | ItemKind::Behavior => Some(ItemKind::Entity),
            ItemKind::Node | ItemKind::Edge | ItemKind::Subgraph | ItemKind::Requirement => {
                Some(ItemKind::GraphItem)
            }
        }
    }

    /// True when `self` is `ancestor` or a subtype of it.
    pub fn is_a(self, ancestor: ItemKind) -> bool {
        self.distance_to(ancestor).is_some()
    }

    /// Number of supertype hops from `self` up to `ancestor`.
    ///
    /// `Some(0)` for the kind itself, `None` when `ancestor` is not on the
    /// chain. Used as the dispatch pipeline's mro-distance term.
    pub fn distance_to(self, ancestor: ItemKind) -> Option<u32> {
        let mut current = Some(self);
        let mut dist = 0u32;
        while let Some(kind) = current {
            if kind == ancestor {
                return Some(dist);
            }
            current = kind.parent();
            dist += 1;
        }
        None
    }
}

/// Base unit of identity shared by every runtime object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    #[serde(default = "Uuid::new_v4")]
    uid: Uuid,
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tags: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub attrs: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Criteria::is_empty")]
    pub selection_criteria: Criteria,
}

impl Entity {
    /// Create a fresh entity with a new random uid.
    pub fn new() -> Self {
        Self::with_uid(Uuid::new_v4())
    }

    /// Create an entity with an explicit uid (replay, deserialization).
    pub fn with_uid(uid: Uuid) -> Self {
        Self {
            uid,
            label: None,
            tags: BTreeSet::new(),
            attrs: Map::new(),
            selection_criteria: Criteria::new(),
        }
    }

    /// Builder: set the label.
    pub fn labeled(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Builder: add tags.
    pub fn tagged<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Builder: set one attribute.
    pub fn with_attr(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attrs.insert(key.into(), value);
        self
    }

    /// Builder: set the selection criteria consulted by selector filtering.
    pub fn with_selection_criteria(mut self, criteria: Criteria) -> Self {
        self.selection_criteria = criteria;
        self
    }

    /// Stable identifier. Entities are equal iff their uids match.
    pub fn uid(&self) -> Uuid {
        self.uid
    }

    /// First eight hex chars of the uid, for logs and fallback labels.
    pub fn short_uid(&self) -> String {
        self.uid.simple().to_string()[..8].to_string()
    }

    /// The label, falling back to the short uid.
    pub fn display_label(&self) -> String {
        self.label.clone().unwrap_or_else(|| self.short_uid())
    }

    /// Attribute lookup by key.
    pub fn attr(&self, key: &str) -> Option<&Value> {
        self.attrs.get(key)
    }

    /// Capabilities every entity answers; `None` means "not understood".
    ///
    /// - `has_tags` / `has_tag`: tag subset / membership
    /// - `has_identifier`: label equality or uid equality (string form)
    /// - `has_label`: label equality
    pub fn base_capability(&self, key: &str, expected: &Value) -> Option<bool> {
        match key {
            "has_tags" => Some(value_as_strings(expected)?.iter().all(|t| self.tags.contains(t))),
            "has_tag" => Some(expected.as_str().map(|t| self.tags.contains(t)).unwrap_or(false)),
            "has_identifier" => {
                let ident = expected.as_str()?;
                if self.label.as_deref() == Some(ident) {
                    return Some(true);
                }
                Some(Uuid::parse_str(ident).map(|u| u == self.uid).unwrap_or(false))
            }
            "has_label" => Some(expected.as_str().map(|l| self.label.as_deref() == Some(l)).unwrap_or(false)),
            _ => None,
        }
    }
}

impl Default for Entity {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Entity {
    fn eq(&self, other: &Self) -> bool {
        self.uid == other.uid
    }
}

impl Eq for Entity {}

impl std::hash::Hash for Entity {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.uid.hash(state);
    }
}

/// Coerce a criterion value into a list of strings (string or string array).
pub(crate) fn value_as_strings(value: &Value) -> Option<Vec<String>> {
    match value {
        Value::String(s) => Some(vec![s.clone()]),
        Value::Array(items) => items
            .iter()
            .map(|v| v.as_str().map(str::to_string))
            .collect::<Option<Vec<_>>>(),
        _ => None,
    }
}

/// Read-only surroundings handed to capability hooks.
///
/// Graph-scoped capabilities (`has_path`, `has_ancestor_tags`, ...) need the
/// owning graph to walk ancestry; detached matching passes [`MatchScope::bare`].
#[derive(Clone, Copy, Default)]
pub struct MatchScope<'a> {
    pub graph: Option<&'a Graph>,
}

impl<'a> MatchScope<'a> {
    /// No graph available; graph-scoped capabilities will not match.
    pub fn bare() -> Self {
        Self { graph: None }
    }

    /// Capabilities may dereference ancestry through `graph`.
    pub fn in_graph(graph: &'a Graph) -> Self {
        Self { graph: Some(graph) }
    }
}

type PredicateFn = Arc<dyn Fn(&dyn Matchable) -> bool>;

/// One selection criterion, tagged by kind.
///
/// The key under which a criterion is stored decides its evaluation:
/// `predicate` and `is_instance` are reserved, `has_*`/`is_*` keys dispatch
/// to capabilities, all other keys compare attributes.
#[derive(Clone)]
pub enum Criterion {
    /// Capability check dispatched by key (`has_tags`, `has_task`, ...).
    Has(Value),
    /// Plain attribute equality.
    Attr(Value),
    /// Kind check; the static stand-in for `is_instance`.
    Kind(ItemKind),
    /// Arbitrary predicate over the candidate.
    Predicate(PredicateFn),
}

impl fmt::Debug for Criterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Criterion::Has(v) => write!(f, "Has({v})"),
            Criterion::Attr(v) => write!(f, "Attr({v})"),
            Criterion::Kind(k) => write!(f, "Kind({k:?})"),
            Criterion::Predicate(_) => write!(f, "Predicate(..)"),
        }
    }
}

/// Ordered `(id, class, other)` triple; higher sorts as more specific.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Specificity(pub u8, pub u8, pub u16);

/// An ordered map of named criteria.
///
/// Iteration order is insertion order, but matching is conjunctive and
/// therefore order-independent. Keys are unique; inserting twice replaces.
#[derive(Clone, Default)]
pub struct Criteria {
    entries: Vec<(String, Criterion)>,
}

impl Criteria {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a criterion under `key`, classifying by prefix: `is_instance`
    /// must use [`Criteria::kind`], `has_*`/`is_*` become capabilities, any
    /// other key becomes attribute equality.
    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        let key = key.into();
        let criterion = if key.starts_with("has_") || key.starts_with("is_") {
            Criterion::Has(value)
        } else {
            Criterion::Attr(value)
        };
        self.insert(key, criterion);
        self
    }

    /// Constrain the candidate's [`ItemKind`] (the `is_instance` criterion).
    pub fn kind(mut self, kind: ItemKind) -> Self {
        self.insert("is_instance".into(), Criterion::Kind(kind));
        self
    }

    /// Attach an arbitrary predicate under the reserved `predicate` key.
    pub fn predicate(mut self, f: impl Fn(&dyn Matchable) -> bool + 'static) -> Self {
        self.insert("predicate".into(), Criterion::Predicate(Arc::new(f)));
        self
    }

    /// Shorthand for `has_tags` with a tag list.
    pub fn has_tags<I, S>(self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tags: Vec<Value> = tags.into_iter().map(|t| Value::String(t.into())).collect();
        self.with("has_tags", Value::Array(tags))
    }

    /// Shorthand for `has_identifier` (label or uid string).
    pub fn has_identifier(self, ident: impl Into<String>) -> Self {
        self.with("has_identifier", Value::String(ident.into()))
    }

    /// Shorthand for label equality.
    pub fn label(self, label: impl Into<String>) -> Self {
        self.with("label", Value::String(label.into()))
    }

    fn insert(&mut self, key: String, criterion: Criterion) {
        if let Some(slot) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = criterion;
        } else {
            self.entries.push((key, criterion));
        }
    }

    pub fn get(&self, key: &str) -> Option<&Criterion> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, c)| c)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Criterion)> {
        self.entries.iter().map(|(k, c)| (k.as_str(), c))
    }

    /// `self` layered over `base`: keys in `self` win on conflict.
    pub fn merged_over(&self, base: &Criteria) -> Criteria {
        let mut out = base.clone();
        for (key, criterion) in &self.entries {
            out.insert(key.clone(), criterion.clone());
        }
        out
    }

    /// CSS-style `(id, class, other)` specificity of this criteria set.
    pub fn specificity(&self) -> Specificity {
        let id = u8::from(self.contains_key("has_identifier"));
        let class = u8::from(self.contains_key("is_instance"));
        let other = (self.len() - id as usize - class as usize) as u16;
        Specificity(id, class, other)
    }
}

impl fmt::Debug for Criteria {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.entries.iter().map(|(k, c)| (k, c))).finish()
    }
}

// Predicates cannot round-trip; they are skipped on serialize and never
// produced by deserialize.
impl Serialize for Criteria {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let serializable = self
            .entries
            .iter()
            .filter(|(_, c)| !matches!(c, Criterion::Predicate(_)))
            .collect::<Vec<_>>();
        let mut map = serializer.serialize_map(Some(serializable.len()))?;
        for (key, criterion) in serializable {
            match criterion {
                Criterion::Has(v) | Criterion::Attr(v) => map.serialize_entry(key, v)?,
                Criterion::Kind(k) => map.serialize_entry(key, k)?,
                Criterion::Predicate(_) => unreachable!(),
            }
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Criteria {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct CriteriaVisitor;

        impl<'de> Visitor<'de> for CriteriaVisitor {
            type Value = Criteria;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of criteria")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> std::result::Result<Criteria, A::Error> {
                let mut criteria = Criteria::new();
                while let Some((key, value)) = access.next_entry::<String, Value>()? {
                    if key == "is_instance" {
                        let kind: ItemKind =
                            serde_json::from_value(value).map_err(serde::de::Error::custom)?;
                        criteria = criteria.kind(kind);
                    } else {
                        criteria = criteria.with(key, value);
                    }
                }
                Ok(criteria)
            }
        }

        deserializer.deserialize_map(CriteriaVisitor)
    }
}

/// Anything that can be evaluated against a [`Criteria`] set.
pub trait Matchable {
    /// The shared identity substrate.
    fn entity(&self) -> &Entity;

    /// Static kind tag for `is_instance` criteria.
    fn kind(&self) -> ItemKind {
        ItemKind::Entity
    }

    /// Capability hook for `has_*`/`is_*` criteria. `None` means the key is
    /// not understood, which fails the match.
    fn capability(&self, key: &str, expected: &Value, _scope: MatchScope<'_>) -> Option<bool> {
        self.entity().base_capability(key, expected)
    }

    /// Attribute lookup for equality criteria. `label` and `uid` are always
    /// answerable; everything else reads the attrs map.
    fn attr(&self, key: &str) -> Option<Value> {
        match key {
            "label" => self.entity().label.clone().map(Value::String),
            "uid" => Some(Value::String(self.entity().uid().to_string())),
            other => self.entity().attr(other).cloned(),
        }
    }

    /// True iff every criterion holds. Deterministic and order-independent.
    fn matches(&self, criteria: &Criteria, scope: MatchScope<'_>) -> bool
    where
        Self: Sized,
    {
        criteria.iter().all(|(key, criterion)| match criterion {
            Criterion::Predicate(f) => f(self),
            Criterion::Kind(kind) => self.kind().is_a(*kind),
            Criterion::Has(expected) => self.capability(key, expected, scope) == Some(true),
            Criterion::Attr(expected) => self.attr(key).map(|v| v == *expected).unwrap_or(false),
        })
    }
}

impl Matchable for Entity {
    fn entity(&self) -> &Entity {
        self
    }
}

/// Items that publish criteria describing the selectors they apply to.
pub trait Selectable: Matchable {
    /// Criteria the *selector* must satisfy for this item to be picked.
    fn selection_criteria(&self) -> Criteria {
        self.entity().selection_criteria.clone()
    }
}

impl Selectable for Entity {}

/// Evaluate one merged criterion for a (selector, item) pair.
///
/// The selector is consulted first; capability keys and attributes it does not
/// understand fall through to the item itself. This is the asymmetry that lets
/// `has_task` filter behaviors while `is_instance` constrains callers.
fn criterion_holds(
    key: &str,
    criterion: &Criterion,
    selector: &dyn Matchable,
    item: &dyn Matchable,
    scope: MatchScope<'_>,
) -> bool {
    match criterion {
        Criterion::Predicate(f) => f(selector),
        Criterion::Kind(kind) => selector.kind().is_a(*kind),
        Criterion::Has(expected) => selector
            .capability(key, expected, scope)
            .or_else(|| item.capability(key, expected, scope))
            == Some(true),
        Criterion::Attr(expected) => selector
            .attr(key)
            .or_else(|| item.attr(key))
            .map(|v| v == *expected)
            .unwrap_or(false),
    }
}

/// Filter `items` down to those whose merged criteria (inline over their own
/// selection criteria) hold for `selector`.
pub fn filter_for_selector<'a, T: Selectable>(
    items: impl IntoIterator<Item = &'a T>,
    selector: &dyn Matchable,
    inline: &Criteria,
    scope: MatchScope<'_>,
) -> Vec<&'a T> {
    items
        .into_iter()
        .filter(|item| {
            let merged = inline.merged_over(&item.selection_criteria());
            let holds = merged
                .iter()
                .all(|(key, criterion)| criterion_holds(key, criterion, selector, *item, scope));
            holds
        })
        .collect()
}
