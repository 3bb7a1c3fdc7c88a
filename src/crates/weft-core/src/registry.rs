//! Uid-keyed, insertion-ordered entity stores
//!
//! A [`Registry`] maps uid → item and preserves insertion order for every
//! query. Duplicate uids are rejected unless the caller opts into overwrite;
//! removal has discard semantics (absent keys are not an error).
//!
//! Queries go through the criteria machinery from [`crate::entity`]:
//! [`Registry::find_all`] yields matches in insertion order and
//! [`Registry::chain_find_all`] walks several registries in the caller's
//! order, which is how layered lookups (local before global) are composed.

use indexmap::IndexMap;
use uuid::Uuid;

use crate::entity::{Criteria, Matchable, MatchScope};
use crate::error::{EngineError, Result};

/// Items that can live in a [`Registry`].
pub trait HasUid {
    fn uid(&self) -> Uuid;
}

impl<T: Matchable> HasUid for T {
    fn uid(&self) -> Uuid {
        self.entity().uid()
    }
}

/// Insertion-ordered mapping uid → item.
#[derive(Debug, Clone)]
pub struct Registry<T> {
    items: IndexMap<Uuid, T>,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self { items: IndexMap::new() }
    }
}

impl<T: Matchable> Registry<T> {
    pub fn new() -> Self {
        Self { items: IndexMap::new() }
    }

    /// Register `item`. Re-registering a uid is a [`EngineError::DuplicateIdentity`].
    pub fn add(&mut self, item: T) -> Result<Uuid> {
        self.add_with(item, false)
    }

    /// Register `item`, optionally overwriting an existing uid in place.
    pub fn add_with(&mut self, item: T, allow_overwrite: bool) -> Result<Uuid> {
        let uid = item.uid();
        if !allow_overwrite && self.items.contains_key(&uid) {
            return Err(EngineError::DuplicateIdentity(format!(
                "uid {uid} already registered; pass allow_overwrite to replace"
            )));
        }
        self.items.insert(uid, item);
        Ok(uid)
    }

    /// Discard by uid. Missing keys are not an error.
    pub fn remove(&mut self, uid: Uuid) -> Option<T> {
        self.items.shift_remove(&uid)
    }

    pub fn get(&self, uid: Uuid) -> Option<&T> {
        self.items.get(&uid)
    }

    pub fn get_mut(&mut self, uid: Uuid) -> Option<&mut T> {
        self.items.get_mut(&uid)
    }

    /// Lookup by uid or, failing that, by unique label.
    pub fn resolve(&self, key: &str) -> Option<&T> {
        if let Ok(uid) = Uuid::parse_str(key) {
            if let Some(item) = self.items.get(&uid) {
                return Some(item);
            }
        }
        self.values().find(|item| item.entity().label.as_deref() == Some(key))
    }

    pub fn contains(&self, uid: Uuid) -> bool {
        self.items.contains_key(&uid)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.items.values()
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.items.values_mut()
    }

    pub fn keys(&self) -> impl Iterator<Item = Uuid> + '_ {
        self.items.keys().copied()
    }

    /// All items matching `criteria`, in insertion order.
    pub fn find_all<'a, 'b>(
        &'a self,
        criteria: &'b Criteria,
        scope: MatchScope<'b>,
    ) -> impl Iterator<Item = &'a T> + 'b
    where
        'a: 'b,
    {
        self.values().filter(move |item| item.matches(criteria, scope))
    }

    /// First item matching `criteria`, in insertion order.
    pub fn find_one<'a>(&'a self, criteria: &Criteria, scope: MatchScope<'_>) -> Option<&'a T> {
        self.find_all(criteria, scope).next()
    }

    /// Walk `registries` in the given order, yielding each registry's matches
    /// before the next registry is consulted. An optional `sort_key` re-sorts
    /// the combined result (stably) at the end.
    pub fn chain_find_all<'a, K: Ord>(
        registries: &[&'a Registry<T>],
        criteria: &Criteria,
        scope: MatchScope<'_>,
        sort_key: Option<&dyn Fn(&T) -> K>,
    ) -> Vec<&'a T> {
        let mut found: Vec<&T> = registries
            .iter()
            .flat_map(|registry| registry.find_all(criteria, scope).collect::<Vec<_>>())
            .collect();
        if let Some(key) = sort_key {
            found.sort_by_key(|item| key(item));
        }
        found
    }
}
