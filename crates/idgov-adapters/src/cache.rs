//! Per-client cache of normalized tables, keyed by entity type.

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;

use idgov_core::Table;
use tracing::debug;

/// Holds the last materialized table per entity for the lifetime of one client.
///
/// Readers always receive a clone, so the cached original is never mutated. Derived
/// entries registered with [`depends_on`](Self::depends_on) are dropped whenever one of
/// their inputs is stored again or invalidated, transitively.
#[derive(Debug, Clone)]
pub struct EntityCache<K> {
    entries: HashMap<K, Table>,
    dependents: HashMap<K, Vec<K>>,
}

impl<K> Default for EntityCache<K> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            dependents: HashMap::new(),
        }
    }
}

impl<K: Copy + Eq + Hash + Debug> EntityCache<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn depends_on(&mut self, derived: K, inputs: &[K]) {
        for input in inputs {
            let list = self.dependents.entry(*input).or_default();
            if !list.contains(&derived) {
                list.push(derived);
            }
        }
    }

    /// `None` when `refresh` is set or the entity was never fetched. An empty table is a
    /// populated entry.
    pub fn get(&self, kind: K, refresh: bool) -> Option<Table> {
        if refresh {
            return None;
        }
        self.entries.get(&kind).cloned()
    }

    pub fn is_populated(&self, kind: K) -> bool {
        self.entries.contains_key(&kind)
    }

    pub fn store(&mut self, kind: K, table: Table) {
        self.drop_dependents(kind);
        debug!(entity = ?kind, rows = table.len(), "cache stored");
        self.entries.insert(kind, table);
    }

    pub fn invalidate(&mut self, kind: K) {
        self.entries.remove(&kind);
        self.drop_dependents(kind);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn drop_dependents(&mut self, kind: K) {
        let mut pending = self.dependents.get(&kind).cloned().unwrap_or_default();
        let mut seen = HashSet::new();
        while let Some(next) = pending.pop() {
            if next == kind || !seen.insert(next) {
                continue;
            }
            if self.entries.remove(&next).is_some() {
                debug!(entity = ?next, cause = ?kind, "cache invalidated");
            }
            if let Some(more) = self.dependents.get(&next) {
                pending.extend(more.iter().copied());
            }
        }
    }
}
