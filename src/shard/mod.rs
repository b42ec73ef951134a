//! Shard maps: which backend hosts which schema and table.
//!
//! A [`Shard`] is a cheap-to-clone snapshot. The location maps sit behind an
//! `Arc` and are only copied when a holder mutates a snapshot it shares with
//! someone else (the cache or another session).

mod cache;
mod ignore;

pub use cache::{CacheStats, ShardCache};
pub use ignore::{IgnoreList, BUILTIN_IGNORED_SCHEMAS};

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use crate::backend::TargetRef;

/// Lower-cased `(schema, table)`; an empty table names the schema itself
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TableKey {
    schema: String,
    table: String,
}

impl TableKey {
    pub fn new(schema: &str, table: &str) -> Self {
        Self {
            schema: schema.to_lowercase(),
            table: table.to_lowercase(),
        }
    }

    pub fn schema(name: &str) -> Self {
        Self::new(name, "")
    }

    pub fn schema_name(&self) -> &str {
        &self.schema
    }

    pub fn table_name(&self) -> &str {
        &self.table
    }

    pub fn is_schema(&self) -> bool {
        self.table.is_empty()
    }

    /// Key of the schema that contains this table
    pub fn schema_key(&self) -> TableKey {
        Self {
            schema: self.schema.clone(),
            table: String::new(),
        }
    }
}

impl fmt::Display for TableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.table.is_empty() {
            f.write_str(&self.schema)
        } else {
            write!(f, "{}.{}", self.schema, self.table)
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Locations {
    by_key: BTreeMap<TableKey, BTreeSet<TargetRef>>,
    all_targets: BTreeSet<TargetRef>,
}

/// Prepared statement to backend affinity
#[derive(Debug, Clone, Default)]
struct Statements {
    named: HashMap<String, TargetRef>,
    numbered: HashMap<u64, TargetRef>,
}

#[derive(Debug, Clone)]
pub struct Shard {
    locations: Arc<Locations>,
    statements: Statements,
    last_updated: SystemTime,
}

impl Default for Shard {
    fn default() -> Self {
        Self::new()
    }
}

impl Shard {
    /// Empty shard stamped with the current time
    pub fn new() -> Self {
        Self {
            locations: Arc::default(),
            statements: Statements::default(),
            last_updated: SystemTime::now(),
        }
    }

    pub fn last_updated(&self) -> SystemTime {
        self.last_updated
    }

    #[cfg(test)]
    pub fn with_last_updated(mut self, at: SystemTime) -> Self {
        self.last_updated = at;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.locations.by_key.is_empty()
    }

    pub fn newer_than(&self, other: &Shard) -> bool {
        self.last_updated > other.last_updated
    }

    /// Record that `target` hosts `schema.table` (or the schema when `table`
    /// is empty). Returns false when another target already hosts the key.
    pub fn add_location(&mut self, schema: &str, table: &str, target: &TargetRef) -> bool {
        let locations = Arc::make_mut(&mut self.locations);
        let set = locations.by_key.entry(TableKey::new(schema, table)).or_default();
        set.insert(target.clone());
        locations.all_targets.insert(target.clone());
        set.len() == 1
    }

    /// Take the locations and timestamp of `other`, keeping this shard's
    /// statement affinity
    pub fn adopt_locations(&mut self, other: &Shard) {
        self.locations = Arc::clone(&other.locations);
        self.last_updated = other.last_updated;
    }

    /// Whether any backend reported the schema or a table in it
    pub fn has_schema(&self, schema: &str) -> bool {
        let start = TableKey::schema(schema);
        self.locations
            .by_key
            .range(&start..)
            .next()
            .map_or(false, |(key, _)| key.schema_name() == start.schema_name())
    }

    pub fn contains_target(&self, target: &TargetRef) -> bool {
        self.locations.all_targets.contains(target)
    }

    /// Targets hosting one key. A table that was never discovered falls back
    /// to its schema, so statements creating new tables still find a home.
    pub fn locations_of(&self, key: &TableKey) -> BTreeSet<TargetRef> {
        if let Some(set) = self.locations.by_key.get(key) {
            return set.clone();
        }
        if key.is_schema() {
            return BTreeSet::new();
        }
        self.locations
            .by_key
            .get(&key.schema_key())
            .cloned()
            .unwrap_or_default()
    }

    /// Targets hosting every one of `tables`
    pub fn locations_for(&self, tables: &[TableKey]) -> BTreeSet<TargetRef> {
        let mut iter = tables.iter();
        let Some(first) = iter.next() else {
            return BTreeSet::new();
        };
        let mut result = self.locations_of(first);
        for key in iter {
            if result.is_empty() {
                break;
            }
            let next = self.locations_of(key);
            result.retain(|t| next.contains(t));
        }
        result
    }

    /// Whether every in-use backend is among `candidates`
    pub fn all_on_same_node_set(
        &self,
        candidates: &BTreeSet<TargetRef>,
        in_use: &[TargetRef],
    ) -> bool {
        !in_use.is_empty() && in_use.iter().all(|t| candidates.contains(t))
    }

    /// Discovered tables found on more than one backend. Schema entries are
    /// not considered: a schema may legitimately be split across backends.
    pub fn duplicates(&self, ignore: &IgnoreList) -> Vec<TableKey> {
        self.locations
            .by_key
            .iter()
            .filter(|(key, targets)| !key.is_schema() && targets.len() > 1 && !ignore.is_ignored(key))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Every `(key, target)` pair, ordered by key then target name
    pub fn entries(&self) -> impl Iterator<Item = (&TableKey, &TargetRef)> {
        self.locations
            .by_key
            .iter()
            .flat_map(|(key, targets)| targets.iter().map(move |t| (key, t)))
    }

    /// Distinct schema names, sorted
    pub fn schemas(&self) -> Vec<String> {
        let set: BTreeSet<&str> = self
            .locations
            .by_key
            .keys()
            .map(|k| k.schema_name())
            .collect();
        set.into_iter().map(str::to_string).collect()
    }

    pub fn named_statement(&self, name: &str) -> Option<&TargetRef> {
        self.statements.named.get(&name.to_lowercase())
    }

    pub fn set_named_statement(&mut self, name: &str, target: TargetRef) {
        self.statements.named.insert(name.to_lowercase(), target);
    }

    pub fn remove_named_statement(&mut self, name: &str) -> Option<TargetRef> {
        self.statements.named.remove(&name.to_lowercase())
    }

    pub fn numbered_statement(&self, id: u64) -> Option<&TargetRef> {
        self.statements.numbered.get(&id)
    }

    pub fn set_numbered_statement(&mut self, id: u64, target: TargetRef) {
        self.statements.numbered.insert(id, target);
    }

    pub fn remove_numbered_statement(&mut self, id: u64) -> Option<TargetRef> {
        self.statements.numbered.remove(&id)
    }

    /// Copy without session-private statement affinity, for publishing
    pub fn snapshot(&self) -> Shard {
        Shard {
            locations: Arc::clone(&self.locations),
            statements: Statements::default(),
            last_updated: self.last_updated,
        }
    }

    #[cfg(test)]
    pub(crate) fn shares_locations_with(&self, other: &Shard) -> bool {
        Arc::ptr_eq(&self.locations, &other.locations)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use crate::backend::{Target, TargetRef};

    pub fn target(name: &str) -> TargetRef {
        Arc::new(Target::new(name, format!("{name}:3306")))
    }
}
