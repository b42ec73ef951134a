use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use crate::config::BackendConfig;

/// A backend server that can own shards.
///
/// Identity is the configured name; usability is flipped by the health
/// monitor and read by every session.
#[derive(Debug)]
pub struct Target {
    name: String,
    addr: String,
    usable: AtomicBool,
}

pub type TargetRef = Arc<Target>;

impl Target {
    pub fn new(name: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            addr: addr.into(),
            usable: AtomicBool::new(true),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn is_usable(&self) -> bool {
        self.usable.load(AtomicOrdering::Acquire)
    }

    /// Returns true when the flag actually changed
    pub fn set_usable(&self, usable: bool) -> bool {
        self.usable.swap(usable, AtomicOrdering::AcqRel) != usable
    }
}

impl PartialEq for Target {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Target {}

impl PartialOrd for Target {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Target {
    fn cmp(&self, other: &Self) -> Ordering {
        self.name.cmp(&other.name)
    }
}

impl Hash for Target {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// All configured backends, in configuration order
#[derive(Debug, Clone, Default)]
pub struct TargetSet {
    targets: Vec<TargetRef>,
}

impl TargetSet {
    pub fn from_config(backends: &[BackendConfig]) -> Self {
        Self {
            targets: backends
                .iter()
                .map(|b| Arc::new(Target::new(b.name.clone(), b.addr())))
                .collect(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &TargetRef> {
        self.targets.iter()
    }

    pub fn usable(&self) -> impl Iterator<Item = &TargetRef> {
        self.targets.iter().filter(|t| t.is_usable())
    }

    pub fn get(&self, name: &str) -> Option<&TargetRef> {
        self.targets.iter().find(|t| t.name() == name)
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }
}
