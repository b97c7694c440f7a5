//! Attribute storage
//!
//! [`AttributeMap`] is the plain name-to-value map with change reporting.
//! [`AttributeContainer`] puts it behind a read/write lock whose acquisition
//! is bounded by a timeout, so a stuck writer turns into an error instead of
//! a silent deadlock.

mod value;

pub use value::{AttributeValue, DestructionAware};

use lifescope_types::Change;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Unlocked attribute map
#[derive(Debug, Clone, Default)]
pub struct AttributeMap {
    entries: HashMap<String, AttributeValue>,
}

impl AttributeMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&AttributeValue> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Store a value; storing a value equal to the current one keeps the
    /// current one and reports `Unchanged`
    pub fn set(&mut self, name: impl Into<String>, value: AttributeValue) -> Change {
        let name = name.into();
        if let Some(existing) = self.entries.get(&name) {
            if existing.same_as(&value) {
                return Change::Unchanged;
            }
        }
        self.entries.insert(name, value);
        Change::Changed
    }

    pub fn remove(&mut self, name: &str) -> Change {
        self.entries.remove(name).is_some().into()
    }

    pub fn clear(&mut self) -> Change {
        if self.entries.is_empty() {
            return Change::Unchanged;
        }
        self.entries.clear();
        Change::Changed
    }

    /// Copy of every value
    pub fn values(&self) -> Vec<AttributeValue> {
        self.entries.values().cloned().collect()
    }

    /// Copy of every entry, ordered by name
    pub fn entries(&self) -> Vec<(String, AttributeValue)> {
        let mut entries: Vec<_> = self
            .entries
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.entries.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The container lock was not acquired within the timeout
#[derive(Debug, Clone, Copy, Error)]
#[error("attribute lock not acquired within {waited:?}")]
pub struct LockTimedOut {
    pub waited: Duration,
}

/// Thread-safe attribute map
///
/// Readers share the lock; every mutator takes it exclusively. Reads are
/// recursive so a reader that already holds the lock never queues behind a
/// waiting writer.
#[derive(Debug)]
pub struct AttributeContainer {
    map: RwLock<AttributeMap>,
    timeout: Duration,
}

impl AttributeContainer {
    pub fn new(timeout: Duration) -> Self {
        AttributeContainer {
            map: RwLock::new(AttributeMap::new()),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run `f` under the shared lock
    pub fn read<R>(&self, f: impl FnOnce(&AttributeMap) -> R) -> Result<R, LockTimedOut> {
        let guard = self
            .map
            .try_read_recursive_for(self.timeout)
            .ok_or(LockTimedOut {
                waited: self.timeout,
            })?;
        Ok(f(&guard))
    }

    /// Run `f` under the exclusive lock
    pub fn write<R>(&self, f: impl FnOnce(&mut AttributeMap) -> R) -> Result<R, LockTimedOut> {
        let mut guard = self.map.try_write_for(self.timeout).ok_or(LockTimedOut {
            waited: self.timeout,
        })?;
        Ok(f(&mut guard))
    }

    pub fn get(&self, name: &str) -> Result<Option<AttributeValue>, LockTimedOut> {
        self.read(|map| map.get(name).cloned())
    }

    pub fn set(
        &self,
        name: impl Into<String>,
        value: AttributeValue,
    ) -> Result<Change, LockTimedOut> {
        self.write(|map| map.set(name, value))
    }

    pub fn remove(&self, name: &str) -> Result<Change, LockTimedOut> {
        self.write(|map| map.remove(name))
    }

    pub fn clear(&self) -> Result<Change, LockTimedOut> {
        self.write(|map| map.clear())
    }

    /// Copy of every value, never a live view
    pub fn values(&self) -> Result<Vec<AttributeValue>, LockTimedOut> {
        self.read(|map| map.values())
    }

    pub fn entries(&self) -> Result<Vec<(String, AttributeValue)>, LockTimedOut> {
        self.read(|map| map.entries())
    }
}
