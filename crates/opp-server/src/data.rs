//! Typed per-domain storage for integration instances

use dashmap::DashMap;
use std::any::Any;
use std::sync::Arc;

type Entry = Arc<dyn Any + Send + Sync>;

/// Process-wide place where integrations keep their runtime objects
///
/// Values are keyed by integration domain and retrieved with the type they
/// were stored as. Asking for another type yields `None`.
#[derive(Default)]
pub struct DataRegistry {
    entries: DashMap<String, Entry>,
}

impl DataRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` for `domain`, replacing whatever was there
    pub fn insert<T: Any + Send + Sync>(&self, domain: impl Into<String>, value: T) -> Arc<T> {
        let value = Arc::new(value);
        self.entries.insert(domain.into(), value.clone());
        value
    }

    pub fn get<T: Any + Send + Sync>(&self, domain: &str) -> Option<Arc<T>> {
        let entry = self.entries.get(domain)?.value().clone();
        entry.downcast().ok()
    }

    /// Get the value for `domain`, creating it first if needed
    ///
    /// Returns `None` if a value of another type is stored.
    pub fn get_or_insert_with<T, F>(&self, domain: &str, init: F) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        let entry = self
            .entries
            .entry(domain.to_string())
            .or_insert_with(|| Arc::new(init()))
            .value()
            .clone();
        entry.downcast().ok()
    }

    /// Remove the value for `domain` if it has type `T`
    pub fn remove<T: Any + Send + Sync>(&self, domain: &str) -> Option<Arc<T>> {
        let (_, entry) = self
            .entries
            .remove_if(domain, |_, entry| entry.is::<T>())?;
        entry.downcast().ok()
    }

    pub fn contains(&self, domain: &str) -> bool {
        self.entries.contains_key(domain)
    }

    pub fn domains(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }
}

impl std::fmt::Debug for DataRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataRegistry")
            .field("domains", &self.domains())
            .finish()
    }
}
