use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

/// In-memory map of logical VM identifiers to canonical names. A VM is known
/// to the orchestrator iff it has an entry here.
#[derive(Debug, Default)]
pub struct VmRegistry {
    entries: RwLock<HashMap<String, String>>,
}

impl VmRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `id`. Re-registering overwrites the mapping and returns the
    /// previous name.
    pub fn register(&self, id: impl Into<String>, name: impl Into<String>) -> Option<String> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.into(), name.into())
    }

    pub fn unregister(&self, id: &str) -> Option<String> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
    }

    /// Strict lookup: the registered name for `id`, or nothing.
    pub fn lookup(&self, id: &str) -> Option<String> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Find a registered entry by identifier or by canonical name, returning
    /// `(id, name)`.
    pub fn find(&self, id_or_name: &str) -> Option<(String, String)> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(name) = entries.get(id_or_name) {
            return Some((id_or_name.to_string(), name.clone()));
        }
        entries
            .iter()
            .find(|(_, name)| name.as_str() == id_or_name)
            .map(|(id, name)| (id.clone(), name.clone()))
    }

    /// Name to hand to the engine. An explicit name always wins, then the
    /// registered name for `id`, then `id` itself.
    pub fn resolve(&self, id: Option<&str>, explicit_name: Option<&str>) -> Option<String> {
        if let Some(name) = explicit_name.filter(|n| !n.is_empty()) {
            return Some(name.to_string());
        }
        let id = id.filter(|i| !i.is_empty())?;
        self.lookup(id).or_else(|| Some(id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
