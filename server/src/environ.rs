//! Environment-variable overlay served by `/environ`.
//!
//! The store starts as a copy of the server's own environment. Mutations
//! change only the store, never the process environment, and every kernel is
//! spawned with a snapshot taken at spawn time. A kernel therefore sees the
//! variables as they were when it started; later changes affect only kernels
//! spawned afterwards.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

#[derive(Clone, Default)]
pub struct EnvironStore {
    vars: Arc<RwLock<BTreeMap<String, String>>>,
}

impl EnvironStore {
    pub fn from_process() -> Self {
        let vars = std::env::vars_os()
            .map(|(k, v)| (k.to_string_lossy().into_owned(), v.to_string_lossy().into_owned()))
            .collect();
        Self::from_map(vars)
    }

    pub fn from_map(vars: BTreeMap<String, String>) -> Self {
        Self {
            vars: Arc::new(RwLock::new(vars)),
        }
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.vars.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn get(&self, name: &str) -> Option<String> {
        self.vars
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Set a variable. Returns `true` if it did not exist before.
    pub fn set(&self, name: &str, value: &str) -> bool {
        self.vars
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), value.to_string())
            .is_none()
    }

    /// Remove a variable. Returns `true` if it existed.
    pub fn remove(&self, name: &str) -> bool {
        self.vars
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some()
    }
}

/// Whether `name` can be used as an environment variable name.
pub fn valid_name(name: &str) -> bool {
    !name.is_empty() && !name.contains('=') && !name.contains('\0')
}
