//! Named service registry.
//!
//! Services are the run's external collaborators (clients, repositories,
//! clocks) injected by name and downcast to their concrete type by the
//! bodies that use them. A per-run override replaces entries without
//! mutating the workflow-level registration.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Named mapping from service identifier to implementation.
///
/// Cloning is cheap; the map itself is shared until modified.
#[derive(Clone, Default)]
pub struct Services {
    inner: Arc<HashMap<String, Arc<dyn Any + Send + Sync>>>,
}

impl Services {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service under `name`.
    pub fn insert<T: Send + Sync + 'static>(&mut self, name: impl Into<String>, service: T) {
        let map = Arc::make_mut(&mut self.inner);
        map.insert(name.into(), Arc::new(service));
    }

    /// Builder-style insert.
    pub fn with<T: Send + Sync + 'static>(mut self, name: impl Into<String>, service: T) -> Self {
        self.insert(name, service);
        self
    }

    /// Look up a service and downcast it to `T`.
    pub fn get<T: Send + Sync + 'static>(&self, name: &str) -> Option<Arc<T>> {
        self.inner
            .get(name)
            .and_then(|entry| entry.clone().downcast::<T>().ok())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// This registry with every entry of `overrides` replacing its own.
    pub fn overridden_by(&self, overrides: &Services) -> Services {
        let mut merged = (*self.inner).clone();
        for (name, service) in overrides.inner.iter() {
            merged.insert(name.clone(), service.clone());
        }
        Services {
            inner: Arc::new(merged),
        }
    }
}

impl fmt::Debug for Services {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.inner.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("Services").field("names", &names).finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
