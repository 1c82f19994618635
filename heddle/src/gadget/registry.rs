//! Gadget registry: name → handler, case-insensitive lookup.

use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;

use super::Gadget;

#[derive(Debug, Error)]
pub enum RegistryError {
    /// Duplicate registration is a caller error, not a runtime condition.
    #[error("gadget {0:?} is already registered")]
    Duplicate(String),
}

/// Holds the gadgets available to one scheduler session.
#[derive(Default)]
pub struct GadgetRegistry {
    gadgets: DashMap<String, Arc<dyn Gadget>>,
}

impl GadgetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a gadget under its lowercased name.
    pub fn register(&self, gadget: Arc<dyn Gadget>) -> Result<(), RegistryError> {
        let key = gadget.name().to_lowercase();
        if self.gadgets.contains_key(&key) {
            return Err(RegistryError::Duplicate(gadget.name().to_string()));
        }
        self.gadgets.insert(key, gadget);
        Ok(())
    }

    /// Case-insensitive lookup.
    pub fn lookup(&self, name: &str) -> Option<Arc<dyn Gadget>> {
        self.gadgets
            .get(&name.to_lowercase())
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Registered names (lowercased), sorted for stable output.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.gadgets.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.gadgets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gadgets.is_empty()
    }
}

impl std::fmt::Debug for GadgetRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GadgetRegistry")
            .field("names", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gadget::EchoGadget;

    #[test]
    fn lookup_is_case_insensitive() {
        let registry = GadgetRegistry::new();
        registry.register(Arc::new(EchoGadget::new())).unwrap();
        assert!(registry.lookup("echo").is_some());
        assert!(registry.lookup("Echo").is_some());
        assert!(registry.lookup("ECHO").is_some());
        assert!(registry.lookup("other").is_none());
    }

    #[test]
    fn duplicate_registration_is_an_error() {
        let registry = GadgetRegistry::new();
        registry.register(Arc::new(EchoGadget::new())).unwrap();
        let err = registry.register(Arc::new(EchoGadget::new())).unwrap_err();
        assert!(matches!(err, RegistryError::Duplicate(name) if name == "echo"));
    }

    #[test]
    fn names_are_sorted() {
        let registry = GadgetRegistry::new();
        registry.register(Arc::new(EchoGadget::new())).unwrap();
        registry
            .register(Arc::new(crate::gadget::FailGadget::new()))
            .unwrap();
        assert_eq!(registry.names(), vec!["echo".to_string(), "fail".to_string()]);
    }
}
