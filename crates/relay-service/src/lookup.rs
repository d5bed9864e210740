//! A lazily-resolved handle to a service's component registry.
//!
//! Components are constructed by application code *before* the
//! registry that will hold them exists — the registry is what
//! [`crate::builder::ServiceBuilder::build`] produces once every
//! `register_component` call has landed. A component that wants to
//! look up a sibling registered earlier (the pattern in scenario 3 of
//! the testable-properties section: `B.on_start` calls
//! `GetComponent("A")` and stores the result) needs a handle it can
//! capture at its own construction time and resolve later, once the
//! registry is actually built. `ComponentLookup` is that handle: cheap
//! to clone, resolved exactly once, and safe to hold before or after
//! resolution (`get` before resolution just returns `None`, matching
//! "component not found" rather than panicking).
use std::sync::{Arc, OnceLock};

use relay_core::component::{Component, ComponentRegistry};

#[derive(Clone, Default)]
pub struct ComponentLookup(Arc<OnceLock<Arc<ComponentRegistry>>>);

impl ComponentLookup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves this handle to `registry`. Called once by
    /// `ServiceBuilder::build`, before any component's `on_init` runs.
    /// A second call is a no-op — the registry for a given service
    /// never changes after `build`.
    pub fn resolve(&self, registry: Arc<ComponentRegistry>) {
        let _ = self.0.set(registry);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Component>> {
        self.0.get().and_then(|registry| registry.get(name))
    }

    pub fn is_resolved(&self) -> bool {
        self.0.get().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::error::CoreError;

    struct Named(&'static str);
    impl Component for Named {
        fn name(&self) -> &str {
            self.0
        }
    }

    #[test]
    fn get_before_resolution_is_none() {
        let lookup = ComponentLookup::new();
        assert!(lookup.get("a").is_none());
    }

    #[test]
    fn get_after_resolution_finds_registered_components() {
        let lookup = ComponentLookup::new();
        let mut registry = ComponentRegistry::new();
        registry.register(Arc::new(Named("a"))).unwrap();
        lookup.resolve(Arc::new(registry));

        assert!(lookup.get("a").is_some());
        assert!(lookup.get("missing").is_none());
        let _: Result<(), CoreError> = Ok(());
    }
}
