//! Component lifecycle, method table, and per-service registry.
//!
//! The source dispatches to components through virtual inheritance plus
//! a name-keyed method table. Here a component is a capability trait
//! object (`Arc<dyn Component>`) for the strongly-typed lifecycle calls,
//! with the method table kept as a secondary, dynamic channel for
//! late-bound/scripted calls — the two paths the design notes ask for,
//! rather than routing everything through one untyped call.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::error::CoreError;
use crate::variant::Variant;

/// A callable registered in a component's method table. Boxed rather
/// than generic so heterogeneous methods can live in one map.
pub type Method = Box<dyn Fn(&Variant) -> Result<Variant, CoreError> + Send + Sync>;

/// A plugin unit hosted by a service.
///
/// Lifecycle methods run on the owning service's loop thread only, in
/// the order `on_init` (registration order) → `on_start` (registration
/// order) → zero or more `on_update` → `on_stop` (reverse order) →
/// `on_destroy` (reverse order). A component must not call another
/// component's methods from `on_init`; by that point in the sequence
/// the only components guaranteed to exist are the ones registered
/// earlier, so init-time dependencies are resolved through the
/// registration list itself, not through lookup.
pub trait Component: Send + Sync {
    fn name(&self) -> &str;

    fn on_init(&self) -> Result<(), CoreError> {
        Ok(())
    }

    fn on_start(&self) -> Result<(), CoreError> {
        Ok(())
    }

    fn on_update(&self, _dt_ms: u64) {}

    fn on_stop(&self) -> Result<(), CoreError> {
        Ok(())
    }

    fn on_destroy(&self) {}

    /// Delivered for every drained envelope that isn't a poller event or
    /// a loop control message — the landing spot for cross-service
    /// `PostMessage` traffic and any other opaque work a producer hands
    /// into this service's queue. No-op by default; components that
    /// care about a particular `tag` inspect it and downcast the
    /// payload themselves.
    fn on_message(&self, _envelope: &crate::queue::Envelope) {}

    /// Methods this component exposes for dynamic, name-keyed dispatch.
    /// Empty by default; components that want scripted/late-bound calls
    /// override this to return their table.
    fn methods(&self) -> &MethodTable {
        static EMPTY: MethodTable = MethodTable::new();
        &EMPTY
    }
}

/// Linear scan below a threshold, hash map above it — the corpus's
/// small-N optimisation for method tables that in practice hold a
/// handful of entries, carried over verbatim because lookup behavior
/// must be identical regardless of which backing store answered it.
pub struct MethodTable {
    linear: Vec<(&'static str, Method)>,
    indexed: Option<HashMap<&'static str, Method>>,
}

const METHOD_TABLE_THRESHOLD: usize = 30;

impl MethodTable {
    pub const fn new() -> Self {
        Self {
            linear: Vec::new(),
            indexed: None,
        }
    }

    pub fn register(&mut self, name: &'static str, method: Method) {
        if let Some(map) = self.indexed.as_mut() {
            map.insert(name, method);
            return;
        }
        if let Some(slot) = self.linear.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = method;
            return;
        }
        self.linear.push((name, method));
        if self.linear.len() > METHOD_TABLE_THRESHOLD {
            self.indexed = Some(self.linear.drain(..).collect());
        }
    }

    pub fn call(&self, name: &str, arg: &Variant) -> Result<Variant, CoreError> {
        let method = if let Some(map) = self.indexed.as_ref() {
            map.get(name)
        } else {
            self.linear.iter().find(|(n, _)| *n == name).map(|(_, m)| m)
        };
        match method {
            Some(method) => method(arg),
            None => Err(CoreError::not_found(format!("method '{name}' not found"))),
        }
    }

    pub fn len(&self) -> usize {
        self.indexed.as_ref().map_or(self.linear.len(), |m| m.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MethodTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Append-only during a service's `Starting` phase; registering during
/// `Running` is a programmer error the caller should catch before
/// invoking it (the service loop enforces this by only exposing
/// mutation during construction).
#[derive(Default)]
pub struct ComponentRegistry {
    order: Vec<String>,
    by_name: BTreeMap<String, Arc<dyn Component>>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, component: Arc<dyn Component>) -> Result<(), CoreError> {
        let name = component.name().to_owned();
        if name.is_empty() {
            return Err(CoreError::arg("component name must not be empty"));
        }
        if self.by_name.contains_key(&name) {
            return Err(CoreError::repeat(format!(
                "component '{name}' already registered"
            )));
        }
        self.order.push(name.clone());
        self.by_name.insert(name, component);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Component>> {
        self.by_name.get(name).cloned()
    }

    /// Components in registration order, for `on_init`/`on_start`/`on_update`.
    pub fn iter_forward(&self) -> impl Iterator<Item = Arc<dyn Component>> + '_ {
        self.order.iter().map(move |name| self.by_name[name].clone())
    }

    /// Components in reverse registration order, for `on_stop`/`on_destroy`.
    pub fn iter_reverse(&self) -> impl Iterator<Item = Arc<dyn Component>> + '_ {
        self.order.iter().rev().map(move |name| self.by_name[name].clone())
    }

    pub fn call_method(
        &self,
        component_name: &str,
        method_name: &str,
        arg: &Variant,
    ) -> Result<Variant, CoreError> {
        let component = self
            .get(component_name)
            .ok_or_else(|| CoreError::not_found(format!("component '{component_name}' not found")))?;
        component.methods().call(method_name, arg)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct Recording {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Component for Recording {
        fn name(&self) -> &str {
            self.name
        }

        fn on_init(&self) -> Result<(), CoreError> {
            self.log.lock().unwrap().push(format!("{}.init", self.name));
            Ok(())
        }

        fn on_stop(&self) -> Result<(), CoreError> {
            self.log.lock().unwrap().push(format!("{}.stop", self.name));
            Ok(())
        }
    }

    #[test]
    fn init_is_registration_order_stop_is_reverse() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ComponentRegistry::new();
        for name in ["a", "b", "c"] {
            registry
                .register(Arc::new(Recording { name, log: log.clone() }))
                .unwrap();
        }

        for c in registry.iter_forward() {
            c.on_init().unwrap();
        }
        for c in registry.iter_reverse() {
            c.on_stop().unwrap();
        }

        assert_eq!(
            *log.lock().unwrap(),
            vec!["a.init", "b.init", "c.init", "c.stop", "b.stop", "a.stop"]
        );
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = ComponentRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        registry
            .register(Arc::new(Recording { name: "a", log: log.clone() }))
            .unwrap();
        let err = registry
            .register(Arc::new(Recording { name: "a", log }))
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Repeat);
    }

    #[test]
    fn method_lookup_is_identical_across_the_linear_to_indexed_threshold() {
        let mut table = MethodTable::new();
        let names: Vec<&'static str> = (0..31)
            .map(|i| Box::leak(format!("m{i}").into_boxed_str()) as &'static str)
            .collect();
        for (i, name) in names.iter().enumerate() {
            let i = i as i64;
            table.register(name, Box::new(move |_arg| Ok(Variant::from(i))));
        }
        assert_eq!(table.len(), 31);
        for (i, name) in names.iter().enumerate() {
            let result = table.call(name, &Variant::Null).unwrap();
            assert_eq!(result.as_int(), Some(i as i64));
        }
    }

    #[test]
    fn unknown_method_is_not_found() {
        let table = MethodTable::new();
        let err = table.call("missing", &Variant::Null).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }

    #[test]
    fn call_method_resolves_component_then_method() {
        struct WithMethod {
            table: MethodTable,
        }
        impl Component for WithMethod {
            fn name(&self) -> &str {
                "calc"
            }
            fn methods(&self) -> &MethodTable {
                &self.table
            }
        }

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_cb = calls.clone();
        let mut table = MethodTable::new();
        table.register(
            "double",
            Box::new(move |arg| {
                calls_cb.fetch_add(1, Ordering::SeqCst);
                Ok(Variant::from(arg.as_int().unwrap_or(0) * 2))
            }),
        );

        let mut registry = ComponentRegistry::new();
        registry.register(Arc::new(WithMethod { table })).unwrap();

        let result = registry
            .call_method("calc", "double", &Variant::from(21i64))
            .unwrap();
        assert_eq!(result.as_int(), Some(42));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
