//! Instance cache keyed by [`CacheKey`].
//!
//! Façade instances (and the connections they own) are `!Send`, so the process-wide
//! registry behind [`crate::EasyDb::of`] is kept per thread. In the browser everything
//! runs on one thread, which makes it process-wide there.

use crate::config::{CacheKey, Config};
use crate::db::EasyDb;
use crate::engine::Factory;
use crate::error::Result;
use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

thread_local! {
    static GLOBAL: RefCell<HashMap<TypeId, Rc<dyn Any>>> = RefCell::new(HashMap::new());
}

/// Maps configurations to the façade instance built for them.
///
/// Lookup and insertion happen in one synchronous step, so two callers can never both
/// miss the cache and open the same container twice.
pub struct Registry<F: Factory> {
    instances: RefCell<HashMap<CacheKey, Rc<EasyDb<F>>>>,
}

impl<F: Factory> Default for Registry<F> {
    fn default() -> Self {
        Self {
            instances: RefCell::new(HashMap::new()),
        }
    }
}

impl<F: Factory> fmt::Debug for Registry<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("instances", &self.instances.borrow().len())
            .finish()
    }
}

impl<F: Factory> Registry<F> {
    pub fn new() -> Self {
        Self::default()
    }

    /// This thread's registry for engine type `F`.
    pub fn global() -> Rc<Self> {
        GLOBAL.with(|global| {
            let existing = global
                .borrow()
                .get(&TypeId::of::<F>())
                .and_then(|any| Rc::clone(any).downcast::<Self>().ok());
            if let Some(registry) = existing {
                return registry;
            }
            let registry = Rc::new(Self::new());
            global
                .borrow_mut()
                .insert(TypeId::of::<F>(), Rc::clone(&registry) as Rc<dyn Any>);
            registry
        })
    }

    /// Returns the cached instance for `config`, or validates it, builds a new instance
    /// and caches it.
    pub fn obtain(&self, config: Config<F>) -> Result<Rc<EasyDb<F>>> {
        config.validate()?;
        let key = config.cache_key();

        if let Some(db) = self.instances.borrow().get(&key) {
            tracing::debug!(key = %key, "reusing cached database instance");
            return Ok(Rc::clone(db));
        }

        tracing::debug!(key = %key, "creating database instance");
        let db = Rc::new(EasyDb::new(config));
        self.instances.borrow_mut().insert(key, Rc::clone(&db));
        Ok(db)
    }

    pub fn get(&self, key: &CacheKey) -> Option<Rc<EasyDb<F>>> {
        self.instances.borrow().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.instances.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.borrow().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemoryFactory;
    use crate::Error;

    #[test]
    fn same_key_yields_same_instance() {
        let factory = MemoryFactory::new();
        let registry = Registry::new();

        let a = registry
            .obtain(Config::new(factory.clone(), "db").stores(["x", "y"]))
            .unwrap();
        let b = registry
            .obtain(Config::new(factory.clone(), "db").stores(["y", "x"]))
            .unwrap();
        assert!(Rc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
        assert_eq!(factory.opens(), 1);
    }

    #[test]
    fn different_name_or_version_yields_new_instance() {
        let factory = MemoryFactory::new();
        let registry = Registry::new();

        let a = registry
            .obtain(Config::new(factory.clone(), "db").store("x"))
            .unwrap();
        let b = registry
            .obtain(Config::new(factory.clone(), "other").store("x"))
            .unwrap();
        let c = registry
            .obtain(Config::new(factory.clone(), "db").store("x").version(2))
            .unwrap();
        assert!(!Rc::ptr_eq(&a, &b));
        assert!(!Rc::ptr_eq(&a, &c));
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn invalid_configuration_never_reaches_the_engine() {
        let factory = MemoryFactory::new();
        let registry = Registry::new();

        let err = registry
            .obtain(Config::new(factory.clone(), " ").store("x"))
            .unwrap_err();
        assert_eq!(err, Error::MissingDatabaseName);
        let err = registry.obtain(Config::new(factory.clone(), "db")).unwrap_err();
        assert_eq!(err, Error::MissingStoreNames);
        assert!(err.is_configuration());

        assert!(registry.is_empty());
        assert_eq!(factory.opens(), 0);
    }

    #[test]
    fn global_registry_is_shared_per_engine_type() {
        let a = Registry::<MemoryFactory>::global();
        let b = Registry::<MemoryFactory>::global();
        assert!(Rc::ptr_eq(&a, &b));
    }
}
