//! `ServiceContainer`: a small type-keyed DI registry (§6).
//!
//! An optional convenience, not required to use a `ThreadPool`. Kept as an
//! explicit, caller-held `Context`-style value rather than a process-wide
//! singleton, per §9's "global state" design note.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::{ErrorCode, ErrorInfo};

const MODULE: &str = "container";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lifetime {
    Singleton,
    Transient,
}

type AnyBox = Box<dyn Any + Send + Sync>;
type Factory = Box<dyn Fn() -> AnyBox + Send + Sync>;

enum Entry {
    Instance(AnyBox),
    Factory(Lifetime, Factory, Mutex<Option<Arc<AnyBox>>>),
}

/// Type-keyed registry providing singleton instances and transient/singleton
/// factories. A factory registered as `Singleton` caches its first resolved
/// value; one registered `Transient` runs on every `resolve`.
#[derive(Default)]
pub struct ServiceContainer {
    entries: Mutex<HashMap<TypeId, Entry>>,
}

impl ServiceContainer {
    pub fn new() -> Self {
        ServiceContainer {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn register_instance<T: Send + Sync + 'static>(&self, value: T) {
        self.entries
            .lock()
            .unwrap()
            .insert(TypeId::of::<T>(), Entry::Instance(Box::new(value)));
    }

    pub fn register_factory<T, F>(&self, factory: F, lifetime: Lifetime)
    where
        T: Send + Sync + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        let boxed_factory: Factory = Box::new(move || Box::new(factory()) as AnyBox);
        self.entries.lock().unwrap().insert(
            TypeId::of::<T>(),
            Entry::Factory(lifetime, boxed_factory, Mutex::new(None)),
        );
    }

    pub fn resolve<T: Clone + Send + Sync + 'static>(&self) -> Result<T, ErrorInfo> {
        let not_registered = || {
            ErrorInfo::new(
                ErrorCode::InvalidArgument,
                MODULE,
                format!("no registration for type {}", std::any::type_name::<T>()),
            )
        };
        let guard = self.entries.lock().unwrap();
        match guard.get(&TypeId::of::<T>()) {
            Some(Entry::Instance(v)) => v
                .downcast_ref::<T>()
                .cloned()
                .ok_or_else(not_registered),
            Some(Entry::Factory(Lifetime::Transient, f, _)) => f()
                .downcast::<T>()
                .map(|b| *b)
                .map_err(|_| not_registered()),
            Some(Entry::Factory(Lifetime::Singleton, f, cache)) => {
                let mut cache = cache.lock().unwrap();
                if cache.is_none() {
                    *cache = Some(Arc::new(f()));
                }
                cache
                    .as_ref()
                    .unwrap()
                    .downcast_ref::<T>()
                    .cloned()
                    .ok_or_else(not_registered)
            }
            None => Err(not_registered()),
        }
    }

    pub fn unregister<T: Send + Sync + 'static>(&self) {
        self.entries.lock().unwrap().remove(&TypeId::of::<T>());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_instance_resolves_same_value() {
        let c = ServiceContainer::new();
        c.register_instance(42u32);
        assert_eq!(c.resolve::<u32>().unwrap(), 42);
    }

    #[test]
    fn singleton_factory_caches_first_value() {
        use std::sync::atomic::{AtomicU32, Ordering};
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        let c = ServiceContainer::new();
        c.register_factory(
            || COUNTER.fetch_add(1, Ordering::SeqCst),
            Lifetime::Singleton,
        );
        let a = c.resolve::<u32>().unwrap();
        let b = c.resolve::<u32>().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn transient_factory_runs_every_resolve() {
        use std::sync::atomic::{AtomicU32, Ordering};
        static COUNTER: AtomicU32 = AtomicU32::new(100);
        let c = ServiceContainer::new();
        c.register_factory(
            || COUNTER.fetch_add(1, Ordering::SeqCst),
            Lifetime::Transient,
        );
        let a = c.resolve::<u32>().unwrap();
        let b = c.resolve::<u32>().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn unregister_removes_entry() {
        let c = ServiceContainer::new();
        c.register_instance(1i64);
        c.unregister::<i64>();
        assert!(c.resolve::<i64>().is_err());
    }
}
