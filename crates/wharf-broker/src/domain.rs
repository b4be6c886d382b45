// Per-domain aggregate: configuration snapshot plus live handle counters.
// A `Domain` exists from registration until it is finalized.
use ahash::RandomState;
use arc_swap::ArcSwap;
use hashbrown::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use wharf_common::DomainConfig;

#[derive(Debug)]
pub struct Domain {
    // Read on every open; replaced wholesale on reconfiguration.
    config: ArcSwap<DomainConfig>,
    open_handles: AtomicUsize,
    consumers: AtomicUsize,
    producers: AtomicUsize,
    removed: AtomicBool,
    // Opens hold it shared, removal holds it exclusively.
    gate: RwLock<()>,
}

impl Domain {
    fn new(config: DomainConfig) -> Self {
        Self {
            config: ArcSwap::from_pointee(config),
            open_handles: AtomicUsize::new(0),
            consumers: AtomicUsize::new(0),
            producers: AtomicUsize::new(0),
            removed: AtomicBool::new(false),
            gate: RwLock::new(()),
        }
    }

    pub fn config(&self) -> Arc<DomainConfig> {
        self.config.load_full()
    }

    pub fn open_handles(&self) -> usize {
        self.open_handles.load(Ordering::Acquire)
    }

    pub fn consumers(&self) -> usize {
        self.consumers.load(Ordering::Acquire)
    }

    pub fn producers(&self) -> usize {
        self.producers.load(Ordering::Acquire)
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    /// Held by an open from the liveness check until the handle is counted.
    pub(crate) async fn admit(&self) -> RwLockReadGuard<'_, ()> {
        self.gate.read().await
    }

    /// Held by a removal from the open-handle check until the domain is
    /// marked removed.
    pub(crate) async fn exclusive(&self) -> RwLockWriteGuard<'_, ()> {
        self.gate.write().await
    }

    pub(crate) fn mark_removed(&self) {
        self.removed.store(true, Ordering::Release);
    }

    pub(crate) fn handle_opened(&self, consumer: bool, producer: bool) {
        self.open_handles.fetch_add(1, Ordering::AcqRel);
        if consumer {
            self.consumers.fetch_add(1, Ordering::AcqRel);
        }
        if producer {
            self.producers.fetch_add(1, Ordering::AcqRel);
        }
    }

    pub(crate) fn handle_closed(&self, consumer: bool, producer: bool) {
        decrement(&self.open_handles);
        if consumer {
            decrement(&self.consumers);
        }
        if producer {
            decrement(&self.producers);
        }
    }
}

fn decrement(counter: &AtomicUsize) {
    let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1));
}

#[derive(Debug, Default)]
pub struct DomainRegistry {
    domains: RwLock<HashMap<String, Arc<Domain>, RandomState>>,
}

impl DomainRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the domain, or swaps the config of a live one. Registering a
    /// removed domain brings it back with fresh counters.
    pub async fn register(&self, config: DomainConfig) -> Arc<Domain> {
        let mut domains = self.domains.write().await;
        if let Some(existing) = domains.get(config.name.as_str())
            && !existing.is_removed()
        {
            existing.config.store(Arc::new(config));
            return Arc::clone(existing);
        }
        let domain = Arc::new(Domain::new(config.clone()));
        domains.insert(config.name, Arc::clone(&domain));
        domain
    }

    pub async fn get(&self, name: &str) -> Option<Arc<Domain>> {
        self.domains.read().await.get(name).cloned()
    }

    pub async fn remove(&self, name: &str) -> Option<Arc<Domain>> {
        self.domains.write().await.remove(name)
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.domains.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}
