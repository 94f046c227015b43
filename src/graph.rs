//! The module graph.
//!
//! An arena owns every live module record and hands out stable, never
//! reused indices. Three orders are maintained: insertion order of the
//! name map (`modules_by_name`), the flat `load_order`, and the
//! promotion-ordered `global_order`. Handle keys map `dlopen` results to
//! module ids.
//!
//! The graph is guarded by the runtime's loader lock; the generation
//! counter is published here and observed lock-free by the TLS engine.

use crate::module::{Module, ModuleFlags, ModuleId, ModuleState};
use alloc::{string::String, sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicUsize, Ordering};
use indexmap::IndexMap;

/// Generation of the shared module state. Bumped after every mutation of
/// the global scope or the TLS registry; threads compare their DTV
/// generation against it.
static GENERATION: AtomicUsize = AtomicUsize::new(1);

#[inline]
pub(crate) fn generation() -> usize {
    GENERATION.load(Ordering::Acquire)
}

/// Publish a new generation after the shared state is consistent.
pub(crate) fn bump_generation() {
    GENERATION.fetch_add(1, Ordering::Release);
}

pub(crate) struct ModuleGraph {
    /// Arena; a slot goes `None` when its module is removed and is never
    /// reused.
    slots: Vec<Option<Arc<Module>>>,
    /// Canonical name to id, in insertion order.
    pub(crate) by_name: IndexMap<String, ModuleId>,
    /// Ids in the order modules were first added.
    pub(crate) load_order: Vec<ModuleId>,
    /// Ids in first-promotion order.
    pub(crate) global_order: Vec<ModuleId>,
    /// Open handle keys.
    handles: IndexMap<usize, ModuleId>,
    next_handle: usize,
    next_symbolizer_modid: usize,
    next_load_rank: usize,
    next_global_rank: usize,
}

/// Snapshot for rolling back a failed load batch.
pub(crate) struct GraphMark {
    slots: usize,
    load_order: usize,
    global_order: usize,
}

impl ModuleGraph {
    pub(crate) fn new() -> Self {
        ModuleGraph {
            slots: Vec::new(),
            by_name: IndexMap::new(),
            load_order: Vec::new(),
            global_order: Vec::new(),
            handles: IndexMap::new(),
            next_handle: 1,
            next_symbolizer_modid: 1,
            next_load_rank: 0,
            next_global_rank: 0,
        }
    }

    #[inline]
    pub(crate) fn module(&self, id: ModuleId) -> Option<&Arc<Module>> {
        self.slots.get(id).and_then(Option::as_ref)
    }

    pub(crate) fn find_by_name(&self, name: &str) -> Option<(ModuleId, &Arc<Module>)> {
        let id = *self.by_name.get(name)?;
        self.module(id).map(|module| (id, module))
    }

    /// Insert a freshly loaded module, assigning its load rank and
    /// symbolizer ordinal. The canonical name must be unused.
    pub(crate) fn insert(&mut self, module: Arc<Module>) -> crate::Result<ModuleId> {
        let name = String::from(module.name());
        if self.by_name.contains_key(&name) {
            return Err(crate::error::already_loaded(name));
        }
        let id = self.slots.len();
        module.set_load_order_rank(self.next_load_rank);
        self.next_load_rank += 1;
        module.set_symbolizer_modid(self.next_symbolizer_modid);
        self.next_symbolizer_modid += 1;
        self.slots.push(Some(module));
        self.by_name.insert(name, id);
        self.load_order.push(id);
        log::debug!(
            "registered [{}] as module #{id}",
            self.module(id).unwrap().name()
        );
        Ok(id)
    }

    /// Add a module to the global scope. Re-promotion keeps the original
    /// rank and order.
    pub(crate) fn promote_global(&mut self, id: ModuleId) {
        let Some(module) = self.module(id).cloned() else {
            return;
        };
        if module.is_global() {
            return;
        }
        if module.try_set_global_order_rank(self.next_global_rank) {
            self.next_global_rank += 1;
            module.insert_flags(ModuleFlags::GLOBAL);
            self.global_order.push(id);
            bump_generation();
            log::debug!(
                "promoted [{}] to global scope (rank {})",
                module.name(),
                module.global_order_rank()
            );
        }
    }

    /// Detach a module whose refcount reached zero. The record is handed
    /// back to the caller, which runs finalizers and drops it outside the
    /// loader lock.
    pub(crate) fn remove(&mut self, id: ModuleId) -> Option<Arc<Module>> {
        let module = self.module(id)?.clone();
        debug_assert_eq!(module.refcount(), 0);
        debug_assert!(!module.is_pinned());
        self.by_name.shift_remove(module.name());
        self.load_order.retain(|&cur| cur != id);
        self.global_order.retain(|&cur| cur != id);
        self.slots[id] = None;
        bump_generation();
        log::info!("removing module [{}]", module.name());
        Some(module)
    }

    /// Live modules of the global scope, in promotion order.
    pub(crate) fn global_modules(&self) -> impl Iterator<Item = &Arc<Module>> {
        self.global_order.iter().filter_map(|&id| self.module(id))
    }

    /// All live modules in load order.
    pub(crate) fn load_modules(&self) -> impl Iterator<Item = &Arc<Module>> {
        self.load_order.iter().filter_map(|&id| self.module(id))
    }

    pub(crate) fn new_handle(&mut self, id: ModuleId) -> usize {
        let key = self.next_handle;
        self.next_handle += 1;
        self.handles.insert(key, id);
        key
    }

    /// Look up the module behind an open handle key.
    pub(crate) fn handle_target(&self, key: usize) -> Option<ModuleId> {
        self.handles.get(&key).copied()
    }

    pub(crate) fn release_handle(&mut self, key: usize) -> Option<ModuleId> {
        self.handles.shift_remove(&key)
    }

    pub(crate) fn mark(&self) -> GraphMark {
        GraphMark {
            slots: self.slots.len(),
            load_order: self.load_order.len(),
            global_order: self.global_order.len(),
        }
    }

    /// Roll a failed load batch back to `mark`. Only entries added after
    /// the mark are touched; their records are returned for teardown
    /// outside the lock (no constructors have run for them).
    pub(crate) fn rollback(&mut self, mark: GraphMark) -> Vec<Arc<Module>> {
        let mut removed = Vec::new();
        self.by_name.retain(|_, &mut id| id < mark.slots);
        for slot in self.slots.drain(mark.slots..) {
            if let Some(module) = slot {
                removed.push(module);
            }
        }
        self.load_order.truncate(mark.load_order);
        self.global_order.truncate(mark.global_order);
        bump_generation();
        removed
    }

    /// Count of live modules with the given state, for diagnostics.
    #[allow(unused)]
    pub(crate) fn count_in_state(&self, state: ModuleState) -> usize {
        self.load_modules()
            .filter(|module| module.state() == state)
            .count()
    }
}
