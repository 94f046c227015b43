//! Constructor and finalizer scheduling.
//!
//! Constructors for a freshly loaded root and its new dependencies run
//! post-order over the dependency DAG, ties broken by reverse load order:
//! starting from the newest module and emitting dependencies first gives
//! leaves-first execution and terminates on cycles. Finalizers run in the
//! exact reverse of the constructor order.

use crate::module::{Module, ModuleId, ModuleState};
use alloc::{sync::Arc, vec::Vec};
use hashbrown::{HashMap, HashSet};

/// Compute the constructor order for `candidates` (the modules of one
/// load batch that still need their constructors). The result contains
/// every candidate exactly once, dependencies before dependents.
pub(crate) fn constructor_order(
    candidates: &[(ModuleId, Arc<Module>)],
) -> Vec<Arc<Module>> {
    let by_id: HashMap<ModuleId, &Arc<Module>> =
        candidates.iter().map(|(id, module)| (*id, module)).collect();

    // Seed order: reverse load order.
    let mut seeds: Vec<(ModuleId, &Arc<Module>)> =
        candidates.iter().map(|(id, module)| (*id, module)).collect();
    seeds.sort_by_key(|(_, module)| core::cmp::Reverse(module.load_order_rank()));

    let mut order = Vec::with_capacity(candidates.len());
    let mut visited: HashSet<ModuleId> = HashSet::new();

    // Emit with an explicit stack; a module is pushed back once all of
    // its in-batch dependencies have been emitted.
    for (seed_id, _) in &seeds {
        if visited.contains(seed_id) {
            continue;
        }
        let mut stack: Vec<(ModuleId, usize)> = alloc::vec![(*seed_id, 0)];
        visited.insert(*seed_id);
        'dfs: while let Some((id, next)) = stack.pop() {
            let module = by_id[&id];
            let deps = module.deps.get().map(|deps| &deps[..]).unwrap_or(&[]);
            for (i, dep) in deps.iter().enumerate().skip(next) {
                if by_id.contains_key(dep) && !visited.contains(dep) {
                    visited.insert(*dep);
                    stack.push((id, i + 1));
                    stack.push((*dep, 0));
                    continue 'dfs;
                }
            }
            order.push((*module).clone());
        }
    }
    order
}

/// Run `DT_INIT` then `DT_INIT_ARRAY` for each module, in order. Must be
/// called without the loader lock held.
pub(crate) fn run_constructors(order: &[Arc<Module>]) {
    for module in order {
        debug_assert!(module.state() == ModuleState::Relocated);
        log::debug!("running constructors of [{}]", module.name());
        if let Some(init_fn) = module.init_fn {
            init_fn();
        }
        if let Some(init_array) = module.init_array_fn {
            for init in init_array {
                init();
            }
        }
        module.set_state(ModuleState::ConstructorsRun);
        module.set_state(ModuleState::Live);
    }
}

/// Run `DT_FINI_ARRAY` in reverse file order, then `DT_FINI`. The caller
/// hands in modules in reverse constructor order and must not hold the
/// loader lock. Modules that never reached `ConstructorsRun` are skipped.
pub(crate) fn run_finalizers(order: &[Arc<Module>]) {
    for module in order {
        if module.state() < ModuleState::ConstructorsRun {
            continue;
        }
        log::debug!("running finalizers of [{}]", module.name());
        if let Some(fini_array) = module.fini_array_fn {
            for fini in fini_array.iter().rev() {
                fini();
            }
        }
        if let Some(fini_fn) = module.fini_fn {
            fini_fn();
        }
        module.set_state(ModuleState::TornDown);
    }
}
