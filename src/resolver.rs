//! Symbol lookup scopes.
//!
//! Two scope shapes exist: the global scope (promotion-ordered, startup
//! modules first) and local scopes, which are breadth-first visit-once
//! walks of a root's dependency graph with the root in front. `dlsym`
//! uses exactly one of them; relocation uses the composite assembled in
//! [`crate::api`], where the global scope precedes the local one.

use crate::{
    graph::ModuleGraph,
    module::{Module, ModuleId},
    symbol::SymbolInfo,
};
use alloc::{boxed::Box, collections::VecDeque, sync::Arc, vec::Vec};
use hashbrown::HashSet;

/// Outcome of a name lookup, ready for the public API to turn into an
/// address.
pub(crate) enum ResolvedSymbol {
    Address(usize),
    #[cfg(feature = "tls")]
    Tls {
        modid: usize,
        offset: usize,
    },
}

impl ResolvedSymbol {
    fn new(module: &Arc<Module>, sym: &crate::arch::ElfSymbol) -> ResolvedSymbol {
        #[cfg(feature = "tls")]
        if sym.is_tls() {
            // TLS symbols resolve per calling thread, not to one address.
            let modid = module
                .tls
                .as_ref()
                .map(|tls| tls.modid)
                .expect("TLS symbol in a module without PT_TLS");
            return ResolvedSymbol::Tls {
                modid,
                offset: sym.st_value(),
            };
        }
        ResolvedSymbol::Address(module.base() + sym.st_value())
    }

    /// The address for the calling thread.
    pub(crate) fn address(&self) -> *const () {
        match self {
            ResolvedSymbol::Address(addr) => *addr as *const (),
            #[cfg(feature = "tls")]
            ResolvedSymbol::Tls { modid, offset } => {
                crate::tls::tls_get_addr(*modid, *offset) as *const ()
            }
        }
    }
}

/// Build the local scope of `root`: breadth-first over the dependency
/// edges, visit-once, root first. Dependency order of each module is
/// preserved, which is what makes the first-found rule deterministic.
pub(crate) fn build_scope(graph: &ModuleGraph, root: ModuleId) -> Box<[ModuleId]> {
    let mut scope = Vec::new();
    let mut visited: HashSet<ModuleId> = HashSet::new();
    let mut queue = VecDeque::new();
    visited.insert(root);
    queue.push_back(root);
    while let Some(id) = queue.pop_front() {
        scope.push(id);
        let Some(module) = graph.module(id) else {
            continue;
        };
        for &dep in module.deps.get().map(|deps| &deps[..]).unwrap_or(&[]) {
            if visited.insert(dep) {
                queue.push_back(dep);
            }
        }
    }
    scope.into_boxed_slice()
}

/// First definition of `name` over an ordered module sequence.
pub(crate) fn lookup_in_modules<'a>(
    modules: impl Iterator<Item = &'a Arc<Module>>,
    name: &str,
) -> Option<ResolvedSymbol> {
    let syminfo = SymbolInfo::from_str(name);
    let mut precompute = syminfo.precompute();
    for module in modules {
        if let Some(sym) = module.symbols.lookup_filter(&syminfo, &mut precompute) {
            log::trace!("resolved [{}] in [{}]", name, module.name());
            return Some(ResolvedSymbol::new(module, sym));
        }
    }
    None
}

/// Scan the global scope front to back.
pub(crate) fn lookup_global(graph: &ModuleGraph, name: &str) -> Option<ResolvedSymbol> {
    lookup_in_modules(graph.global_modules(), name)
}

/// Scan the local scope of `root` (BFS, visit-once, root first).
pub(crate) fn lookup_local(
    graph: &ModuleGraph,
    root: ModuleId,
    name: &str,
) -> Option<ResolvedSymbol> {
    let root_module = graph.module(root)?;
    match root_module.scope.get() {
        Some(scope) => lookup_in_modules(
            scope.iter().filter_map(|&id| graph.module(id)),
            name,
        ),
        None => {
            // Scope not precomputed (startup modules registered one by
            // one); walk on the fly.
            let scope = build_scope(graph, root);
            lookup_in_modules(scope.iter().filter_map(|&id| graph.module(id)), name)
        }
    }
}
