//! The public `dlopen`/`dlsym`/`dlclose` surface.
//!
//! A [`Runtime`] owns the module graph behind the loader lock, the
//! injected capabilities (module provider, diagnostics) and the embedder
//! host-symbol map. All mutating calls serialize on the loader lock; user
//! code (constructors, finalizers, TLSDESC resolvers) always runs with
//! the lock released.

use crate::{
    Result,
    diagnostics::{Diagnostics, StrictDiagnostics},
    error::{missing_dependency, noload_failed, not_found, system_error, undefined_symbol},
    graph::ModuleGraph,
    init,
    loader::Loader,
    mmap::Mmap,
    module::{Module, ModuleFlags, ModuleId, ModuleState},
    object::ModuleProvider,
    relocation::{self, LazyScope},
    resolver,
};
use alloc::{
    boxed::Box,
    string::{String, ToString},
    sync::Arc,
    vec::Vec,
};
use bitflags::bitflags;
use core::marker::PhantomData;
use hashbrown::HashMap;
use spin::RwLock;

bitflags! {
    /// Mode flags accepted by [`Runtime::dlopen`].
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        /// Defer PLT binding to the first call.
        const RTLD_LAZY = 0x1;
        /// Bind every relocation eagerly.
        const RTLD_NOW = 0x2;
        /// Only hand out a handle if the module is already loaded.
        const RTLD_NOLOAD = 0x4;
        /// Add the loaded modules to the global resolution scope.
        const RTLD_GLOBAL = 0x100;
        /// Keep the modules out of the global scope. This is the default.
        const RTLD_LOCAL = 0x0;
        /// Pin the root module; `dlclose` never unloads it.
        const RTLD_NODELETE = 0x1000;
    }
}

/// Whether `dlclose` runs finalizers synchronously when the last
/// reference to a module goes away. This implementation always does;
/// tests gate their teardown expectations on this capability.
pub const SYNCHRONOUS_FINALIZERS: bool = true;

/// An opaque `dlopen` result.
///
/// Handles are plain keys: copying one does not affect the module's
/// reference count, and every key is invalidated by the `dlclose` that
/// consumes it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Handle(usize);

impl Handle {
    /// The pseudo-handle for the caller's root set; `dlsym` against it
    /// scans the global scope.
    pub const GLOBAL: Handle = Handle(0);
}

struct RuntimeInner {
    graph: RwLock<ModuleGraph>,
    provider: Box<dyn ModuleProvider>,
    diagnostics: Box<dyn Diagnostics>,
    host_symbols: HashMap<String, usize>,
}

impl RuntimeInner {
    fn pre_find(&self) -> impl Fn(&str) -> Option<*const ()> + Send + Sync + '_ {
        |name: &str| {
            self.host_symbols
                .get(name)
                .map(|&addr| addr as *const ())
        }
    }
}

/// Builder for a [`Runtime`]: capabilities in, process singleton out.
pub struct RuntimeBuilder {
    provider: Box<dyn ModuleProvider>,
    diagnostics: Box<dyn Diagnostics>,
    host_symbols: HashMap<String, usize>,
}

impl RuntimeBuilder {
    pub fn new(provider: impl ModuleProvider + 'static) -> Self {
        let mut host_symbols = HashMap::new();
        #[cfg(feature = "tls")]
        host_symbols.insert(
            String::from("__tls_get_addr"),
            crate::tls::__tls_get_addr as usize,
        );
        RuntimeBuilder {
            provider: Box::new(provider),
            diagnostics: Box::new(StrictDiagnostics),
            host_symbols,
        }
    }

    /// Replace the default diagnostics sink.
    pub fn diagnostics(mut self, diagnostics: impl Diagnostics + 'static) -> Self {
        self.diagnostics = Box::new(diagnostics);
        self
    }

    /// Pre-resolve `name` to a host address, ahead of all module scopes.
    pub fn host_symbol(mut self, name: &str, addr: *const ()) -> Self {
        self.host_symbols.insert(String::from(name), addr as usize);
        self
    }

    pub fn build<M: Mmap>(self) -> Runtime<M> {
        Runtime {
            inner: Arc::new(RuntimeInner {
                graph: RwLock::new(ModuleGraph::new()),
                provider: self.provider,
                diagnostics: self.diagnostics,
                host_symbols: self.host_symbols,
            }),
            _marker: PhantomData,
        }
    }
}

/// The dynamic linker runtime.
pub struct Runtime<M: Mmap> {
    inner: Arc<RuntimeInner>,
    _marker: PhantomData<M>,
}

impl<M: Mmap> Clone for Runtime<M> {
    fn clone(&self) -> Self {
        Runtime {
            inner: self.inner.clone(),
            _marker: PhantomData,
        }
    }
}

/// Read-only view of one module, for diagnostics walks.
pub struct ModuleInfo<'graph> {
    pub name: &'graph str,
    pub base: usize,
    pub state: ModuleState,
    pub refcount: usize,
    pub global: bool,
    pub symbolizer_modid: usize,
}

impl<M: Mmap> Runtime<M> {
    /// Load the modules already present at process entry, in order.
    ///
    /// Startup modules are pinned, always global, and their `PT_TLS`
    /// images are laid out in the static TLS block; their global ranks
    /// precede everything a later `dlopen` can introduce. Must be called
    /// before the first `dlopen`.
    pub fn load_startup(&self, names: &[&str]) -> Result<()> {
        let inner = &self.inner;
        let mut graph = inner.graph.write();
        if !graph.load_order.is_empty() {
            return Err(system_error(0, "startup modules must be loaded first"));
        }
        let loader = Loader::<M>::new();
        let mark = graph.mark();

        let outcome = (|| -> Result<Vec<(ModuleId, Arc<Module>)>> {
            let mut batch = Vec::new();
            for name in names {
                let mut object = inner.provider.open(name)?;
                #[cfg(feature = "tls")]
                let module = loader.load_with_class(
                    &mut *object,
                    Some(false),
                    crate::tls::TlsClass::Static,
                    &*inner.diagnostics,
                )?;
                #[cfg(not(feature = "tls"))]
                let module =
                    loader.load_module(&mut *object, Some(false), &*inner.diagnostics)?;
                let module = Arc::new(module);
                module.insert_flags(ModuleFlags::STARTUP | ModuleFlags::NODELETE);
                let id = graph.insert(module.clone())?;
                graph.promote_global(id);
                batch.push((id, module));
            }

            // Dependency edges resolve against the whole startup set.
            for (_, module) in &batch {
                let mut deps = Vec::with_capacity(module.needed.len());
                for dep_name in module.needed.iter() {
                    match graph.find_by_name(dep_name) {
                        Some((dep_id, _)) => deps.push(dep_id),
                        None => {
                            inner
                                .diagnostics
                                .missing_dependency(dep_name, module.name());
                            return Err(missing_dependency(
                                dep_name.clone(),
                                module.name().to_string(),
                            ));
                        }
                    }
                }
                module.deps.call_once(|| deps.into_boxed_slice());
            }
            for (id, module) in &batch {
                let scope = resolver::build_scope(&graph, *id);
                module.scope.call_once(|| scope);
            }

            let order = init::constructor_order(&batch);
            let pre_find = inner.pre_find();
            for module in &order {
                let scope = composite_scope(&graph, module);
                relocation::relocate_module(module, &scope, &pre_find, None)?;
            }
            apply_dep_edges(&graph, &batch);
            Ok(batch)
        })();

        match outcome {
            Ok(batch) => {
                crate::graph::bump_generation();
                let order = init::constructor_order(&batch);
                drop(graph);
                init::run_constructors(&order);
                Ok(())
            }
            Err(err) => {
                let removed = graph.rollback(mark);
                drop(graph);
                drop(removed);
                Err(err)
            }
        }
    }

    /// `dlopen(name, mode)`.
    ///
    /// `None` returns the global pseudo-handle. Otherwise the module and
    /// its transitive dependencies are loaded, relocated and constructed
    /// as needed, and a new strong handle is returned.
    pub fn dlopen(&self, name: Option<&str>, mode: OpenFlags) -> Result<Handle> {
        validate_mode(mode)?;
        let Some(name) = name else {
            return Ok(Handle::GLOBAL);
        };
        log::info!("dlopen: [{}] with {:?}", name, mode);

        let inner = &self.inner;
        let mut graph = inner.graph.write();

        // Already live under this name (or its basename)?
        if let Some((id, module)) = lookup_loaded(&graph, name) {
            let module = module.clone();
            module.inc_refcount();
            if mode.contains(OpenFlags::RTLD_GLOBAL) {
                graph.promote_global(id);
            }
            if mode.contains(OpenFlags::RTLD_NODELETE) {
                module.insert_flags(ModuleFlags::NODELETE);
            }
            let key = graph.new_handle(id);
            log::info!("dlopen: reusing [{}]", module.name());
            return Ok(Handle(key));
        }
        if mode.contains(OpenFlags::RTLD_NOLOAD) {
            return Err(noload_failed(name));
        }

        let mark = graph.mark();
        let lazy = lazy_from_mode(mode);
        let outcome = self.load_batch(&mut graph, name, lazy);

        match outcome {
            Ok(batch) => {
                let (root_id, root) = batch[0].clone();
                if mode.contains(OpenFlags::RTLD_GLOBAL) {
                    for (id, _) in &batch {
                        graph.promote_global(*id);
                    }
                }
                if mode.contains(OpenFlags::RTLD_NODELETE) {
                    root.insert_flags(ModuleFlags::NODELETE);
                }
                root.inc_refcount();
                let key = graph.new_handle(root_id);
                crate::graph::bump_generation();

                let order = init::constructor_order(&batch);
                drop(graph);
                // Constructors run without the loader lock; they may
                // legally re-enter dlopen/dlsym.
                init::run_constructors(&order);
                Ok(Handle(key))
            }
            Err(err) => {
                let removed = graph.rollback(mark);
                drop(graph);
                // Mapped but never constructed: no finalizers, just
                // unmap.
                drop(removed);
                // A SONAME collision folds into the existing module.
                if let crate::Error::AlreadyLoaded { name } = &err {
                    let name = name.clone();
                    return self.reuse_loaded(&name, mode);
                }
                Err(err)
            }
        }
    }

    /// Fold an `AlreadyLoaded` collision into a handle on the live
    /// module.
    fn reuse_loaded(&self, name: &str, mode: OpenFlags) -> Result<Handle> {
        let mut graph = self.inner.graph.write();
        let Some((id, module)) = lookup_loaded(&graph, name) else {
            return Err(crate::error::already_loaded(name.to_string()));
        };
        let module = module.clone();
        module.inc_refcount();
        if mode.contains(OpenFlags::RTLD_GLOBAL) {
            graph.promote_global(id);
        }
        let key = graph.new_handle(id);
        Ok(Handle(key))
    }

    /// Load `name` and its transitive dependencies into the graph,
    /// relocate them and leave them in state `Relocated`.
    fn load_batch(
        &self,
        graph: &mut ModuleGraph,
        name: &str,
        lazy: Option<bool>,
    ) -> Result<Vec<(ModuleId, Arc<Module>)>> {
        let inner = &self.inner;
        let loader = Loader::<M>::new();

        let mut object = inner.provider.open(name).map_err(|err| match err {
            crate::Error::NotFound { name } => not_found(name),
            other => other,
        })?;
        let root = Arc::new(loader.load_module(&mut *object, lazy, &*inner.diagnostics)?);
        drop(object);

        // The object may carry a SONAME that is already live.
        if graph.find_by_name(root.name()).is_some() {
            return Err(crate::error::already_loaded(root.name().to_string()));
        }
        let root_id = graph.insert(root.clone())?;
        let mut batch = alloc::vec![(root_id, root)];

        // Breadth-first needed-closure: every new module's dependencies
        // are either live already or loaded now.
        let mut cursor = 0;
        while cursor < batch.len() {
            let (_, module) = batch[cursor].clone();
            cursor += 1;
            let mut deps = Vec::with_capacity(module.needed.len());
            for dep_name in module.needed.iter() {
                if let Some((dep_id, _)) = lookup_loaded(graph, dep_name) {
                    deps.push(dep_id);
                    continue;
                }
                let mut dep_object = inner.provider.open(dep_name).map_err(|err| {
                    if matches!(err, crate::Error::NotFound { .. }) {
                        inner
                            .diagnostics
                            .missing_dependency(dep_name, module.name());
                        missing_dependency(dep_name.clone(), module.name().to_string())
                    } else {
                        err
                    }
                })?;
                let dep = Arc::new(loader.load_module(
                    &mut *dep_object,
                    lazy,
                    &*inner.diagnostics,
                )?);
                let dep_id = graph.insert(dep.clone())?;
                deps.push(dep_id);
                batch.push((dep_id, dep));
            }
            module.deps.call_once(|| deps.into_boxed_slice());
        }

        for (id, module) in &batch {
            let scope = resolver::build_scope(graph, *id);
            module.scope.call_once(|| scope);
        }

        // Relocate dependencies before dependents, all against the
        // root's composite scope (global scope first - the documented
        // global-dominates-local policy).
        let lazy_scope = self.make_lazy_scope(batch[0].0);
        let order = init::constructor_order(&batch);
        let pre_find = inner.pre_find();
        let scope = composite_scope(graph, &batch[0].1);
        for module in &order {
            relocation::relocate_module(module, &scope, &pre_find, Some(lazy_scope.clone()))?;
        }
        // Reverse-dependency edges count only once the batch is known
        // good; a rollback therefore never has to unwind them.
        apply_dep_edges(graph, &batch);
        Ok(batch)
    }

    /// Scope closure used by lazy PLT fixups of one load batch: host
    /// symbols, then the global scope, then the root's local scope, as
    /// they stand at call time. Holds the runtime weakly; modules own
    /// their lazy scope, and a strong capture would cycle back through
    /// the graph.
    fn make_lazy_scope(&self, root_id: ModuleId) -> LazyScope {
        let inner = Arc::downgrade(&self.inner);
        Arc::new(move |name: &str| {
            let inner = inner.upgrade()?;
            if let Some(&addr) = inner.host_symbols.get(name) {
                return Some(addr as *const ());
            }
            let graph = inner.graph.read();
            resolver::lookup_global(&graph, name)
                .or_else(|| resolver::lookup_local(&graph, root_id, name))
                .map(|resolved| resolved.address())
        })
    }

    /// `dlsym(handle, name)`.
    ///
    /// The global pseudo-handle scans the global scope in promotion
    /// order; a module handle scans its local BFS scope, root first.
    /// TLS symbols yield the calling thread's address.
    pub fn dlsym(&self, handle: Handle, name: &str) -> Result<*const ()> {
        let graph = self.inner.graph.read();
        let resolved = if handle == Handle::GLOBAL {
            resolver::lookup_global(&graph, name)
                .ok_or_else(|| undefined_symbol(name, "<global>"))?
        } else {
            let id = graph
                .handle_target(handle.0)
                .ok_or_else(|| system_error(22, "stale module handle"))?;
            let module = graph
                .module(id)
                .ok_or_else(|| system_error(22, "stale module handle"))?;
            resolver::lookup_local(&graph, id, name)
                .ok_or_else(|| undefined_symbol(name, module.name()))?
        };
        Ok(resolved.address())
    }

    /// `dlclose(handle)`.
    ///
    /// Consumes the handle. When a module's reference count reaches zero
    /// and it is not pinned, its finalizers run (synchronously, see
    /// [`SYNCHRONOUS_FINALIZERS`]), its TLS modid is revoked and the
    /// image is unmapped; dependencies that lose their last reference
    /// are torn down the same way.
    pub fn dlclose(&self, handle: Handle) -> Result<()> {
        if handle == Handle::GLOBAL {
            return Ok(());
        }
        let inner = &self.inner;
        let mut graph = inner.graph.write();
        let Some(id) = graph.release_handle(handle.0) else {
            return Err(system_error(22, "stale module handle"));
        };
        let module = graph
            .module(id)
            .ok_or_else(|| system_error(22, "stale module handle"))?
            .clone();
        log::info!("dlclose: [{}]", module.name());
        module.dec_refcount();

        // Cascade: tear down everything whose last reference went away.
        let mut victims: Vec<(ModuleId, Arc<Module>)> = Vec::new();
        let mut worklist = alloc::vec![id];
        while let Some(cur) = worklist.pop() {
            let Some(module) = graph.module(cur).cloned() else {
                continue;
            };
            if module.refcount() != 0 || module.is_pinned() {
                continue;
            }
            let Some(removed) = graph.remove(cur) else {
                continue;
            };
            for &dep in removed.deps.get().map(|deps| &deps[..]).unwrap_or(&[]) {
                if let Some(dep_module) = graph.module(dep) {
                    dep_module.dec_refcount();
                    worklist.push(dep);
                }
            }
            victims.push((cur, removed));
        }
        if victims.is_empty() {
            return Ok(());
        }

        // Finalizers mirror construction: reverse of the constructor
        // order computed over the victim set.
        let mut order = init::constructor_order(&victims);
        order.reverse();
        drop(graph);
        init::run_finalizers(&order);
        drop(victims);
        Ok(())
    }

    /// Walk every live module under the loader lock.
    pub fn iterate_modules(&self, mut f: impl FnMut(&ModuleInfo)) {
        let graph = self.inner.graph.read();
        for module in graph.load_modules() {
            f(&ModuleInfo {
                name: module.name(),
                base: module.base(),
                state: module.state(),
                refcount: module.refcount(),
                global: module.is_global(),
                symbolizer_modid: module.symbolizer_modid(),
            });
        }
    }

    /// Number of live modules.
    pub fn module_count(&self) -> usize {
        self.inner.graph.read().load_order.len()
    }
}

/// Unknown bits and contradictory bind modes are rejected up front.
fn validate_mode(mode: OpenFlags) -> Result<()> {
    if mode.bits() & !OpenFlags::all().bits() != 0 {
        return Err(crate::Error::InvalidMode);
    }
    if mode.contains(OpenFlags::RTLD_LAZY | OpenFlags::RTLD_NOW) {
        return Err(crate::Error::InvalidMode);
    }
    Ok(())
}

fn lazy_from_mode(mode: OpenFlags) -> Option<bool> {
    if mode.contains(OpenFlags::RTLD_NOW) {
        Some(false)
    } else if mode.contains(OpenFlags::RTLD_LAZY) {
        Some(true)
    } else {
        None
    }
}

/// Find a live module by the exact request name or its basename.
fn lookup_loaded<'graph>(
    graph: &'graph ModuleGraph,
    name: &str,
) -> Option<(ModuleId, &'graph Arc<Module>)> {
    graph.find_by_name(name).or_else(|| {
        let short = name.rsplit('/').next().unwrap_or(name);
        graph.find_by_name(short)
    })
}

/// The composite relocation scope for a root: the global scope in
/// promotion order, then the root's BFS dependency set, deduplicated.
fn composite_scope(graph: &ModuleGraph, root: &Arc<Module>) -> Vec<Arc<Module>> {
    let mut scope: Vec<Arc<Module>> = Vec::new();
    let mut seen: hashbrown::HashSet<usize> = hashbrown::HashSet::new();
    for module in graph.global_modules() {
        if seen.insert(Arc::as_ptr(module) as usize) {
            scope.push(module.clone());
        }
    }
    for &id in root.scope.get().map(|scope| &scope[..]).unwrap_or(&[]) {
        if let Some(module) = graph.module(id) {
            if seen.insert(Arc::as_ptr(module) as usize) {
                scope.push(module.clone());
            }
        }
    }
    scope
}

/// Count one reverse-dependency edge on every target of a committed
/// batch's `DT_NEEDED` edges.
fn apply_dep_edges(graph: &ModuleGraph, batch: &[(ModuleId, Arc<Module>)]) {
    for (_, module) in batch {
        for &dep in module.deps.get().map(|deps| &deps[..]).unwrap_or(&[]) {
            if let Some(dep_module) = graph.module(dep) {
                dep_module.inc_refcount();
            }
        }
    }
}
