//! Runtime registry - libraries, descriptors, dependent scripts, deferred init
//!
//! Design: one `Runtime` per host, shared as `Arc<Runtime>` by every script
//! and instance it produces. The thread that calls [`Runtime::new`] is the
//! main context:
//! - Library initialization, reload, unload and finish run only there
//! - Other threads asking for an uninitialized library enqueue a request
//!   that [`Runtime::frame`] drains in order
//! - Lookups from any thread go through short read locks; no lock is held
//!   while library code runs

mod binding;
mod deferred;

pub use binding::InstanceBindingData;

use crate::abi::{BindingFunctions, EntryPoint};
use crate::config::RuntimeConfig;
use crate::descriptor::{ClassDescriptor, ClassResolver};
use crate::error::{ScriptError, ScriptResult};
use crate::host::ObjectId;
use crate::library::{DynamicLibrary, LibraryBackend, LibraryId, LibraryState, NativeLibrary};
use crate::logging::{self, debug, info, warn};
use crate::registrar::ClassRegistrar;
use crate::script::Script;
use binding::BindingSlots;
use core::ffi::c_void;
use dashmap::DashMap;
use deferred::{DeferredInit, DeferredQueue};
use indexmap::IndexMap;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

/// Outcome of [`Runtime::init_library`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitStatus {
    Initialized,
    /// Queued for the main context
    Deferred,
    AlreadyInitialized,
    /// Setup is running further up the stack
    InProgress,
}

/// What a reload touched
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReloadReport {
    pub scripts: usize,
    pub detached: usize,
    pub reattached: usize,
}

struct LibraryEntry {
    library: Arc<NativeLibrary>,
    classes: IndexMap<String, Arc<ClassDescriptor>>,
}

pub struct Runtime {
    config: RuntimeConfig,
    main_thread: ThreadId,
    /// Registration order is the base-class search order
    libraries: RwLock<IndexMap<LibraryId, LibraryEntry>>,
    dependents: DashMap<LibraryId, Vec<Weak<Script>>>,
    deferred: DeferredQueue,
    bindings: Arc<BindingSlots>,
    finished: AtomicBool,
}

impl Runtime {
    /// Create a runtime whose main context is the calling thread
    pub fn new(config: RuntimeConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            main_thread: thread::current().id(),
            libraries: RwLock::new(IndexMap::new()),
            dependents: DashMap::new(),
            deferred: DeferredQueue::new(),
            bindings: Arc::new(BindingSlots::new()),
            finished: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn is_main_context(&self) -> bool {
        thread::current().id() == self.main_thread
    }

    fn require_main(&self, operation: &'static str) -> ScriptResult<()> {
        if self.is_main_context() {
            Ok(())
        } else {
            Err(ScriptError::NotMainContext { operation })
        }
    }

    /// Open and initialize every library marked `preload` in the config
    pub fn init(&self) -> ScriptResult<()> {
        self.require_main("init")?;
        for entry in self.config.preloaded() {
            let library = self.open_library(&entry.path)?;
            self.init_library(&library)?;
        }
        info!(target: "registry", libraries = self.libraries.read().len(), "runtime initialized");
        Ok(())
    }

    // ========================================================================
    // Libraries
    // ========================================================================

    /// Register a library backend. A library already known under the same
    /// path is returned as is.
    pub fn load_library<B: LibraryBackend + 'static>(&self, backend: B) -> Arc<NativeLibrary> {
        let id = LibraryId::new(backend.path());
        if let Some(existing) = self.library(id.as_str()) {
            return existing;
        }

        let library = Arc::new(NativeLibrary::new(Arc::new(backend)));
        let _ = library.transition(LibraryState::Loading);

        let mut libraries = self.libraries.write();
        let entry = libraries.entry(id).or_insert_with(|| LibraryEntry {
            library: Arc::clone(&library),
            classes: IndexMap::new(),
        });
        let library = Arc::clone(&entry.library);
        drop(libraries);

        logging::log_library_loaded(library.path());
        library
    }

    /// Open a shared library from disk
    pub fn open_library(&self, path: &str) -> ScriptResult<Arc<NativeLibrary>> {
        if let Some(existing) = self.library(path) {
            return Ok(existing);
        }
        let backend = DynamicLibrary::load(path)?;
        Ok(self.load_library(backend))
    }

    pub fn library(&self, path: &str) -> Option<Arc<NativeLibrary>> {
        self.libraries
            .read()
            .get(&LibraryId::new(path))
            .map(|entry| Arc::clone(&entry.library))
    }

    /// Known libraries in registration order
    pub fn libraries(&self) -> Vec<Arc<NativeLibrary>> {
        self.libraries
            .read()
            .values()
            .map(|entry| Arc::clone(&entry.library))
            .collect()
    }

    /// Classes an initialized library registered, in registration order
    pub fn class_names(&self, library: &LibraryId) -> Vec<String> {
        self.libraries
            .read()
            .get(library)
            .filter(|entry| entry.library.is_initialized())
            .map(|entry| entry.classes.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether `library` is the handle this runtime has on record
    fn is_loaded(&self, library: &Arc<NativeLibrary>) -> bool {
        self.libraries
            .read()
            .get(library.id())
            .is_some_and(|entry| Arc::ptr_eq(&entry.library, library))
    }

    fn not_loaded(library: &NativeLibrary) -> ScriptError {
        ScriptError::LibraryNotLoaded {
            library: library.path().to_string(),
        }
    }

    pub fn find_descriptor(&self, library: &LibraryId, class: &str) -> Option<Arc<ClassDescriptor>> {
        let libraries = self.libraries.read();
        let entry = libraries.get(library)?;
        if !entry.library.is_initialized() {
            return None;
        }
        entry.classes.get(class).cloned()
    }

    // ========================================================================
    // Scripts
    // ========================================================================

    /// Script for `class_name` in `library`. An uninitialized library is
    /// initialized inline on the main context and deferred elsewhere.
    pub fn create_script(self: &Arc<Self>, library: &Arc<NativeLibrary>, class_name: &str) -> Arc<Script> {
        let script = Script::new(Arc::clone(self), Arc::clone(library), class_name);

        match library.state() {
            LibraryState::Initialized | LibraryState::Terminated => {}
            _ if self.is_main_context() => {
                if let Err(err) = self.init_library(library) {
                    warn!(target: "registry", class = class_name, %err, "script library unavailable");
                }
            }
            _ => self.defer_init_library(library, Some(&script)),
        }

        script
    }

    /// Record `script` as depending on its library
    pub fn register_script(&self, script: &Arc<Script>) {
        let mut scripts = self.dependents.entry(script.library().id().clone()).or_default();
        scripts.retain(|weak| weak.strong_count() > 0);
        if !scripts.iter().any(|weak| weak.as_ptr() == Arc::as_ptr(script)) {
            scripts.push(Arc::downgrade(script));
        }
    }

    pub fn unregister_script(&self, script: &Script) {
        let id = script.library().id();
        let now_empty = match self.dependents.get_mut(id) {
            Some(mut scripts) => {
                scripts.retain(|weak| weak.as_ptr() != script as *const Script && weak.strong_count() > 0);
                scripts.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.dependents.remove_if(id, |_, scripts| scripts.is_empty());
        }
    }

    /// Scripts with live instances of `library`'s classes
    pub fn dependent_scripts(&self, library: &LibraryId) -> Vec<Arc<Script>> {
        self.dependents
            .get(library)
            .map(|scripts| scripts.iter().filter_map(Weak::upgrade).collect())
            .unwrap_or_default()
    }

    // ========================================================================
    // Initialization
    // ========================================================================

    /// Run `library`'s setup and publish its classes. Off the main context
    /// the request is queued instead.
    pub fn init_library(&self, library: &Arc<NativeLibrary>) -> ScriptResult<InitStatus> {
        if !self.is_main_context() {
            self.defer_init_library(library, None);
            return Ok(InitStatus::Deferred);
        }
        if !self.is_loaded(library) {
            return Err(Self::not_loaded(library));
        }

        if library.state() == LibraryState::Unloaded {
            let _ = library.transition(LibraryState::Loading);
        }
        match library.transition(LibraryState::Initializing) {
            Ok(_) => self.run_setup(library),
            Err(LibraryState::Initialized) => Ok(InitStatus::AlreadyInitialized),
            Err(LibraryState::Initializing) => Ok(InitStatus::InProgress),
            Err(_) => Err(ScriptError::AlreadyTerminated {
                library: library.path().to_string(),
            }),
        }
    }

    /// Queue `library` for initialization on the main context. Safe from
    /// any thread.
    pub fn defer_init_library(&self, library: &Arc<NativeLibrary>, script: Option<&Arc<Script>>) {
        let _ = library.transition(LibraryState::AwaitingMainThreadInit);
        if let Some(script) = script {
            script.mark_pending();
        }
        self.deferred.push(DeferredInit {
            library: Arc::clone(library),
            script: script.map(Arc::downgrade),
        });
        logging::log_init_deferred(library.path());
    }

    /// Library is in `Initializing`; run its entry point and publish
    fn run_setup(&self, library: &Arc<NativeLibrary>) -> ScriptResult<InitStatus> {
        let backend = library.backend();
        let mut registrar = ClassRegistrar::new(library.id().clone(), Arc::clone(&backend));
        let outcome = backend
            .run_init(&mut registrar)
            .and_then(|()| registrar.finish());

        match outcome {
            Ok(classes) => {
                let count = classes.len();
                let replaced = self
                    .libraries
                    .write()
                    .get_mut(library.id())
                    .filter(|entry| Arc::ptr_eq(&entry.library, library))
                    .map(|entry| std::mem::replace(&mut entry.classes, classes));
                if replaced.is_none() {
                    // Unloaded while its setup ran; nothing is published.
                    backend.run_hook(EntryPoint::Terminate);
                    let _ = library.transition(LibraryState::Terminated);
                    logging::log_library_terminated(library.path());
                    return Err(Self::not_loaded(library));
                }
                drop(replaced);

                let _ = library.transition(LibraryState::Initialized);
                logging::log_library_init(library.path(), count);
                Ok(InitStatus::Initialized)
            }
            Err(reason) => {
                let _ = library.transition(LibraryState::Terminated);
                logging::log_library_init_failed(library.path(), &reason);
                Err(ScriptError::LibraryInitFailed {
                    library: library.path().to_string(),
                    reason,
                })
            }
        }
    }

    /// Main-context pump: run queued initializations in enqueue order, tell
    /// waiting scripts, then call every library's frame hook. Returns the
    /// number of queued requests handled.
    pub fn frame(&self) -> ScriptResult<usize> {
        self.require_main("frame")?;

        let batch = self.deferred.drain();
        let handled = batch.len();
        if handled > 0 {
            let mut seen = HashSet::new();
            for request in &batch {
                if !seen.insert(request.library.id().clone()) {
                    continue;
                }
                match self.init_library(&request.library) {
                    Ok(_) => {}
                    Err(ScriptError::LibraryNotLoaded { .. }) => {
                        debug!(target: "registry", path = request.library.path(), "dropping init for unloaded library");
                    }
                    Err(err) => {
                        warn!(target: "registry", path = request.library.path(), %err, "deferred init failed")
                    }
                }
            }
            for request in batch {
                if let Some(script) = request.script.and_then(|weak| weak.upgrade()) {
                    script.library_ready();
                }
            }
            debug!(target: "registry", handled, "deferred queue drained");
        }

        if self.config.runtime.call_frame_hooks {
            self.run_hooks(EntryPoint::Frame);
        }
        Ok(handled)
    }

    /// Whether a deferred request is waiting for [`Runtime::frame`]
    pub fn has_pending_work(&self) -> bool {
        self.deferred.has_work()
    }

    pub fn thread_enter(&self) {
        if self.config.runtime.call_thread_hooks {
            self.run_hooks(EntryPoint::ThreadEnter);
        }
    }

    pub fn thread_exit(&self) {
        if self.config.runtime.call_thread_hooks {
            self.run_hooks(EntryPoint::ThreadExit);
        }
    }

    fn run_hooks(&self, entry: EntryPoint) {
        let backends: Vec<_> = self
            .libraries
            .read()
            .values()
            .filter(|e| e.library.is_initialized())
            .map(|e| e.library.backend())
            .collect();
        for backend in backends {
            backend.run_hook(entry);
        }
    }

    // ========================================================================
    // Reload / unload
    // ========================================================================

    /// Reload `library` from its current backend
    pub fn reload_library(&self, library: &Arc<NativeLibrary>) -> ScriptResult<ReloadReport> {
        self.reload(library, None)
    }

    /// Reload `library`, swapping in a new backend first
    pub fn reload_library_with<B: LibraryBackend + 'static>(
        &self,
        library: &Arc<NativeLibrary>,
        backend: B,
    ) -> ScriptResult<ReloadReport> {
        self.reload(library, Some(Arc::new(backend)))
    }

    /// Reload every library that has been initialized or terminated
    pub fn reload_all(&self) -> ScriptResult<Vec<ReloadReport>> {
        self.require_main("reload_all")?;
        let mut reports = Vec::new();
        for library in self.libraries() {
            if matches!(library.state(), LibraryState::Initialized | LibraryState::Terminated) {
                reports.push(self.reload(&library, None)?);
            }
        }
        Ok(reports)
    }

    fn reload(
        &self,
        library: &Arc<NativeLibrary>,
        backend: Option<Arc<dyn LibraryBackend>>,
    ) -> ScriptResult<ReloadReport> {
        self.require_main("reload_library")?;
        if !self.is_loaded(library) {
            return Err(Self::not_loaded(library));
        }

        let scripts = self.dependent_scripts(library.id());

        // Leaving `Initialized` first hides the old classes from instances
        // created while the current ones are detached.
        let previous = match library.transition(LibraryState::Reloading) {
            Ok(previous) => previous,
            Err(_) => {
                // Never got as far as setup; a plain init is a reload.
                let detached = scripts.iter().map(|script| script.unload_instances()).sum();
                if let Some(backend) = backend {
                    library.replace_backend(backend);
                }
                self.init_library(library)?;
                return Ok(ReloadReport {
                    scripts: scripts.len(),
                    detached,
                    reattached: scripts.iter().map(|script| script.reload_instances()).sum(),
                });
            }
        };

        let detached = scripts.iter().map(|script| script.unload_instances()).sum();
        if previous == LibraryState::Initialized {
            library.backend().run_hook(EntryPoint::Terminate);
        }
        drop(self.take_classes(library.id()));
        if let Some(backend) = backend {
            library.replace_backend(backend);
        }

        let _ = library.transition(LibraryState::Initializing);
        let setup = self.run_setup(library);
        let reattached = scripts.iter().map(|script| script.reload_instances()).sum();
        setup?;

        let report = ReloadReport {
            scripts: scripts.len(),
            detached,
            reattached,
        };
        logging::log_reload(library.path(), report.scripts, report.reattached);
        Ok(report)
    }

    /// Terminate `library` and forget it. Instances of its classes lose their
    /// user-data and report `UnresolvedClass` from then on.
    pub fn unload_library(&self, library: &Arc<NativeLibrary>) -> ScriptResult<()> {
        self.require_main("unload_library")?;

        // Terminating first cancels a queued init and refuses new instances.
        let was_initialized =
            library.transition(LibraryState::Terminated) == Ok(LibraryState::Initialized);

        for script in self.dependent_scripts(library.id()) {
            script.unload_instances();
        }
        if was_initialized {
            library.backend().run_hook(EntryPoint::Terminate);
        }

        let removed = self.libraries.write().shift_remove(library.id());
        drop(removed);
        logging::log_library_terminated(library.path());
        Ok(())
    }

    /// Terminate every library and release every binding slot. Runs once.
    pub fn finish(&self) -> ScriptResult<()> {
        self.require_main("finish")?;
        if self.finished.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        for library in self.libraries().into_iter().rev() {
            self.unload_library(&library)?;
        }
        self.bindings.clear();
        info!(target: "registry", "runtime finished");
        Ok(())
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    fn take_classes(&self, library: &LibraryId) -> IndexMap<String, Arc<ClassDescriptor>> {
        self.libraries
            .write()
            .get_mut(library)
            .map(|entry| std::mem::take(&mut entry.classes))
            .unwrap_or_default()
    }

    // ========================================================================
    // Binding slots
    // ========================================================================

    /// Register an allocator/free pair; the returned index is stable
    pub fn register_binding_functions(&self, functions: BindingFunctions) -> usize {
        self.bindings.register(functions)
    }

    /// Free the slot's binding in every live side-table and retire the index
    pub fn unregister_binding_functions(&self, index: usize) -> bool {
        self.bindings.unregister(index)
    }

    /// Side-table for `owner` holding one binding per currently registered slot
    pub fn alloc_instance_binding_data(&self, owner: ObjectId) -> InstanceBindingData {
        self.bindings.alloc(owner)
    }

    pub fn get_instance_binding_data(&self, table: &InstanceBindingData, index: usize) -> Option<*mut c_void> {
        table.get(index)
    }

    pub fn free_instance_binding_data(&self, table: InstanceBindingData) {
        drop(table);
    }
}

impl ClassResolver for Runtime {
    /// `library` first, then every other initialized library in registration order
    fn find_class(&self, library: &LibraryId, name: &str) -> Option<Arc<ClassDescriptor>> {
        let libraries = self.libraries.read();
        let own = libraries
            .get(library)
            .filter(|entry| entry.library.is_initialized())
            .and_then(|entry| entry.classes.get(name));
        if let Some(found) = own {
            return Some(Arc::clone(found));
        }

        libraries
            .iter()
            .filter(|(id, entry)| *id != library && entry.library.is_initialized())
            .find_map(|(_, entry)| entry.classes.get(name).cloned())
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if !self.is_finished() && self.is_main_context() {
            if let Err(err) = self.finish() {
                warn!(target: "registry", %err, "runtime shutdown failed");
            }
        }
    }
}

#[cfg(test)]
mod tests;
