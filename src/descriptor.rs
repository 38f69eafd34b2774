//! Class descriptors and base-chain resolution
//!
//! Design: descriptors are built by a [`crate::ClassRegistrar`] while a
//! library runs its setup entry point and are immutable once handed to the
//! runtime. The base class is stored by name and resolved lazily through a
//! [`ClassResolver`]:
//! 1. A successful resolution is memoized as a weak link and never changes
//! 2. A failed resolution is not memoized; the next lookup retries
//! 3. While unresolved, the chain simply ends at the current descriptor

use crate::abi::{CreateFn, DestroyFn, GetterFn, MethodFn, NativeCallback, SetterFn};
use crate::host::{MethodInfo, PropertyInfo, RpcMode, Variant};
use crate::library::{LibraryBackend, LibraryId};
use core::ffi::c_void;
use indexmap::IndexMap;
use once_cell::sync::OnceCell;
use serde::Serialize;
use smallvec::SmallVec;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::{Arc, Weak};

/// Looks up registered classes by (library, name)
pub trait ClassResolver {
    /// Find `name`, preferring `library` and falling back to the other
    /// initialized libraries
    fn find_class(&self, library: &LibraryId, name: &str) -> Option<Arc<ClassDescriptor>>;
}

pub struct MethodDesc {
    pub(crate) callback: NativeCallback<MethodFn>,
    pub info: MethodInfo,
    pub rpc_mode: RpcMode,
}

pub struct PropertyDesc {
    pub(crate) setter: NativeCallback<SetterFn>,
    pub(crate) getter: NativeCallback<GetterFn>,
    pub info: PropertyInfo,
    pub default_value: Variant,
    pub rset_mode: RpcMode,
}

pub struct SignalDesc {
    pub info: MethodInfo,
    pub default_args: Vec<Variant>,
}

/// Static metadata of one native-backed class
pub struct ClassDescriptor {
    name: String,
    library: LibraryId,
    /// Script class or host native type this class extends
    base: String,
    base_link: OnceCell<Weak<ClassDescriptor>>,
    pub(crate) methods: BTreeMap<String, MethodDesc>,
    pub(crate) properties: IndexMap<String, PropertyDesc>,
    pub(crate) signals: BTreeMap<String, SignalDesc>,
    pub(crate) create: Option<NativeCallback<CreateFn>>,
    pub(crate) destroy: NativeCallback<DestroyFn>,
    pub(crate) type_tag: usize,
    pub(crate) is_tool: bool,
    // Keeps the code behind the callbacks mapped while the descriptor lives.
    _backend: Arc<dyn LibraryBackend>,
}

impl ClassDescriptor {
    pub(crate) fn new(
        name: String,
        library: LibraryId,
        base: String,
        create: Option<NativeCallback<CreateFn>>,
        destroy: NativeCallback<DestroyFn>,
        backend: Arc<dyn LibraryBackend>,
    ) -> Self {
        Self {
            name,
            library,
            base,
            base_link: OnceCell::new(),
            methods: BTreeMap::new(),
            properties: IndexMap::new(),
            signals: BTreeMap::new(),
            create,
            destroy,
            type_tag: 0,
            is_tool: false,
            _backend: backend,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn library(&self) -> &LibraryId {
        &self.library
    }

    pub fn base_name(&self) -> &str {
        &self.base
    }

    pub fn is_tool(&self) -> bool {
        self.is_tool
    }

    pub fn has_constructor(&self) -> bool {
        self.create.is_some()
    }

    /// Opaque tag set by the library, null if none
    pub fn type_tag(&self) -> *const c_void {
        self.type_tag as *const c_void
    }

    pub fn method(&self, name: &str) -> Option<&MethodDesc> {
        self.methods.get(name)
    }

    pub fn property(&self, name: &str) -> Option<&PropertyDesc> {
        self.properties.get(name)
    }

    pub fn signal(&self, name: &str) -> Option<&SignalDesc> {
        self.signals.get(name)
    }

    pub fn methods(&self) -> impl Iterator<Item = &MethodDesc> {
        self.methods.values()
    }

    /// Properties in registration order
    pub fn properties(&self) -> impl Iterator<Item = &PropertyDesc> {
        self.properties.values()
    }

    pub fn signals(&self) -> impl Iterator<Item = &SignalDesc> {
        self.signals.values()
    }

    pub fn is_base_resolved(&self) -> bool {
        self.base_link.get().is_some()
    }

    /// Resolve the base descriptor, memoizing only a successful lookup
    pub fn resolve_base(&self, resolver: &dyn ClassResolver) -> Option<Arc<ClassDescriptor>> {
        if let Some(link) = self.base_link.get() {
            if let Some(base) = link.upgrade() {
                return Some(base);
            }
            // The base's library was reloaded; its replacement is found by name.
            return resolver.find_class(&self.library, &self.base);
        }

        if self.base.is_empty() || self.base == self.name {
            return None;
        }

        let base = resolver.find_class(&self.library, &self.base)?;
        let _ = self.base_link.set(Arc::downgrade(&base));
        Some(base)
    }

    /// Walk from this class towards the root, most-derived first
    pub fn chain<'r>(self: &Arc<Self>, resolver: &'r dyn ClassResolver) -> ClassChain<'r> {
        ClassChain {
            next: Some(Arc::clone(self)),
            resolver,
            seen: SmallVec::new(),
        }
    }

    /// First level of the chain defining `method`
    pub fn find_method(
        self: &Arc<Self>,
        resolver: &dyn ClassResolver,
        method: &str,
    ) -> Option<Arc<ClassDescriptor>> {
        self.chain(resolver).find(|level| level.method(method).is_some())
    }

    /// First level of the chain defining `property`
    pub fn find_property(
        self: &Arc<Self>,
        resolver: &dyn ClassResolver,
        property: &str,
    ) -> Option<Arc<ClassDescriptor>> {
        self.chain(resolver).find(|level| level.property(property).is_some())
    }

    /// The host type the hierarchy ultimately extends: the base name of the
    /// last level the chain reaches. A base that is not registered yet cannot
    /// be told apart from a host type, so until it resolves this is its name;
    /// the value settles once the chain resolves up to the host type.
    pub fn base_native_type(self: &Arc<Self>, resolver: &dyn ClassResolver) -> String {
        self.chain(resolver)
            .last()
            .map(|root| root.base.clone())
            .unwrap_or_default()
    }

    pub fn method_list(self: &Arc<Self>, resolver: &dyn ClassResolver) -> Vec<MethodInfo> {
        collect_unique(self.chain(resolver), |level| {
            level.methods().map(|m| m.info.clone()).collect()
        })
    }

    pub fn property_list(self: &Arc<Self>, resolver: &dyn ClassResolver) -> Vec<PropertyInfo> {
        collect_unique(self.chain(resolver), |level| {
            level.properties().map(|p| p.info.clone()).collect()
        })
    }

    pub fn signal_list(self: &Arc<Self>, resolver: &dyn ClassResolver) -> Vec<MethodInfo> {
        collect_unique(self.chain(resolver), |level| {
            level.signals().map(|s| s.info.clone()).collect()
        })
    }

    pub fn property_default(
        self: &Arc<Self>,
        resolver: &dyn ClassResolver,
        property: &str,
    ) -> Option<Variant> {
        self.chain(resolver)
            .find_map(|level| level.property(property).map(|p| p.default_value.clone()))
    }

    pub fn rpc_mode(self: &Arc<Self>, resolver: &dyn ClassResolver, method: &str) -> RpcMode {
        self.chain(resolver)
            .find_map(|level| level.method(method).map(|m| m.rpc_mode))
            .unwrap_or_default()
    }

    pub fn rset_mode(self: &Arc<Self>, resolver: &dyn ClassResolver, property: &str) -> RpcMode {
        self.chain(resolver)
            .find_map(|level| level.property(property).map(|p| p.rset_mode))
            .unwrap_or_default()
    }

    pub fn summary(self: &Arc<Self>, resolver: &dyn ClassResolver) -> ClassSummary {
        ClassSummary {
            name: self.name.clone(),
            library: self.library.to_string(),
            base: self.base.clone(),
            base_native_type: self.base_native_type(resolver),
            is_tool: self.is_tool,
            methods: self.method_list(resolver),
            properties: self.property_list(resolver),
            signals: self.signal_list(resolver),
        }
    }
}

impl Drop for ClassDescriptor {
    fn drop(&mut self) {
        if let Some(create) = &self.create {
            create.release();
        }
        self.destroy.release();
        for method in self.methods.values() {
            method.callback.release();
        }
        for property in self.properties.values() {
            property.setter.release();
            property.getter.release();
        }
    }
}

impl fmt::Debug for ClassDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassDescriptor")
            .field("name", &self.name)
            .field("library", &self.library)
            .field("base", &self.base)
            .field("methods", &self.methods.len())
            .field("properties", &self.properties.len())
            .field("signals", &self.signals.len())
            .finish()
    }
}

/// Iterator over a class and its resolved bases. Stops at the first
/// unresolved base or at a repeated class.
pub struct ClassChain<'r> {
    next: Option<Arc<ClassDescriptor>>,
    resolver: &'r dyn ClassResolver,
    seen: SmallVec<[*const ClassDescriptor; 8]>,
}

impl Iterator for ClassChain<'_> {
    type Item = Arc<ClassDescriptor>;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next.take()?;
        let ptr = Arc::as_ptr(&current);
        if self.seen.contains(&ptr) {
            return None;
        }
        self.seen.push(ptr);
        self.next = current.resolve_base(self.resolver);
        Some(current)
    }
}

/// Entries from every level, most-derived first; a base entry is dropped
/// when a more-derived level already named it.
fn collect_unique<T, I, F>(chain: I, entries: F) -> Vec<T>
where
    I: Iterator<Item = Arc<ClassDescriptor>>,
    F: Fn(&ClassDescriptor) -> Vec<T>,
    T: Named,
{
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for level in chain {
        for entry in entries(&level) {
            if seen.insert(entry.name().to_string()) {
                out.push(entry);
            }
        }
    }
    out
}

trait Named {
    fn name(&self) -> &str;
}

impl Named for MethodInfo {
    fn name(&self) -> &str {
        &self.name
    }
}

impl Named for PropertyInfo {
    fn name(&self) -> &str {
        &self.name
    }
}

/// Serializable view of a class with its whole chain folded in
#[derive(Debug, Clone, Serialize)]
pub struct ClassSummary {
    pub name: String,
    pub library: String,
    pub base: String,
    pub base_native_type: String,
    pub is_tool: bool,
    pub methods: Vec<MethodInfo>,
    pub properties: Vec<PropertyInfo>,
    pub signals: Vec<MethodInfo>,
}
