//! Class registration handle passed to a library's setup entry point
//!
//! Design: registrations accumulate in a private staging map while the
//! library's `nativescript_init` runs. When setup returns, the runtime
//! consumes the registrar and freezes every staged class into an
//! `Arc<ClassDescriptor>`; nothing is visible to lookups before that point.
//!
//! Ownership of every callback passes to the registrar on the call, whether
//! or not the registration is accepted. Rejected callbacks have their
//! `method_data` released immediately.

use crate::abi::{CreateFn, DestroyFn, GetterFn, MethodFn, NativeCallback, SetterFn};
use crate::descriptor::{ClassDescriptor, MethodDesc, PropertyDesc, SignalDesc};
use crate::error::RegistrationError;
use crate::host::{MethodInfo, PropertyInfo, RpcMode, Variant};
use crate::library::{LibraryBackend, LibraryId};
use crate::logging::log_registration_rejected;
use core::ffi::c_void;
use indexmap::IndexMap;
use std::sync::Arc;

pub type RegistrationResult = Result<(), RegistrationError>;

pub struct ClassRegistrar {
    library: LibraryId,
    backend: Arc<dyn LibraryBackend>,
    classes: IndexMap<String, ClassDescriptor>,
    failure: Option<String>,
}

impl ClassRegistrar {
    pub(crate) fn new(library: LibraryId, backend: Arc<dyn LibraryBackend>) -> Self {
        Self {
            library,
            backend,
            classes: IndexMap::new(),
            failure: None,
        }
    }

    /// Library the classes are registered into
    pub fn library(&self) -> &LibraryId {
        &self.library
    }

    /// Names of the classes staged so far, in registration order
    pub fn class_names(&self) -> impl Iterator<Item = &str> {
        self.classes.keys().map(String::as_str)
    }

    /// Register a class. `base` names either another script class or a host
    /// native type. A class without `create` cannot be instantiated.
    pub fn register_class(
        &mut self,
        name: &str,
        base: &str,
        create: Option<NativeCallback<CreateFn>>,
        destroy: NativeCallback<DestroyFn>,
    ) -> RegistrationResult {
        self.add_class(name, base, create, destroy, false)
    }

    /// Register a class that also runs in tool/editor contexts
    pub fn register_tool_class(
        &mut self,
        name: &str,
        base: &str,
        create: Option<NativeCallback<CreateFn>>,
        destroy: NativeCallback<DestroyFn>,
    ) -> RegistrationResult {
        self.add_class(name, base, create, destroy, true)
    }

    fn add_class(
        &mut self,
        name: &str,
        base: &str,
        create: Option<NativeCallback<CreateFn>>,
        destroy: NativeCallback<DestroyFn>,
        is_tool: bool,
    ) -> RegistrationResult {
        let check = if name.is_empty() {
            Err(RegistrationError::EmptyName)
        } else if name == base {
            Err(RegistrationError::SelfInheritance(name.to_string()))
        } else if self.classes.contains_key(name) {
            Err(RegistrationError::DuplicateClass(name.to_string()))
        } else {
            Ok(())
        };

        if let Err(err) = check {
            if let Some(create) = &create {
                create.release();
            }
            destroy.release();
            return self.reject(err);
        }

        let mut desc = ClassDescriptor::new(
            name.to_string(),
            self.library.clone(),
            base.to_string(),
            create,
            destroy,
            Arc::clone(&self.backend),
        );
        desc.is_tool = is_tool;
        self.classes.insert(name.to_string(), desc);
        Ok(())
    }

    /// Register a method. Re-registering a name replaces the earlier entry.
    pub fn register_method(
        &mut self,
        class: &str,
        info: MethodInfo,
        rpc_mode: RpcMode,
        callback: NativeCallback<MethodFn>,
    ) -> RegistrationResult {
        let desc = match self.staged(class, &info.name) {
            Ok(desc) => desc,
            Err(err) => {
                callback.release();
                return self.reject(err);
            }
        };

        let name = info.name.clone();
        let method = MethodDesc {
            callback,
            info,
            rpc_mode,
        };
        if let Some(old) = desc.methods.insert(name, method) {
            old.callback.release();
        }
        Ok(())
    }

    /// Register a property with its accessor pair
    pub fn register_property(
        &mut self,
        class: &str,
        info: PropertyInfo,
        default_value: Variant,
        rset_mode: RpcMode,
        setter: NativeCallback<SetterFn>,
        getter: NativeCallback<GetterFn>,
    ) -> RegistrationResult {
        let desc = match self.staged(class, &info.name) {
            Ok(desc) => desc,
            Err(err) => {
                setter.release();
                getter.release();
                return self.reject(err);
            }
        };

        let name = info.name.clone();
        let property = PropertyDesc {
            setter,
            getter,
            info,
            default_value,
            rset_mode,
        };
        if let Some(old) = desc.properties.insert(name, property) {
            old.setter.release();
            old.getter.release();
        }
        Ok(())
    }

    pub fn register_signal(
        &mut self,
        class: &str,
        info: MethodInfo,
        default_args: Vec<Variant>,
    ) -> RegistrationResult {
        let desc = match self.staged(class, &info.name) {
            Ok(desc) => desc,
            Err(err) => return self.reject(err),
        };
        desc.signals
            .insert(info.name.clone(), SignalDesc { info, default_args });
        Ok(())
    }

    /// Attach an opaque identity tag to `class`
    pub fn set_type_tag(&mut self, class: &str, tag: *const c_void) -> RegistrationResult {
        match self.classes.get_mut(class) {
            Some(desc) => {
                desc.type_tag = tag as usize;
                Ok(())
            }
            None => self.reject(RegistrationError::UnknownClass(class.to_string())),
        }
    }

    /// Mark setup as failed. The library ends up terminated and nothing it
    /// registered becomes visible.
    pub fn fail(&mut self, reason: impl Into<String>) {
        if self.failure.is_none() {
            self.failure = Some(reason.into());
        }
    }

    pub fn has_failed(&self) -> bool {
        self.failure.is_some()
    }

    fn staged(&mut self, class: &str, member: &str) -> Result<&mut ClassDescriptor, RegistrationError> {
        if member.is_empty() {
            return Err(RegistrationError::EmptyName);
        }
        self.classes
            .get_mut(class)
            .ok_or_else(|| RegistrationError::UnknownClass(class.to_string()))
    }

    fn reject(&self, err: RegistrationError) -> RegistrationResult {
        log_registration_rejected(self.library.as_str(), &err.to_string());
        Err(err)
    }

    /// Freeze the staged classes, or report the recorded failure
    pub(crate) fn finish(self) -> Result<IndexMap<String, Arc<ClassDescriptor>>, String> {
        if let Some(reason) = self.failure {
            return Err(reason);
        }
        Ok(self
            .classes
            .into_iter()
            .map(|(name, desc)| (name, Arc::new(desc)))
            .collect())
    }
}
