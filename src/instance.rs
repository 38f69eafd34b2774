//! Script instances - one per host object, owning the native user-data
//!
//! Design: the user-data pointer lives in a move-only [`UserData`] handle
//! whose drop runs the class destructor, so destruction happens exactly once
//! however the instance goes away (host release, reload, runtime shutdown).
//!
//! Dispatch copies the class and pointer out of the instance lock and calls
//! native code with no lock held. Concurrent dispatch on one instance is not
//! serialized here.

use crate::abi::{GetterFn, MethodFn, NativeCallback, SetterFn};
use crate::descriptor::{ClassDescriptor, ClassResolver};
use crate::error::{ScriptError, ScriptResult};
use crate::host::{MethodInfo, ObjectId, PropertyInfo, RpcMode, Variant, VariantType};
use crate::logging::{debug, log_native_call, warn};
use crate::script::Script;
use core::ffi::c_void;
use core::ptr::NonNull;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;

/// Instance lifecycle; only moves forward
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Live,
    /// The refcount hook allowed release; dispatch is refused from here on
    PendingRelease,
    Destroyed,
}

/// Owning handle to one native user-data pointer
pub(crate) struct UserData {
    ptr: NonNull<c_void>,
    class: Arc<ClassDescriptor>,
    owner: ObjectId,
}

impl UserData {
    /// Run the class factory for `owner`
    pub fn create(class: Arc<ClassDescriptor>, owner: ObjectId) -> ScriptResult<Self> {
        let create = class.create.ok_or_else(|| ScriptError::InstanceCreateFailed {
            class: class.name().to_string(),
        })?;

        let raw = unsafe { create.create(owner) };
        match NonNull::new(raw) {
            Some(ptr) => Ok(Self { ptr, class, owner }),
            None => Err(ScriptError::InstanceCreateFailed {
                class: class.name().to_string(),
            }),
        }
    }
}

impl Drop for UserData {
    fn drop(&mut self) {
        debug!(target: "dispatch", class = self.class.name(), owner = %self.owner, "destroying user-data");
        unsafe { self.class.destroy.destroy(self.owner, self.ptr.as_ptr()) };
    }
}

// The library owns the pointee and allows use from any thread.
unsafe impl Send for UserData {}
unsafe impl Sync for UserData {}

struct InstanceState {
    lifecycle: Lifecycle,
    /// None while detached for a reload
    user_data: Option<UserData>,
}

/// Runtime object bound to exactly one host object
pub struct ScriptInstance {
    owner: ObjectId,
    script: Arc<Script>,
    state: Mutex<InstanceState>,
}

type MethodLevels = SmallVec<[NativeCallback<MethodFn>; 4]>;

impl ScriptInstance {
    pub(crate) fn new(owner: ObjectId, script: Arc<Script>, user_data: UserData) -> Self {
        Self {
            owner,
            script,
            state: Mutex::new(InstanceState {
                lifecycle: Lifecycle::Live,
                user_data: Some(user_data),
            }),
        }
    }

    pub fn owner(&self) -> ObjectId {
        self.owner
    }

    pub fn get_script(&self) -> &Arc<Script> {
        &self.script
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.state.lock().lifecycle
    }

    /// Whether native user-data is attached (false while detached for reload)
    pub fn has_user_data(&self) -> bool {
        self.state.lock().user_data.is_some()
    }

    fn resolver(&self) -> &dyn ClassResolver {
        &**self.script.runtime()
    }

    /// Class and user-data pointer for a dispatch, copied out of the lock
    fn target(&self) -> ScriptResult<(Arc<ClassDescriptor>, *mut c_void)> {
        let state = self.state.lock();
        if state.lifecycle != Lifecycle::Live {
            return Err(ScriptError::InstanceReleased { owner: self.owner });
        }
        match &state.user_data {
            Some(data) => Ok((Arc::clone(&data.class), data.ptr.as_ptr())),
            None => Err(ScriptError::UnresolvedClass {
                library: self.script.library().path().to_string(),
                class: self.script.class_name().to_string(),
            }),
        }
    }

    /// Class for metadata queries: the attached one, else whatever the script
    /// resolves to now
    fn descriptor(&self) -> Option<Arc<ClassDescriptor>> {
        let attached = self
            .state
            .lock()
            .user_data
            .as_ref()
            .map(|data| Arc::clone(&data.class));
        attached.or_else(|| self.script.resolve_descriptor().ok())
    }

    /// Read a property. Each level of the chain is asked for the property,
    /// then for a `_get` fallback returning non-nil.
    pub fn get(&self, name: &str) -> ScriptResult<Variant> {
        let (class, user_data) = self.target()?;

        for level in class.chain(self.resolver()) {
            if let Some(property) = level.property(name) {
                let getter: NativeCallback<GetterFn> = property.getter;
                return Ok(unsafe { getter.get(self.owner, user_data) });
            }
            if let Some(fallback) = level.method("_get") {
                let callback = fallback.callback;
                let args = [Variant::from(name)];
                let value = self.invoke(&level, "_get", callback, user_data, &args)?;
                if !value.is_nil() {
                    return Ok(value);
                }
            }
        }

        Err(ScriptError::not_found(name))
    }

    /// Write a property. Each level is asked for the property, then for a
    /// `_set` fallback returning `true` when it handled the write.
    pub fn set(&self, name: &str, value: Variant) -> ScriptResult<()> {
        let (class, user_data) = self.target()?;

        for level in class.chain(self.resolver()) {
            if let Some(property) = level.property(name) {
                let setter: NativeCallback<SetterFn> = property.setter;
                unsafe { setter.set(self.owner, user_data, &value) };
                return Ok(());
            }
            if let Some(fallback) = level.method("_set") {
                let callback = fallback.callback;
                let args = [Variant::from(name), value.clone()];
                let handled = self.invoke(&level, "_set", callback, user_data, &args)?;
                if handled.as_bool() == Some(true) {
                    return Ok(());
                }
            }
        }

        Err(ScriptError::not_found(name))
    }

    /// Call the most-derived definition of `method`
    pub fn call(&self, method: &str, args: &[Variant]) -> ScriptResult<Variant> {
        let (class, user_data) = self.target()?;

        let level = class
            .find_method(self.resolver(), method)
            .ok_or_else(|| ScriptError::not_found(method))?;
        let callback = match level.method(method) {
            Some(desc) => desc.callback,
            None => return Err(ScriptError::not_found(method)),
        };

        self.invoke(&level, method, callback, user_data, args)
    }

    /// Call every definition of `method`, most-derived first. Return values
    /// are discarded.
    pub fn call_multilevel(&self, method: &str, args: &[Variant]) -> ScriptResult<()> {
        let (class, user_data) = self.target()?;
        let levels = self.method_levels(&class, method);
        self.invoke_all(&class, method, levels.into_iter(), user_data, args);
        Ok(())
    }

    /// Call every definition of `method`, base first
    pub fn call_multilevel_reversed(&self, method: &str, args: &[Variant]) -> ScriptResult<()> {
        let (class, user_data) = self.target()?;
        let levels = self.method_levels(&class, method);
        self.invoke_all(&class, method, levels.into_iter().rev(), user_data, args);
        Ok(())
    }

    /// Deliver a host notification as `_notification(code)`, base first
    pub fn notification(&self, what: i32) -> ScriptResult<()> {
        self.call_multilevel_reversed("_notification", &[Variant::Int(i64::from(what))])
    }

    /// Forward the host's reference increment to `_refcount_incremented`
    pub fn refcount_incremented(&self) -> ScriptResult<()> {
        match self.call("_refcount_incremented", &[]) {
            Ok(_) | Err(ScriptError::NotFound { .. }) => Ok(()),
            Err(ScriptError::ArgumentError { method, status }) => {
                warn!(target: "dispatch", %method, %status, "refcount hook failed");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Forward the host's reference decrement to `_refcount_decremented`.
    /// Returns whether the host may release the object; once it has said
    /// so the instance refuses every further dispatch.
    pub fn refcount_decremented(&self) -> ScriptResult<bool> {
        let may_release = match self.call("_refcount_decremented", &[]) {
            Ok(Variant::Bool(value)) => value,
            Ok(other) => {
                warn!(
                    target: "dispatch",
                    class = self.script.class_name(),
                    returned = %other.get_type(),
                    "_refcount_decremented did not return a bool"
                );
                true
            }
            Err(ScriptError::NotFound { .. }) => true,
            Err(ScriptError::ArgumentError { method, status }) => {
                warn!(target: "dispatch", %method, %status, "refcount hook failed");
                true
            }
            Err(err) => return Err(err),
        };

        if may_release {
            let mut state = self.state.lock();
            if state.lifecycle == Lifecycle::Live {
                state.lifecycle = Lifecycle::PendingRelease;
            }
        }
        Ok(may_release)
    }

    pub fn has_method(&self, method: &str) -> bool {
        self.descriptor()
            .map(|class| class.find_method(self.resolver(), method).is_some())
            .unwrap_or(false)
    }

    pub fn get_method_list(&self) -> Vec<MethodInfo> {
        self.descriptor()
            .map(|class| class.method_list(self.resolver()))
            .unwrap_or_default()
    }

    pub fn get_property_list(&self) -> Vec<PropertyInfo> {
        self.descriptor()
            .map(|class| class.property_list(self.resolver()))
            .unwrap_or_default()
    }

    pub fn get_property_type(&self, name: &str) -> Option<VariantType> {
        let class = self.descriptor()?;
        let level = class.find_property(self.resolver(), name)?;
        level.property(name).map(|p| p.info.ty)
    }

    pub fn get_rpc_mode(&self, method: &str) -> RpcMode {
        self.descriptor()
            .map(|class| class.rpc_mode(self.resolver(), method))
            .unwrap_or_default()
    }

    pub fn get_rset_mode(&self, property: &str) -> RpcMode {
        self.descriptor()
            .map(|class| class.rset_mode(self.resolver(), property))
            .unwrap_or_default()
    }

    /// Tag of the most-derived class, null if it set none
    pub fn type_tag(&self) -> *const c_void {
        self.descriptor()
            .map(|class| class.type_tag())
            .unwrap_or(core::ptr::null())
    }

    fn method_levels(&self, class: &Arc<ClassDescriptor>, method: &str) -> MethodLevels {
        class
            .chain(self.resolver())
            .filter_map(|level| level.method(method).map(|desc| desc.callback))
            .collect()
    }

    fn invoke_all(
        &self,
        class: &ClassDescriptor,
        method: &str,
        levels: impl Iterator<Item = NativeCallback<MethodFn>>,
        user_data: *mut c_void,
        args: &[Variant],
    ) {
        for callback in levels {
            if let Err(err) = self.invoke(class, method, callback, user_data, args) {
                debug!(target: "dispatch", %err, "multilevel call level failed");
            }
        }
    }

    fn invoke(
        &self,
        class: &ClassDescriptor,
        method: &str,
        callback: NativeCallback<MethodFn>,
        user_data: *mut c_void,
        args: &[Variant],
    ) -> ScriptResult<Variant> {
        log_native_call(class.name(), method, args.len());
        unsafe { callback.call(self.owner, user_data, args) }.map_err(|status| {
            ScriptError::ArgumentError {
                method: method.to_string(),
                status,
            }
        })
    }

    /// Destroy the user-data ahead of a reload. The instance stays bound to
    /// its owner and reports `UnresolvedClass` until reattached.
    pub(crate) fn detach_user_data(&self) -> bool {
        let detached = self.state.lock().user_data.take();
        detached.is_some()
    }

    /// Recreate user-data from `class` after a reload. User-data built from
    /// any other descriptor is destroyed and replaced.
    pub(crate) fn reattach(&self, class: Arc<ClassDescriptor>) -> ScriptResult<()> {
        let current = |state: &InstanceState| {
            state
                .user_data
                .as_ref()
                .is_some_and(|data| Arc::ptr_eq(&data.class, &class))
        };
        if current(&*self.state.lock()) {
            return Ok(());
        }

        let fresh = UserData::create(Arc::clone(&class), self.owner)?;
        let mut state = self.state.lock();
        if state.lifecycle != Lifecycle::Live || current(&*state) {
            drop(state);
            drop(fresh);
            return Ok(());
        }
        let stale = state.user_data.replace(fresh);
        drop(state);
        drop(stale);
        Ok(())
    }
}

impl Drop for ScriptInstance {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        state.lifecycle = Lifecycle::Destroyed;
        drop(state.user_data.take());
        self.script.forget_owner(self.owner, self as *const ScriptInstance);
    }
}

impl fmt::Debug for ScriptInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptInstance")
            .field("owner", &self.owner)
            .field("class", &self.script.class_name())
            .field("lifecycle", &self.lifecycle())
            .finish()
    }
}
