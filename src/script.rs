//! Scripts - a (library, class name) pair acting as instance factory
//!
//! A script never caches its descriptor; every query resolves it from the
//! runtime at the moment of use, so a reload is picked up without touching
//! the script.

use crate::descriptor::{ClassDescriptor, ClassResolver};
use crate::error::{ScriptError, ScriptResult};
use crate::host::{MethodInfo, ObjectId, PropertyInfo, Variant};
use crate::instance::{ScriptInstance, UserData};
use crate::library::NativeLibrary;
use crate::logging::{debug, warn};
use crate::runtime::Runtime;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

pub struct Script {
    runtime: Arc<Runtime>,
    library: Arc<NativeLibrary>,
    class_name: String,
    instances: Mutex<HashMap<ObjectId, Weak<ScriptInstance>>>,
    /// Waiting for a deferred library initialization
    pending: AtomicBool,
}

impl Script {
    pub(crate) fn new(runtime: Arc<Runtime>, library: Arc<NativeLibrary>, class_name: &str) -> Arc<Self> {
        Arc::new(Self {
            runtime,
            library,
            class_name: class_name.to_string(),
            instances: Mutex::new(HashMap::new()),
            pending: AtomicBool::new(false),
        })
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn library(&self) -> &Arc<NativeLibrary> {
        &self.library
    }

    pub(crate) fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    fn resolver(&self) -> &dyn ClassResolver {
        &*self.runtime
    }

    /// Descriptor of this class, if its library is initialized and defines it
    pub fn resolve_descriptor(&self) -> ScriptResult<Arc<ClassDescriptor>> {
        self.runtime
            .find_descriptor(self.library.id(), &self.class_name)
            .ok_or_else(|| ScriptError::UnresolvedClass {
                library: self.library.path().to_string(),
                class: self.class_name.clone(),
            })
    }

    pub fn can_instantiate(&self) -> bool {
        self.resolve_descriptor()
            .map(|desc| desc.has_constructor())
            .unwrap_or(false)
    }

    /// Run the class factory and bind the new instance to `owner`
    pub fn create_instance(self: &Arc<Self>, owner: ObjectId) -> ScriptResult<Arc<ScriptInstance>> {
        let class = self.resolve_descriptor()?;
        if self.instance_has(owner) {
            return Err(self.already_bound(owner));
        }

        let user_data = UserData::create(class, owner)?;
        let instance = Arc::new(ScriptInstance::new(owner, Arc::clone(self), user_data));

        {
            let mut instances = self.instances.lock();
            let taken = instances
                .get(&owner)
                .map(|existing| existing.strong_count() > 0)
                .unwrap_or(false);
            if !taken {
                instances.insert(owner, Arc::downgrade(&instance));
            }
            drop(instances);
            if taken {
                // Lost a race with another constructor for the same owner.
                drop(instance);
                return Err(self.already_bound(owner));
            }
        }

        self.runtime.register_script(self);
        debug!(target: "registry", class = %self.class_name, %owner, "instance created");
        Ok(instance)
    }

    fn already_bound(&self, owner: ObjectId) -> ScriptError {
        ScriptError::AlreadyBound {
            owner,
            class: self.class_name.clone(),
        }
    }

    /// Live instance bound to `owner`
    pub fn instance(&self, owner: ObjectId) -> Option<Arc<ScriptInstance>> {
        self.instances.lock().get(&owner).and_then(Weak::upgrade)
    }

    pub fn instance_has(&self, owner: ObjectId) -> bool {
        self.instance(owner).is_some()
    }

    pub fn instance_count(&self) -> usize {
        self.instances
            .lock()
            .values()
            .filter(|instance| instance.strong_count() > 0)
            .count()
    }

    /// Script for the resolved base class, if the base is itself a script class
    pub fn get_base_script(&self) -> Option<Arc<Script>> {
        let class = self.resolve_descriptor().ok()?;
        let base = class.resolve_base(self.resolver())?;
        let library = self.runtime.library(base.library().as_str())?;
        Some(Script::new(Arc::clone(&self.runtime), library, base.name()))
    }

    /// Host type the class hierarchy ultimately extends; empty if unresolved
    pub fn get_instance_base_type(&self) -> String {
        self.resolve_descriptor()
            .map(|class| class.base_native_type(self.resolver()))
            .unwrap_or_default()
    }

    pub fn is_tool(&self) -> bool {
        self.resolve_descriptor()
            .map(|class| class.is_tool())
            .unwrap_or(false)
    }

    pub fn has_method(&self, method: &str) -> bool {
        self.resolve_descriptor()
            .map(|class| class.find_method(self.resolver(), method).is_some())
            .unwrap_or(false)
    }

    pub fn get_method_info(&self, method: &str) -> Option<MethodInfo> {
        let class = self.resolve_descriptor().ok()?;
        let level = class.find_method(self.resolver(), method)?;
        level.method(method).map(|m| m.info.clone())
    }

    pub fn has_script_signal(&self, signal: &str) -> bool {
        self.resolve_descriptor()
            .map(|class| class.chain(self.resolver()).any(|level| level.signal(signal).is_some()))
            .unwrap_or(false)
    }

    pub fn get_script_signal_list(&self) -> Vec<MethodInfo> {
        self.resolve_descriptor()
            .map(|class| class.signal_list(self.resolver()))
            .unwrap_or_default()
    }

    pub fn get_script_method_list(&self) -> Vec<MethodInfo> {
        self.resolve_descriptor()
            .map(|class| class.method_list(self.resolver()))
            .unwrap_or_default()
    }

    pub fn get_script_property_list(&self) -> Vec<PropertyInfo> {
        self.resolve_descriptor()
            .map(|class| class.property_list(self.resolver()))
            .unwrap_or_default()
    }

    pub fn get_property_default_value(&self, property: &str) -> Option<Variant> {
        let class = self.resolve_descriptor().ok()?;
        class.property_default(self.resolver(), property)
    }

    /// Waiting for its library to be initialized on the main context
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    pub(crate) fn mark_pending(&self) {
        self.pending.store(true, Ordering::Release);
    }

    /// Deferred initialization of the library has run
    pub(crate) fn library_ready(&self) {
        if self.pending.swap(false, Ordering::AcqRel) {
            debug!(
                target: "registry",
                class = %self.class_name,
                resolved = self.resolve_descriptor().is_ok(),
                "script ready"
            );
        }
    }

    fn live_instances(&self) -> Vec<Arc<ScriptInstance>> {
        self.instances
            .lock()
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }

    pub(crate) fn forget_owner(&self, owner: ObjectId, instance: *const ScriptInstance) {
        let mut instances = self.instances.lock();
        if let Some(existing) = instances.get(&owner) {
            if existing.as_ptr() == instance {
                instances.remove(&owner);
            }
        }
    }

    /// Destroy the user-data of every live instance. Returns how many were
    /// detached.
    pub(crate) fn unload_instances(&self) -> usize {
        self.live_instances()
            .iter()
            .filter(|instance| instance.detach_user_data())
            .count()
    }

    /// Recreate user-data for every live instance whose class still exists.
    /// Returns how many were reattached.
    pub(crate) fn reload_instances(&self) -> usize {
        let class = match self.resolve_descriptor() {
            Ok(class) => class,
            Err(err) => {
                warn!(target: "registry", %err, "class vanished across reload");
                return 0;
            }
        };

        let mut reattached = 0;
        for instance in self.live_instances() {
            match instance.reattach(Arc::clone(&class)) {
                Ok(()) => reattached += 1,
                Err(err) => warn!(
                    target: "registry",
                    owner = %instance.owner(),
                    %err,
                    "failed to recreate instance after reload"
                ),
            }
        }
        reattached
    }
}

impl Drop for Script {
    fn drop(&mut self) {
        self.runtime.unregister_script(self);
    }
}

impl fmt::Debug for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Script")
            .field("library", &self.library.id())
            .field("class", &self.class_name)
            .field("pending", &self.is_pending())
            .finish()
    }
}
