//! Native fixture shared by the integration tests
//!
//! Every instance owns a `NativeState`. Recording methods append their tag
//! to the state's journal; the `journal` method returns it as an array.

#![allow(dead_code)]

use parking_lot::Mutex;
use qnative::abi::{CreateFn, DestroyFn, GetterFn, MethodFn, SetterFn};
use qnative::{
    CallStatus, ClassRegistrar, MethodInfo, NativeCallback, ObjectId, PropertyInfo, RpcMode,
    ScriptInstance, Variant, VariantType,
};
use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Default)]
pub struct Counters {
    pub created: AtomicUsize,
    pub destroyed: AtomicUsize,
    pub freed: AtomicUsize,
}

impl Counters {
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn freed(&self) -> usize {
        self.freed.load(Ordering::SeqCst)
    }
}

pub struct NativeState {
    pub owner: ObjectId,
    pub journal: Mutex<Vec<String>>,
    pub hp: Mutex<Variant>,
    pub dynamic: Mutex<HashMap<String, Variant>>,
}

struct MethodTag {
    tag: String,
    counters: Arc<Counters>,
}

unsafe fn state<'a>(user_data: *mut c_void) -> &'a NativeState {
    &*(user_data as *const NativeState)
}

unsafe fn args<'a>(argc: usize, args: *const Variant) -> &'a [Variant] {
    if argc == 0 {
        &[]
    } else {
        std::slice::from_raw_parts(args, argc)
    }
}

unsafe extern "C" fn create(owner: ObjectId, method_data: *mut c_void) -> *mut c_void {
    let counters = &*(method_data as *const Counters);
    counters.created.fetch_add(1, Ordering::SeqCst);
    Box::into_raw(Box::new(NativeState {
        owner,
        journal: Mutex::new(Vec::new()),
        hp: Mutex::new(Variant::Int(100)),
        dynamic: Mutex::new(HashMap::new()),
    })) as *mut c_void
}

unsafe extern "C" fn create_null(_: ObjectId, _: *mut c_void) -> *mut c_void {
    core::ptr::null_mut()
}

unsafe extern "C" fn destroy(_: ObjectId, method_data: *mut c_void, user_data: *mut c_void) {
    let counters = &*(method_data as *const Counters);
    counters.destroyed.fetch_add(1, Ordering::SeqCst);
    drop(Box::from_raw(user_data as *mut NativeState));
}

unsafe extern "C" fn release_counters(data: *mut c_void) {
    drop(Arc::from_raw(data as *const Counters));
}

unsafe extern "C" fn release_tag(data: *mut c_void) {
    let tag = Box::from_raw(data as *mut MethodTag);
    tag.counters.freed.fetch_add(1, Ordering::SeqCst);
}

unsafe extern "C" fn record(
    _: ObjectId,
    method_data: *mut c_void,
    user_data: *mut c_void,
    _: usize,
    _: *const Variant,
    _: *mut Variant,
) -> CallStatus {
    let tag = &*(method_data as *const MethodTag);
    state(user_data).journal.lock().push(tag.tag.clone());
    CallStatus::Ok
}

unsafe extern "C" fn journal(
    _: ObjectId,
    _: *mut c_void,
    user_data: *mut c_void,
    _: usize,
    _: *const Variant,
    ret: *mut Variant,
) -> CallStatus {
    let entries = state(user_data)
        .journal
        .lock()
        .iter()
        .map(|entry| Variant::from(entry.as_str()))
        .collect::<Vec<_>>();
    *ret = Variant::Array(entries);
    CallStatus::Ok
}

unsafe extern "C" fn double_int(
    _: ObjectId,
    _: *mut c_void,
    _: *mut c_void,
    argc: usize,
    argv: *const Variant,
    ret: *mut Variant,
) -> CallStatus {
    match args(argc, argv) {
        [] => CallStatus::TooFewArguments,
        [Variant::Int(n)] => {
            *ret = Variant::Int(n * 2);
            CallStatus::Ok
        }
        [_] => CallStatus::InvalidArgument,
        _ => CallStatus::TooManyArguments,
    }
}

unsafe extern "C" fn return_false(
    _: ObjectId,
    _: *mut c_void,
    _: *mut c_void,
    _: usize,
    _: *const Variant,
    ret: *mut Variant,
) -> CallStatus {
    *ret = Variant::Bool(false);
    CallStatus::Ok
}

unsafe extern "C" fn return_int(
    _: ObjectId,
    _: *mut c_void,
    _: *mut c_void,
    _: usize,
    _: *const Variant,
    ret: *mut Variant,
) -> CallStatus {
    *ret = Variant::Int(7);
    CallStatus::Ok
}

unsafe extern "C" fn dynamic_get(
    _: ObjectId,
    _: *mut c_void,
    user_data: *mut c_void,
    argc: usize,
    argv: *const Variant,
    ret: *mut Variant,
) -> CallStatus {
    let name = match args(argc, argv).first().and_then(Variant::as_str) {
        Some(name) => name,
        None => return CallStatus::InvalidArgument,
    };
    if let Some(value) = state(user_data).dynamic.lock().get(name) {
        *ret = value.clone();
    }
    CallStatus::Ok
}

unsafe extern "C" fn dynamic_set(
    _: ObjectId,
    _: *mut c_void,
    user_data: *mut c_void,
    argc: usize,
    argv: *const Variant,
    ret: *mut Variant,
) -> CallStatus {
    match args(argc, argv) {
        [Variant::String(name), value] if name.starts_with("dyn_") => {
            state(user_data).dynamic.lock().insert(name.clone(), value.clone());
            *ret = Variant::Bool(true);
            CallStatus::Ok
        }
        [_, _] => {
            *ret = Variant::Bool(false);
            CallStatus::Ok
        }
        _ => CallStatus::InvalidArgument,
    }
}

unsafe extern "C" fn get_hp(_: ObjectId, _: *mut c_void, user_data: *mut c_void, ret: *mut Variant) {
    *ret = state(user_data).hp.lock().clone();
}

unsafe extern "C" fn set_hp(_: ObjectId, _: *mut c_void, user_data: *mut c_void, value: *const Variant) {
    *state(user_data).hp.lock() = (*value).clone();
}

/// Builds callbacks that count into one shared set of counters
#[derive(Clone, Default)]
pub struct Fixture {
    pub counters: Arc<Counters>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::default()
    }

    fn counters_ptr(&self) -> *mut c_void {
        Arc::into_raw(Arc::clone(&self.counters)) as *mut c_void
    }

    pub fn create(&self) -> NativeCallback<CreateFn> {
        NativeCallback::with_data(create as CreateFn, self.counters_ptr(), Some(release_counters))
    }

    pub fn create_null(&self) -> NativeCallback<CreateFn> {
        NativeCallback::new(create_null as CreateFn)
    }

    pub fn destroy(&self) -> NativeCallback<DestroyFn> {
        NativeCallback::with_data(destroy as DestroyFn, self.counters_ptr(), Some(release_counters))
    }

    /// Method appending `tag` to the instance journal
    pub fn record(&self, tag: &str) -> NativeCallback<MethodFn> {
        let data = Box::into_raw(Box::new(MethodTag {
            tag: tag.to_string(),
            counters: Arc::clone(&self.counters),
        })) as *mut c_void;
        NativeCallback::with_data(record as MethodFn, data, Some(release_tag))
    }

    /// Register `name` extending `base`, with a recording method per entry
    /// of `methods` tagged `"<name>.<method>"`
    pub fn class(&self, reg: &mut ClassRegistrar, name: &str, base: &str, methods: &[&str]) {
        reg.register_class(name, base, Some(self.create()), self.destroy())
            .unwrap();
        for method in methods {
            reg.register_method(
                name,
                MethodInfo::new(*method),
                RpcMode::Disabled,
                self.record(&format!("{name}.{method}")),
            )
            .unwrap();
        }
    }

    /// Root class with `journal`, an `hp` property and an argument-checked
    /// `double` method
    pub fn root_class(&self, reg: &mut ClassRegistrar, name: &str, methods: &[&str]) {
        self.class(reg, name, "Reference", methods);
        reg.register_method(
            name,
            MethodInfo::new("journal").returning(VariantType::Array),
            RpcMode::Disabled,
            NativeCallback::new(journal as MethodFn),
        )
        .unwrap();
        reg.register_method(
            name,
            MethodInfo::new("double")
                .with_arg(PropertyInfo::new("n", VariantType::Int))
                .returning(VariantType::Int),
            RpcMode::Remote,
            NativeCallback::new(double_int as MethodFn),
        )
        .unwrap();
        reg.register_property(
            name,
            PropertyInfo::new("hp", VariantType::Int).with_hint("0,100"),
            Variant::Int(100),
            RpcMode::Disabled,
            NativeCallback::new(set_hp as SetterFn),
            NativeCallback::new(get_hp as GetterFn),
        )
        .unwrap();
    }

    /// `_get` / `_set` fallbacks serving `dyn_*` names
    pub fn dynamic_properties(&self, reg: &mut ClassRegistrar, class: &str) {
        reg.register_method(
            class,
            MethodInfo::new("_get"),
            RpcMode::Disabled,
            NativeCallback::new(dynamic_get as MethodFn),
        )
        .unwrap();
        reg.register_method(
            class,
            MethodInfo::new("_set"),
            RpcMode::Disabled,
            NativeCallback::new(dynamic_set as MethodFn),
        )
        .unwrap();
    }

    /// `_refcount_decremented` returning `false`
    pub fn refcount_keep(&self, reg: &mut ClassRegistrar, class: &str) {
        reg.register_method(
            class,
            MethodInfo::new("_refcount_decremented"),
            RpcMode::Disabled,
            NativeCallback::new(return_false as MethodFn),
        )
        .unwrap();
    }

    /// `_refcount_decremented` returning a non-boolean
    pub fn refcount_garbage(&self, reg: &mut ClassRegistrar, class: &str) {
        reg.register_method(
            class,
            MethodInfo::new("_refcount_decremented"),
            RpcMode::Disabled,
            NativeCallback::new(return_int as MethodFn),
        )
        .unwrap();
    }
}

/// Journal entries of `instance`, oldest first
pub fn journal_of(instance: &ScriptInstance) -> Vec<String> {
    match instance.call("journal", &[]) {
        Ok(Variant::Array(entries)) => entries
            .into_iter()
            .filter_map(|entry| entry.as_str().map(str::to_string))
            .collect(),
        other => panic!("journal call failed: {other:?}"),
    }
}
