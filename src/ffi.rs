//! C registration API
//!
//! Libraries written in C receive an opaque handle in `nativescript_init`
//! and pass it back to these functions. Every function returns `true` when
//! the registration was accepted. Ownership of `method_data` passes to the
//! bridge on every call, including rejected ones.
//!
//! Values (`Variant`) are opaque to C. Arguments are read and results written
//! through the `qnative_variant_*` functions; a value owned by the library,
//! such as a property default, comes from `qnative_variant_new`.

use crate::abi::{CreateFn, DestroyFn, FreeFn, GetterFn, MethodFn, NativeCallback, SetterFn};
use crate::error::RegistrationError;
use crate::host::{MethodInfo, ObjectId, PropertyInfo, RpcMode, Variant, VariantType};
use crate::logging::{log_registration_rejected, trace};
use crate::registrar::ClassRegistrar;
use core::ffi::c_void;
use std::ffi::CStr;
use std::os::raw::c_char;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct InstanceCreateFunc {
    pub create_func: Option<CreateFn>,
    pub method_data: *mut c_void,
    pub free_func: Option<FreeFn>,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct InstanceDestroyFunc {
    pub destroy_func: Option<DestroyFn>,
    pub method_data: *mut c_void,
    pub free_func: Option<FreeFn>,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct InstanceMethod {
    pub method: Option<MethodFn>,
    pub method_data: *mut c_void,
    pub free_func: Option<FreeFn>,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct PropertySetFunc {
    pub set_func: Option<SetterFn>,
    pub method_data: *mut c_void,
    pub free_func: Option<FreeFn>,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct PropertyGetFunc {
    pub get_func: Option<GetterFn>,
    pub method_data: *mut c_void,
    pub free_func: Option<FreeFn>,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct MethodAttributes {
    pub rpc_type: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct PropertyAttributes {
    pub rset_type: u32,
    pub ty: u32,
    /// Nullable
    pub hint_string: *const c_char,
    /// Nullable; Nil when absent
    pub default_value: *const Variant,
}

/// Turn a nullable function/data triple into a callback, releasing the data
/// when the function is missing
fn callback<F: Copy>(
    func: Option<F>,
    method_data: *mut c_void,
    free_func: Option<FreeFn>,
    name: &str,
    what: &'static str,
) -> Result<NativeCallback<F>, RegistrationError> {
    match func {
        Some(func) => Ok(NativeCallback::with_data(func, method_data, free_func)),
        None => {
            if let Some(free) = free_func {
                if !method_data.is_null() {
                    unsafe { free(method_data) };
                }
            }
            Err(RegistrationError::MissingCallback {
                name: name.to_string(),
                what,
            })
        }
    }
}

unsafe fn registrar<'a>(handle: *mut c_void) -> Option<&'a mut ClassRegistrar> {
    (handle as *mut ClassRegistrar).as_mut()
}

unsafe fn string<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok()
}

fn accepted(registrar: &ClassRegistrar, result: Result<(), RegistrationError>) -> bool {
    match result {
        Ok(()) => true,
        Err(RegistrationError::MissingCallback { name, what }) => {
            let reason = format!("'{name}' is missing its {what} callback");
            log_registration_rejected(registrar.library().as_str(), &reason);
            false
        }
        Err(_) => false,
    }
}

unsafe fn register_class_impl(
    handle: *mut c_void,
    name: *const c_char,
    base: *const c_char,
    create: InstanceCreateFunc,
    destroy: InstanceDestroyFunc,
    tool: bool,
) -> bool {
    let Some(registrar) = registrar(handle) else {
        return false;
    };
    let name = string(name).unwrap_or_default();
    let base = string(base).unwrap_or_default();
    trace!(target: "registry", class = name, base, tool, "C class registration");

    let create = create.create_func.map(|func| {
        NativeCallback::with_data(func, create.method_data, create.free_func)
    });
    let destroy = match callback(
        destroy.destroy_func,
        destroy.method_data,
        destroy.free_func,
        name,
        "destroy",
    ) {
        Ok(destroy) => destroy,
        Err(err) => {
            if let Some(create) = create {
                create.release();
            }
            return accepted(registrar, Err(err));
        }
    };

    let result = if tool {
        registrar.register_tool_class(name, base, create, destroy)
    } else {
        registrar.register_class(name, base, create, destroy)
    };
    accepted(registrar, result)
}

/// # Safety
/// `handle` must be the pointer passed to `nativescript_init`; strings must
/// be NUL-terminated UTF-8.
#[no_mangle]
pub unsafe extern "C" fn qnative_register_class(
    handle: *mut c_void,
    name: *const c_char,
    base: *const c_char,
    create: InstanceCreateFunc,
    destroy: InstanceDestroyFunc,
) -> bool {
    register_class_impl(handle, name, base, create, destroy, false)
}

/// # Safety
/// See [`qnative_register_class`].
#[no_mangle]
pub unsafe extern "C" fn qnative_register_tool_class(
    handle: *mut c_void,
    name: *const c_char,
    base: *const c_char,
    create: InstanceCreateFunc,
    destroy: InstanceDestroyFunc,
) -> bool {
    register_class_impl(handle, name, base, create, destroy, true)
}

/// # Safety
/// See [`qnative_register_class`].
#[no_mangle]
pub unsafe extern "C" fn qnative_register_method(
    handle: *mut c_void,
    class: *const c_char,
    name: *const c_char,
    attributes: MethodAttributes,
    method: InstanceMethod,
) -> bool {
    let Some(registrar) = registrar(handle) else {
        return false;
    };
    let class = string(class).unwrap_or_default();
    let name = string(name).unwrap_or_default();

    let result = callback(method.method, method.method_data, method.free_func, name, "method")
        .and_then(|callback| {
            registrar.register_method(
                class,
                MethodInfo::new(name),
                RpcMode::from_raw(attributes.rpc_type),
                callback,
            )
        });
    accepted(registrar, result)
}

/// # Safety
/// See [`qnative_register_class`]. `attributes.default_value`, when set,
/// must point at a valid `Variant`.
#[no_mangle]
pub unsafe extern "C" fn qnative_register_property(
    handle: *mut c_void,
    class: *const c_char,
    path: *const c_char,
    attributes: PropertyAttributes,
    set: PropertySetFunc,
    get: PropertyGetFunc,
) -> bool {
    let Some(registrar) = registrar(handle) else {
        return false;
    };
    let class = string(class).unwrap_or_default();
    let path = string(path).unwrap_or_default();

    let setter = callback(set.set_func, set.method_data, set.free_func, path, "setter");
    let getter = callback(get.get_func, get.method_data, get.free_func, path, "getter");
    let (setter, getter) = match (setter, getter) {
        (Ok(setter), Ok(getter)) => (setter, getter),
        (Ok(other), Err(err)) => {
            other.release();
            return accepted(registrar, Err(err));
        }
        (Err(err), Ok(other)) => {
            other.release();
            return accepted(registrar, Err(err));
        }
        (Err(err), Err(_)) => return accepted(registrar, Err(err)),
    };

    let ty = VariantType::from_raw(attributes.ty).unwrap_or(VariantType::Nil);
    let mut info = PropertyInfo::new(path, ty);
    if let Some(hint) = string(attributes.hint_string) {
        info = info.with_hint(hint);
    }
    let default_value = attributes
        .default_value
        .as_ref()
        .cloned()
        .unwrap_or_default();

    let result = registrar.register_property(
        class,
        info,
        default_value,
        RpcMode::from_raw(attributes.rset_type),
        setter,
        getter,
    );
    accepted(registrar, result)
}

/// # Safety
/// See [`qnative_register_class`].
#[no_mangle]
pub unsafe extern "C" fn qnative_register_signal(
    handle: *mut c_void,
    class: *const c_char,
    name: *const c_char,
) -> bool {
    let Some(registrar) = registrar(handle) else {
        return false;
    };
    let class = string(class).unwrap_or_default();
    let name = string(name).unwrap_or_default();
    let result = registrar.register_signal(class, MethodInfo::new(name), Vec::new());
    accepted(registrar, result)
}

/// # Safety
/// See [`qnative_register_class`].
#[no_mangle]
pub unsafe extern "C" fn qnative_set_type_tag(
    handle: *mut c_void,
    class: *const c_char,
    tag: *const c_void,
) -> bool {
    let Some(registrar) = registrar(handle) else {
        return false;
    };
    let class = string(class).unwrap_or_default();
    let result = registrar.set_type_tag(class, tag);
    accepted(registrar, result)
}

/// Report that setup failed; the library will be terminated.
///
/// # Safety
/// See [`qnative_register_class`].
#[no_mangle]
pub unsafe extern "C" fn qnative_init_failed(handle: *mut c_void, reason: *const c_char) {
    if let Some(registrar) = registrar(handle) {
        registrar.fail(string(reason).unwrap_or("setup reported failure"));
    }
}

// ============================================================================
// Values
// ============================================================================

unsafe fn write(value: *mut Variant, new: Variant) -> bool {
    match value.as_mut() {
        Some(slot) => {
            *slot = new;
            true
        }
        None => false,
    }
}

/// Allocate a `Nil` value owned by the caller
#[no_mangle]
pub extern "C" fn qnative_variant_new() -> *mut Variant {
    Box::into_raw(Box::new(Variant::Nil))
}

/// # Safety
/// `value` must come from [`qnative_variant_new`] and not be used afterwards.
#[no_mangle]
pub unsafe extern "C" fn qnative_variant_destroy(value: *mut Variant) {
    if !value.is_null() {
        drop(Box::from_raw(value));
    }
}

/// Raw [`VariantType`] of `value`; `Nil` for a null pointer
///
/// # Safety
/// `value` must be null or point at a valid `Variant`.
#[no_mangle]
pub unsafe extern "C" fn qnative_variant_get_type(value: *const Variant) -> u32 {
    value
        .as_ref()
        .map_or(VariantType::Nil, Variant::get_type) as u32
}

/// Truthiness as the host defines it
///
/// # Safety
/// See [`qnative_variant_get_type`].
#[no_mangle]
pub unsafe extern "C" fn qnative_variant_as_bool(value: *const Variant) -> bool {
    value.as_ref().is_some_and(Variant::booleanize)
}

/// Integer value; floats truncate, bools are 0/1, anything else is 0
///
/// # Safety
/// See [`qnative_variant_get_type`].
#[no_mangle]
pub unsafe extern "C" fn qnative_variant_as_int(value: *const Variant) -> i64 {
    match value.as_ref() {
        Some(Variant::Int(i)) => *i,
        Some(Variant::Float(f)) => *f as i64,
        Some(Variant::Bool(b)) => i64::from(*b),
        _ => 0,
    }
}

/// # Safety
/// See [`qnative_variant_get_type`].
#[no_mangle]
pub unsafe extern "C" fn qnative_variant_as_float(value: *const Variant) -> f64 {
    match value.as_ref() {
        Some(Variant::Float(f)) => *f,
        Some(Variant::Int(i)) => *i as f64,
        Some(Variant::Bool(b)) => f64::from(u8::from(*b)),
        _ => 0.0,
    }
}

/// # Safety
/// See [`qnative_variant_get_type`].
#[no_mangle]
pub unsafe extern "C" fn qnative_variant_as_object(value: *const Variant) -> ObjectId {
    match value.as_ref() {
        Some(Variant::Object(id)) => *id,
        _ => ObjectId::NULL,
    }
}

/// UTF-8 bytes of a string value, not NUL-terminated. Returns null (and a
/// zero length) for any other type. The bytes stay valid until `value` is
/// changed or dropped.
///
/// # Safety
/// See [`qnative_variant_get_type`]. `len` must be null or writable.
#[no_mangle]
pub unsafe extern "C" fn qnative_variant_as_string(
    value: *const Variant,
    len: *mut usize,
) -> *const c_char {
    let text = value.as_ref().and_then(Variant::as_str);
    if let Some(len) = len.as_mut() {
        *len = text.map_or(0, str::len);
    }
    text.map_or(core::ptr::null(), |s| s.as_ptr() as *const c_char)
}

/// # Safety
/// See [`qnative_variant_get_type`].
#[no_mangle]
pub unsafe extern "C" fn qnative_variant_array_size(value: *const Variant) -> usize {
    match value.as_ref() {
        Some(Variant::Array(items)) => items.len(),
        _ => 0,
    }
}

/// Element `index` of an array value; null when out of range or not an array
///
/// # Safety
/// See [`qnative_variant_get_type`].
#[no_mangle]
pub unsafe extern "C" fn qnative_variant_array_get(
    value: *const Variant,
    index: usize,
) -> *const Variant {
    match value.as_ref() {
        Some(Variant::Array(items)) => items
            .get(index)
            .map_or(core::ptr::null(), |item| item as *const Variant),
        _ => core::ptr::null(),
    }
}

/// # Safety
/// `value` must be null or point at an initialized `Variant`, such as the
/// `ret` slot of a method call.
#[no_mangle]
pub unsafe extern "C" fn qnative_variant_set_nil(value: *mut Variant) -> bool {
    write(value, Variant::Nil)
}

/// # Safety
/// See [`qnative_variant_set_nil`].
#[no_mangle]
pub unsafe extern "C" fn qnative_variant_set_bool(value: *mut Variant, b: bool) -> bool {
    write(value, Variant::Bool(b))
}

/// # Safety
/// See [`qnative_variant_set_nil`].
#[no_mangle]
pub unsafe extern "C" fn qnative_variant_set_int(value: *mut Variant, i: i64) -> bool {
    write(value, Variant::Int(i))
}

/// # Safety
/// See [`qnative_variant_set_nil`].
#[no_mangle]
pub unsafe extern "C" fn qnative_variant_set_float(value: *mut Variant, f: f64) -> bool {
    write(value, Variant::Float(f))
}

/// # Safety
/// See [`qnative_variant_set_nil`].
#[no_mangle]
pub unsafe extern "C" fn qnative_variant_set_object(value: *mut Variant, id: ObjectId) -> bool {
    write(value, Variant::Object(id))
}

/// Copy `len` bytes of UTF-8 into a string value. Invalid UTF-8 leaves
/// `value` untouched and returns false.
///
/// # Safety
/// See [`qnative_variant_set_nil`]. `text` must point at `len` readable bytes
/// (it may be null when `len` is 0).
#[no_mangle]
pub unsafe extern "C" fn qnative_variant_set_string(
    value: *mut Variant,
    text: *const c_char,
    len: usize,
) -> bool {
    let bytes = if len == 0 {
        &[][..]
    } else if text.is_null() {
        return false;
    } else {
        core::slice::from_raw_parts(text as *const u8, len)
    };
    match std::str::from_utf8(bytes) {
        Ok(s) => write(value, Variant::String(s.to_string())),
        Err(_) => false,
    }
}

/// Make `value` an empty array
///
/// # Safety
/// See [`qnative_variant_set_nil`].
#[no_mangle]
pub unsafe extern "C" fn qnative_variant_set_array(value: *mut Variant) -> bool {
    write(value, Variant::Array(Vec::new()))
}

/// Append a copy of `item` to an array value
///
/// # Safety
/// See [`qnative_variant_set_nil`]; `item` must point at a valid `Variant`.
#[no_mangle]
pub unsafe extern "C" fn qnative_variant_array_push(
    value: *mut Variant,
    item: *const Variant,
) -> bool {
    match (value.as_mut(), item.as_ref()) {
        (Some(Variant::Array(items)), Some(item)) => {
            items.push(item.clone());
            true
        }
        _ => false,
    }
}
