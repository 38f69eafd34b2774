//! Native ABI - function pointer types crossing the library boundary
//!
//! Design: every callback a library hands us is a C-ABI function pointer
//! paired with an opaque `method_data` pointer and an optional free function.
//! The pair is carried as a [`NativeCallback`]; `method_data` is released once,
//! when the descriptor owning the callback is destroyed.

use crate::host::{ObjectId, Variant};
use core::ffi::c_void;
use std::fmt;

/// Instance factory: `(owner, method_data) -> user_data`
pub type CreateFn = unsafe extern "C" fn(owner: ObjectId, method_data: *mut c_void) -> *mut c_void;

/// Instance destructor: `(owner, method_data, user_data)`
pub type DestroyFn =
    unsafe extern "C" fn(owner: ObjectId, method_data: *mut c_void, user_data: *mut c_void);

/// Method call. `args` points at `argc` contiguous variants; the result is
/// written through `ret`, which always points at an initialized `Variant::Nil`.
pub type MethodFn = unsafe extern "C" fn(
    owner: ObjectId,
    method_data: *mut c_void,
    user_data: *mut c_void,
    argc: usize,
    args: *const Variant,
    ret: *mut Variant,
) -> CallStatus;

/// Property getter, writes through `ret`
pub type GetterFn = unsafe extern "C" fn(
    owner: ObjectId,
    method_data: *mut c_void,
    user_data: *mut c_void,
    ret: *mut Variant,
);

/// Property setter
pub type SetterFn = unsafe extern "C" fn(
    owner: ObjectId,
    method_data: *mut c_void,
    user_data: *mut c_void,
    value: *const Variant,
);

/// Releases a `method_data` pointer
pub type FreeFn = unsafe extern "C" fn(method_data: *mut c_void);

/// `nativescript_init`: receives the registration handle
pub type InitFn = unsafe extern "C" fn(handle: *mut c_void);

/// No-argument lifecycle hook (terminate, frame, thread enter/exit)
pub type HookFn = unsafe extern "C" fn();

/// Binding slot allocator: `(data, owner) -> binding`
pub type BindingAllocFn = unsafe extern "C" fn(data: *mut c_void, owner: ObjectId) -> *mut c_void;

/// Binding slot release: `(data, binding)`
pub type BindingFreeFn = unsafe extern "C" fn(data: *mut c_void, binding: *mut c_void);

/// Result of a native method call
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Ok = 0,
    InvalidMethod = 1,
    InvalidArgument = 2,
    TooManyArguments = 3,
    TooFewArguments = 4,
    InstanceIsNull = 5,
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::InvalidMethod => write!(f, "invalid method"),
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::TooManyArguments => write!(f, "too many arguments"),
            Self::TooFewArguments => write!(f, "too few arguments"),
            Self::InstanceIsNull => write!(f, "instance is null"),
        }
    }
}

/// Well-known library entry points, looked up by symbol name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryPoint {
    Init,
    Terminate,
    Frame,
    ThreadEnter,
    ThreadExit,
}

impl EntryPoint {
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Init => "nativescript_init",
            Self::Terminate => "nativescript_terminate",
            Self::Frame => "nativescript_frame",
            Self::ThreadEnter => "nativescript_thread_enter",
            Self::ThreadExit => "nativescript_thread_exit",
        }
    }
}

/// Function pointer plus the opaque data it is called with
pub struct NativeCallback<F: Copy> {
    pub func: F,
    pub method_data: *mut c_void,
    pub free_func: Option<FreeFn>,
}

impl<F: Copy> NativeCallback<F> {
    /// Callback without `method_data`
    pub fn new(func: F) -> Self {
        Self {
            func,
            method_data: core::ptr::null_mut(),
            free_func: None,
        }
    }

    /// Callback carrying `method_data`, released through `free_func`
    pub fn with_data(func: F, method_data: *mut c_void, free_func: Option<FreeFn>) -> Self {
        Self {
            func,
            method_data,
            free_func,
        }
    }

    /// Release `method_data`. Called exactly once by the owner of the callback.
    pub(crate) fn release(&self) {
        if let Some(free) = self.free_func {
            if !self.method_data.is_null() {
                unsafe { free(self.method_data) };
            }
        }
    }
}

impl<F: Copy> Clone for NativeCallback<F> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<F: Copy> Copy for NativeCallback<F> {}

impl<F: Copy> fmt::Debug for NativeCallback<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeCallback")
            .field("method_data", &self.method_data)
            .field("has_free", &self.free_func.is_some())
            .finish()
    }
}

// Libraries promise their callbacks and method_data may be used from any thread.
unsafe impl<F: Copy> Send for NativeCallback<F> {}
unsafe impl<F: Copy> Sync for NativeCallback<F> {}

impl NativeCallback<CreateFn> {
    /// # Safety
    /// The library backing this callback must still be loaded.
    #[inline]
    pub(crate) unsafe fn create(&self, owner: ObjectId) -> *mut c_void {
        (self.func)(owner, self.method_data)
    }
}

impl NativeCallback<DestroyFn> {
    /// # Safety
    /// `user_data` must come from the paired factory and not be destroyed yet.
    #[inline]
    pub(crate) unsafe fn destroy(&self, owner: ObjectId, user_data: *mut c_void) {
        (self.func)(owner, self.method_data, user_data)
    }
}

impl NativeCallback<MethodFn> {
    /// # Safety
    /// `user_data` must be a live pointer produced by the class factory.
    pub(crate) unsafe fn call(
        &self,
        owner: ObjectId,
        user_data: *mut c_void,
        args: &[Variant],
    ) -> Result<Variant, CallStatus> {
        let mut ret = Variant::Nil;
        let status = (self.func)(
            owner,
            self.method_data,
            user_data,
            args.len(),
            args.as_ptr(),
            &mut ret,
        );
        match status {
            CallStatus::Ok => Ok(ret),
            err => Err(err),
        }
    }
}

impl NativeCallback<GetterFn> {
    /// # Safety
    /// `user_data` must be a live pointer produced by the class factory.
    #[inline]
    pub(crate) unsafe fn get(&self, owner: ObjectId, user_data: *mut c_void) -> Variant {
        let mut ret = Variant::Nil;
        (self.func)(owner, self.method_data, user_data, &mut ret);
        ret
    }
}

impl NativeCallback<SetterFn> {
    /// # Safety
    /// `user_data` must be a live pointer produced by the class factory.
    #[inline]
    pub(crate) unsafe fn set(&self, owner: ObjectId, user_data: *mut c_void, value: &Variant) {
        (self.func)(owner, self.method_data, user_data, value)
    }
}

/// Allocator/free pair of one binding slot
#[derive(Debug, Clone, Copy)]
pub struct BindingFunctions {
    pub alloc: BindingAllocFn,
    pub free: BindingFreeFn,
    pub data: *mut c_void,
    /// Releases `data` when the slot is unregistered
    pub free_data: Option<FreeFn>,
}

unsafe impl Send for BindingFunctions {}
unsafe impl Sync for BindingFunctions {}
