//! Dynamic library backend
//!
//! Wraps dlopen/LoadLibrary. Entry points are looked up by their well-known
//! symbol names on every call, so a hook the library does not export is
//! simply skipped.

use super::LibraryBackend;
use crate::abi::{EntryPoint, HookFn, InitFn};
use crate::logging::{debug, trace};
use crate::registrar::ClassRegistrar;
use core::ffi::c_void;
use core::ptr::NonNull;
use std::ffi::CString;
use thiserror::Error;

/// Handle to a dynamically loaded library
pub struct DynamicLibrary {
    path: String,
    handle: NonNull<c_void>,
}

impl DynamicLibrary {
    /// Open the library at `path`. Resolution of relative names follows the
    /// platform loader.
    pub fn load(path: &str) -> Result<Self, LoadError> {
        let cname = CString::new(path).map_err(|_| LoadError::InvalidName)?;
        let handle = unsafe { sys::open(&cname) }.map_err(|reason| LoadError::LoadFailed {
            path: path.to_string(),
            reason,
        })?;
        debug!(target: "library", path, "shared library opened");
        Ok(Self {
            path: path.to_string(),
            handle,
        })
    }

    /// Address of an exported symbol
    pub fn symbol(&self, name: &str) -> Result<NonNull<c_void>, SymbolError> {
        let cname = CString::new(name).map_err(|_| SymbolError::InvalidName)?;
        let ptr = unsafe { sys::symbol(self.handle, &cname) }
            .ok_or_else(|| SymbolError::NotFound(name.to_string()))?;
        trace!(target: "library", path = %self.path, symbol = name, "symbol resolved");
        Ok(ptr)
    }

    fn hook(&self, entry: EntryPoint) -> Option<HookFn> {
        let ptr = self.symbol(entry.symbol()).ok()?;
        Some(unsafe { core::mem::transmute::<*mut c_void, HookFn>(ptr.as_ptr()) })
    }
}

impl LibraryBackend for DynamicLibrary {
    fn path(&self) -> &str {
        &self.path
    }

    fn run_init(&self, registrar: &mut ClassRegistrar) -> Result<(), String> {
        let ptr = self
            .symbol(EntryPoint::Init.symbol())
            .map_err(|e| e.to_string())?;
        let init = unsafe { core::mem::transmute::<*mut c_void, InitFn>(ptr.as_ptr()) };
        unsafe { init(registrar as *mut ClassRegistrar as *mut c_void) };
        Ok(())
    }

    fn run_hook(&self, entry: EntryPoint) -> bool {
        match self.hook(entry) {
            Some(hook) => {
                unsafe { hook() };
                true
            }
            None => false,
        }
    }
}

impl Drop for DynamicLibrary {
    fn drop(&mut self) {
        unsafe { sys::close(self.handle) };
    }
}

unsafe impl Send for DynamicLibrary {}
unsafe impl Sync for DynamicLibrary {}

#[cfg(unix)]
mod sys {
    use core::ffi::c_void;
    use core::ptr::NonNull;
    use std::ffi::{CStr, CString};
    use std::os::raw::c_char;

    extern "C" {
        fn dlopen(filename: *const c_char, flag: i32) -> *mut c_void;
        fn dlsym(handle: *mut c_void, symbol: *const c_char) -> *mut c_void;
        fn dlclose(handle: *mut c_void) -> i32;
        fn dlerror() -> *const c_char;
    }

    const RTLD_NOW: i32 = 2;

    pub unsafe fn open(path: &CString) -> Result<NonNull<c_void>, String> {
        NonNull::new(dlopen(path.as_ptr(), RTLD_NOW)).ok_or_else(|| {
            let err = dlerror();
            if err.is_null() {
                "unknown error".to_string()
            } else {
                CStr::from_ptr(err).to_string_lossy().into_owned()
            }
        })
    }

    pub unsafe fn symbol(handle: NonNull<c_void>, name: &CString) -> Option<NonNull<c_void>> {
        NonNull::new(dlsym(handle.as_ptr(), name.as_ptr()))
    }

    pub unsafe fn close(handle: NonNull<c_void>) {
        dlclose(handle.as_ptr());
    }
}

#[cfg(windows)]
mod sys {
    use core::ffi::c_void;
    use core::ptr::NonNull;
    use std::ffi::{CString, OsStr};
    use std::os::windows::ffi::OsStrExt;

    extern "system" {
        fn LoadLibraryW(filename: *const u16) -> *mut c_void;
        fn GetProcAddress(module: *mut c_void, name: *const u8) -> *mut c_void;
        fn FreeLibrary(module: *mut c_void) -> i32;
        fn GetLastError() -> u32;
    }

    pub unsafe fn open(path: &CString) -> Result<NonNull<c_void>, String> {
        let wide: Vec<u16> = OsStr::new(&*path.to_string_lossy())
            .encode_wide()
            .chain(Some(0))
            .collect();
        NonNull::new(LoadLibraryW(wide.as_ptr()))
            .ok_or_else(|| format!("error code {}", GetLastError()))
    }

    pub unsafe fn symbol(handle: NonNull<c_void>, name: &CString) -> Option<NonNull<c_void>> {
        NonNull::new(GetProcAddress(handle.as_ptr(), name.as_ptr() as *const u8))
    }

    pub unsafe fn close(handle: NonNull<c_void>) {
        FreeLibrary(handle.as_ptr());
    }
}

/// Library loading errors
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("invalid library name")]
    InvalidName,
    #[error("failed to load library '{path}': {reason}")]
    LoadFailed { path: String, reason: String },
}

/// Symbol lookup errors
#[derive(Debug, Error)]
pub enum SymbolError {
    #[error("invalid symbol name")]
    InvalidName,
    #[error("symbol '{0}' not found")]
    NotFound(String),
}
