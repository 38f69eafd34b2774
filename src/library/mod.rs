//! Library handles - one per loaded native library
//!
//! Design: the runtime talks to a library only through [`LibraryBackend`]:
//! - `dynamic.rs` - shared objects opened with dlopen/LoadLibrary
//! - `embedded.rs` - classes linked into the host, registered from Rust closures
//!
//! A [`NativeLibrary`] wraps the backend with an identity and the
//! initialization state machine.

mod dynamic;
mod embedded;

pub use dynamic::{DynamicLibrary, LoadError, SymbolError};
pub use embedded::{EmbeddedLibrary, InitCallback};

use crate::abi::EntryPoint;
use crate::registrar::ClassRegistrar;
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Library identity (its path)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LibraryId(Arc<str>);

impl LibraryId {
    pub fn new(path: &str) -> Self {
        Self(Arc::from(path))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LibraryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Initialization state of a library
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LibraryState {
    Unloaded = 0,
    Loading = 1,
    AwaitingMainThreadInit = 2,
    Initializing = 3,
    Initialized = 4,
    Terminated = 5,
    Reloading = 6,
}

impl LibraryState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Unloaded,
            1 => Self::Loading,
            2 => Self::AwaitingMainThreadInit,
            3 => Self::Initializing,
            4 => Self::Initialized,
            5 => Self::Terminated,
            _ => Self::Reloading,
        }
    }

    /// Edges of the state machine. Every state but `Reloading` can be
    /// terminated; only an explicit reload leaves `Terminated`.
    pub fn can_transition(self, to: LibraryState) -> bool {
        use LibraryState::*;
        matches!(
            (self, to),
            (Unloaded, Loading)
                | (Unloaded, Terminated)
                | (Loading, AwaitingMainThreadInit)
                | (Loading, Terminated)
                | (AwaitingMainThreadInit, Terminated)
                | (Loading, Initializing)
                | (AwaitingMainThreadInit, Initializing)
                | (Initializing, Initialized)
                | (Initializing, Terminated)
                | (Initialized, Terminated)
                | (Initialized, Reloading)
                | (Terminated, Reloading)
                | (Reloading, Initializing)
        )
    }
}

/// Access to one native library's entry points
pub trait LibraryBackend: Send + Sync {
    /// Path or identifier the library was opened from
    fn path(&self) -> &str;

    /// Run `nativescript_init`, letting the library register its classes.
    /// An error marks the library terminated.
    fn run_init(&self, registrar: &mut ClassRegistrar) -> Result<(), String>;

    /// Run a no-argument hook. Returns false if the library does not export it.
    fn run_hook(&self, entry: EntryPoint) -> bool;
}

/// A library known to a runtime
pub struct NativeLibrary {
    id: LibraryId,
    backend: RwLock<Arc<dyn LibraryBackend>>,
    state: AtomicU8,
}

impl NativeLibrary {
    pub(crate) fn new(backend: Arc<dyn LibraryBackend>) -> Self {
        Self {
            id: LibraryId::new(backend.path()),
            backend: RwLock::new(backend),
            state: AtomicU8::new(LibraryState::Unloaded as u8),
        }
    }

    pub fn id(&self) -> &LibraryId {
        &self.id
    }

    pub fn path(&self) -> &str {
        self.id.as_str()
    }

    pub fn state(&self) -> LibraryState {
        LibraryState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_initialized(&self) -> bool {
        self.state() == LibraryState::Initialized
    }

    /// Move to `to` if the edge is legal. Returns the state observed before
    /// the attempt, as `Err` when the move was refused.
    pub(crate) fn transition(&self, to: LibraryState) -> Result<LibraryState, LibraryState> {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let from = LibraryState::from_u8(current);
            if !from.can_transition(to) {
                return Err(from);
            }
            match self.state.compare_exchange_weak(
                current,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(from),
                Err(actual) => current = actual,
            }
        }
    }

    pub(crate) fn backend(&self) -> Arc<dyn LibraryBackend> {
        self.backend.read().clone()
    }

    pub(crate) fn replace_backend(&self, backend: Arc<dyn LibraryBackend>) {
        *self.backend.write() = backend;
    }
}

impl fmt::Debug for NativeLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeLibrary")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}
