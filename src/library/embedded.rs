//! Embedded library backend
//!
//! For classes linked into the host binary: the setup entry point and hooks
//! are Rust closures instead of exported symbols.

use super::LibraryBackend;
use crate::abi::EntryPoint;
use crate::registrar::ClassRegistrar;
use std::collections::HashMap;

pub type InitCallback = Box<dyn Fn(&mut ClassRegistrar) -> Result<(), String> + Send + Sync>;

type HookCallback = Box<dyn Fn() + Send + Sync>;

pub struct EmbeddedLibrary {
    path: String,
    init: Option<InitCallback>,
    hooks: HashMap<EntryPoint, HookCallback>,
}

impl EmbeddedLibrary {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            init: None,
            hooks: HashMap::new(),
        }
    }

    /// Setup entry point, the equivalent of `nativescript_init`
    pub fn on_init<F>(mut self, init: F) -> Self
    where
        F: Fn(&mut ClassRegistrar) -> Result<(), String> + Send + Sync + 'static,
    {
        self.init = Some(Box::new(init));
        self
    }

    /// Hook run for `entry` (terminate, frame, thread enter/exit)
    pub fn on_hook<F>(mut self, entry: EntryPoint, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.hooks.insert(entry, Box::new(hook));
        self
    }
}

impl LibraryBackend for EmbeddedLibrary {
    fn path(&self) -> &str {
        &self.path
    }

    fn run_init(&self, registrar: &mut ClassRegistrar) -> Result<(), String> {
        match &self.init {
            Some(init) => init(registrar),
            None => Err(format!(
                "library exports no '{}'",
                EntryPoint::Init.symbol()
            )),
        }
    }

    fn run_hook(&self, entry: EntryPoint) -> bool {
        match self.hooks.get(&entry) {
            Some(hook) => {
                hook();
                true
            }
            None => false,
        }
    }
}
