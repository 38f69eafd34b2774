//! Binding slots - per-object auxiliary data independent of script user-data
//!
//! Design: a slot is an allocator/free pair registered once and addressed
//! by a stable index. Every host object gets an [`InstanceBindingData`]
//! side-table sized to the slots registered when it was allocated; slots
//! registered later are not filled in retroactively.
//!
//! Lock order is slots -> live -> entries. Slot callbacks run under the
//! slots lock and must not register or unregister slots themselves.

use crate::abi::BindingFunctions;
use crate::host::ObjectId;
use crate::logging::log_binding_slot;
use core::ffi::c_void;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::{Arc, Weak};

struct BindingTable {
    owner: ObjectId,
    /// One entry per slot known at allocation; null when empty or freed
    entries: Mutex<Vec<*mut c_void>>,
}

// Entries are opaque pointers owned by the slot that produced them.
unsafe impl Send for BindingTable {}
unsafe impl Sync for BindingTable {}

pub(crate) struct BindingSlots {
    slots: RwLock<Vec<Option<BindingFunctions>>>,
    live: Mutex<Vec<Weak<BindingTable>>>,
}

impl BindingSlots {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(Vec::new()),
            live: Mutex::new(Vec::new()),
        }
    }

    /// Register a slot; indices are never reused
    pub fn register(&self, functions: BindingFunctions) -> usize {
        let mut slots = self.slots.write();
        slots.push(Some(functions));
        let index = slots.len() - 1;
        log_binding_slot("slot_registered", index);
        index
    }

    /// Free the slot's entry in every live table, then release its data.
    /// Returns false for an unknown or already retired index.
    pub fn unregister(&self, index: usize) -> bool {
        let mut slots = self.slots.write();
        let functions = match slots.get_mut(index).and_then(Option::take) {
            Some(functions) => functions,
            None => return false,
        };

        let tables: Vec<_> = {
            let mut live = self.live.lock();
            live.retain(|table| table.strong_count() > 0);
            live.iter().filter_map(Weak::upgrade).collect()
        };
        for table in tables {
            let binding = {
                let mut entries = table.entries.lock();
                match entries.get_mut(index) {
                    Some(entry) => std::mem::replace(entry, core::ptr::null_mut()),
                    None => core::ptr::null_mut(),
                }
            };
            if !binding.is_null() {
                unsafe { (functions.free)(functions.data, binding) };
            }
        }

        release_data(&functions);
        drop(slots);
        log_binding_slot("slot_unregistered", index);
        true
    }

    /// Build the side-table for `owner`, running every registered allocator
    pub fn alloc(self: &Arc<Self>, owner: ObjectId) -> InstanceBindingData {
        let slots = self.slots.read();
        let entries: Vec<*mut c_void> = slots
            .iter()
            .map(|slot| match slot {
                Some(f) => unsafe { (f.alloc)(f.data, owner) },
                None => core::ptr::null_mut(),
            })
            .collect();

        let table = Arc::new(BindingTable {
            owner,
            entries: Mutex::new(entries),
        });
        {
            let mut live = self.live.lock();
            live.retain(|t| t.strong_count() > 0);
            live.push(Arc::downgrade(&table));
        }
        drop(slots);

        InstanceBindingData {
            table,
            slots: Arc::clone(self),
        }
    }

    pub fn slot_count(&self) -> usize {
        self.slots.read().iter().filter(|s| s.is_some()).count()
    }

    /// Retire every slot
    pub fn clear(&self) {
        let count = self.slots.read().len();
        for index in 0..count {
            self.unregister(index);
        }
    }

    fn free_entries(&self, table: &BindingTable) {
        let slots = self.slots.read();
        let entries = std::mem::take(&mut *table.entries.lock());
        for (index, binding) in entries.into_iter().enumerate() {
            if binding.is_null() {
                continue;
            }
            if let Some(Some(f)) = slots.get(index) {
                unsafe { (f.free)(f.data, binding) };
            }
        }
    }
}

impl Drop for BindingSlots {
    fn drop(&mut self) {
        for functions in self.slots.get_mut().iter().flatten() {
            release_data(functions);
        }
    }
}

fn release_data(functions: &BindingFunctions) {
    if let Some(free_data) = functions.free_data {
        if !functions.data.is_null() {
            unsafe { free_data(functions.data) };
        }
    }
}

/// Per-object binding side-table. Freed exactly once, on drop.
pub struct InstanceBindingData {
    table: Arc<BindingTable>,
    slots: Arc<BindingSlots>,
}

impl InstanceBindingData {
    pub fn owner(&self) -> ObjectId {
        self.table.owner
    }

    /// Binding produced by slot `index`, if the slot existed at allocation
    /// and is still registered
    pub fn get(&self, index: usize) -> Option<*mut c_void> {
        self.table
            .entries
            .lock()
            .get(index)
            .copied()
            .filter(|binding| !binding.is_null())
    }

    /// Number of slots the table was sized for
    pub fn len(&self) -> usize {
        self.table.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for InstanceBindingData {
    fn drop(&mut self) {
        self.slots.free_entries(&self.table);
    }
}

impl fmt::Debug for InstanceBindingData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceBindingData")
            .field("owner", &self.table.owner)
            .field("len", &self.len())
            .finish()
    }
}
