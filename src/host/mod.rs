//! Host object model - the data the bridge consumes from the host
//!
//! The host's object system is an external collaborator. This module carries
//! only the records the bridge passes through: object identity, the generic
//! value type, property/method descriptions, replication modes and the
//! notification codes delivered to instances.

mod variant;

pub use variant::{Variant, VariantType};

use serde::Serialize;
use std::fmt;

/// Identity of a host object. Non-owning.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ObjectId(pub u64);

impl ObjectId {
    pub const NULL: ObjectId = ObjectId(0);

    #[inline]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Network replication mode of a method (rpc) or property (rset)
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RpcMode {
    #[default]
    Disabled = 0,
    Remote = 1,
    Master = 2,
    Puppet = 3,
    RemoteSync = 4,
    MasterSync = 5,
    PuppetSync = 6,
}

impl RpcMode {
    /// Unknown values fall back to `Disabled`
    pub const fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Self::Remote,
            2 => Self::Master,
            3 => Self::Puppet,
            4 => Self::RemoteSync,
            5 => Self::MasterSync,
            6 => Self::PuppetSync,
            _ => Self::Disabled,
        }
    }
}

/// Type metadata of one property or argument
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PropertyInfo {
    pub name: String,
    pub ty: VariantType,
    pub hint_string: String,
}

impl PropertyInfo {
    pub fn new(name: impl Into<String>, ty: VariantType) -> Self {
        Self {
            name: name.into(),
            ty,
            hint_string: String::new(),
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint_string = hint.into();
        self
    }
}

/// Signature metadata of a method or signal
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MethodInfo {
    pub name: String,
    pub args: Vec<PropertyInfo>,
    pub return_type: VariantType,
}

impl MethodInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
            return_type: VariantType::Nil,
        }
    }

    pub fn with_arg(mut self, arg: PropertyInfo) -> Self {
        self.args.push(arg);
        self
    }

    pub fn returning(mut self, ty: VariantType) -> Self {
        self.return_type = ty;
        self
    }
}

/// Notification codes the host delivers through [`crate::ScriptInstance::notification`]
pub mod notification {
    pub const POSTINITIALIZE: i32 = 0;
    pub const PREDELETE: i32 = 1;
    pub const READY: i32 = 13;
}
