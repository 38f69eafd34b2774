//! Error taxonomy for resolution, dispatch and library lifecycle

use crate::abi::CallStatus;
use crate::host::ObjectId;
use crate::library::{LoadError, SymbolError};
use thiserror::Error;

pub type ScriptResult<T> = Result<T, ScriptError>;

#[derive(Debug, Error)]
pub enum ScriptError {
    /// Descriptor not available yet (library not initialized, class missing,
    /// or instance user-data detached for a reload)
    #[error("class '{class}' in library '{library}' is not resolved")]
    UnresolvedClass { library: String, class: String },

    /// Method, property or signal absent across the whole chain
    #[error("'{name}' not found")]
    NotFound { name: String },

    /// Native call rejected its arguments
    #[error("call to '{method}' failed: {status}")]
    ArgumentError { method: String, status: CallStatus },

    #[error("library '{library}' failed to initialize: {reason}")]
    LibraryInitFailed { library: String, reason: String },

    #[error("library '{library}' has been terminated")]
    AlreadyTerminated { library: String },

    #[error("library '{library}' is not loaded in this runtime")]
    LibraryNotLoaded { library: String },

    #[error("object {owner} already has an instance of '{class}'")]
    AlreadyBound { owner: ObjectId, class: String },

    #[error("constructor of '{class}' produced no instance")]
    InstanceCreateFailed { class: String },

    #[error("instance on object {owner} has been released")]
    InstanceReleased { owner: ObjectId },

    #[error("'{operation}' must run on the main context")]
    NotMainContext { operation: &'static str },

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Symbol(#[from] SymbolError),
}

impl ScriptError {
    pub fn not_found(name: impl Into<String>) -> Self {
        Self::NotFound { name: name.into() }
    }

    /// Recoverable by retrying after the owning library initializes
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::UnresolvedClass { .. })
    }
}

/// A rejected class, method, property or signal registration
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrationError {
    #[error("registration name is empty")]
    EmptyName,

    #[error("class '{0}' is already registered")]
    DuplicateClass(String),

    #[error("class '{0}' is not registered")]
    UnknownClass(String),

    #[error("class '{0}' cannot inherit from itself")]
    SelfInheritance(String),

    #[error("'{name}' is missing its {what} callback")]
    MissingCallback { name: String, what: &'static str },
}
