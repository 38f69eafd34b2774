//! qnative - expose classes from native libraries to a host object system
//!
//! A library registers classes (methods, properties, signals, a
//! constructor/destructor pair and a base class) from its setup entry point.
//! The [`Runtime`] tracks libraries and their classes, a [`Script`] names one
//! class, and a [`ScriptInstance`] binds that class to one host object and
//! dispatches host calls into the library.

pub mod abi;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod ffi;
pub mod host;
pub mod instance;
pub mod library;
pub mod logging;
pub mod registrar;
pub mod runtime;
pub mod script;

pub use abi::{BindingFunctions, CallStatus, EntryPoint, NativeCallback};
pub use config::{ConfigError, LibraryConfig, RuntimeConfig};
pub use descriptor::{ClassDescriptor, ClassResolver, ClassSummary};
pub use error::{RegistrationError, ScriptError, ScriptResult};
pub use host::{notification, MethodInfo, ObjectId, PropertyInfo, RpcMode, Variant, VariantType};
pub use instance::{Lifecycle, ScriptInstance};
pub use library::{
    DynamicLibrary, EmbeddedLibrary, LibraryBackend, LibraryId, LibraryState, NativeLibrary,
};
pub use registrar::ClassRegistrar;
pub use runtime::{InitStatus, InstanceBindingData, ReloadReport, Runtime};
pub use script::Script;
