//! Luna host bridge
//!
//! This crate connects host code to an embedded Lua 5.4 VM:
//! - Sessions serializing all access to one guest state
//! - Handles pinning guest values, reclaimed by a background finalizer
//! - Marshalling between guest stack slots and host values
//! - Reflective dispatch against explicitly registered host classes
//! - Projection of guest tables into host maps and sequences
//!
//! Every operation that touches a guest stack runs under the owning
//! session's reentrant lock and leaves the stack depth as it found it.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod bindings;
pub mod cleaner;
pub mod collection;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod handle;
pub mod marshal;
pub mod object;
pub mod session;
pub mod value;
pub mod vm;

pub use bindings::BRIDGE_LIB;
pub use cleaner::Cleaner;
pub use config::SessionOptions;
pub use dispatch::{
    Arg, ClassBuilder, ClassId, ClassRegistry, Invocation, Invoke, MemberKind, ParamType, Target,
};
pub use error::{BridgeError, BridgeResult, HostError, MarshalError};
pub use handle::Handle;
pub use marshal::{
    convert_number, push_host_value, to_host_value, HostNumber, Narrow, NumericType,
};
pub use object::{
    ArrayRef, BooleanRef, FunctionRef, GuestObject, NumberRef, StringRef, TableRef, TypedValue,
    UserdataRef,
};
pub use session::{Session, SessionId, StackGuard};
pub use value::{FromHost, HostMap, HostObject, HostValue};

pub use vm::{status, GuestState, LuaType, VmError, VmResult, MULTRET};
