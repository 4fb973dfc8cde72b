//! Embedded guest VM
//!
//! A safe wrapper over the raw Lua 5.4 C API exposed by `mlua::ffi`:
//! - One evaluation stack per state, addressed by relative, negative and
//!   pseudo indices
//! - The registry table, used to pin values under integer keys
//! - Host closures and boxed host payloads as full userdata
//! - Protected calls and chunk loading
//!
//! The interpreter, its collector and the standard library are the real
//! ones; this module only checks indices and stack space before handing
//! each primitive to the C API.

pub mod state;
pub mod userdata;

pub use state::GuestState;
pub use userdata::Userdata;

use mlua::ffi;
use std::fmt;
use std::os::raw::c_int;

/// Pseudo-index addressing the registry table
pub const REGISTRY_INDEX: i32 = ffi::LUA_REGISTRYINDEX;

/// `pcall` result count that keeps every returned value
pub const MULTRET: i32 = ffi::LUA_MULTRET;

/// Registry key handed out when nil is pinned
pub const REF_NIL: i32 = ffi::LUA_REFNIL;

/// Registry key that never refers to a value
pub const NO_REF: i32 = ffi::LUA_NOREF;

/// Status codes returned by [`GuestState::pcall`] and [`GuestState::load`]
pub mod status {
    use mlua::ffi;

    /// Call completed
    pub const OK: i32 = ffi::LUA_OK;
    /// Runtime error raised by the callee
    pub const ERR_RUN: i32 = ffi::LUA_ERRRUN;
    /// Chunk failed to compile
    pub const ERR_SYNTAX: i32 = ffi::LUA_ERRSYNTAX;
    /// Memory allocation error
    pub const ERR_MEM: i32 = ffi::LUA_ERRMEM;
    /// Error while running the message handler
    pub const ERR_ERR: i32 = ffi::LUA_ERRERR;
}

/// Dynamic type tag of a guest value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LuaType {
    /// No value at the queried index
    None,
    /// The nil sentinel
    Nil,
    /// Boolean
    Boolean,
    /// Raw pointer-sized userdata
    LightUserdata,
    /// Number (integer or float subtype)
    Number,
    /// Immutable byte string
    String,
    /// Associative table
    Table,
    /// Guest or host function
    Function,
    /// Full userdata
    Userdata,
    /// Coroutine
    Thread,
}

impl LuaType {
    pub(crate) fn from_raw(tag: c_int) -> Self {
        match tag {
            ffi::LUA_TNIL => LuaType::Nil,
            ffi::LUA_TBOOLEAN => LuaType::Boolean,
            ffi::LUA_TLIGHTUSERDATA => LuaType::LightUserdata,
            ffi::LUA_TNUMBER => LuaType::Number,
            ffi::LUA_TSTRING => LuaType::String,
            ffi::LUA_TTABLE => LuaType::Table,
            ffi::LUA_TFUNCTION => LuaType::Function,
            ffi::LUA_TUSERDATA => LuaType::Userdata,
            ffi::LUA_TTHREAD => LuaType::Thread,
            _ => LuaType::None,
        }
    }

    /// Guest-facing type name
    pub const fn name(self) -> &'static str {
        match self {
            LuaType::None => "no value",
            LuaType::Nil => "nil",
            LuaType::Boolean => "boolean",
            LuaType::LightUserdata => "userdata",
            LuaType::Number => "number",
            LuaType::String => "string",
            LuaType::Table => "table",
            LuaType::Function => "function",
            LuaType::Userdata => "userdata",
            LuaType::Thread => "thread",
        }
    }
}

impl fmt::Display for LuaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Guest VM errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum VmError {
    /// Stack limit reached or the C stack could not grow
    #[error("Stack overflow")]
    StackOverflow,

    /// Fewer values on the stack than the operation consumes
    #[error("Stack underflow")]
    StackUnderflow,

    /// Stack index does not address a value
    #[error("Invalid stack index: {0}")]
    InvalidIndex(i32),

    /// Value has the wrong type for the operation
    #[error("Type error: {0}")]
    TypeError(String),

    /// Chunk name or global name unusable by the C API
    #[error("Invalid name: {0}")]
    InvalidName(String),

    /// Runtime error raised by guest code or a host closure
    #[error("{0}")]
    Runtime(String),

    /// The state has been closed
    #[error("Guest state is closed")]
    Closed,
}

/// Guest VM result
pub type VmResult<T> = Result<T, VmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_names() {
        assert_eq!(LuaType::from_raw(ffi::LUA_TTABLE), LuaType::Table);
        assert_eq!(LuaType::from_raw(ffi::LUA_TNONE), LuaType::None);
        assert_eq!(LuaType::LightUserdata.to_string(), "userdata");
        assert_eq!(LuaType::Thread.name(), "thread");
    }

    #[test]
    fn test_status_codes_are_distinct() {
        let codes = [
            status::OK,
            status::ERR_RUN,
            status::ERR_SYNTAX,
            status::ERR_MEM,
            status::ERR_ERR,
        ];
        for (i, a) in codes.iter().enumerate() {
            for b in &codes[i + 1..] {
                assert_ne!(a, b);
            }
        }
        assert_eq!(status::OK, 0);
    }
}
