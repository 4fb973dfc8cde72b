//! Host payloads and host closures living in the guest heap
//!
//! Both are full userdata whose block holds a Rust value written in place.
//! Each kind has its own metatable in the registry: a `__gc` metamethod
//! drops the value when the guest collector reclaims the block, and a
//! locked `__metatable` field keeps guest code from swapping it out.

use super::state::{Core, GuestState};
use super::VmResult;
use mlua::ffi;
use std::any::Any;
use std::ffi::CStr;
use std::fmt;
use std::mem;
use std::os::raw::{c_char, c_int, c_void};
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const PAYLOAD_META: &CStr = c"luna.payload";
const FUNCTION_META: &CStr = c"luna.function";

/// A host function callable from guest code
///
/// The function sees its arguments at stack indices `1..=n`, pushes its
/// results and returns how many of them the caller receives.
pub type HostFn = Box<dyn Fn(&GuestState) -> VmResult<i32> + Send + Sync>;

/// Full userdata payload: a shared host value owned by the guest heap
#[derive(Clone)]
pub struct Userdata {
    id: u64,
    payload: Arc<dyn Any + Send + Sync>,
}

impl Userdata {
    /// Box a host value as userdata
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self::from_arc(Arc::new(value))
    }

    /// Wrap an already shared payload
    pub fn from_arc(payload: Arc<dyn Any + Send + Sync>) -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            payload,
        }
    }

    /// Identity of this payload
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The boxed payload
    pub fn payload(&self) -> &Arc<dyn Any + Send + Sync> {
        &self.payload
    }

    /// Borrow the payload as `T` if it has that type
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        (*self.payload).downcast_ref::<T>()
    }
}

impl fmt::Debug for Userdata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Userdata({})", self.id)
    }
}

// ============================================================================
// Raw helpers (callers reserve stack space)
// ============================================================================

/// Move `value` into a new userdata block tagged with `meta`
///
/// Pushes the userdata. Needs three free slots.
unsafe fn push_block<T>(l: *mut ffi::lua_State, value: T, meta: &CStr) {
    let block = ffi::lua_newuserdatauv(l, mem::size_of::<T>(), 0) as *mut T;
    ptr::write(block, value);
    if ffi::luaL_newmetatable(l, meta.as_ptr()) != 0 {
        ffi::lua_pushcclosure(l, collect::<T>, 0);
        ffi::lua_setfield(l, -2, c"__gc".as_ptr());
        ffi::lua_pushboolean(l, 0);
        ffi::lua_setfield(l, -2, c"__metatable".as_ptr());
    }
    ffi::lua_setmetatable(l, -2);
}

/// `__gc` metamethod dropping the block's value
///
/// The metatable is cleared afterwards so a resurrected block is never
/// read again.
unsafe extern "C-unwind" fn collect<T>(l: *mut ffi::lua_State) -> c_int {
    let block = ffi::lua_touserdata(l, 1) as *mut T;
    if !block.is_null() {
        let _ = panic::catch_unwind(AssertUnwindSafe(|| ptr::drop_in_place(block)));
        ffi::lua_pushnil(l);
        ffi::lua_setmetatable(l, 1);
    }
    0
}

/// Push host payload userdata. Needs three free slots.
pub(crate) unsafe fn push_payload(l: *mut ffi::lua_State, userdata: Userdata) {
    push_block(l, userdata, PAYLOAD_META);
}

/// Payload of the userdata at `index`, if it was pushed by [`push_payload`]
///
/// Needs two free slots.
pub(crate) unsafe fn read_payload(l: *mut ffi::lua_State, index: c_int) -> Option<Userdata> {
    let block = ffi::luaL_testudata(l, index, PAYLOAD_META.as_ptr()) as *const Userdata;
    if block.is_null() {
        None
    } else {
        Some((*block).clone())
    }
}

/// Push `func` as a guest closure bound to `core`. Needs three free slots.
pub(crate) unsafe fn push_function(l: *mut ffi::lua_State, core: *const Core, func: HostFn) {
    push_block(l, func, FUNCTION_META);
    ffi::lua_pushlightuserdata(l, core as *mut c_void);
    ffi::lua_pushcclosure(l, call_host, 2);
}

// ============================================================================
// Host closure entry point
// ============================================================================

/// Entry point of every host closure
///
/// Errors are raised into the guest only after every Rust value of the
/// call has been dropped, since raising unwinds with `longjmp`.
unsafe extern "C-unwind" fn call_host(l: *mut ffi::lua_State) -> c_int {
    let message = match invoke(l) {
        Ok(n) => return n,
        Err(message) => message,
    };
    ffi::lua_pushlstring(l, message.as_ptr() as *const c_char, message.len());
    drop(message);
    ffi::lua_error(l)
}

unsafe fn invoke(l: *mut ffi::lua_State) -> Result<c_int, String> {
    let func = ffi::lua_touserdata(l, ffi::lua_upvalueindex(1)) as *const HostFn;
    let core = ffi::lua_touserdata(l, ffi::lua_upvalueindex(2)) as *const Core;
    if func.is_null() || core.is_null() {
        return Err("host function is no longer available".to_string());
    }
    let view = GuestState::view(core);
    let previous = (*core).enter(l);
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| (*func)(&view)));
    (*core).leave(previous);

    match outcome {
        Ok(Ok(n)) => Ok(n.clamp(0, ffi::lua_gettop(l))),
        Ok(Err(err)) => Err(err.to_string()),
        Err(_) => Err("host function panicked".to_string()),
    }
}
