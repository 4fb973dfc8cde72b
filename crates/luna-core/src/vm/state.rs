//! Guest state and its embedding API
//!
//! [`GuestState`] owns one `lua_State` with the standard libraries opened.
//! Every method validates indices and reserves stack space before calling
//! into the C API, so a bad index surfaces as [`VmError::InvalidIndex`]
//! instead of undefined behavior. Operations that may run metamethods go
//! through a protected call.

use super::userdata::{self, Userdata};
use super::{status, LuaType, VmError, VmResult, REF_NIL, REGISTRY_INDEX};
use mlua::ffi;
use std::cell::Cell;
use std::ffi::CString;
use std::os::raw::{c_char, c_int, c_void};
use std::ptr;
use std::slice;
use tracing::{debug, error};

/// Default stack limit (in slots)
pub const DEFAULT_STACK_LIMIT: usize = 1024 * 64;

/// Shared part of a state, reachable from host closures
///
/// `active` is the thread currently running: the main thread, or the
/// coroutine a host closure was called from.
pub(crate) struct Core {
    main: Cell<*mut ffi::lua_State>,
    active: Cell<*mut ffi::lua_State>,
    closed: Cell<bool>,
    calls: Cell<u32>,
    pinned: Cell<usize>,
    stack_limit: usize,
}

impl Core {
    /// Make `l` the running thread, returning the previous one
    pub(crate) fn enter(&self, l: *mut ffi::lua_State) -> *mut ffi::lua_State {
        self.active.replace(l)
    }

    /// Restore the thread saved by [`Core::enter`]
    pub(crate) fn leave(&self, previous: *mut ffi::lua_State) {
        self.active.set(previous);
    }

    /// Free the C state once no call is in flight
    fn finish_close(&self) {
        if self.calls.get() > 0 {
            return;
        }
        let main = self.main.replace(ptr::null_mut());
        self.active.set(ptr::null_mut());
        if !main.is_null() {
            // SAFETY: `main` came from luaL_newstate and is closed once
            unsafe { ffi::lua_close(main) };
        }
    }
}

enum Owner {
    Owned(Box<Core>),
    View(*const Core),
}

/// A guest VM instance
///
/// `Send` but not `Sync`: the state may move between threads, but every
/// access must be serialized by its owner.
pub struct GuestState {
    owner: Owner,
}

// SAFETY: the C state is only touched through `&self` by the thread that
// holds the owner's lock; nothing in it is bound to the creating thread.
unsafe impl Send for GuestState {}

impl Default for GuestState {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for GuestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestState")
            .field("closed", &self.is_closed())
            .field("top", &self.get_top())
            .finish_non_exhaustive()
    }
}

fn to_c(n: usize) -> c_int {
    c_int::try_from(n).unwrap_or(c_int::MAX)
}

/// Copy the string at `index` out of the guest heap
///
/// # Safety
/// `index` must be valid and hold a string.
unsafe fn read_string(l: *mut ffi::lua_State, index: c_int) -> String {
    let mut len = 0usize;
    let data = ffi::lua_tolstring(l, index, &mut len);
    if data.is_null() {
        return String::new();
    }
    String::from_utf8_lossy(slice::from_raw_parts(data as *const u8, len)).into_owned()
}

unsafe extern "C-unwind" fn protected_get(l: *mut ffi::lua_State) -> c_int {
    ffi::lua_gettable(l, 1);
    1
}

unsafe extern "C-unwind" fn protected_set(l: *mut ffi::lua_State) -> c_int {
    ffi::lua_settable(l, 1);
    0
}

impl GuestState {
    /// Create a new state with the default stack limit
    pub fn new() -> Self {
        Self::with_stack_limit(DEFAULT_STACK_LIMIT)
    }

    /// Create a new state with a specific stack limit (in slots)
    ///
    /// If the C state cannot be allocated the returned state is closed.
    pub fn with_stack_limit(limit: usize) -> Self {
        // SAFETY: a fresh state is opened and used by this thread only
        let main = unsafe {
            let l = ffi::luaL_newstate();
            if !l.is_null() {
                ffi::luaL_openlibs(l);
            }
            l
        };
        if main.is_null() {
            error!("guest state allocation failed");
        }
        Self {
            owner: Owner::Owned(Box::new(Core {
                main: Cell::new(main),
                active: Cell::new(main),
                closed: Cell::new(main.is_null()),
                calls: Cell::new(0),
                pinned: Cell::new(0),
                stack_limit: limit,
            })),
        }
    }

    /// Non-owning state over `core`, handed to host closures
    pub(crate) fn view(core: *const Core) -> Self {
        Self {
            owner: Owner::View(core),
        }
    }

    fn core(&self) -> &Core {
        match &self.owner {
            Owner::Owned(core) => core,
            // SAFETY: views only live for the duration of a host closure,
            // while the owning state is alive
            Owner::View(core) => unsafe { &**core },
        }
    }

    /// Close the state, releasing every value it holds
    ///
    /// Closing twice is a no-op. Closing from inside a host closure takes
    /// effect once the outermost protected call returns.
    pub fn close(&self) {
        let core = self.core();
        if core.closed.replace(true) {
            return;
        }
        core.finish_close();
        debug!("guest state closed");
    }

    /// Check if the state has been closed
    pub fn is_closed(&self) -> bool {
        self.core().closed.get()
    }

    /// Running thread, or `Closed`
    fn raw(&self) -> VmResult<*mut ffi::lua_State> {
        let core = self.core();
        let l = core.active.get();
        if core.closed.get() || l.is_null() {
            Err(VmError::Closed)
        } else {
            Ok(l)
        }
    }

    /// Absolute index of an existing slot (pseudo-indices pass through)
    fn slot(&self, l: *mut ffi::lua_State, index: i32) -> VmResult<c_int> {
        if index == REGISTRY_INDEX {
            return Ok(index);
        }
        // SAFETY: `l` is the live running thread
        let top = unsafe { ffi::lua_gettop(l) };
        match index {
            i if i > 0 && i <= top => Ok(i),
            i if i < 0 && -i <= top => Ok(top + i + 1),
            _ => Err(VmError::InvalidIndex(index)),
        }
    }

    fn table_slot(&self, l: *mut ffi::lua_State, index: i32) -> VmResult<c_int> {
        let slot = self.slot(l, index)?;
        // SAFETY: `slot` was validated above
        let tag = unsafe { ffi::lua_type(l, slot) };
        if tag == ffi::LUA_TTABLE {
            Ok(slot)
        } else {
            Err(VmError::TypeError(format!(
                "attempt to index a {} value",
                LuaType::from_raw(tag)
            )))
        }
    }

    /// Make room for `n` more values
    fn reserve(&self, l: *mut ffi::lua_State, n: usize) -> VmResult<()> {
        // SAFETY: `l` is the live running thread
        let top = unsafe { ffi::lua_gettop(l) }.max(0) as usize;
        if top + n > self.core().stack_limit {
            return Err(VmError::StackOverflow);
        }
        // SAFETY: as above
        if unsafe { ffi::lua_checkstack(l, to_c(n)) } == 0 {
            return Err(VmError::StackOverflow);
        }
        Ok(())
    }

    fn require(&self, l: *mut ffi::lua_State, n: i32) -> VmResult<()> {
        // SAFETY: `l` is the live running thread
        if unsafe { ffi::lua_gettop(l) } < n {
            Err(VmError::StackUnderflow)
        } else {
            Ok(())
        }
    }

    // ========================================================================
    // Stack Manipulation
    // ========================================================================

    /// Number of values in the current frame (0 once closed)
    pub fn get_top(&self) -> i32 {
        match self.raw() {
            // SAFETY: live running thread
            Ok(l) => unsafe { ffi::lua_gettop(l) },
            Err(_) => 0,
        }
    }

    /// Set the top of the current frame, padding with nil when growing
    pub fn set_top(&self, index: i32) -> VmResult<()> {
        let l = self.raw()?;
        let top = self.get_top();
        let target = if index >= 0 { index } else { top + index + 1 };
        if target < 0 {
            return Err(VmError::StackUnderflow);
        }
        if target > top {
            self.reserve(l, (target - top) as usize)?;
        }
        // SAFETY: `target` is within the reserved frame
        unsafe { ffi::lua_settop(l, target) };
        Ok(())
    }

    /// Discard `n` values
    pub fn pop(&self, n: i32) -> VmResult<()> {
        let l = self.raw()?;
        let n = n.max(0);
        self.require(l, n)?;
        // SAFETY: at least `n` values are on the stack
        unsafe { ffi::lua_settop(l, -n - 1) };
        Ok(())
    }

    /// Check that `n` more values fit on the stack
    pub fn check_stack(&self, n: usize) -> bool {
        self.raw().and_then(|l| self.reserve(l, n)).is_ok()
    }

    /// Push a copy of the value at `index`
    pub fn push_value(&self, index: i32) -> VmResult<()> {
        let l = self.raw()?;
        let slot = self.slot(l, index)?;
        self.reserve(l, 1)?;
        // SAFETY: valid slot, one free slot reserved
        unsafe { ffi::lua_pushvalue(l, slot) };
        Ok(())
    }

    /// Remove the value at `index`, shifting the values above it down
    pub fn remove(&self, index: i32) -> VmResult<()> {
        let l = self.raw()?;
        let slot = self.slot(l, index)?;
        if slot == REGISTRY_INDEX {
            return Err(VmError::InvalidIndex(index));
        }
        // SAFETY: `slot` is a valid stack position
        unsafe {
            ffi::lua_rotate(l, slot, -1);
            ffi::lua_settop(l, -2);
        }
        Ok(())
    }

    /// Move the top value into `index`, shifting the values above it up
    pub fn insert(&self, index: i32) -> VmResult<()> {
        let l = self.raw()?;
        let slot = self.slot(l, index)?;
        if slot == REGISTRY_INDEX {
            return Err(VmError::InvalidIndex(index));
        }
        // SAFETY: `slot` is a valid stack position
        unsafe { ffi::lua_rotate(l, slot, 1) };
        Ok(())
    }

    // ========================================================================
    // Push Operations
    // ========================================================================

    /// Push nil
    pub fn push_nil(&self) -> VmResult<()> {
        let l = self.raw()?;
        self.reserve(l, 1)?;
        // SAFETY: one free slot reserved
        unsafe { ffi::lua_pushnil(l) };
        Ok(())
    }

    /// Push a boolean
    pub fn push_boolean(&self, b: bool) -> VmResult<()> {
        let l = self.raw()?;
        self.reserve(l, 1)?;
        // SAFETY: one free slot reserved
        unsafe { ffi::lua_pushboolean(l, b as c_int) };
        Ok(())
    }

    /// Push a number (float subtype)
    pub fn push_number(&self, n: f64) -> VmResult<()> {
        let l = self.raw()?;
        self.reserve(l, 1)?;
        // SAFETY: one free slot reserved
        unsafe { ffi::lua_pushnumber(l, n) };
        Ok(())
    }

    /// Push an integer
    pub fn push_integer(&self, n: i64) -> VmResult<()> {
        let l = self.raw()?;
        self.reserve(l, 1)?;
        // SAFETY: one free slot reserved
        unsafe { ffi::lua_pushinteger(l, n as ffi::lua_Integer) };
        Ok(())
    }

    /// Push a string
    pub fn push_string(&self, s: &str) -> VmResult<()> {
        let l = self.raw()?;
        self.reserve(l, 1)?;
        // SAFETY: one free slot reserved; the bytes are copied
        unsafe { ffi::lua_pushlstring(l, s.as_ptr() as *const c_char, s.len()) };
        Ok(())
    }

    /// Wrap a host function as a guest closure and push it
    pub fn push_closure<F>(&self, func: F) -> VmResult<()>
    where
        F: Fn(&GuestState) -> VmResult<i32> + Send + Sync + 'static,
    {
        let l = self.raw()?;
        self.reserve(l, 3)?;
        let core: *const Core = self.core();
        // SAFETY: three free slots reserved; `core` outlives every call
        // into the closure because closing waits for in-flight calls
        unsafe { userdata::push_function(l, core, Box::new(func)) };
        Ok(())
    }

    /// Push full userdata owning `userdata`
    pub fn push_userdata(&self, userdata: Userdata) -> VmResult<()> {
        let l = self.raw()?;
        self.reserve(l, 3)?;
        // SAFETY: three free slots reserved
        unsafe { userdata::push_payload(l, userdata) };
        Ok(())
    }

    /// Push a light userdata
    pub fn push_light_userdata(&self, ptr: usize) -> VmResult<()> {
        let l = self.raw()?;
        self.reserve(l, 1)?;
        // SAFETY: one free slot reserved; the pointer is never dereferenced
        unsafe { ffi::lua_pushlightuserdata(l, ptr as *mut c_void) };
        Ok(())
    }

    /// Create an empty table and push it
    pub fn new_table(&self) -> VmResult<()> {
        let l = self.raw()?;
        self.reserve(l, 1)?;
        // SAFETY: one free slot reserved
        unsafe { ffi::lua_createtable(l, 0, 0) };
        Ok(())
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Type of the value at `index` (`None` if there is none)
    pub fn type_of(&self, index: i32) -> LuaType {
        let Ok(l) = self.raw() else {
            return LuaType::None;
        };
        match self.slot(l, index) {
            // SAFETY: valid slot
            Ok(slot) => LuaType::from_raw(unsafe { ffi::lua_type(l, slot) }),
            Err(_) => LuaType::None,
        }
    }

    /// Check for nil
    pub fn is_nil(&self, index: i32) -> bool {
        self.type_of(index) == LuaType::Nil
    }

    /// Check for a boolean
    pub fn is_boolean(&self, index: i32) -> bool {
        self.type_of(index) == LuaType::Boolean
    }

    /// Check for a number or a string convertible to one
    pub fn is_number(&self, index: i32) -> bool {
        self.to_number(index).is_some()
    }

    /// Check for a string or a number
    pub fn is_string(&self, index: i32) -> bool {
        matches!(self.type_of(index), LuaType::String | LuaType::Number)
    }

    /// Check for a table
    pub fn is_table(&self, index: i32) -> bool {
        self.type_of(index) == LuaType::Table
    }

    /// Check for a function
    pub fn is_function(&self, index: i32) -> bool {
        self.type_of(index) == LuaType::Function
    }

    /// Check for full or light userdata
    pub fn is_userdata(&self, index: i32) -> bool {
        matches!(
            self.type_of(index),
            LuaType::Userdata | LuaType::LightUserdata
        )
    }

    /// Guest truthiness of the value at `index`
    pub fn to_boolean(&self, index: i32) -> bool {
        let Ok(l) = self.raw() else {
            return false;
        };
        match self.slot(l, index) {
            // SAFETY: valid slot
            Ok(slot) => unsafe { ffi::lua_toboolean(l, slot) != 0 },
            Err(_) => false,
        }
    }

    /// Numeric value at `index`, converting numeric strings
    pub fn to_number(&self, index: i32) -> Option<f64> {
        let l = self.raw().ok()?;
        let slot = self.slot(l, index).ok()?;
        let mut isnum: c_int = 0;
        // SAFETY: valid slot; conversion does not touch the stack
        let n = unsafe { ffi::lua_tonumberx(l, slot, &mut isnum) };
        (isnum != 0).then_some(n as f64)
    }

    /// String value at `index`, formatting numbers
    ///
    /// Numbers are formatted from a copy so a traversal key at `index` is
    /// never converted in place.
    pub fn to_string(&self, index: i32) -> Option<String> {
        let l = self.raw().ok()?;
        let slot = self.slot(l, index).ok()?;
        match self.type_of(slot) {
            // SAFETY: valid slot holding a string
            LuaType::String => Some(unsafe { read_string(l, slot) }),
            LuaType::Number => {
                self.reserve(l, 1).ok()?;
                // SAFETY: one free slot reserved; the copy is popped again
                unsafe {
                    ffi::lua_pushvalue(l, slot);
                    let text = read_string(l, -1);
                    ffi::lua_settop(l, -2);
                    Some(text)
                }
            }
            _ => None,
        }
    }

    /// Host payload of the userdata at `index`
    ///
    /// `None` for light userdata and for userdata not created by
    /// [`GuestState::push_userdata`].
    pub fn to_userdata(&self, index: i32) -> Option<Userdata> {
        let l = self.raw().ok()?;
        let slot = self.slot(l, index).ok()?;
        if slot == REGISTRY_INDEX {
            return None;
        }
        self.reserve(l, 2).ok()?;
        // SAFETY: valid slot, two free slots reserved
        unsafe { userdata::read_payload(l, slot) }
    }

    /// Identity of the reference value at `index` (0 for scalars)
    pub fn to_pointer(&self, index: i32) -> usize {
        let Ok(l) = self.raw() else {
            return 0;
        };
        match self.slot(l, index) {
            // SAFETY: valid slot
            Ok(slot) => unsafe { ffi::lua_topointer(l, slot) as usize },
            Err(_) => 0,
        }
    }

    /// Primitive equality of two stack values
    pub fn raw_equal(&self, a: i32, b: i32) -> bool {
        let Ok(l) = self.raw() else {
            return false;
        };
        match (self.slot(l, a), self.slot(l, b)) {
            // SAFETY: both slots valid
            (Ok(a), Ok(b)) => unsafe { ffi::lua_rawequal(l, a, b) != 0 },
            _ => false,
        }
    }

    /// Raw length of the value at `index`: string bytes, table border,
    /// userdata block size, 0 otherwise
    pub fn obj_len(&self, index: i32) -> usize {
        let Ok(l) = self.raw() else {
            return 0;
        };
        match self.slot(l, index) {
            // SAFETY: valid slot
            Ok(slot) => unsafe { ffi::lua_rawlen(l, slot) as usize },
            Err(_) => 0,
        }
    }

    // ========================================================================
    // Table Access
    // ========================================================================

    /// Push `t[n]` where `t` is the table at `index` (or the registry),
    /// without metamethods
    pub fn raw_get_i(&self, index: i32, n: i64) -> VmResult<()> {
        let l = self.raw()?;
        let slot = self.table_slot(l, index)?;
        self.reserve(l, 1)?;
        // SAFETY: table slot, one free slot reserved
        unsafe { ffi::lua_rawgeti(l, slot, n as ffi::lua_Integer) };
        Ok(())
    }

    /// Pop a value and store it as `t[n]` without metamethods
    pub fn raw_set_i(&self, index: i32, n: i64) -> VmResult<()> {
        let l = self.raw()?;
        let slot = self.table_slot(l, index)?;
        self.require(l, 1)?;
        // SAFETY: table slot, value on top
        unsafe { ffi::lua_rawseti(l, slot, n as ffi::lua_Integer) };
        Ok(())
    }

    /// Pop a key and push `t[key]` where `t` is at `index`
    ///
    /// Runs `__index` metamethods in protected mode; a raised error is
    /// returned as [`VmError::Runtime`] with the key popped.
    pub fn get_table(&self, index: i32) -> VmResult<()> {
        let l = self.raw()?;
        let slot = self.slot(l, index)?;
        self.require(l, 1)?;
        self.reserve(l, 2)?;
        // SAFETY: two free slots reserved; stack becomes [f, t, key]
        unsafe {
            ffi::lua_pushcclosure(l, protected_get, 0);
            ffi::lua_pushvalue(l, slot);
            ffi::lua_rotate(l, -3, 2);
        }
        self.protected(l, 2, 1)
    }

    /// Pop a value and a key and store `t[key] = value`
    ///
    /// Runs `__newindex` metamethods in protected mode.
    pub fn set_table(&self, index: i32) -> VmResult<()> {
        let l = self.raw()?;
        let slot = self.slot(l, index)?;
        self.require(l, 2)?;
        self.reserve(l, 2)?;
        // SAFETY: two free slots reserved; stack becomes [f, t, key, value]
        unsafe {
            ffi::lua_pushcclosure(l, protected_set, 0);
            ffi::lua_pushvalue(l, slot);
            ffi::lua_rotate(l, -4, 2);
        }
        self.protected(l, 3, 0)
    }

    fn protected(&self, l: *mut ffi::lua_State, nargs: c_int, nresults: c_int) -> VmResult<()> {
        // SAFETY: function and arguments are in place
        let code = unsafe { ffi::lua_pcall(l, nargs, nresults, 0) };
        if code == status::OK {
            return Ok(());
        }
        // SAFETY: a failed pcall leaves exactly the error value
        let message = unsafe {
            let message = read_string(l, -1);
            ffi::lua_settop(l, -2);
            message
        };
        Err(VmError::Runtime(message))
    }

    /// Push `t[name]` where `t` is at `index`
    pub fn get_field(&self, index: i32, name: &str) -> VmResult<()> {
        let l = self.raw()?;
        let slot = self.slot(l, index)?;
        self.push_string(name)?;
        self.get_table(slot)
    }

    /// Pop a value and store it as `t[name]`
    pub fn set_field(&self, index: i32, name: &str) -> VmResult<()> {
        let l = self.raw()?;
        let slot = self.slot(l, index)?;
        self.require(l, 1)?;
        self.push_string(name)?;
        // SAFETY: key and value swapped into [key, value]
        unsafe { ffi::lua_rotate(l, -2, 1) };
        self.set_table(slot)
    }

    fn push_globals(&self, l: *mut ffi::lua_State) -> VmResult<()> {
        self.reserve(l, 1)?;
        // SAFETY: one free slot reserved
        unsafe {
            ffi::lua_rawgeti(
                l,
                ffi::LUA_REGISTRYINDEX,
                ffi::LUA_RIDX_GLOBALS as ffi::lua_Integer,
            )
        };
        Ok(())
    }

    /// Push the global `name`
    pub fn get_global(&self, name: &str) -> VmResult<()> {
        let l = self.raw()?;
        let top = self.get_top();
        self.push_globals(l)?;
        let fetched = self.get_field(-1, name).and_then(|_| self.remove(-2));
        if fetched.is_err() {
            let _ = self.set_top(top);
        }
        fetched
    }

    /// Pop a value and bind it to the global `name`
    pub fn set_global(&self, name: &str) -> VmResult<()> {
        let l = self.raw()?;
        self.require(l, 1)?;
        let top = self.get_top() - 1;
        self.push_globals(l)?;
        let stored = self
            .insert(-2)
            .and_then(|_| self.set_field(-2, name))
            .and_then(|_| self.pop(1));
        if stored.is_err() {
            let _ = self.set_top(top);
        }
        stored
    }

    /// Table traversal step
    ///
    /// Pops a key and pushes the next key and value of the table at
    /// `index`, returning `true`. At the end nothing is pushed and `false`
    /// is returned. The key must come from the previous step (or be nil).
    pub fn next(&self, index: i32) -> VmResult<bool> {
        let l = self.raw()?;
        let slot = self.table_slot(l, index)?;
        self.require(l, 1)?;
        self.reserve(l, 2)?;
        // SAFETY: table slot, key on top, two free slots reserved
        Ok(unsafe { ffi::lua_next(l, slot) } != 0)
    }

    // ========================================================================
    // Registry
    // ========================================================================

    /// Pop the top value and pin it in the registry
    ///
    /// Nil is not pinned and yields [`REF_NIL`](super::REF_NIL).
    pub fn registry_ref(&self) -> VmResult<i32> {
        let l = self.raw()?;
        self.require(l, 1)?;
        // SAFETY: value on top
        let key = unsafe { ffi::luaL_ref(l, ffi::LUA_REGISTRYINDEX) };
        if key != REF_NIL {
            let pinned = &self.core().pinned;
            pinned.set(pinned.get() + 1);
        }
        Ok(key)
    }

    /// Unpin a registry key
    ///
    /// The key must come from [`GuestState::registry_ref`] and be unpinned
    /// at most once; the registry reuses freed keys.
    pub fn registry_unref(&self, key: i32) -> VmResult<()> {
        let l = self.raw()?;
        if key < 0 {
            return Ok(());
        }
        // SAFETY: live key handed out by luaL_ref
        unsafe { ffi::luaL_unref(l, ffi::LUA_REGISTRYINDEX, key) };
        let pinned = &self.core().pinned;
        pinned.set(pinned.get().saturating_sub(1));
        Ok(())
    }

    /// Number of values pinned through this state
    pub fn registry_len(&self) -> usize {
        if self.is_closed() {
            0
        } else {
            self.core().pinned.get()
        }
    }

    // ========================================================================
    // Calls and chunks
    // ========================================================================

    /// Protected call
    ///
    /// Calls the function below the top `nargs` values. On success the
    /// function and its arguments are replaced by `nresults` results (all
    /// of them for [`MULTRET`](super::MULTRET)) and [`status::OK`] is
    /// returned. On failure they are replaced by the error value and the
    /// error status is returned. A non-zero `errfunc` names a stack slot
    /// holding a message handler.
    pub fn pcall(&self, nargs: i32, nresults: i32, errfunc: i32) -> VmResult<i32> {
        let l = self.raw()?;
        let nargs = nargs.max(0);
        self.require(l, nargs + 1)?;
        let handler = if errfunc == 0 {
            0
        } else {
            self.slot(l, errfunc)?
        };
        if nresults > 0 {
            self.reserve(l, nresults as usize)?;
        }

        let core = self.core();
        core.calls.set(core.calls.get() + 1);
        // SAFETY: function and arguments are in place; errors raised by
        // the callee are caught by the C library
        let code = unsafe { ffi::lua_pcall(l, nargs, nresults, handler) };
        core.calls.set(core.calls.get() - 1);
        if core.closed.get() {
            core.finish_close();
        }
        Ok(code)
    }

    /// Call that reports guest errors as [`VmError::Runtime`]
    ///
    /// Same stack contract as [`GuestState::pcall`]; on error the message
    /// is popped.
    pub fn call(&self, nargs: i32, nresults: i32) -> VmResult<()> {
        let code = self.pcall(nargs, nresults, 0)?;
        if code == status::OK {
            return Ok(());
        }
        let message = self.to_string(-1).unwrap_or_default();
        self.pop(1)?;
        Err(VmError::Runtime(message))
    }

    /// Compile a text chunk and push it as a function
    ///
    /// Returns [`status::OK`], or an error status with the message pushed
    /// instead. Binary chunks are rejected.
    pub fn load(&self, source: &str, chunk_name: &str) -> VmResult<i32> {
        let l = self.raw()?;
        let name = CString::new(format!("={}", chunk_name))
            .map_err(|_| VmError::InvalidName(chunk_name.to_string()))?;
        self.reserve(l, 1)?;
        // SAFETY: one free slot reserved; source and name outlive the call
        let code = unsafe {
            ffi::luaL_loadbufferx(
                l,
                source.as_ptr() as *const c_char,
                source.len(),
                name.as_ptr(),
                c"t".as_ptr(),
            )
        };
        Ok(code)
    }

    /// Compile and run a chunk, discarding its results
    pub fn exec(&self, source: &str, chunk_name: &str) -> VmResult<()> {
        let code = self.load(source, chunk_name)?;
        if code != status::OK {
            let message = self.to_string(-1).unwrap_or_default();
            self.pop(1)?;
            return Err(VmError::Runtime(message));
        }
        self.call(0, 0)
    }
}

impl Drop for GuestState {
    fn drop(&mut self) {
        if let Owner::Owned(core) = &self.owner {
            core.closed.set(true);
            core.finish_close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::MULTRET;

    #[test]
    fn test_push_and_query() {
        let state = GuestState::new();
        state.push_nil().unwrap();
        state.push_boolean(true).unwrap();
        state.push_number(2.5).unwrap();
        state.push_string("10").unwrap();

        assert_eq!(state.get_top(), 4);
        assert_eq!(state.type_of(1), LuaType::Nil);
        assert_eq!(state.type_of(2), LuaType::Boolean);
        assert_eq!(state.type_of(-2), LuaType::Number);
        assert_eq!(state.type_of(5), LuaType::None);
        assert_eq!(state.to_number(-1), Some(10.0));
        assert_eq!(state.to_string(3).as_deref(), Some("2.5"));
        assert_eq!(state.type_of(3), LuaType::Number);
        assert!(state.is_number(-1));
        assert!(!state.to_boolean(1));
    }

    #[test]
    fn test_invalid_indices_are_rejected() {
        let state = GuestState::new();
        state.push_number(1.0).unwrap();
        assert_eq!(state.push_value(2), Err(VmError::InvalidIndex(2)));
        assert_eq!(state.push_value(-2), Err(VmError::InvalidIndex(-2)));
        assert_eq!(state.remove(0), Err(VmError::InvalidIndex(0)));
        assert_eq!(state.pop(2), Err(VmError::StackUnderflow));
        assert_eq!(state.to_string(7), None);
        assert_eq!(state.get_top(), 1);
    }

    #[test]
    fn test_stack_limit() {
        let state = GuestState::with_stack_limit(4);
        for _ in 0..4 {
            state.push_nil().unwrap();
        }
        assert_eq!(state.push_nil(), Err(VmError::StackOverflow));
        assert!(!state.check_stack(1));
        assert_eq!(state.get_top(), 4);
    }

    #[test]
    fn test_tables() {
        let state = GuestState::new();
        state.new_table().unwrap();
        state.push_number(7.0).unwrap();
        state.set_field(1, "x").unwrap();
        state.push_string("a").unwrap();
        state.raw_set_i(1, 1).unwrap();

        state.get_field(1, "x").unwrap();
        assert_eq!(state.to_number(-1), Some(7.0));
        state.pop(1).unwrap();

        state.raw_get_i(1, 1).unwrap();
        assert_eq!(state.to_string(-1).as_deref(), Some("a"));
        state.pop(1).unwrap();

        assert_eq!(state.obj_len(1), 1);
        assert_eq!(state.get_top(), 1);
    }

    #[test]
    fn test_index_error_is_caught() {
        let state = GuestState::new();
        state.push_number(1.0).unwrap();
        assert!(matches!(state.get_field(1, "x"), Err(VmError::Runtime(_))));
        assert!(matches!(state.raw_get_i(1, 1), Err(VmError::TypeError(_))));
        assert_eq!(state.get_top(), 1);
    }

    #[test]
    fn test_index_runs_metamethods() {
        let state = GuestState::new();
        state
            .exec("proxy = setmetatable({}, { __index = function(_, k) return k .. '!' end })", "meta")
            .unwrap();
        state.get_global("proxy").unwrap();
        state.get_field(-1, "hi").unwrap();
        assert_eq!(state.to_string(-1).as_deref(), Some("hi!"));
        assert_eq!(state.get_top(), 2);
    }

    #[test]
    fn test_next_traversal() {
        let state = GuestState::new();
        state.new_table().unwrap();
        for (i, name) in ["a", "b", "c"].iter().enumerate() {
            state.push_number(i as f64).unwrap();
            state.set_field(1, name).unwrap();
        }

        let mut count = 0;
        state.push_nil().unwrap();
        while state.next(1).unwrap() {
            count += 1;
            state.pop(1).unwrap();
        }
        assert_eq!(count, 3);
        assert_eq!(state.get_top(), 1);
    }

    #[test]
    fn test_registry_ref_unref() {
        let state = GuestState::new();
        state.push_string("pinned").unwrap();
        let key = state.registry_ref().unwrap();
        assert_eq!(state.get_top(), 0);
        assert_eq!(state.registry_len(), 1);

        state.raw_get_i(REGISTRY_INDEX, key as i64).unwrap();
        assert_eq!(state.to_string(-1).as_deref(), Some("pinned"));

        state.registry_unref(key).unwrap();
        assert_eq!(state.registry_len(), 0);

        state.push_nil().unwrap();
        assert_eq!(state.registry_ref().unwrap(), REF_NIL);
        assert_eq!(state.registry_len(), 0);
    }

    #[test]
    fn test_pcall_results() {
        let state = GuestState::new();
        state
            .push_closure(|s| {
                let a = s.to_number(1).unwrap_or(0.0);
                let b = s.to_number(2).unwrap_or(0.0);
                s.push_number(a + b)?;
                s.push_number(a * b)?;
                Ok(2)
            })
            .unwrap();
        state.push_number(3.0).unwrap();
        state.push_number(4.0).unwrap();

        assert_eq!(state.pcall(2, 1, 0).unwrap(), status::OK);
        assert_eq!(state.get_top(), 1);
        assert_eq!(state.to_number(-1), Some(7.0));
    }

    #[test]
    fn test_pcall_multret() {
        let state = GuestState::new();
        assert_eq!(state.load("return 1, 2, 3", "three").unwrap(), status::OK);
        assert_eq!(state.pcall(0, MULTRET, 0).unwrap(), status::OK);
        assert_eq!(state.get_top(), 3);
        assert_eq!(state.to_number(3), Some(3.0));
    }

    #[test]
    fn test_host_error_becomes_guest_error() {
        let state = GuestState::new();
        state.push_number(99.0).unwrap();
        state
            .push_closure(|_| Err(VmError::Runtime("boom".to_string())))
            .unwrap();
        state.push_number(1.0).unwrap();

        assert_eq!(state.pcall(1, 0, 0).unwrap(), status::ERR_RUN);
        assert_eq!(state.get_top(), 2);
        assert_eq!(state.to_string(-1).as_deref(), Some("boom"));
        assert_eq!(state.to_number(1), Some(99.0));
    }

    #[test]
    fn test_host_panic_is_contained() {
        let state = GuestState::new();
        state.push_closure(|_| panic!("host bug")).unwrap();
        assert_eq!(state.pcall(0, 0, 0).unwrap(), status::ERR_RUN);
        assert_eq!(
            state.to_string(-1).as_deref(),
            Some("host function panicked")
        );
    }

    #[test]
    fn test_guest_calls_host_closure() {
        let state = GuestState::new();
        state
            .push_closure(|s| {
                let n = s.to_number(1).unwrap_or(0.0);
                s.push_number(n * 2.0)?;
                Ok(1)
            })
            .unwrap();
        state.set_global("double").unwrap();
        state.exec("result = double(21)", "calls").unwrap();

        state.get_global("result").unwrap();
        assert_eq!(state.to_number(-1), Some(42.0));
    }

    #[test]
    fn test_host_closure_in_coroutine() {
        let state = GuestState::new();
        state
            .push_closure(|s| {
                let n = s.to_number(1).unwrap_or(0.0);
                s.push_number(n + 1.0)?;
                Ok(1)
            })
            .unwrap();
        state.set_global("inc").unwrap();
        state
            .exec(
                "local co = coroutine.wrap(function(x) coroutine.yield(inc(x)) end)\nresult = co(1)",
                "coroutine",
            )
            .unwrap();
        state.get_global("result").unwrap();
        assert_eq!(state.to_number(-1), Some(2.0));
        assert_eq!(state.get_top(), 1);
    }

    #[test]
    fn test_syntax_error() {
        let state = GuestState::new();
        assert_eq!(state.load("return +", "broken").unwrap(), status::ERR_SYNTAX);
        assert!(state.to_string(-1).unwrap_or_default().starts_with("broken:"));
        assert_eq!(state.get_top(), 1);
    }

    #[test]
    fn test_message_handler() {
        let state = GuestState::new();
        state
            .push_closure(|s| {
                let msg = s.to_string(1).unwrap_or_default();
                s.push_string(&format!("handled: {}", msg))?;
                Ok(1)
            })
            .unwrap();
        state
            .push_closure(|_| Err(VmError::Runtime("bad".to_string())))
            .unwrap();

        assert_eq!(state.pcall(0, 0, 1).unwrap(), status::ERR_RUN);
        assert_eq!(state.get_top(), 2);
        assert_eq!(state.to_string(-1).as_deref(), Some("handled: bad"));
    }

    #[test]
    fn test_userdata_payload() {
        let state = GuestState::new();
        state.push_userdata(Userdata::new(42u32)).unwrap();
        state.push_light_userdata(0x10).unwrap();

        let payload = state.to_userdata(1).unwrap();
        assert_eq!(payload.downcast_ref::<u32>(), Some(&42));
        assert!(state.to_userdata(2).is_none());
        assert_eq!(state.type_of(1), LuaType::Userdata);
        assert_eq!(state.type_of(2), LuaType::LightUserdata);
        assert_eq!(state.get_top(), 2);
    }

    #[test]
    fn test_collector_drops_payload() {
        use std::sync::Arc;

        let state = GuestState::new();
        let payload = Arc::new(());
        state
            .push_userdata(Userdata::from_arc(payload.clone()))
            .unwrap();
        assert_eq!(Arc::strong_count(&payload), 2);

        state.pop(1).unwrap();
        state.exec("collectgarbage('collect')", "gc").unwrap();
        assert_eq!(Arc::strong_count(&payload), 1);
    }

    #[test]
    fn test_close() {
        let state = GuestState::new();
        state.push_number(1.0).unwrap();
        state.close();
        state.close();
        assert!(state.is_closed());
        assert_eq!(state.get_top(), 0);
        assert_eq!(state.push_nil(), Err(VmError::Closed));
    }

    #[test]
    fn test_close_inside_callback_is_deferred() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        let state = GuestState::new();
        let seen_closed = Arc::new(AtomicBool::new(false));
        let flag = seen_closed.clone();
        state
            .push_closure(move |s| {
                s.close();
                flag.store(s.is_closed(), Ordering::SeqCst);
                Ok(0)
            })
            .unwrap();
        assert_eq!(state.pcall(0, 0, 0).unwrap(), status::OK);
        assert!(seen_closed.load(Ordering::SeqCst));
        assert!(state.is_closed());
        assert_eq!(state.push_nil(), Err(VmError::Closed));
    }
}
