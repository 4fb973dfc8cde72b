//! Guest VM sessions
//!
//! A session owns one guest state behind a reentrant lock. Every stack or
//! registry access in the bridge runs inside that lock; a thread already
//! holding it may take it again, which guest-to-host callbacks rely on.

use crate::cleaner::Cleaner;
use crate::config::SessionOptions;
use crate::dispatch::{self, ClassId, ClassRegistry, Target};
use crate::error::{BridgeError, BridgeResult};
use crate::handle::Handle;
use crate::marshal::{push_host_value, to_host_value};
use crate::object::FunctionRef;
use crate::value::{HostObject, HostValue};
use crate::vm::{status, GuestState, Userdata, MULTRET};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

/// Unique identifier of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    /// Create a new unique session ID
    pub fn new() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        SessionId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Live sessions, looked up by guest callbacks
static SESSIONS: Lazy<DashMap<SessionId, Weak<Session>>> = Lazy::new(DashMap::new);

/// One embedded guest VM instance
pub struct Session {
    id: SessionId,
    state: ReentrantMutex<GuestState>,
    classes: Arc<ClassRegistry>,
    cleaner: Arc<Cleaner>,
    max_projection_depth: usize,
}

impl Session {
    /// Create a session with default options
    pub fn new() -> Arc<Self> {
        Self::with_options(SessionOptions::default())
    }

    /// Create a session with specific options
    pub fn with_options(options: SessionOptions) -> Arc<Self> {
        let session = Arc::new(Self {
            id: SessionId::new(),
            state: ReentrantMutex::new(GuestState::with_stack_limit(options.stack_limit)),
            classes: options.classes,
            cleaner: options.cleaner,
            max_projection_depth: options.max_projection_depth,
        });
        SESSIONS.insert(session.id, Arc::downgrade(&session));
        debug!(session = %session.id, "session created");
        session
    }

    /// Find a live session by id
    pub fn get_existing(id: SessionId) -> Option<Arc<Session>> {
        SESSIONS.get(&id).and_then(|entry| entry.value().upgrade())
    }

    /// Session id
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Enter the session's exclusive region
    pub fn lock(&self) -> ReentrantMutexGuard<'_, GuestState> {
        self.state.lock()
    }

    /// Check if the session has been closed
    pub fn is_closed(&self) -> bool {
        self.state.lock().is_closed()
    }

    /// Fail with `UseAfterRelease` once the session is closed
    pub fn ensure_open(&self) -> BridgeResult<()> {
        if self.is_closed() {
            Err(BridgeError::UseAfterRelease)
        } else {
            Ok(())
        }
    }

    /// Destroy the guest state
    ///
    /// Outstanding handles become unusable. Closing twice is a no-op.
    pub fn close(&self) {
        let state = self.state.lock();
        if state.is_closed() {
            return;
        }
        state.close();
        drop(state);
        SESSIONS.remove(&self.id);
        debug!(session = %self.id, "session closed");
    }

    /// Host classes visible to this session
    pub fn classes(&self) -> &Arc<ClassRegistry> {
        &self.classes
    }

    /// Finalizer queue of this session's handles
    pub fn cleaner(&self) -> &Arc<Cleaner> {
        &self.cleaner
    }

    /// Bound on deep projection nesting
    pub fn max_projection_depth(&self) -> usize {
        self.max_projection_depth
    }

    /// Number of values pinned in the guest registry
    pub fn registry_len(&self) -> usize {
        self.state.lock().registry_len()
    }

    /// Current guest stack depth
    pub fn get_top(&self) -> i32 {
        self.state.lock().get_top()
    }

    // ========================================================================
    // Convenience API
    // ========================================================================

    /// Compile a text chunk into a guest function without running it
    ///
    /// A compile error becomes [`BridgeError::GuestRuntime`] with the
    /// syntax error status.
    pub fn load(self: &Arc<Self>, chunk_name: &str, source: &str) -> BridgeResult<FunctionRef> {
        let state = self.lock();
        self.ensure_open()?;
        let _guard = StackGuard::new(&state);
        let code = state.load(source, chunk_name)?;
        if code != status::OK {
            let message = state.to_string(-1).unwrap_or_default();
            return Err(BridgeError::guest_runtime(code, &message));
        }
        FunctionRef::capture(self, -1)
    }

    /// Compile and run a text chunk, returning every value it returns
    pub fn exec(self: &Arc<Self>, chunk_name: &str, source: &str) -> BridgeResult<Vec<HostValue>> {
        let chunk = self.load(chunk_name, source)?;
        let results = chunk.call(&[], MULTRET);
        chunk.handle().release();
        results
    }

    /// Read a global as a host value
    pub fn global(self: &Arc<Self>, name: &str) -> BridgeResult<HostValue> {
        let state = self.lock();
        self.ensure_open()?;
        let guard = StackGuard::new(&state);
        state.get_global(name)?;
        let value = to_host_value(self, -1);
        drop(guard);
        value
    }

    /// Bind a host value to a global
    pub fn set_global(&self, name: &str, value: &HostValue) -> BridgeResult<()> {
        let state = self.lock();
        self.ensure_open()?;
        let guard = StackGuard::new(&state);
        push_host_value(self, value)?;
        state.set_global(name)?;
        guard.defuse();
        Ok(())
    }

    /// Capture a global as a handle
    pub fn capture_global(self: &Arc<Self>, name: &str) -> BridgeResult<Handle> {
        let state = self.lock();
        self.ensure_open()?;
        let _guard = StackGuard::new(&state);
        state.get_global(name)?;
        Handle::capture(self, -1)
    }

    /// Push a host object as userdata
    pub fn push_object(&self, object: HostObject) -> BridgeResult<()> {
        let state = self.lock();
        self.ensure_open()?;
        state.push_userdata(Userdata::new(object))?;
        Ok(())
    }

    /// Push a registered class as userdata
    pub fn push_class(&self, class: ClassId) -> BridgeResult<()> {
        self.classes.get(class)?;
        self.push_object(HostObject::new(class))
    }

    /// Call a method on a host target with host arguments
    ///
    /// Returns `Nil` for methods without a result.
    pub fn call_method(
        self: &Arc<Self>,
        target: &Target,
        name: &str,
        args: &[HostValue],
    ) -> BridgeResult<HostValue> {
        let state = self.lock();
        self.ensure_open()?;
        let _guard = StackGuard::new(&state);
        let first = state.get_top() + 1;
        for arg in args {
            push_host_value(self, arg)?;
        }
        let pushed = dispatch::object_index(self, target, name, first, args.len())?;
        if pushed == 0 {
            return Ok(HostValue::Nil);
        }
        to_host_value(self, -1)
    }

    /// Read a field of a host target
    pub fn get_field(self: &Arc<Self>, target: &Target, name: &str) -> BridgeResult<HostValue> {
        let state = self.lock();
        self.ensure_open()?;
        let _guard = StackGuard::new(&state);
        dispatch::field_read(self, target, name)?;
        to_host_value(self, -1)
    }

    /// Write a field of a host target
    pub fn set_field(
        self: &Arc<Self>,
        target: &Target,
        name: &str,
        value: &HostValue,
    ) -> BridgeResult<()> {
        let state = self.lock();
        self.ensure_open()?;
        let _guard = StackGuard::new(&state);
        push_host_value(self, value)?;
        dispatch::field_write(self, target, name, -1)
    }

    /// Read element `position` (1-based) of an array-like host object
    pub fn get_element(self: &Arc<Self>, target: &Target, position: i64) -> BridgeResult<HostValue> {
        let state = self.lock();
        self.ensure_open()?;
        let _guard = StackGuard::new(&state);
        dispatch::array_index(self, target, position)?;
        to_host_value(self, -1)
    }

    /// Write element `position` (1-based) of an array-like host object
    pub fn set_element(
        self: &Arc<Self>,
        target: &Target,
        position: i64,
        value: &HostValue,
    ) -> BridgeResult<()> {
        let state = self.lock();
        self.ensure_open()?;
        let _guard = StackGuard::new(&state);
        push_host_value(self, value)?;
        dispatch::array_new_index(self, target, position, -1)
    }

    /// Construct an instance of a class registered under `class_name`
    pub fn new_instance(
        self: &Arc<Self>,
        class_name: &str,
        args: &[HostValue],
    ) -> BridgeResult<HostObject> {
        dispatch::new_instance_by_name(self, class_name, args)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.state.get_mut().close();
        SESSIONS.remove(&self.id);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("max_projection_depth", &self.max_projection_depth)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Stack Guard
// ============================================================================

/// RAII guard restoring the guest stack depth
///
/// The depth recorded at creation is restored when the guard is dropped,
/// on success and error paths alike, unless [`StackGuard::defuse`] is
/// called first.
pub struct StackGuard<'a> {
    state: &'a GuestState,
    top: i32,
    armed: bool,
}

impl<'a> StackGuard<'a> {
    /// Record the current depth
    pub fn new(state: &'a GuestState) -> Self {
        Self {
            state,
            top: state.get_top(),
            armed: true,
        }
    }

    /// Recorded depth
    pub fn depth(&self) -> i32 {
        self.top
    }

    /// Keep whatever the stack holds now
    pub fn defuse(mut self) {
        self.armed = false;
    }
}

impl Drop for StackGuard<'_> {
    fn drop(&mut self) {
        if self.armed && !self.state.is_closed() {
            let _ = self.state.set_top(self.top);
        }
    }
}
