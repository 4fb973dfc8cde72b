//! Handle registry
//!
//! A [`Handle`] pins one guest value in its session's registry. The slot is
//! freed exactly once: by [`Handle::release`], or by the finalizer queue
//! after the last clone of the handle is dropped.

use crate::error::{BridgeError, BridgeResult};
use crate::marshal::{push_host_value, to_host_value};
use crate::session::{Session, StackGuard};
use crate::value::HostValue;
use crate::vm::{status, GuestState, LuaType, MULTRET, REGISTRY_INDEX};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

use crate::cleaner::Tracker;

/// Idempotent release of one registry slot
struct ReleaseTask {
    session: Weak<Session>,
    key: i32,
    released: AtomicBool,
}

impl ReleaseTask {
    fn run(&self) {
        if self
            .released
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let Some(session) = self.session.upgrade() else {
            warn!(key = self.key, "cannot release handle: session destroyed");
            return;
        };
        let state = session.lock();
        if state.is_closed() {
            warn!(key = self.key, session = %session.id(), "cannot release handle: session closed");
            return;
        }
        match state.registry_unref(self.key) {
            Ok(_) => debug!(key = self.key, session = %session.id(), "handle released"),
            Err(err) => warn!(key = self.key, error = %err, "handle release failed"),
        }
    }

    fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

struct Slot {
    session: Arc<Session>,
    key: i32,
    identity: usize,
    release: Arc<ReleaseTask>,
    _tracker: Tracker,
}

/// Host-side proxy for one guest value
///
/// Cloning is cheap and shares the registry slot.
#[derive(Clone)]
pub struct Handle {
    slot: Arc<Slot>,
}

impl Handle {
    /// Pin the value at `index` and return a handle to it
    pub fn capture(session: &Arc<Session>, index: i32) -> BridgeResult<Handle> {
        let state = session.lock();
        session.ensure_open()?;
        if state.type_of(index) == LuaType::None {
            return Err(crate::vm::VmError::InvalidIndex(index).into());
        }
        // The copy is consumed by registry_ref; the guard covers its failure
        let (identity, key) = {
            let _guard = StackGuard::new(&state);
            state.push_value(index)?;
            (state.to_pointer(-1), state.registry_ref()?)
        };
        drop(state);

        let release = Arc::new(ReleaseTask {
            session: Arc::downgrade(session),
            key,
            released: AtomicBool::new(false),
        });
        let task = release.clone();
        let tracker = session.cleaner().register(move || task.run());
        debug!(key, session = %session.id(), "handle captured");

        Ok(Handle {
            slot: Arc::new(Slot {
                session: session.clone(),
                key,
                identity,
                release,
                _tracker: tracker,
            }),
        })
    }

    /// Registry key of the pinned value
    pub fn key(&self) -> i32 {
        self.slot.key
    }

    /// Owning session
    pub fn session(&self) -> &Arc<Session> {
        &self.slot.session
    }

    /// Check if the registry slot has been freed
    pub fn is_released(&self) -> bool {
        self.slot.release.is_released()
    }

    /// Free the registry slot
    ///
    /// Later calls are no-ops. A closed session is logged, not reported.
    pub fn release(&self) {
        self.slot.release.run();
    }

    /// Push the pinned value onto the owning session's stack
    pub fn push(&self) -> BridgeResult<()> {
        let state = self.session().lock();
        if self.is_released() || state.is_closed() {
            return Err(BridgeError::UseAfterRelease);
        }
        state.raw_get_i(REGISTRY_INDEX, self.key() as i64)?;
        Ok(())
    }

    /// Push the value and run `f` with the stack restored afterwards
    pub(crate) fn with_pushed<R>(
        &self,
        f: impl FnOnce(&GuestState) -> BridgeResult<R>,
    ) -> BridgeResult<R> {
        let state = self.session().lock();
        let _guard = StackGuard::new(&state);
        self.push()?;
        f(&*state)
    }

    // ========================================================================
    // Type queries
    // ========================================================================

    /// Guest type of the pinned value
    pub fn lua_type(&self) -> BridgeResult<LuaType> {
        self.with_pushed(|state| Ok(state.type_of(-1)))
    }

    /// Check for nil
    pub fn is_nil(&self) -> BridgeResult<bool> {
        Ok(self.lua_type()? == LuaType::Nil)
    }

    /// Check for a boolean
    pub fn is_boolean(&self) -> BridgeResult<bool> {
        Ok(self.lua_type()? == LuaType::Boolean)
    }

    /// Check for a number or numeric string
    pub fn is_number(&self) -> BridgeResult<bool> {
        self.with_pushed(|state| Ok(state.is_number(-1)))
    }

    /// Check for a string or number
    pub fn is_string(&self) -> BridgeResult<bool> {
        self.with_pushed(|state| Ok(state.is_string(-1)))
    }

    /// Check for a table
    pub fn is_table(&self) -> BridgeResult<bool> {
        Ok(self.lua_type()? == LuaType::Table)
    }

    /// Check for a function
    pub fn is_function(&self) -> BridgeResult<bool> {
        Ok(self.lua_type()? == LuaType::Function)
    }

    /// Check for full or light userdata
    pub fn is_userdata(&self) -> BridgeResult<bool> {
        self.with_pushed(|state| Ok(state.is_userdata(-1)))
    }

    /// Guest truthiness
    pub fn to_boolean(&self) -> BridgeResult<bool> {
        self.with_pushed(|state| Ok(state.to_boolean(-1)))
    }

    /// Numeric value, converting numeric strings
    pub fn to_number(&self) -> BridgeResult<Option<f64>> {
        self.with_pushed(|state| Ok(state.to_number(-1)))
    }

    /// String value, formatting numbers
    pub fn to_string(&self) -> BridgeResult<Option<String>> {
        self.with_pushed(|state| Ok(state.to_string(-1)))
    }

    /// Project the pinned value into a host value
    pub fn to_host_value(&self) -> BridgeResult<HostValue> {
        let session = self.session().clone();
        self.with_pushed(|_| to_host_value(&session, -1))
    }

    // ========================================================================
    // Indexing
    // ========================================================================

    /// Handle to `self[name]`
    pub fn get_field(&self, name: &str) -> BridgeResult<Handle> {
        self.index_with(|state| state.push_string(name).map_err(Into::into))
    }

    /// Handle to `self[n]`
    pub fn get_index(&self, n: f64) -> BridgeResult<Handle> {
        self.index_with(|state| state.push_number(n).map_err(Into::into))
    }

    /// Handle to `self[key]`
    pub fn get_by(&self, key: &Handle) -> BridgeResult<Handle> {
        if key.session().id() != self.session().id() {
            return Err(BridgeError::InvalidTarget(
                "key handle belongs to another session".to_string(),
            ));
        }
        self.index_with(|_| key.push())
    }

    fn index_with(
        &self,
        push_key: impl FnOnce(&GuestState) -> BridgeResult<()>,
    ) -> BridgeResult<Handle> {
        let session = self.session().clone();
        self.with_pushed(|state| {
            let kind = state.type_of(-1);
            if kind != LuaType::Table {
                return Err(BridgeError::InvalidTarget(format!(
                    "attempt to index a {} value",
                    kind
                )));
            }
            push_key(state)?;
            state.get_table(-2)?;
            Handle::capture(&session, -1)
        })
    }

    // ========================================================================
    // Calls
    // ========================================================================

    /// Call the pinned function with host arguments
    ///
    /// `nresults` is the number of results to keep, or [`MULTRET`] for all
    /// of them. A guest error becomes [`BridgeError::GuestRuntime`].
    pub fn call(&self, args: &[HostValue], nresults: i32) -> BridgeResult<Vec<HostValue>> {
        if nresults < MULTRET {
            return Err(BridgeError::InvalidArgument(format!(
                "invalid number of results: {}",
                nresults
            )));
        }
        let session = self.session().clone();
        let state = session.lock();
        let guard = StackGuard::new(&state);
        self.push()?;
        for arg in args {
            push_host_value(&session, arg)?;
        }

        let code = state.pcall(args.len() as i32, nresults, 0)?;
        if code != status::OK {
            let message = state.to_string(-1).unwrap_or_default();
            return Err(BridgeError::guest_runtime(code, &message));
        }

        let returned = state.get_top() - guard.depth();
        let mut results = Vec::with_capacity(returned.max(0) as usize);
        for i in 0..returned {
            results.push(to_host_value(&session, guard.depth() + 1 + i)?);
        }
        Ok(results)
    }

    /// Call the pinned function and keep its first result
    pub fn call1(&self, args: &[HostValue]) -> BridgeResult<HostValue> {
        let mut results = self.call(args, 1)?;
        Ok(results.pop().unwrap_or_default())
    }
}

impl PartialEq for Handle {
    fn eq(&self, other: &Self) -> bool {
        if Arc::ptr_eq(&self.slot, &other.slot) {
            return true;
        }
        if self.session().id() != other.session().id()
            || self.slot.identity != other.slot.identity
        {
            return false;
        }
        let state = self.session().lock();
        let guard = StackGuard::new(&state);
        let equal = self.push().is_ok()
            && other.push().is_ok()
            && state.raw_equal(guard.depth() + 1, guard.depth() + 2);
        drop(guard);
        equal
    }
}

impl Eq for Handle {}

impl Hash for Handle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.session().id().hash(state);
        self.slot.identity.hash(state);
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("session", &self.session().id())
            .field("key", &self.key())
            .field("released", &self.is_released())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_and_push() {
        let session = Session::new();
        let state = session.lock();
        state.push_string("pinned").unwrap();
        let handle = Handle::capture(&session, -1).unwrap();
        state.pop(1).unwrap();
        assert_eq!(state.get_top(), 0);
        assert_eq!(session.registry_len(), 1);

        handle.push().unwrap();
        assert_eq!(state.to_string(-1).as_deref(), Some("pinned"));
    }

    #[test]
    fn test_release_is_idempotent() {
        let session = Session::new();
        {
            let state = session.lock();
            state.new_table().unwrap();
        }
        let handle = Handle::capture(&session, -1).unwrap();
        assert_eq!(session.registry_len(), 1);

        handle.release();
        handle.release();
        assert!(handle.is_released());
        assert_eq!(session.registry_len(), 0);
        assert!(matches!(handle.push(), Err(BridgeError::UseAfterRelease)));
    }

    #[test]
    fn test_release_after_close_is_silent() {
        let session = Session::new();
        session.lock().push_boolean(true).unwrap();
        let handle = Handle::capture(&session, 1).unwrap();
        session.close();
        handle.release();
        assert!(matches!(handle.push(), Err(BridgeError::UseAfterRelease)));
    }

    #[test]
    fn test_capture_at_stack_limit_keeps_stack() {
        let session =
            Session::with_options(crate::config::SessionOptions::new().with_stack_limit(4));
        let state = session.lock();
        for _ in 0..4 {
            state.push_boolean(true).unwrap();
        }

        assert!(matches!(
            Handle::capture(&session, 1),
            Err(BridgeError::Vm(crate::vm::VmError::StackOverflow))
        ));
        assert_eq!(state.get_top(), 4);
        assert_eq!(session.registry_len(), 0);

        state.pop(1).unwrap();
        let handle = Handle::capture(&session, 1).unwrap();
        assert_eq!(state.get_top(), 3);
        assert_eq!(session.registry_len(), 1);
        handle.release();
    }

    #[test]
    fn test_capture_invalid_index() {
        let session = Session::new();
        assert!(Handle::capture(&session, 3).is_err());
    }

    #[test]
    fn test_type_queries_keep_stack() {
        let session = Session::new();
        session.lock().push_number(4.0).unwrap();
        let handle = Handle::capture(&session, 1).unwrap();

        assert_eq!(handle.lua_type().unwrap(), LuaType::Number);
        assert!(handle.is_number().unwrap());
        assert!(handle.is_string().unwrap());
        assert_eq!(handle.to_number().unwrap(), Some(4.0));
        assert_eq!(handle.to_string().unwrap().as_deref(), Some("4.0"));
        assert_eq!(session.get_top(), 1);
    }

    #[test]
    fn test_equality_by_guest_identity() {
        let session = Session::new();
        let state = session.lock();
        state.new_table().unwrap();
        state.new_table().unwrap();
        let a1 = Handle::capture(&session, 1).unwrap();
        let a2 = Handle::capture(&session, 1).unwrap();
        let b = Handle::capture(&session, 2).unwrap();
        assert_eq!(a1, a2);
        assert_ne!(a1, b);
    }

    #[test]
    fn test_get_field_on_non_table() {
        let session = Session::new();
        session.lock().push_number(1.0).unwrap();
        let handle = Handle::capture(&session, 1).unwrap();
        assert!(matches!(
            handle.get_field("x"),
            Err(BridgeError::InvalidTarget(_))
        ));
        assert_eq!(session.get_top(), 1);
    }
}
