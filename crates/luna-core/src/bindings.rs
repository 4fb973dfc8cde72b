//! Guest-facing bridge library
//!
//! Installs a global `bridge` table whose functions route guest calls into
//! the dispatch resolver:
//!
//! - `bridge.invoke(target, name, ...)` calls a method
//! - `bridge.get(target, name)` reads a field
//! - `bridge.set(target, name, value)` writes a field
//! - `bridge.new(class, ...)` constructs an instance
//! - `bridge.class(name)` looks up a registered class
//! - `bridge.aget(array, i)` reads element `i` of an array-like instance
//! - `bridge.aset(array, i, value)` writes element `i`
//!
//! Element positions are 1-based, as guest sequences are.
//!
//! A class argument is either a value returned by `bridge.class` or a
//! class name.

use crate::dispatch::{self, Target};
use crate::error::{BridgeError, BridgeResult};
use crate::session::{Session, SessionId, StackGuard};
use crate::vm::{GuestState, LuaType, VmError, VmResult};
use std::sync::Arc;
use tracing::debug;

/// Name of the global holding the bridge library
pub const BRIDGE_LIB: &str = "bridge";

fn to_vm_error(err: BridgeError) -> VmError {
    match err {
        BridgeError::Vm(err) => err,
        other => VmError::Runtime(other.to_string()),
    }
}

/// Wrap a bridge function as a guest closure bound to session `id`
fn bridge_fn<F>(id: SessionId, f: F) -> impl Fn(&GuestState) -> VmResult<i32> + Send + Sync + 'static
where
    F: Fn(&Arc<Session>, &GuestState) -> BridgeResult<usize> + Send + Sync + 'static,
{
    move |state: &GuestState| {
        let session = Session::get_existing(id).ok_or(VmError::Closed)?;
        let _lock = session.lock();
        f(&session, state).map(|n| n as i32).map_err(to_vm_error)
    }
}

fn string_arg(state: &GuestState, index: i32, what: &str) -> BridgeResult<String> {
    match state.type_of(index) {
        LuaType::String | LuaType::Number => Ok(state.to_string(index).unwrap_or_default()),
        other => Err(BridgeError::InvalidArgument(format!(
            "bad argument #{} ({} expected, got {})",
            index, what, other
        ))),
    }
}

fn position_arg(state: &GuestState, index: i32) -> BridgeResult<i64> {
    match state.to_number(index) {
        Some(n) if state.type_of(index) == LuaType::Number => Ok(n as i64),
        _ => Err(BridgeError::InvalidArgument(format!(
            "bad argument #{} (position expected, got {})",
            index,
            state.type_of(index)
        ))),
    }
}

fn nargs_from(state: &GuestState, first: i32) -> usize {
    (state.get_top() - first + 1).max(0) as usize
}

fn invoke(session: &Arc<Session>, state: &GuestState) -> BridgeResult<usize> {
    let target = Target::from_stack(state, 1)?;
    let name = string_arg(state, 2, "method name")?;
    dispatch::object_index(session, &target, &name, 3, nargs_from(state, 3))
}

fn get(session: &Arc<Session>, state: &GuestState) -> BridgeResult<usize> {
    let target = Target::from_stack(state, 1)?;
    let name = string_arg(state, 2, "field name")?;
    dispatch::field_read(session, &target, &name)?;
    Ok(1)
}

fn set(session: &Arc<Session>, state: &GuestState) -> BridgeResult<usize> {
    let target = Target::from_stack(state, 1)?;
    let name = string_arg(state, 2, "field name")?;
    if state.type_of(3) == LuaType::None {
        state.push_nil()?;
    }
    dispatch::field_write(session, &target, &name, 3)?;
    Ok(0)
}

fn aget(session: &Arc<Session>, state: &GuestState) -> BridgeResult<usize> {
    let target = Target::from_stack(state, 1)?;
    let position = position_arg(state, 2)?;
    dispatch::array_index(session, &target, position)?;
    Ok(1)
}

fn aset(session: &Arc<Session>, state: &GuestState) -> BridgeResult<usize> {
    let target = Target::from_stack(state, 1)?;
    let position = position_arg(state, 2)?;
    if state.type_of(3) == LuaType::None {
        state.push_nil()?;
    }
    dispatch::array_new_index(session, &target, position, 3)?;
    Ok(0)
}

fn new(session: &Arc<Session>, state: &GuestState) -> BridgeResult<usize> {
    let class = match state.type_of(1) {
        LuaType::String => {
            let name = string_arg(state, 1, "class")?;
            session
                .classes()
                .by_name(&name)
                .map(|def| def.id)
                .ok_or_else(|| BridgeError::InvalidTarget(format!("unknown class '{}'", name)))?
        }
        _ => match Target::from_stack(state, 1)? {
            Target::Class(id) => id,
            Target::Instance(object) => {
                return Err(BridgeError::InvalidTarget(format!(
                    "{} is not a class",
                    object.type_name()
                )))
            }
        },
    };
    dispatch::construct(session, class, 2, nargs_from(state, 2))?;
    Ok(1)
}

fn class(session: &Arc<Session>, state: &GuestState) -> BridgeResult<usize> {
    let name = string_arg(state, 1, "class name")?;
    match session.classes().by_name(&name) {
        Some(def) => session.push_class(def.id)?,
        None => state.push_nil()?,
    }
    Ok(1)
}

impl Session {
    /// Install the `bridge` library into the guest globals
    pub fn open_bridge_lib(self: &Arc<Self>) -> BridgeResult<()> {
        let state = self.lock();
        self.ensure_open()?;
        let _guard = StackGuard::new(&state);
        let id = self.id();

        state.new_table()?;
        state.push_closure(bridge_fn(id, invoke))?;
        state.set_field(-2, "invoke")?;
        state.push_closure(bridge_fn(id, get))?;
        state.set_field(-2, "get")?;
        state.push_closure(bridge_fn(id, set))?;
        state.set_field(-2, "set")?;
        state.push_closure(bridge_fn(id, new))?;
        state.set_field(-2, "new")?;
        state.push_closure(bridge_fn(id, class))?;
        state.set_field(-2, "class")?;
        state.push_closure(bridge_fn(id, aget))?;
        state.set_field(-2, "aget")?;
        state.push_closure(bridge_fn(id, aset))?;
        state.set_field(-2, "aset")?;
        state.set_global(BRIDGE_LIB)?;

        debug!(session = %id, "bridge library installed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionOptions;
    use crate::dispatch::{ClassBuilder, ClassRegistry, ParamType};
    use crate::object::FunctionRef;
    use crate::value::{HostObject, HostValue};
    use crate::vm::status;
    use parking_lot::Mutex;

    struct Box2(f64, f64);

    struct Row(Mutex<Vec<f64>>);

    fn row(this: &HostObject) -> Result<&Row, crate::error::HostError> {
        this.downcast_ref::<Row>().ok_or_else(|| "not a row".into())
    }

    fn bridged() -> Arc<Session> {
        let classes = Arc::new(ClassRegistry::new());
        classes
            .register(
                ClassBuilder::for_type::<Box2>("Box2")
                    .constructor([ParamType::Double, ParamType::Double], |call| {
                        let w = call.arg(0).as_f64().unwrap_or_default();
                        let h = call.arg(1).as_f64().unwrap_or_default();
                        Ok(HostObject::new(Box2(w, h)))
                    })
                    .field("width", ParamType::Double, |this| {
                        let b = this.downcast_ref::<Box2>().ok_or("not a box")?;
                        Ok(HostValue::Number(b.0))
                    })
                    .method("area", Vec::new(), |call| {
                        let b = call.this::<Box2>()?;
                        Ok(Some(HostValue::Number(b.0 * b.1)))
                    })
                    .method("apply", [ParamType::Function], |call| {
                        let f = call.arg(0).as_function().ok_or("function expected")?;
                        let b = call.this::<Box2>()?;
                        Ok(Some(f.call1(&[HostValue::Number(b.0)])?))
                    }),
            )
            .unwrap();
        classes
            .register(
                ClassBuilder::for_type::<Row>("Row")
                    .constructor([ParamType::Int], |call| {
                        let len = call.arg(0).as_i64().unwrap_or_default().max(0) as usize;
                        Ok(HostObject::new(Row(Mutex::new(vec![0.0; len]))))
                    })
                    .elements_mut(
                        ParamType::Double,
                        |this| Ok(row(this)?.0.lock().len()),
                        |this, i| Ok(HostValue::Number(row(this)?.0.lock()[i])),
                        |this, i, value| {
                            row(this)?.0.lock()[i] = value.as_f64().unwrap_or_default();
                            Ok(())
                        },
                    ),
            )
            .unwrap();
        let session = Session::with_options(SessionOptions::new().with_classes(classes));
        session.open_bridge_lib().unwrap();
        session
    }

    fn lib_fn(session: &Arc<Session>, name: &str) -> FunctionRef {
        let lib = session.capture_global(BRIDGE_LIB).unwrap();
        FunctionRef::from_handle(lib.get_field(name).unwrap())
    }

    #[test]
    fn test_new_and_invoke() {
        let session = bridged();
        let new = lib_fn(&session, "new");
        let object = new
            .call1(&["Box2".into(), 2.0.into(), 3.0.into()])
            .unwrap();
        assert!(matches!(object, HostValue::Object(_)));

        let invoke = lib_fn(&session, "invoke");
        let area = invoke.call1(&[object.clone(), "area".into()]).unwrap();
        assert_eq!(area, HostValue::Number(6.0));

        let get = lib_fn(&session, "get");
        assert_eq!(
            get.call1(&[object, "width".into()]).unwrap(),
            HostValue::Number(2.0)
        );
        assert_eq!(session.get_top(), 0);
    }

    #[test]
    fn test_class_lookup() {
        let session = bridged();
        let class = lib_fn(&session, "class");
        let found = class.call1(&["Box2".into()]).unwrap();
        let new = lib_fn(&session, "new");
        let object = new.call1(&[found, 1.0.into(), 1.0.into()]).unwrap();
        assert!(matches!(object, HostValue::Object(_)));
        assert_eq!(class.call1(&["Nope".into()]).unwrap(), HostValue::Nil);
    }

    #[test]
    fn test_reentrant_callback() {
        let session = bridged();
        let object = session
            .new_instance("Box2", &[4.0.into(), 1.0.into()])
            .unwrap();

        session.lock().push_closure(|state| {
            let n = state.to_number(1).unwrap_or_default();
            state.push_number(n * 10.0)?;
            Ok(1)
        })
        .unwrap();
        let callback = session.lock().get_top();
        let callback = FunctionRef::capture(&session, callback).unwrap();
        session.lock().pop(1).unwrap();

        let invoke = lib_fn(&session, "invoke");
        let result = invoke
            .call1(&[object.into(), "apply".into(), HostValue::Function(callback)])
            .unwrap();
        assert_eq!(result, HostValue::Number(40.0));
        assert_eq!(session.get_top(), 0);
    }

    #[test]
    fn test_errors_surface_as_guest_errors() {
        let session = bridged();
        let invoke = lib_fn(&session, "invoke");
        let object = session
            .new_instance("Box2", &[1.0.into(), 1.0.into()])
            .unwrap();

        let err = invoke
            .call1(&[object.into(), "missing".into()])
            .unwrap_err();
        match err {
            BridgeError::GuestRuntime { code, message } => {
                assert_eq!(code, status::ERR_RUN);
                assert!(message.contains("No such member 'missing'"));
            }
            other => panic!("expected guest error, got {:?}", other),
        }
        assert_eq!(session.get_top(), 0);
    }

    #[test]
    fn test_guest_source_drives_bridge() {
        let session = bridged();
        let results = session
            .exec(
                "main",
                r#"
                local box = bridge.new("Box2", 2, 3)
                local doubled = bridge.invoke(box, "apply", function(w) return w * 2 end)
                return bridge.invoke(box, "area"), bridge.get(box, "width"), doubled
                "#,
            )
            .unwrap();
        assert_eq!(
            results,
            vec![
                HostValue::Number(6.0),
                HostValue::Number(2.0),
                HostValue::Number(4.0)
            ]
        );
        assert_eq!(session.get_top(), 0);
    }

    #[test]
    fn test_guest_catches_bridge_errors() {
        let session = bridged();
        let results = session
            .exec(
                "main",
                r#"
                local box = bridge.new("Box2", 1, 1)
                local ok, err = pcall(bridge.invoke, box, "missing")
                return ok, err
                "#,
            )
            .unwrap();
        assert_eq!(results[0], HostValue::Boolean(false));
        match &results[1] {
            HostValue::String(message) => assert!(message.contains("No such member 'missing'")),
            other => panic!("expected error message, got {:?}", other),
        }
    }

    #[test]
    fn test_array_elements_from_guest() {
        let session = bridged();
        let results = session
            .exec(
                "main",
                r#"
                local row = bridge.new("Row", 3)
                bridge.aset(row, 1, 1.5)
                bridge.aset(row, 3, 7)
                return bridge.aget(row, 1), bridge.aget(row, 2), bridge.aget(row, 3)
                "#,
            )
            .unwrap();
        assert_eq!(
            results,
            vec![
                HostValue::Number(1.5),
                HostValue::Number(0.0),
                HostValue::Number(7.0)
            ]
        );
        assert_eq!(session.get_top(), 0);
    }

    #[test]
    fn test_array_element_errors() {
        let session = bridged();
        session
            .exec(
                "main",
                "row = bridge.new('Row', 2)\nbox = bridge.new('Box2', 1, 1)",
            )
            .unwrap();
        let cases = [
            ("return bridge.aget(row, 3)", "Index out of bounds: 3 (length 2)"),
            ("return bridge.aget(row, 0)", "Index out of bounds: 0 (length 2)"),
            ("bridge.aset(row, 5, 1)", "Index out of bounds: 5 (length 2)"),
            ("bridge.aset(row, 1, 'x')", "invalid type string for an element of Row"),
            ("return bridge.aget(box, 1)", "object indexed is not an array"),
            ("return bridge.aget(row, 'first')", "position expected, got string"),
        ];
        for (source, expected) in cases {
            let state = session.lock();
            state.push_string("below").unwrap();
            match session.exec("main", source) {
                Err(BridgeError::GuestRuntime { code, message }) => {
                    assert_eq!(code, status::ERR_RUN);
                    assert!(message.contains(expected), "{}: {}", source, message);
                }
                other => panic!("{}: unexpected result {:?}", source, other),
            }
            assert_eq!(state.get_top(), 1);
            state.pop(1).unwrap();
        }
        assert_eq!(session.get_top(), 0);
    }
}
