//! Member resolution
//!
//! Methods and fields are looked up from the most-derived class toward the
//! base. Within one class, overloads are tried in declaration order and the
//! first whose parameters all accept the arguments wins, even when a later
//! overload would be a closer fit.
//!
//! Elements of array-like instances are addressed with 1-based guest
//! positions and bounds-checked before the host accessor runs.

use super::class::{ClassDef, ElementsDef, FieldDef, Invoke, MethodDef};
use super::coerce::{accepts, extract, Arg, ParamType};
use super::ClassId;
use crate::error::{BridgeError, BridgeResult};
use crate::marshal::push_host_value;
use crate::session::{Session, StackGuard};
use crate::value::{HostObject, HostValue};
use crate::vm::GuestState;
use std::sync::Arc;
use tracing::debug;

/// Receiver of a member access
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    /// Static access through the class
    Class(ClassId),
    /// Access through an instance
    Instance(HostObject),
}

impl Target {
    /// Read the target from userdata at `index`
    ///
    /// Userdata holding a [`ClassId`] designates the class itself.
    pub fn from_stack(state: &GuestState, index: i32) -> BridgeResult<Target> {
        let object = state
            .to_userdata(index)
            .and_then(|ud| ud.downcast_ref::<HostObject>().cloned())
            .ok_or_else(|| {
                BridgeError::InvalidTarget(format!("{} is not a host object", state.type_of(index)))
            })?;
        Ok(match object.downcast_ref::<ClassId>() {
            Some(id) => Target::Class(*id),
            None => Target::Instance(object),
        })
    }

    /// Class searched for members
    pub fn class_id(&self, session: &Session) -> BridgeResult<ClassId> {
        match self {
            Target::Class(id) => Ok(*id),
            Target::Instance(object) => session.classes().class_of(object).ok_or_else(|| {
                BridgeError::InvalidTarget(format!("unregistered host type {}", object.type_name()))
            }),
        }
    }

    /// Instance receiver, absent for static access
    pub fn receiver(&self) -> Option<&HostObject> {
        match self {
            Target::Class(_) => None,
            Target::Instance(object) => Some(object),
        }
    }
}

impl From<ClassId> for Target {
    fn from(id: ClassId) -> Self {
        Target::Class(id)
    }
}

impl From<HostObject> for Target {
    fn from(object: HostObject) -> Self {
        Target::Instance(object)
    }
}

/// What a member name refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberKind {
    /// No member with that name
    None,
    /// A field; its value was pushed
    Field,
    /// One or more methods
    Method,
}

/// A resolved method call, ready to run
#[derive(Debug)]
pub struct Invocation {
    class: String,
    method: MethodDef,
    this: Option<HostObject>,
    args: Vec<Arg>,
}

impl Invocation {
    /// Name of the resolved method
    pub fn name(&self) -> &str {
        &self.method.name
    }

    /// Class declaring the resolved method
    pub fn class_name(&self) -> &str {
        &self.class
    }

    /// Declared parameters of the resolved overload
    pub fn params(&self) -> &[ParamType] {
        &self.method.params
    }

    /// Coerced arguments
    pub fn args(&self) -> &[Arg] {
        &self.args
    }

    /// Run the method
    ///
    /// Host failures are wrapped in [`BridgeError::Invocation`] with the
    /// original error as source.
    pub fn invoke(&self, session: &Arc<Session>) -> BridgeResult<Option<HostValue>> {
        if !self.method.is_static && self.this.is_none() {
            return Err(BridgeError::invocation(
                self.name(),
                format!("instance method '{}' called without a receiver", self.name()),
            ));
        }
        let call = Invoke::new(session, self.this.as_ref(), &self.args);
        (self.method.invoker)(&call).map_err(|e| BridgeError::invocation(self.name(), e))
    }
}

/// Coerce `nargs` slots starting at `first` to `params`, or `None`
fn coerce_all(
    session: &Arc<Session>,
    first: i32,
    nargs: usize,
    params: &[ParamType],
) -> BridgeResult<Option<Vec<Arg>>> {
    if params.len() != nargs {
        return Ok(None);
    }
    {
        let state = session.lock();
        let classes = session.classes();
        let fits = params
            .iter()
            .enumerate()
            .all(|(i, ty)| accepts(&state, classes, first + i as i32, *ty));
        if !fits {
            return Ok(None);
        }
    }
    let args = params
        .iter()
        .enumerate()
        .map(|(i, ty)| extract(session, first + i as i32, *ty))
        .collect::<BridgeResult<Vec<_>>>()?;
    Ok(Some(args))
}

fn absolute(state: &GuestState, index: i32) -> i32 {
    if index < 0 {
        state.get_top() + index + 1
    } else {
        index
    }
}

/// Find the method `name` accepting the `nargs` values at `first..`
pub fn resolve_method(
    session: &Arc<Session>,
    target: &Target,
    name: &str,
    first: i32,
    nargs: usize,
) -> BridgeResult<Invocation> {
    session.ensure_open()?;
    let class = target.class_id(session)?;
    let lineage = session.classes().lineage(class)?;

    let mut named = false;
    for def in &lineage {
        for method in def.methods_named(name) {
            named = true;
            if let Some(args) = coerce_all(session, first, nargs, &method.params)? {
                debug!(class = %def.name, method = name, params = ?method.params, "resolved method");
                return Ok(Invocation {
                    class: def.name.clone(),
                    method: method.clone(),
                    this: target.receiver().cloned(),
                    args,
                });
            }
        }
    }

    let class = lineage_name(&lineage);
    if named {
        Err(BridgeError::NoMatchingOverload {
            class,
            name: name.to_string(),
        })
    } else {
        Err(BridgeError::NoSuchMember {
            class,
            name: name.to_string(),
        })
    }
}

fn lineage_name(lineage: &[Arc<ClassDef>]) -> String {
    lineage.first().map(|c| c.name.clone()).unwrap_or_default()
}

/// Call method `name` with the `nargs` values at `first..`
///
/// Pushes the result, if any, and returns the number of values pushed.
pub fn object_index(
    session: &Arc<Session>,
    target: &Target,
    name: &str,
    first: i32,
    nargs: usize,
) -> BridgeResult<usize> {
    let invocation = resolve_method(session, target, name, first, nargs)?;
    match invocation.invoke(session)? {
        Some(value) => {
            push_host_value(session, &value)?;
            Ok(1)
        }
        None => Ok(0),
    }
}

fn find_field(
    session: &Session,
    target: &Target,
    name: &str,
) -> BridgeResult<Option<(String, FieldDef)>> {
    let class = target.class_id(session)?;
    for def in session.classes().lineage(class)? {
        if let Some(field) = def.field(name) {
            return Ok(Some((def.name.clone(), field.clone())));
        }
    }
    Ok(None)
}

fn require_field(session: &Session, target: &Target, name: &str) -> BridgeResult<(String, FieldDef)> {
    match find_field(session, target, name)? {
        Some(found) => Ok(found),
        None => {
            let class = target.class_id(session)?;
            Err(BridgeError::NoSuchMember {
                class: session.classes().get(class)?.name.clone(),
                name: name.to_string(),
            })
        }
    }
}

fn instance_access_check(target: &Target, field: &FieldDef) -> BridgeResult<()> {
    if !field.is_static && target.receiver().is_none() {
        return Err(BridgeError::invocation(
            field.name.clone(),
            format!("instance field '{}' accessed without a receiver", field.name),
        ));
    }
    Ok(())
}

/// Push the value of field `name`
pub fn field_read(session: &Arc<Session>, target: &Target, name: &str) -> BridgeResult<()> {
    session.ensure_open()?;
    let (class, field) = require_field(session, target, name)?;
    instance_access_check(target, &field)?;
    let value = (field.getter)(target.receiver()).map_err(|e| BridgeError::invocation(name, e))?;
    debug!(class = %class, field = name, "field read");
    push_host_value(session, &value)
}

/// Assign the value at `value_index` to field `name`
pub fn field_write(
    session: &Arc<Session>,
    target: &Target,
    name: &str,
    value_index: i32,
) -> BridgeResult<()> {
    session.ensure_open()?;
    let (class, field) = require_field(session, target, name)?;
    instance_access_check(target, &field)?;
    let setter = field.setter.as_ref().ok_or_else(|| {
        BridgeError::InvalidTarget(format!("field '{}' of {} is read-only", name, class))
    })?;

    let index = absolute(&session.lock(), value_index);
    let value = coerce_all(session, index, 1, &[field.ty])?
        .and_then(|mut args| args.pop())
        .ok_or_else(|| BridgeError::NoMatchingOverload {
            class: class.clone(),
            name: name.to_string(),
        })?;
    setter(target.receiver(), &value).map_err(|e| BridgeError::invocation(name, e))?;
    debug!(class = %class, field = name, "field written");
    Ok(())
}

/// Look up `name` on a target
///
/// A field has its value pushed; a method name only reports
/// [`MemberKind::Method`].
pub fn class_index(session: &Arc<Session>, target: &Target, name: &str) -> BridgeResult<MemberKind> {
    session.ensure_open()?;
    if let Some((_, field)) = find_field(session, target, name)? {
        if field.is_static || target.receiver().is_some() {
            field_read(session, target, name)?;
            return Ok(MemberKind::Field);
        }
    }
    let class = target.class_id(session)?;
    let has_method = session
        .classes()
        .lineage(class)?
        .iter()
        .any(|def| def.has_method(name));
    Ok(if has_method {
        MemberKind::Method
    } else {
        MemberKind::None
    })
}

fn require_elements<'t>(
    session: &Session,
    target: &'t Target,
) -> BridgeResult<(String, ElementsDef, &'t HostObject)> {
    let not_array = || BridgeError::InvalidTarget("object indexed is not an array".to_string());
    let this = target.receiver().ok_or_else(not_array)?;
    let class = target.class_id(session)?;
    for def in session.classes().lineage(class)? {
        if let Some(elements) = &def.elements {
            return Ok((def.name.clone(), elements.clone(), this));
        }
    }
    Err(not_array())
}

/// 0-based slot of a 1-based guest position
fn element_slot(elements: &ElementsDef, this: &HostObject, position: i64) -> BridgeResult<usize> {
    let len = (elements.len)(this).map_err(|e| BridgeError::invocation("length", e))?;
    match usize::try_from(position) {
        Ok(position) if (1..=len).contains(&position) => Ok(position - 1),
        _ => Err(BridgeError::IndexOutOfBounds { position, len }),
    }
}

/// Push element `position` (1-based) of an array-like instance
pub fn array_index(session: &Arc<Session>, target: &Target, position: i64) -> BridgeResult<()> {
    session.ensure_open()?;
    let (class, elements, this) = require_elements(session, target)?;
    let slot = element_slot(&elements, this, position)?;
    let value = (elements.getter)(this, slot).map_err(|e| BridgeError::invocation("[]", e))?;
    debug!(class = %class, position, "element read");
    push_host_value(session, &value)
}

/// Assign the value at `value_index` to element `position` (1-based)
///
/// The value is coerced to the declared element type.
pub fn array_new_index(
    session: &Arc<Session>,
    target: &Target,
    position: i64,
    value_index: i32,
) -> BridgeResult<()> {
    session.ensure_open()?;
    let (class, elements, this) = require_elements(session, target)?;
    let setter = elements.setter.as_ref().ok_or_else(|| {
        BridgeError::InvalidTarget(format!("elements of {} are read-only", class))
    })?;
    let slot = element_slot(&elements, this, position)?;

    let (index, kind) = {
        let state = session.lock();
        let index = absolute(&state, value_index);
        (index, state.type_of(index))
    };
    let value = coerce_all(session, index, 1, &[elements.ty])?
        .and_then(|mut args| args.pop())
        .ok_or_else(|| {
            BridgeError::InvalidArgument(format!(
                "invalid type {} for an element of {}",
                kind, class
            ))
        })?;
    setter(this, slot, &value).map_err(|e| BridgeError::invocation("[]", e))?;
    debug!(class = %class, position, "element written");
    Ok(())
}

/// Construct an instance of `class` from the `nargs` values at `first..`
///
/// Constructors are not inherited. The new object is pushed and returned.
pub fn construct(
    session: &Arc<Session>,
    class: ClassId,
    first: i32,
    nargs: usize,
) -> BridgeResult<HostObject> {
    session.ensure_open()?;
    let def = session.classes().get(class)?;
    if def.constructors.is_empty() {
        return Err(BridgeError::NoSuchMember {
            class: def.name.clone(),
            name: "new".to_string(),
        });
    }

    for ctor in &def.constructors {
        if let Some(args) = coerce_all(session, first, nargs, &ctor.params)? {
            debug!(class = %def.name, params = ?ctor.params, "resolved constructor");
            let call = Invoke::new(session, None, &args);
            let object = (ctor.factory)(&call).map_err(|e| BridgeError::invocation("new", e))?;
            session.push_object(object.clone())?;
            return Ok(object);
        }
    }
    Err(BridgeError::NoMatchingOverload {
        class: def.name.clone(),
        name: "new".to_string(),
    })
}

/// Construct an instance of the class registered as `class_name`
pub fn new_instance_by_name(
    session: &Arc<Session>,
    class_name: &str,
    args: &[HostValue],
) -> BridgeResult<HostObject> {
    let class = session
        .classes()
        .by_name(class_name)
        .ok_or_else(|| BridgeError::InvalidTarget(format!("unknown class '{}'", class_name)))?;

    let state = session.lock();
    session.ensure_open()?;
    let _guard = StackGuard::new(&state);
    let first = state.get_top() + 1;
    for arg in args {
        push_host_value(session, arg)?;
    }
    construct(session, class.id, first, args.len())
}
