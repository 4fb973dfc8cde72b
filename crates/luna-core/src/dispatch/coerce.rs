//! Argument coercion
//!
//! Resolution runs in two phases. [`accepts`] decides from the type tag
//! alone whether a stack slot fits a parameter, so that rejected overloads
//! pin nothing. [`extract`] then converts the slots of the winning overload.

use super::class::ClassRegistry;
use super::ClassId;
use crate::error::BridgeResult;
use crate::handle::Handle;
use crate::marshal::{convert_number, to_host_value, HostNumber, NumericType};
use crate::object::{FunctionRef, TableRef};
use crate::session::Session;
use crate::value::{HostObject, HostValue};
use crate::vm::{GuestState, LuaType};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Declared type of a parameter or field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamType {
    /// Any guest value, passed through as a host value
    Any,
    /// Boolean
    Boolean,
    /// String
    String,
    /// 8-bit integer
    Byte,
    /// 16-bit integer
    Short,
    /// 32-bit integer
    Int,
    /// 64-bit integer
    Long,
    /// 32-bit float
    Float,
    /// 64-bit float
    Double,
    /// Handle to any reference value
    Handle,
    /// Guest table
    Table,
    /// Guest function
    Function,
    /// Host object of a registered class or one of its subclasses
    Object(ClassId),
}

impl ParamType {
    /// Numeric target of this type, if any
    pub fn numeric(self) -> Option<NumericType> {
        match self {
            ParamType::Byte => Some(NumericType::Byte),
            ParamType::Short => Some(NumericType::Short),
            ParamType::Int => Some(NumericType::Int),
            ParamType::Long => Some(NumericType::Long),
            ParamType::Float => Some(NumericType::Float),
            ParamType::Double => Some(NumericType::Double),
            _ => None,
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamType::Object(id) => write!(f, "{}", id),
            other => write!(f, "{:?}", other),
        }
    }
}

/// A coerced argument
#[derive(Debug, Clone)]
pub enum Arg {
    /// Guest nil, accepted by every parameter type
    Nil,
    /// Boolean
    Boolean(bool),
    /// String
    String(String),
    /// Number narrowed to the declared width
    Number(HostNumber),
    /// Pinned table
    Table(TableRef),
    /// Pinned function
    Function(FunctionRef),
    /// Pinned value of any reference type
    Handle(Handle),
    /// Host object unwrapped from userdata
    Object(HostObject),
    /// Untyped host value
    Any(HostValue),
}

impl Arg {
    /// Check for nil
    pub fn is_nil(&self) -> bool {
        matches!(self, Arg::Nil)
    }

    /// Boolean value
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Arg::Boolean(b) => Some(*b),
            Arg::Any(v) => v.as_bool(),
            _ => None,
        }
    }

    /// String value
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Arg::String(s) => Some(s),
            Arg::Any(v) => v.as_str(),
            _ => None,
        }
    }

    /// Narrowed number
    pub fn as_number(&self) -> Option<HostNumber> {
        match self {
            Arg::Number(n) => Some(*n),
            Arg::Any(v) => v.as_number().map(HostNumber::Double),
            _ => None,
        }
    }

    /// Number widened to f64
    pub fn as_f64(&self) -> Option<f64> {
        self.as_number().map(HostNumber::as_f64)
    }

    /// Number as an integer
    pub fn as_i64(&self) -> Option<i64> {
        self.as_number().map(HostNumber::as_i64)
    }

    /// Pinned table
    pub fn as_table(&self) -> Option<&TableRef> {
        match self {
            Arg::Table(t) => Some(t),
            _ => None,
        }
    }

    /// Pinned function
    pub fn as_function(&self) -> Option<&FunctionRef> {
        match self {
            Arg::Function(f) => Some(f),
            _ => None,
        }
    }

    /// Handle behind any pinned argument
    pub fn as_handle(&self) -> Option<&Handle> {
        match self {
            Arg::Table(t) => Some(t.handle()),
            Arg::Function(f) => Some(f.handle()),
            Arg::Handle(h) => Some(h),
            Arg::Any(v) => v.handle(),
            _ => None,
        }
    }

    /// Host object
    pub fn as_object(&self) -> Option<&HostObject> {
        match self {
            Arg::Object(o) => Some(o),
            Arg::Any(HostValue::Object(o)) => Some(o),
            _ => None,
        }
    }

    /// Host object downcast to `T`
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.as_object().and_then(HostObject::downcast_ref)
    }

    /// Convert back to an untyped host value
    pub fn into_host_value(self) -> HostValue {
        match self {
            Arg::Nil => HostValue::Nil,
            Arg::Boolean(b) => HostValue::Boolean(b),
            Arg::String(s) => HostValue::String(s),
            Arg::Number(n) => HostValue::Number(n.as_f64()),
            Arg::Table(t) => HostValue::Table(t),
            Arg::Function(f) => HostValue::Function(f),
            Arg::Handle(h) => HostValue::Generic(h),
            Arg::Object(o) => HostValue::Object(o),
            Arg::Any(v) => v,
        }
    }
}

fn wrapped_object(state: &GuestState, index: i32) -> Option<HostObject> {
    state
        .to_userdata(index)
        .and_then(|ud| ud.downcast_ref::<HostObject>().cloned())
}

/// Check whether the value at `index` coerces to `ty`
///
/// Rules are tried by the guest type of the value; nil fits everything.
pub fn accepts(state: &GuestState, classes: &ClassRegistry, index: i32, ty: ParamType) -> bool {
    if ty == ParamType::Any {
        return state.type_of(index) != LuaType::None;
    }
    match state.type_of(index) {
        LuaType::None => false,
        LuaType::Nil => true,
        LuaType::Boolean => ty == ParamType::Boolean,
        LuaType::String => ty == ParamType::String,
        LuaType::Function => matches!(ty, ParamType::Function | ParamType::Handle),
        LuaType::Table => matches!(ty, ParamType::Table | ParamType::Handle),
        LuaType::Number => ty.numeric().is_some(),
        LuaType::Userdata => match wrapped_object(state, index) {
            Some(object) => match ty {
                ParamType::Object(expected) => classes
                    .class_of(&object)
                    .map(|actual| classes.is_assignable(actual, expected))
                    .unwrap_or(false),
                _ => false,
            },
            None => ty == ParamType::Handle,
        },
        LuaType::LightUserdata | LuaType::Thread => ty == ParamType::Handle,
    }
}

/// Convert the value at `index` to `ty`
///
/// Only meaningful after [`accepts`] returned true for the same slot.
pub fn extract(session: &Arc<Session>, index: i32, ty: ParamType) -> BridgeResult<Arg> {
    let state = session.lock();
    if ty == ParamType::Any {
        return Ok(Arg::Any(to_host_value(session, index)?));
    }
    let arg = match state.type_of(index) {
        LuaType::Nil | LuaType::None => Arg::Nil,
        LuaType::Boolean => Arg::Boolean(state.to_boolean(index)),
        LuaType::String => Arg::String(state.to_string(index).unwrap_or_default()),
        LuaType::Number => {
            let n = state.to_number(index).unwrap_or_default();
            match ty.numeric() {
                Some(numeric) => Arg::Number(convert_number(n, numeric)),
                None => Arg::Number(HostNumber::Double(n)),
            }
        }
        LuaType::Table if ty == ParamType::Table => Arg::Table(TableRef::capture(session, index)?),
        LuaType::Function if ty == ParamType::Function => {
            Arg::Function(FunctionRef::capture(session, index)?)
        }
        LuaType::Userdata => match wrapped_object(&state, index) {
            Some(object) => Arg::Object(object),
            None => Arg::Handle(Handle::capture(session, index)?),
        },
        _ => Arg::Handle(Handle::capture(session, index)?),
    };
    Ok(arg)
}
