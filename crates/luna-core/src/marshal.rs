//! Type marshalling engine
//!
//! Converts between guest stack slots and [`HostValue`]s, and narrows
//! guest numbers to fixed-width host numeric types.

use crate::collection;
use crate::error::{BridgeError, BridgeResult, MarshalError};
use crate::handle::Handle;
use crate::object::{ArrayRef, FunctionRef, TableRef, UserdataRef};
use crate::session::{Session, StackGuard};
use crate::value::{HostObject, HostValue};
use crate::vm::{LuaType, Userdata};
use std::sync::Arc;
use tracing::trace;

// ============================================================================
// Numeric narrowing
// ============================================================================

/// Fixed-width host numeric types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NumericType {
    /// 8-bit signed integer
    Byte,
    /// 16-bit signed integer
    Short,
    /// 32-bit signed integer
    Int,
    /// 64-bit signed integer
    Long,
    /// 32-bit float
    Float,
    /// 64-bit float
    Double,
}

/// A guest number narrowed to a host numeric type
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HostNumber {
    /// 8-bit signed integer
    Byte(i8),
    /// 16-bit signed integer
    Short(i16),
    /// 32-bit signed integer
    Int(i32),
    /// 64-bit signed integer
    Long(i64),
    /// 32-bit float
    Float(f32),
    /// 64-bit float
    Double(f64),
}

impl HostNumber {
    /// Widen back to f64
    pub fn as_f64(self) -> f64 {
        match self {
            HostNumber::Byte(n) => n as f64,
            HostNumber::Short(n) => n as f64,
            HostNumber::Int(n) => n as f64,
            HostNumber::Long(n) => n as f64,
            HostNumber::Float(n) => n as f64,
            HostNumber::Double(n) => n,
        }
    }

    /// Integer value (floats truncate)
    pub fn as_i64(self) -> i64 {
        match self {
            HostNumber::Byte(n) => n as i64,
            HostNumber::Short(n) => n as i64,
            HostNumber::Int(n) => n as i64,
            HostNumber::Long(n) => n,
            HostNumber::Float(n) => n as i64,
            HostNumber::Double(n) => n as i64,
        }
    }
}

/// Host numeric types a guest number narrows to
///
/// Integer targets truncate toward zero. Byte and short wrap from the
/// 32-bit truncation; int and long saturate, NaN becoming 0.
pub trait Narrow: Copy {
    /// Matching [`NumericType`] tag
    const TYPE: NumericType;

    /// Narrow a guest number in one conversion
    fn narrow(n: f64) -> Self;
}

macro_rules! narrow_impl {
    ($ty:ty, $tag:ident, |$n:ident| $body:expr) => {
        impl Narrow for $ty {
            const TYPE: NumericType = NumericType::$tag;

            fn narrow($n: f64) -> Self {
                $body
            }
        }
    };
}

narrow_impl!(i8, Byte, |n| n as i32 as i8);
narrow_impl!(i16, Short, |n| n as i32 as i16);
narrow_impl!(i32, Int, |n| n as i32);
narrow_impl!(i64, Long, |n| n as i64);
narrow_impl!(f32, Float, |n| n as f32);
narrow_impl!(f64, Double, |n| n);

/// Narrow a guest number to `ty`
pub fn convert_number(n: f64, ty: NumericType) -> HostNumber {
    match ty {
        NumericType::Byte => HostNumber::Byte(i8::narrow(n)),
        NumericType::Short => HostNumber::Short(i16::narrow(n)),
        NumericType::Int => HostNumber::Int(i32::narrow(n)),
        NumericType::Long => HostNumber::Long(i64::narrow(n)),
        NumericType::Float => HostNumber::Float(f32::narrow(n)),
        NumericType::Double => HostNumber::Double(n),
    }
}

// ============================================================================
// Guest -> host
// ============================================================================

/// Project the guest value at `index` into the most specific host value
///
/// Tables are classified as arrays when sequence-shaped. The stack is left
/// unchanged.
pub fn to_host_value(session: &Arc<Session>, index: i32) -> BridgeResult<HostValue> {
    let state = session.lock();
    session.ensure_open()?;
    let kind = state.type_of(index);
    trace!(index, %kind, "marshalling guest value");

    let value = match kind {
        LuaType::None => return Err(MarshalError::Unmarshallable(kind).into()),
        LuaType::Nil => HostValue::Nil,
        LuaType::Boolean => HostValue::Boolean(state.to_boolean(index)),
        LuaType::Number => HostValue::Number(state.to_number(index).unwrap_or_default()),
        LuaType::String => HostValue::String(state.to_string(index).unwrap_or_default()),
        LuaType::Function => HostValue::Function(FunctionRef::capture(session, index)?),
        LuaType::Table => {
            let handle = Handle::capture(session, index)?;
            if collection::classify_at(&state, index)? {
                HostValue::Array(ArrayRef::from_handle(handle))
            } else {
                HostValue::Table(TableRef::from_handle(handle))
            }
        }
        LuaType::Userdata => {
            let object = state
                .to_userdata(index)
                .and_then(|ud| ud.downcast_ref::<HostObject>().cloned());
            match object {
                Some(object) => HostValue::Object(object),
                None => HostValue::Userdata(UserdataRef::capture(session, index)?),
            }
        }
        LuaType::LightUserdata | LuaType::Thread => {
            HostValue::Generic(Handle::capture(session, index)?)
        }
    };
    Ok(value)
}

// ============================================================================
// Host -> guest
// ============================================================================

/// Push one host value onto the guest stack
///
/// Host objects become fresh userdata, maps become fresh tables, and
/// reference values re-push their pinned guest value.
pub fn push_host_value(session: &Session, value: &HostValue) -> BridgeResult<()> {
    let state = session.lock();
    session.ensure_open()?;
    match value {
        HostValue::Nil => state.push_nil()?,
        HostValue::Boolean(b) => state.push_boolean(*b)?,
        HostValue::Number(n) => state.push_number(*n)?,
        HostValue::String(s) => state.push_string(s)?,
        HostValue::Object(object) => state.push_userdata(Userdata::new(object.clone()))?,
        HostValue::Map(map) => {
            let guard = StackGuard::new(&state);
            state.new_table()?;
            for (k, v) in map.iter() {
                push_host_value(session, k)?;
                push_host_value(session, v)?;
                state.set_table(-3)?;
            }
            guard.defuse();
        }
        other => {
            let handle = other
                .handle()
                .ok_or_else(|| BridgeError::InvalidTarget(other.kind().to_string()))?;
            if handle.session().id() != session.id() {
                return Err(BridgeError::InvalidTarget(
                    "handle belongs to another session".to_string(),
                ));
            }
            handle.push()?;
        }
    }
    Ok(())
}
