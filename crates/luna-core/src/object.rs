//! Typed guest object wrappers
//!
//! Each wrapper is a [`Handle`] whose guest type was known at capture time.
//! [`GuestObject`] picks the wrapper from the guest type tag, refining
//! sequence-shaped tables to [`ArrayRef`].

use crate::collection;
use crate::error::{BridgeResult, MarshalError};
use crate::handle::Handle;
use crate::marshal::Narrow;
use crate::session::Session;
use crate::value::HostValue;
use crate::vm::{LuaType, Userdata};
use std::fmt;
use std::sync::Arc;

/// Capabilities shared by every guest value representation
pub trait TypedValue {
    /// Guest type
    fn lua_type(&self) -> LuaType;

    /// Host-facing string form
    fn stringify(&self) -> String;

    /// Guest truthiness
    fn to_boolean(&self) -> bool;
}

macro_rules! handle_wrapper {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash)]
        pub struct $name(Handle);

        impl $name {
            /// Pin the value at `index`
            pub fn capture(session: &Arc<Session>, index: i32) -> BridgeResult<Self> {
                Handle::capture(session, index).map(Self)
            }

            /// Wrap an existing handle
            pub fn from_handle(handle: Handle) -> Self {
                Self(handle)
            }

            /// Underlying handle
            pub fn handle(&self) -> &Handle {
                &self.0
            }

            /// Take the underlying handle
            pub fn into_handle(self) -> Handle {
                self.0
            }

            /// Owning session
            pub fn session(&self) -> &Arc<Session> {
                self.0.session()
            }
        }

        impl From<$name> for Handle {
            fn from(value: $name) -> Handle {
                value.0
            }
        }
    };
}

handle_wrapper!(
    /// Pinned guest boolean
    BooleanRef
);
handle_wrapper!(
    /// Pinned guest number
    NumberRef
);
handle_wrapper!(
    /// Pinned guest string
    StringRef
);
handle_wrapper!(
    /// Pinned guest function
    FunctionRef
);
handle_wrapper!(
    /// Pinned guest table
    TableRef
);
handle_wrapper!(
    /// Pinned sequence-shaped guest table
    ArrayRef
);
handle_wrapper!(
    /// Pinned guest userdata
    UserdataRef
);

impl BooleanRef {
    /// Current value
    pub fn get(&self) -> BridgeResult<bool> {
        self.0.to_boolean()
    }
}

impl NumberRef {
    /// Current value
    pub fn get(&self) -> BridgeResult<f64> {
        Ok(self.0.to_number()?.unwrap_or_default())
    }

    /// Value narrowed to any host numeric type
    pub fn narrow<T: Narrow>(&self) -> BridgeResult<T> {
        Ok(T::narrow(self.get()?))
    }

    /// Value narrowed to i8
    pub fn get_byte(&self) -> BridgeResult<i8> {
        self.narrow()
    }

    /// Value narrowed to i16
    pub fn get_short(&self) -> BridgeResult<i16> {
        self.narrow()
    }

    /// Value narrowed to i32
    pub fn get_int(&self) -> BridgeResult<i32> {
        self.narrow()
    }

    /// Value narrowed to i64
    pub fn get_long(&self) -> BridgeResult<i64> {
        self.narrow()
    }

    /// Value narrowed to f32
    pub fn get_float(&self) -> BridgeResult<f32> {
        self.narrow()
    }

    /// Value as f64
    pub fn get_double(&self) -> BridgeResult<f64> {
        self.get()
    }
}

impl StringRef {
    /// Current value
    pub fn get(&self) -> BridgeResult<String> {
        Ok(self.0.to_string()?.unwrap_or_default())
    }
}

impl FunctionRef {
    /// Call with host arguments, keeping `nresults` results
    pub fn call(&self, args: &[HostValue], nresults: i32) -> BridgeResult<Vec<HostValue>> {
        self.0.call(args, nresults)
    }

    /// Call with host arguments, keeping the first result
    pub fn call1(&self, args: &[HostValue]) -> BridgeResult<HostValue> {
        self.0.call1(args)
    }
}

impl ArrayRef {
    /// View as a plain table
    pub fn as_table(&self) -> TableRef {
        TableRef(self.0.clone())
    }

    /// Convert into a plain table
    pub fn into_table(self) -> TableRef {
        TableRef(self.0)
    }
}

impl UserdataRef {
    /// The guest userdata (`None` for light userdata)
    pub fn userdata(&self) -> BridgeResult<Option<Userdata>> {
        self.0.with_pushed(|state| Ok(state.to_userdata(-1)))
    }
}

impl TypedValue for BooleanRef {
    fn lua_type(&self) -> LuaType {
        LuaType::Boolean
    }

    fn stringify(&self) -> String {
        self.get().unwrap_or_default().to_string()
    }

    fn to_boolean(&self) -> bool {
        self.get().unwrap_or_default()
    }
}

impl TypedValue for NumberRef {
    fn lua_type(&self) -> LuaType {
        LuaType::Number
    }

    fn stringify(&self) -> String {
        format!("{:?}", self.get().unwrap_or_default())
    }

    fn to_boolean(&self) -> bool {
        true
    }
}

impl TypedValue for StringRef {
    fn lua_type(&self) -> LuaType {
        LuaType::String
    }

    fn stringify(&self) -> String {
        self.get().unwrap_or_default()
    }

    fn to_boolean(&self) -> bool {
        true
    }
}

macro_rules! opaque_typed_value {
    ($name:ident, $ty:expr, $display:expr) => {
        impl TypedValue for $name {
            fn lua_type(&self) -> LuaType {
                $ty
            }

            fn stringify(&self) -> String {
                $display.to_string()
            }

            fn to_boolean(&self) -> bool {
                true
            }
        }
    };
}

opaque_typed_value!(FunctionRef, LuaType::Function, "[Lua Function]");
opaque_typed_value!(TableRef, LuaType::Table, "[Lua Table]");
opaque_typed_value!(ArrayRef, LuaType::Table, "[Lua Array]");
opaque_typed_value!(UserdataRef, LuaType::Userdata, "[Lua UserData]");

// ============================================================================
// GuestObject
// ============================================================================

/// A captured guest value with its most specific wrapper
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum GuestObject {
    /// Boolean
    Boolean(BooleanRef),
    /// Number
    Number(NumberRef),
    /// String
    String(StringRef),
    /// Function
    Function(FunctionRef),
    /// Table that is not sequence-shaped
    Table(TableRef),
    /// Sequence-shaped table
    Array(ArrayRef),
    /// Full userdata
    Userdata(UserdataRef),
    /// Nil, light userdata, and anything else
    Generic(Handle),
}

impl GuestObject {
    /// Capture the value at `index` with the matching wrapper
    pub fn capture(session: &Arc<Session>, index: i32) -> BridgeResult<Self> {
        let state = session.lock();
        session.ensure_open()?;
        let object = match state.type_of(index) {
            LuaType::None => {
                return Err(MarshalError::Unmarshallable(LuaType::None).into());
            }
            LuaType::Boolean => GuestObject::Boolean(BooleanRef::capture(session, index)?),
            LuaType::Number => GuestObject::Number(NumberRef::capture(session, index)?),
            LuaType::String => GuestObject::String(StringRef::capture(session, index)?),
            LuaType::Function => GuestObject::Function(FunctionRef::capture(session, index)?),
            LuaType::Table => {
                let handle = Handle::capture(session, index)?;
                if collection::classify_at(&state, index)? {
                    GuestObject::Array(ArrayRef(handle))
                } else {
                    GuestObject::Table(TableRef(handle))
                }
            }
            LuaType::Userdata => GuestObject::Userdata(UserdataRef::capture(session, index)?),
            LuaType::Nil | LuaType::LightUserdata | LuaType::Thread => {
                GuestObject::Generic(Handle::capture(session, index)?)
            }
        };
        Ok(object)
    }

    /// Underlying handle
    pub fn handle(&self) -> &Handle {
        match self {
            GuestObject::Boolean(v) => v.handle(),
            GuestObject::Number(v) => v.handle(),
            GuestObject::String(v) => v.handle(),
            GuestObject::Function(v) => v.handle(),
            GuestObject::Table(v) => v.handle(),
            GuestObject::Array(v) => v.handle(),
            GuestObject::Userdata(v) => v.handle(),
            GuestObject::Generic(h) => h,
        }
    }

    /// Check if this is a sequence-shaped table
    pub fn is_array(&self) -> bool {
        matches!(self, GuestObject::Array(_))
    }

    /// Project into a host value
    pub fn to_host_value(&self) -> BridgeResult<HostValue> {
        self.handle().to_host_value()
    }

    /// Free the registry slot
    pub fn release(&self) {
        self.handle().release();
    }
}

impl TypedValue for GuestObject {
    fn lua_type(&self) -> LuaType {
        match self {
            GuestObject::Boolean(v) => v.lua_type(),
            GuestObject::Number(v) => v.lua_type(),
            GuestObject::String(v) => v.lua_type(),
            GuestObject::Function(v) => v.lua_type(),
            GuestObject::Table(v) => v.lua_type(),
            GuestObject::Array(v) => v.lua_type(),
            GuestObject::Userdata(v) => v.lua_type(),
            GuestObject::Generic(h) => h.lua_type().unwrap_or(LuaType::None),
        }
    }

    fn stringify(&self) -> String {
        match self {
            GuestObject::Boolean(v) => v.stringify(),
            GuestObject::Number(v) => v.stringify(),
            GuestObject::String(v) => v.stringify(),
            GuestObject::Function(v) => v.stringify(),
            GuestObject::Table(v) => v.stringify(),
            GuestObject::Array(v) => v.stringify(),
            GuestObject::Userdata(v) => v.stringify(),
            GuestObject::Generic(h) => match h.lua_type() {
                Ok(LuaType::Nil) => "nil".to_string(),
                Ok(kind) => format!("[Lua {}]", kind),
                Err(_) => "[Lua released]".to_string(),
            },
        }
    }

    fn to_boolean(&self) -> bool {
        match self {
            GuestObject::Boolean(v) => v.to_boolean(),
            GuestObject::Generic(h) => h.to_boolean().unwrap_or(false),
            _ => true,
        }
    }
}

impl fmt::Display for GuestObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.stringify())
    }
}
