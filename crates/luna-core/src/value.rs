//! Host-side value representation
//!
//! [`HostValue`] is what the marshalling engine produces from a guest stack
//! slot: scalars are copied out, reference values stay behind a handle.
//! Values are hashable so they can key a [`HostMap`].

use crate::error::MarshalError;
use crate::handle::Handle;
use crate::object::{ArrayRef, FunctionRef, TableRef, TypedValue, UserdataRef};
use crate::vm::LuaType;
use rustc_hash::{FxHashMap, FxHasher};
use std::any::{Any, TypeId};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

// ============================================================================
// HostObject
// ============================================================================

/// An opaque host object that can travel through the guest as userdata
#[derive(Clone)]
pub struct HostObject {
    inner: Arc<dyn Any + Send + Sync>,
    type_id: TypeId,
    type_name: &'static str,
}

impl HostObject {
    /// Box a host value
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self::from_arc(Arc::new(value))
    }

    /// Share an existing allocation
    pub fn from_arc<T: Any + Send + Sync>(value: Arc<T>) -> Self {
        Self {
            inner: value,
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
        }
    }

    /// Rust type of the boxed value
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Rust type name of the boxed value
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Borrow the boxed value as `T`
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        (*self.inner).downcast_ref::<T>()
    }

    /// Check if the boxed value is a `T`
    pub fn is<T: Any>(&self) -> bool {
        self.type_id == TypeId::of::<T>()
    }

    /// Address of the shared allocation
    pub fn identity(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const () as usize
    }
}

impl PartialEq for HostObject {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl Eq for HostObject {}

impl Hash for HostObject {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identity().hash(state);
    }
}

impl fmt::Debug for HostObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostObject({} @ {:#x})", self.type_name, self.identity())
    }
}

// ============================================================================
// HostMap
// ============================================================================

/// Host mapping produced by table projection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostMap {
    entries: FxHashMap<HostValue, HostValue>,
}

impl HostMap {
    /// Create an empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry, returning the previous value
    pub fn insert(&mut self, key: HostValue, value: HostValue) -> Option<HostValue> {
        self.entries.insert(key, value)
    }

    /// Look up a key
    pub fn get(&self, key: &HostValue) -> Option<&HostValue> {
        self.entries.get(key)
    }

    /// Look up a string key
    pub fn get_str(&self, key: &str) -> Option<&HostValue> {
        self.entries.get(&HostValue::String(key.to_string()))
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the map is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over entries in unspecified order
    pub fn iter(&self) -> impl Iterator<Item = (&HostValue, &HostValue)> {
        self.entries.iter()
    }

    /// Take the underlying map
    pub fn into_inner(self) -> FxHashMap<HostValue, HostValue> {
        self.entries
    }
}

impl Hash for HostMap {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // Order-independent combination of per-entry hashes
        let mut sum: u64 = 0;
        for (k, v) in &self.entries {
            let mut h = FxHasher::default();
            k.hash(&mut h);
            v.hash(&mut h);
            sum = sum.wrapping_add(h.finish());
        }
        self.entries.len().hash(state);
        sum.hash(state);
    }
}

impl FromIterator<(HostValue, HostValue)> for HostMap {
    fn from_iter<I: IntoIterator<Item = (HostValue, HostValue)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

// ============================================================================
// HostValue
// ============================================================================

/// A guest value projected into the host
#[derive(Debug, Clone, Default)]
pub enum HostValue {
    /// Guest nil / host null
    #[default]
    Nil,
    /// Boolean
    Boolean(bool),
    /// Number
    Number(f64),
    /// String
    String(String),
    /// Guest function
    Function(FunctionRef),
    /// Guest table that is not sequence-shaped
    Table(TableRef),
    /// Sequence-shaped guest table
    Array(ArrayRef),
    /// Guest userdata that does not wrap a host object
    Userdata(UserdataRef),
    /// Host object that travelled through the guest
    Object(HostObject),
    /// Any other guest value
    Generic(Handle),
    /// Projected mapping (deep projections only)
    Map(HostMap),
}

impl HostValue {
    /// Kind name used in cast errors
    pub fn kind(&self) -> &'static str {
        match self {
            HostValue::Nil => "nil",
            HostValue::Boolean(_) => "boolean",
            HostValue::Number(_) => "number",
            HostValue::String(_) => "string",
            HostValue::Function(_) => "function",
            HostValue::Table(_) => "table",
            HostValue::Array(_) => "array",
            HostValue::Userdata(_) => "userdata",
            HostValue::Object(_) => "object",
            HostValue::Generic(_) => "generic",
            HostValue::Map(_) => "map",
        }
    }

    /// Check for nil
    pub fn is_nil(&self) -> bool {
        matches!(self, HostValue::Nil)
    }

    /// Number, if this is one
    pub fn as_number(&self) -> Option<f64> {
        match self {
            HostValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// String slice, if this is a string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HostValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Boolean, if this is one
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            HostValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Mapping, if this is one
    pub fn as_map(&self) -> Option<&HostMap> {
        match self {
            HostValue::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Handle behind a reference value
    pub fn handle(&self) -> Option<&Handle> {
        match self {
            HostValue::Function(f) => Some(f.handle()),
            HostValue::Table(t) => Some(t.handle()),
            HostValue::Array(a) => Some(a.handle()),
            HostValue::Userdata(u) => Some(u.handle()),
            HostValue::Generic(h) => Some(h),
            _ => None,
        }
    }

    /// Cast to a host type
    pub fn cast<T: FromHost>(self) -> Result<T, MarshalError> {
        T::from_host(self)
    }

    fn cast_error(&self, to: &'static str) -> MarshalError {
        MarshalError::Cast {
            from: self.kind(),
            to,
        }
    }
}

impl PartialEq for HostValue {
    fn eq(&self, other: &Self) -> bool {
        use HostValue::*;
        match (self, other) {
            (Nil, Nil) => true,
            (Boolean(a), Boolean(b)) => a == b,
            (Number(a), Number(b)) => number_bits(*a) == number_bits(*b),
            (String(a), String(b)) => a == b,
            (Object(a), Object(b)) => a == b,
            (Map(a), Map(b)) => a == b,
            (Function(_), Function(_))
            | (Table(_), Table(_))
            | (Array(_), Array(_))
            | (Userdata(_), Userdata(_))
            | (Generic(_), Generic(_)) => self.handle() == other.handle(),
            _ => false,
        }
    }
}

impl Eq for HostValue {}

impl Hash for HostValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            HostValue::Nil => {}
            HostValue::Boolean(b) => b.hash(state),
            HostValue::Number(n) => number_bits(*n).hash(state),
            HostValue::String(s) => s.hash(state),
            HostValue::Object(o) => o.hash(state),
            HostValue::Map(m) => m.hash(state),
            other => {
                if let Some(handle) = other.handle() {
                    handle.hash(state);
                }
            }
        }
    }
}

/// Bits of a number with -0.0 folded into 0.0
fn number_bits(n: f64) -> u64 {
    (n + 0.0).to_bits()
}

impl From<bool> for HostValue {
    fn from(b: bool) -> Self {
        HostValue::Boolean(b)
    }
}

impl From<f64> for HostValue {
    fn from(n: f64) -> Self {
        HostValue::Number(n)
    }
}

impl From<i32> for HostValue {
    fn from(n: i32) -> Self {
        HostValue::Number(n as f64)
    }
}

impl From<&str> for HostValue {
    fn from(s: &str) -> Self {
        HostValue::String(s.to_string())
    }
}

impl From<String> for HostValue {
    fn from(s: String) -> Self {
        HostValue::String(s)
    }
}

impl From<HostObject> for HostValue {
    fn from(o: HostObject) -> Self {
        HostValue::Object(o)
    }
}

impl From<HostMap> for HostValue {
    fn from(m: HostMap) -> Self {
        HostValue::Map(m)
    }
}

impl<T: Into<HostValue>> From<Option<T>> for HostValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(HostValue::Nil)
    }
}

impl TypedValue for HostValue {
    fn lua_type(&self) -> LuaType {
        match self {
            HostValue::Nil => LuaType::Nil,
            HostValue::Boolean(_) => LuaType::Boolean,
            HostValue::Number(_) => LuaType::Number,
            HostValue::String(_) => LuaType::String,
            HostValue::Function(_) => LuaType::Function,
            HostValue::Table(_) | HostValue::Array(_) | HostValue::Map(_) => LuaType::Table,
            HostValue::Userdata(_) | HostValue::Object(_) => LuaType::Userdata,
            HostValue::Generic(h) => h.lua_type().unwrap_or(LuaType::None),
        }
    }

    fn stringify(&self) -> String {
        match self {
            HostValue::Nil => "nil".to_string(),
            HostValue::Boolean(b) => b.to_string(),
            HostValue::Number(n) => format!("{:?}", n),
            HostValue::String(s) => s.clone(),
            HostValue::Function(f) => f.stringify(),
            HostValue::Table(t) => t.stringify(),
            HostValue::Array(a) => a.stringify(),
            HostValue::Userdata(u) => u.stringify(),
            HostValue::Object(o) => format!("[Host {}]", o.type_name()),
            HostValue::Generic(h) => format!("[Lua {}]", h.lua_type().unwrap_or(LuaType::None)),
            HostValue::Map(m) => format!("[Map of {}]", m.len()),
        }
    }

    fn to_boolean(&self) -> bool {
        !matches!(self, HostValue::Nil | HostValue::Boolean(false))
    }
}

// ============================================================================
// FromHost
// ============================================================================

/// Cast a projected value to a requested host type
pub trait FromHost: Sized {
    /// Host type name used in cast errors
    const NAME: &'static str;

    /// Perform the cast
    fn from_host(value: HostValue) -> Result<Self, MarshalError>;

    /// Check that `value` would cast, without consuming it
    fn check(value: &HostValue) -> Result<(), MarshalError> {
        Self::from_host(value.clone()).map(drop)
    }
}

impl FromHost for HostValue {
    const NAME: &'static str = "value";

    fn from_host(value: HostValue) -> Result<Self, MarshalError> {
        Ok(value)
    }

    fn check(_: &HostValue) -> Result<(), MarshalError> {
        Ok(())
    }
}

impl FromHost for bool {
    const NAME: &'static str = "bool";

    fn from_host(value: HostValue) -> Result<Self, MarshalError> {
        match value {
            HostValue::Boolean(b) => Ok(b),
            other => Err(other.cast_error(Self::NAME)),
        }
    }
}

impl FromHost for f64 {
    const NAME: &'static str = "f64";

    fn from_host(value: HostValue) -> Result<Self, MarshalError> {
        match value {
            HostValue::Number(n) => Ok(n),
            other => Err(other.cast_error(Self::NAME)),
        }
    }
}

impl FromHost for String {
    const NAME: &'static str = "String";

    fn from_host(value: HostValue) -> Result<Self, MarshalError> {
        match value {
            HostValue::String(s) => Ok(s),
            other => Err(other.cast_error(Self::NAME)),
        }
    }
}

impl FromHost for HostObject {
    const NAME: &'static str = "HostObject";

    fn from_host(value: HostValue) -> Result<Self, MarshalError> {
        match value {
            HostValue::Object(o) => Ok(o),
            other => Err(other.cast_error(Self::NAME)),
        }
    }
}

impl FromHost for HostMap {
    const NAME: &'static str = "HostMap";

    fn from_host(value: HostValue) -> Result<Self, MarshalError> {
        match value {
            HostValue::Map(m) => Ok(m),
            other => Err(other.cast_error(Self::NAME)),
        }
    }

    fn check(value: &HostValue) -> Result<(), MarshalError> {
        match value {
            HostValue::Map(_) => Ok(()),
            other => Err(other.cast_error(Self::NAME)),
        }
    }
}

impl FromHost for Handle {
    const NAME: &'static str = "Handle";

    fn from_host(value: HostValue) -> Result<Self, MarshalError> {
        match value.handle() {
            Some(h) => Ok(h.clone()),
            None => Err(value.cast_error(Self::NAME)),
        }
    }
}

impl FromHost for TableRef {
    const NAME: &'static str = "TableRef";

    fn from_host(value: HostValue) -> Result<Self, MarshalError> {
        match value {
            HostValue::Table(t) => Ok(t),
            HostValue::Array(a) => Ok(a.into_table()),
            other => Err(other.cast_error(Self::NAME)),
        }
    }
}

impl FromHost for ArrayRef {
    const NAME: &'static str = "ArrayRef";

    fn from_host(value: HostValue) -> Result<Self, MarshalError> {
        match value {
            HostValue::Array(a) => Ok(a),
            other => Err(other.cast_error(Self::NAME)),
        }
    }
}

impl FromHost for FunctionRef {
    const NAME: &'static str = "FunctionRef";

    fn from_host(value: HostValue) -> Result<Self, MarshalError> {
        match value {
            HostValue::Function(f) => Ok(f),
            other => Err(other.cast_error(Self::NAME)),
        }
    }
}

impl FromHost for UserdataRef {
    const NAME: &'static str = "UserdataRef";

    fn from_host(value: HostValue) -> Result<Self, MarshalError> {
        match value {
            HostValue::Userdata(u) => Ok(u),
            other => Err(other.cast_error(Self::NAME)),
        }
    }
}

impl<T: FromHost> FromHost for Option<T> {
    const NAME: &'static str = T::NAME;

    fn from_host(value: HostValue) -> Result<Self, MarshalError> {
        match value {
            HostValue::Nil => Ok(None),
            other => T::from_host(other).map(Some),
        }
    }

    fn check(value: &HostValue) -> Result<(), MarshalError> {
        match value {
            HostValue::Nil => Ok(()),
            other => T::check(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    fn hash_of<T: Hash>(value: &T) -> u64 {
        let mut h = DefaultHasher::new();
        value.hash(&mut h);
        h.finish()
    }

    #[test]
    fn test_number_equality_folds_zero() {
        assert_eq!(HostValue::Number(0.0), HostValue::Number(-0.0));
        assert_eq!(
            hash_of(&HostValue::Number(0.0)),
            hash_of(&HostValue::Number(-0.0))
        );
        assert_ne!(HostValue::Number(1.0), HostValue::String("1".to_string()));
    }

    #[test]
    fn test_map_hash_order_independent() {
        let mut a = HostMap::new();
        a.insert("x".into(), 1.0.into());
        a.insert("y".into(), 2.0.into());

        let mut b = HostMap::new();
        b.insert("y".into(), 2.0.into());
        b.insert("x".into(), 1.0.into());

        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
    }

    #[test]
    fn test_host_object_identity() {
        let a = HostObject::new(5u8);
        let b = a.clone();
        let c = HostObject::new(5u8);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.downcast_ref::<u8>(), Some(&5));
        assert!(a.is::<u8>());
        assert!(!a.is::<u16>());
    }

    #[test]
    fn test_casts() {
        assert_eq!(HostValue::Number(2.0).cast::<f64>(), Ok(2.0));
        assert_eq!(HostValue::Nil.cast::<Option<String>>(), Ok(None));
        assert_eq!(
            HostValue::Boolean(true).cast::<String>(),
            Err(MarshalError::Cast {
                from: "boolean",
                to: "String"
            })
        );
    }

    #[test]
    fn test_stringify() {
        assert_eq!(HostValue::Number(3.0).stringify(), "3.0");
        assert_eq!(HostValue::Nil.stringify(), "nil");
        assert!(HostValue::Number(0.0).to_boolean());
        assert!(!HostValue::Boolean(false).to_boolean());
    }
}
