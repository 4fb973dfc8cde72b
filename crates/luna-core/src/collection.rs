//! Collection projector
//!
//! Walks guest tables with the VM's `next` cursor and materializes host
//! maps and sequences. Every traversal holds the session lock for its
//! whole duration and restores the stack depth on every exit path,
//! including visitor errors.

use crate::error::{BridgeResult, MarshalError};
use crate::marshal::{to_host_value, Narrow};
use crate::object::{ArrayRef, TableRef};
use crate::session::{Session, StackGuard};
use crate::value::{FromHost, HostMap, HostValue};
use crate::vm::{GuestState, LuaType};
use rustc_hash::FxHashMap;
use std::hash::Hash;
use std::sync::Arc;
use tracing::trace;

/// Convert a relative stack index to an absolute one
fn absolute(state: &GuestState, index: i32) -> i32 {
    if index < 0 {
        state.get_top() + index + 1
    } else {
        index
    }
}

/// Check whether the table at `index` is sequence-shaped
///
/// True for an empty table, or when every key is an integer in `1..=n`
/// and there are exactly `n` entries, `n` being the guest length.
pub(crate) fn classify_at(state: &GuestState, index: i32) -> BridgeResult<bool> {
    let table = absolute(state, index);
    let len = state.obj_len(table);
    let _guard = StackGuard::new(state);

    let mut count = 0usize;
    state.push_nil()?;
    while state.next(table)? {
        count += 1;
        let in_range = match state.type_of(-2) {
            LuaType::Number => state
                .to_number(-2)
                .map(|k| k.fract() == 0.0 && k >= 1.0 && k <= len as f64)
                .unwrap_or(false),
            _ => false,
        };
        if !in_range || count > len {
            return Ok(false);
        }
        state.pop(1)?;
    }
    Ok(count == len)
}

/// Run `step` for each entry of the table pinned by `table`
///
/// `step` sees the key at -2 and the value at -1 and must leave the stack
/// as it found it.
fn traverse(
    table: &TableRef,
    mut step: impl FnMut(&Arc<Session>, &GuestState) -> BridgeResult<()>,
) -> BridgeResult<()> {
    let session = table.session().clone();
    let state = session.lock();
    let _guard = StackGuard::new(&state);
    table.handle().push()?;
    let index = state.get_top();

    state.push_nil()?;
    while state.next(index)? {
        trace!(depth = state.get_top(), "table traversal step");
        step(&session, &*state)?;
        state.pop(1)?;
    }
    Ok(())
}

impl TableRef {
    /// Check whether the table is currently sequence-shaped
    pub fn classify(&self) -> BridgeResult<bool> {
        self.handle().with_pushed(|state| classify_at(state, -1))
    }

    /// Visit every entry as untyped host values
    pub fn for_each_entry(
        &self,
        mut visitor: impl FnMut(HostValue, HostValue) -> BridgeResult<()>,
    ) -> BridgeResult<()> {
        traverse(self, |session, _| {
            let key = to_host_value(session, -2)?;
            let value = to_host_value(session, -1)?;
            visitor(key, value)
        })
    }

    /// Visit every entry cast to `K` and `V`
    ///
    /// A failed cast or a visitor error stops the traversal.
    pub fn for_each<K: FromHost, V: FromHost>(
        &self,
        mut visitor: impl FnMut(K, V) -> BridgeResult<()>,
    ) -> BridgeResult<()> {
        self.for_each_entry(|k, v| visitor(K::from_host(k)?, V::from_host(v)?))
    }

    /// Collect every entry into a host map
    pub fn as_map<K, V>(&self) -> BridgeResult<FxHashMap<K, V>>
    where
        K: FromHost + Eq + Hash,
        V: FromHost,
    {
        let mut map = FxHashMap::default();
        self.for_each(|k: K, v: V| {
            map.insert(k, v);
            Ok(())
        })?;
        Ok(map)
    }

    /// Collect every entry with string keys
    pub fn as_string_map<V: FromHost>(&self) -> BridgeResult<FxHashMap<String, V>> {
        self.as_map::<String, V>()
    }

    /// Collect every entry as untyped host values
    pub fn as_host_map(&self) -> BridgeResult<HostMap> {
        let mut map = HostMap::new();
        self.for_each_entry(|k, v| {
            map.insert(k, v);
            Ok(())
        })?;
        Ok(map)
    }

    /// Collect every entry, projecting nested tables into maps
    ///
    /// Keys and values are cast to `K` and `V` at every level, so a nested
    /// entry that does not fit fails with a cast error. Tables used as keys
    /// are projected as well; a key type that cannot hold a [`HostMap`]
    /// fails the same way. Nesting beyond the session's projection bound
    /// fails with [`MarshalError::MaxDepthExceeded`].
    pub fn as_deep_map<K, V>(&self) -> BridgeResult<FxHashMap<K, V>>
    where
        K: FromHost + Eq + Hash,
        V: FromHost,
    {
        let max = self.session().max_projection_depth();
        let mut out = FxHashMap::default();
        for (k, v) in deep_host_map::<K, V>(self, 0, max)?.into_inner() {
            out.insert(K::from_host(k)?, V::from_host(v)?);
        }
        Ok(out)
    }
}

/// Project `table` into a [`HostMap`], checking nested entries against
/// `K` and `V`
///
/// Entries of the outermost table are left to the caller's conversion.
fn deep_host_map<K: FromHost, V: FromHost>(
    table: &TableRef,
    depth: usize,
    max: usize,
) -> BridgeResult<HostMap> {
    if depth >= max {
        return Err(MarshalError::MaxDepthExceeded(max).into());
    }
    // Collect first so nested traversals do not interleave with this one
    let mut entries = Vec::new();
    table.for_each_entry(|k, v| {
        entries.push((k, v));
        Ok(())
    })?;

    let mut map = HostMap::new();
    for (k, v) in entries {
        let k = deepen::<K, V>(k, depth, max)?;
        let v = deepen::<K, V>(v, depth, max)?;
        if depth > 0 {
            K::check(&k)?;
            V::check(&v)?;
        }
        map.insert(k, v);
    }
    Ok(map)
}

fn deepen<K: FromHost, V: FromHost>(
    value: HostValue,
    depth: usize,
    max: usize,
) -> BridgeResult<HostValue> {
    let table = match value {
        HostValue::Table(t) => t,
        HostValue::Array(a) => a.into_table(),
        other => return Ok(other),
    };
    let nested = deep_host_map::<K, V>(&table, depth + 1, max);
    table.handle().release();
    Ok(HostValue::Map(nested?))
}

// ============================================================================
// Arrays
// ============================================================================

impl ArrayRef {
    /// Guest length
    pub fn len(&self) -> BridgeResult<usize> {
        self.handle().with_pushed(|state| Ok(state.obj_len(-1)))
    }

    /// Check if the array has no elements
    pub fn is_empty(&self) -> BridgeResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Visit elements in order with their 0-based position
    pub fn for_each<V: FromHost>(
        &self,
        mut visitor: impl FnMut(usize, V) -> BridgeResult<()>,
    ) -> BridgeResult<()> {
        let session = self.session().clone();
        self.handle().with_pushed(|state| {
            let len = state.obj_len(-1);
            for i in 1..=len {
                state.raw_get_i(-1, i as i64)?;
                let value = V::from_host(to_host_value(&session, -1)?)?;
                visitor(i - 1, value)?;
                state.pop(1)?;
            }
            Ok(())
        })
    }

    /// Visit elements in order
    pub fn for_each_value<V: FromHost>(
        &self,
        mut visitor: impl FnMut(V) -> BridgeResult<()>,
    ) -> BridgeResult<()> {
        self.for_each(|_, v| visitor(v))
    }

    /// Collect elements into a vector
    pub fn as_list<V: FromHost>(&self) -> BridgeResult<Vec<V>> {
        let mut list = Vec::new();
        self.for_each_value(|v| {
            list.push(v);
            Ok(())
        })?;
        Ok(list)
    }

    /// Collect elements into a boxed slice
    pub fn as_array<V: FromHost>(&self) -> BridgeResult<Box<[V]>> {
        Ok(self.as_list()?.into_boxed_slice())
    }

    /// Elements narrowed to any host numeric type
    pub fn numbers<T: Narrow>(&self) -> BridgeResult<Vec<T>> {
        let mut out = Vec::new();
        self.for_each_value(|n: f64| {
            out.push(T::narrow(n));
            Ok(())
        })?;
        Ok(out)
    }

    /// Elements narrowed to i8
    pub fn to_byte_array(&self) -> BridgeResult<Vec<i8>> {
        self.numbers()
    }

    /// Elements narrowed to i16
    pub fn to_short_array(&self) -> BridgeResult<Vec<i16>> {
        self.numbers()
    }

    /// Elements narrowed to i32
    pub fn to_int_array(&self) -> BridgeResult<Vec<i32>> {
        self.numbers()
    }

    /// Elements narrowed to i64
    pub fn to_long_array(&self) -> BridgeResult<Vec<i64>> {
        self.numbers()
    }

    /// Elements narrowed to f32
    pub fn to_float_array(&self) -> BridgeResult<Vec<f32>> {
        self.numbers()
    }

    /// Elements as f64
    pub fn to_double_array(&self) -> BridgeResult<Vec<f64>> {
        self.numbers()
    }

    /// Boolean elements
    pub fn to_boolean_array(&self) -> BridgeResult<Vec<bool>> {
        self.as_list()
    }

    /// Characters from numeric code points or one-character strings
    pub fn to_char_array(&self) -> BridgeResult<Vec<char>> {
        let mut out = Vec::new();
        self.for_each_value(|v: HostValue| {
            let c = match &v {
                HostValue::Number(n) => char::from_u32(*n as u32),
                HostValue::String(s) => {
                    let mut chars = s.chars();
                    match (chars.next(), chars.next()) {
                        (Some(c), None) => Some(c),
                        _ => None,
                    }
                }
                _ => None,
            };
            let c = c.ok_or(MarshalError::Cast {
                from: v.kind(),
                to: "char",
            })?;
            out.push(c);
            Ok(())
        })?;
        Ok(out)
    }
}
