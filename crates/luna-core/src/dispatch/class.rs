//! Host class registry
//!
//! Host types are exposed to the guest by explicit registration. A class
//! lists its fields, methods and constructors in declaration order, which
//! is also the order the resolver tries them in. A class may also declare
//! indexed elements, which makes its instances usable as guest arrays.

use super::coerce::{Arg, ParamType};
use crate::error::{BridgeError, BridgeResult, HostError};
use crate::session::Session;
use crate::value::{HostObject, HostValue};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

/// Identifier of a registered class
///
/// Pushed to the guest as userdata, a class id stands for the class itself
/// and gives static access to its members.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(u32);

impl ClassId {
    /// Position in the registry
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "class#{}", self.0)
    }
}

// ============================================================================
// Invocation context
// ============================================================================

static NIL_ARG: Arg = Arg::Nil;

/// Arguments of one resolved call
pub struct Invoke<'a> {
    session: &'a Arc<Session>,
    this: Option<&'a HostObject>,
    args: &'a [Arg],
}

impl<'a> Invoke<'a> {
    pub(crate) fn new(
        session: &'a Arc<Session>,
        this: Option<&'a HostObject>,
        args: &'a [Arg],
    ) -> Self {
        Self {
            session,
            this,
            args,
        }
    }

    /// Session the call came from
    pub fn session(&self) -> &Arc<Session> {
        self.session
    }

    /// Receiver, absent for static calls
    pub fn receiver(&self) -> Option<&HostObject> {
        self.this
    }

    /// Receiver downcast to `T`
    pub fn this<T: Any>(&self) -> Result<&T, HostError> {
        let this = self.this.ok_or("no receiver for instance member")?;
        this.downcast_ref::<T>()
            .ok_or_else(|| format!("receiver is a {}", this.type_name()).into())
    }

    /// Coerced arguments
    pub fn args(&self) -> &[Arg] {
        self.args
    }

    /// Argument at `i`, nil when out of range
    pub fn arg(&self, i: usize) -> &Arg {
        self.args.get(i).unwrap_or(&NIL_ARG)
    }
}

/// Method body
pub type Invoker = Arc<dyn Fn(&Invoke<'_>) -> Result<Option<HostValue>, HostError> + Send + Sync>;

/// Constructor body
pub type Factory = Arc<dyn Fn(&Invoke<'_>) -> Result<HostObject, HostError> + Send + Sync>;

/// Field reader; the receiver is absent for static fields
pub type Getter = Arc<dyn Fn(Option<&HostObject>) -> Result<HostValue, HostError> + Send + Sync>;

/// Field writer; the receiver is absent for static fields
pub type Setter = Arc<dyn Fn(Option<&HostObject>, &Arg) -> Result<(), HostError> + Send + Sync>;

/// Element count of an array-like instance
pub type Length = Arc<dyn Fn(&HostObject) -> Result<usize, HostError> + Send + Sync>;

/// Element reader taking a 0-based position
pub type ElementGetter =
    Arc<dyn Fn(&HostObject, usize) -> Result<HostValue, HostError> + Send + Sync>;

/// Element writer taking a 0-based position
pub type ElementSetter =
    Arc<dyn Fn(&HostObject, usize, &Arg) -> Result<(), HostError> + Send + Sync>;

// ============================================================================
// Members
// ============================================================================

/// A registered field
#[derive(Clone)]
pub struct FieldDef {
    /// Field name
    pub name: String,
    /// Accepted type for writes
    pub ty: ParamType,
    /// Whether the field belongs to the class rather than instances
    pub is_static: bool,
    pub(crate) getter: Getter,
    pub(crate) setter: Option<Setter>,
}

impl FieldDef {
    /// Check if the field accepts writes
    pub fn is_writable(&self) -> bool {
        self.setter.is_some()
    }
}

/// A registered method overload
#[derive(Clone)]
pub struct MethodDef {
    /// Method name
    pub name: String,
    /// Declared parameter types
    pub params: Vec<ParamType>,
    /// Whether the method is called without a receiver
    pub is_static: bool,
    pub(crate) invoker: Invoker,
}

/// Indexed element access of an array-like class
///
/// Positions handed to the accessors are 0-based and already checked
/// against the current length.
#[derive(Clone)]
pub struct ElementsDef {
    /// Accepted type for element writes
    pub ty: ParamType,
    pub(crate) len: Length,
    pub(crate) getter: ElementGetter,
    pub(crate) setter: Option<ElementSetter>,
}

impl ElementsDef {
    /// Check if elements accept writes
    pub fn is_writable(&self) -> bool {
        self.setter.is_some()
    }
}

/// A registered constructor overload
#[derive(Clone)]
pub struct ConstructorDef {
    /// Declared parameter types
    pub params: Vec<ParamType>,
    pub(crate) factory: Factory,
}

macro_rules! opaque_debug {
    ($ty:ident { $($field:ident),* }) => {
        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($ty))
                    $(.field(stringify!($field), &self.$field))*
                    .finish_non_exhaustive()
            }
        }
    };
}

opaque_debug!(FieldDef { name, ty, is_static });
opaque_debug!(MethodDef { name, params, is_static });
opaque_debug!(ConstructorDef { params });
opaque_debug!(ElementsDef { ty });

/// A registered host class
#[derive(Debug)]
pub struct ClassDef {
    /// Class id
    pub id: ClassId,
    /// Class name
    pub name: String,
    /// Superclass
    pub parent: Option<ClassId>,
    /// Rust type of instances, when bound to one
    pub type_id: Option<TypeId>,
    /// Fields in declaration order
    pub fields: Vec<FieldDef>,
    /// Methods in declaration order
    pub methods: Vec<MethodDef>,
    /// Constructors in declaration order
    pub constructors: Vec<ConstructorDef>,
    /// Indexed elements, for array-like classes
    pub elements: Option<ElementsDef>,
}

impl ClassDef {
    /// First field declared with `name` in this class
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Overloads declared with `name` in this class
    pub fn methods_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a MethodDef> + 'a {
        self.methods.iter().filter(move |m| m.name == name)
    }

    /// Check if any method is declared with `name`
    pub fn has_method(&self, name: &str) -> bool {
        self.methods.iter().any(|m| m.name == name)
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Declares a class before registration
pub struct ClassBuilder {
    name: String,
    parent: Option<ClassId>,
    type_id: Option<TypeId>,
    fields: Vec<FieldDef>,
    methods: Vec<MethodDef>,
    constructors: Vec<ConstructorDef>,
    elements: Option<ElementsDef>,
}

impl ClassBuilder {
    /// Start a class not bound to a Rust type
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parent: None,
            type_id: None,
            fields: Vec::new(),
            methods: Vec::new(),
            constructors: Vec::new(),
            elements: None,
        }
    }

    /// Start a class whose instances are host objects of type `T`
    pub fn for_type<T: Any + Send + Sync>(name: impl Into<String>) -> Self {
        let mut builder = Self::new(name);
        builder.type_id = Some(TypeId::of::<T>());
        builder
    }

    /// Set the superclass
    pub fn extends(mut self, parent: ClassId) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Declare a read-only instance field
    pub fn field<G>(self, name: impl Into<String>, ty: ParamType, get: G) -> Self
    where
        G: Fn(&HostObject) -> Result<HostValue, HostError> + Send + Sync + 'static,
    {
        self.push_field(name.into(), ty, false, instance_getter(get), None)
    }

    /// Declare a writable instance field
    pub fn field_mut<G, S>(self, name: impl Into<String>, ty: ParamType, get: G, set: S) -> Self
    where
        G: Fn(&HostObject) -> Result<HostValue, HostError> + Send + Sync + 'static,
        S: Fn(&HostObject, &Arg) -> Result<(), HostError> + Send + Sync + 'static,
    {
        let setter: Setter = Arc::new(
            move |this: Option<&HostObject>, value: &Arg| -> Result<(), HostError> {
                let this = this.ok_or("instance field accessed without a receiver")?;
                set(this, value)
            },
        );
        self.push_field(name.into(), ty, false, instance_getter(get), Some(setter))
    }

    /// Declare a read-only static field
    pub fn static_field<G>(self, name: impl Into<String>, ty: ParamType, get: G) -> Self
    where
        G: Fn() -> Result<HostValue, HostError> + Send + Sync + 'static,
    {
        let getter: Getter = Arc::new(move |_: Option<&HostObject>| get());
        self.push_field(name.into(), ty, true, getter, None)
    }

    /// Declare a writable static field
    pub fn static_field_mut<G, S>(
        self,
        name: impl Into<String>,
        ty: ParamType,
        get: G,
        set: S,
    ) -> Self
    where
        G: Fn() -> Result<HostValue, HostError> + Send + Sync + 'static,
        S: Fn(&Arg) -> Result<(), HostError> + Send + Sync + 'static,
    {
        let getter: Getter = Arc::new(move |_: Option<&HostObject>| get());
        let setter: Setter = Arc::new(move |_: Option<&HostObject>, value: &Arg| set(value));
        self.push_field(name.into(), ty, true, getter, Some(setter))
    }

    fn push_field(
        mut self,
        name: String,
        ty: ParamType,
        is_static: bool,
        getter: Getter,
        setter: Option<Setter>,
    ) -> Self {
        self.fields.push(FieldDef {
            name,
            ty,
            is_static,
            getter,
            setter,
        });
        self
    }

    /// Declare an instance method overload
    pub fn method<F>(self, name: impl Into<String>, params: impl Into<Vec<ParamType>>, f: F) -> Self
    where
        F: Fn(&Invoke<'_>) -> Result<Option<HostValue>, HostError> + Send + Sync + 'static,
    {
        self.push_method(name.into(), params.into(), false, Arc::new(f))
    }

    /// Declare a static method overload
    pub fn static_method<F>(
        self,
        name: impl Into<String>,
        params: impl Into<Vec<ParamType>>,
        f: F,
    ) -> Self
    where
        F: Fn(&Invoke<'_>) -> Result<Option<HostValue>, HostError> + Send + Sync + 'static,
    {
        self.push_method(name.into(), params.into(), true, Arc::new(f))
    }

    fn push_method(
        mut self,
        name: String,
        params: Vec<ParamType>,
        is_static: bool,
        invoker: Invoker,
    ) -> Self {
        self.methods.push(MethodDef {
            name,
            params,
            is_static,
            invoker,
        });
        self
    }

    /// Declare a constructor overload
    pub fn constructor<F>(mut self, params: impl Into<Vec<ParamType>>, f: F) -> Self
    where
        F: Fn(&Invoke<'_>) -> Result<HostObject, HostError> + Send + Sync + 'static,
    {
        self.constructors.push(ConstructorDef {
            params: params.into(),
            factory: Arc::new(f),
        });
        self
    }

    /// Declare read-only indexed elements
    pub fn elements<L, G>(mut self, ty: ParamType, len: L, get: G) -> Self
    where
        L: Fn(&HostObject) -> Result<usize, HostError> + Send + Sync + 'static,
        G: Fn(&HostObject, usize) -> Result<HostValue, HostError> + Send + Sync + 'static,
    {
        self.elements = Some(ElementsDef {
            ty,
            len: Arc::new(len),
            getter: Arc::new(get),
            setter: None,
        });
        self
    }

    /// Declare writable indexed elements
    pub fn elements_mut<L, G, S>(self, ty: ParamType, len: L, get: G, set: S) -> Self
    where
        L: Fn(&HostObject) -> Result<usize, HostError> + Send + Sync + 'static,
        G: Fn(&HostObject, usize) -> Result<HostValue, HostError> + Send + Sync + 'static,
        S: Fn(&HostObject, usize, &Arg) -> Result<(), HostError> + Send + Sync + 'static,
    {
        let mut builder = self.elements(ty, len, get);
        if let Some(elements) = builder.elements.as_mut() {
            elements.setter = Some(Arc::new(set));
        }
        builder
    }
}

fn instance_getter<G>(get: G) -> Getter
where
    G: Fn(&HostObject) -> Result<HostValue, HostError> + Send + Sync + 'static,
{
    Arc::new(
        move |this: Option<&HostObject>| -> Result<HostValue, HostError> {
            let this = this.ok_or("instance field accessed without a receiver")?;
            get(this)
        },
    )
}

// ============================================================================
// Registry
// ============================================================================

#[derive(Default)]
struct RegistryInner {
    classes: Vec<Arc<ClassDef>>,
    by_name: FxHashMap<String, ClassId>,
    by_type: FxHashMap<TypeId, ClassId>,
}

/// Registered host classes, shared by the sessions that expose them
#[derive(Default)]
pub struct ClassRegistry {
    inner: RwLock<RegistryInner>,
}

impl ClassRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a class
    ///
    /// Names must be unique and the superclass must already be registered.
    pub fn register(&self, builder: ClassBuilder) -> BridgeResult<ClassId> {
        let mut inner = self.inner.write();
        if inner.by_name.contains_key(&builder.name) {
            return Err(BridgeError::InvalidArgument(format!(
                "class '{}' is already registered",
                builder.name
            )));
        }
        if let Some(parent) = builder.parent {
            if parent.index() >= inner.classes.len() {
                return Err(BridgeError::InvalidTarget(format!(
                    "unknown superclass {}",
                    parent
                )));
            }
        }

        let id = ClassId(inner.classes.len() as u32);
        inner.by_name.insert(builder.name.clone(), id);
        if let Some(type_id) = builder.type_id {
            inner.by_type.entry(type_id).or_insert(id);
        }
        inner.classes.push(Arc::new(ClassDef {
            id,
            name: builder.name,
            parent: builder.parent,
            type_id: builder.type_id,
            fields: builder.fields,
            methods: builder.methods,
            constructors: builder.constructors,
            elements: builder.elements,
        }));
        Ok(id)
    }

    /// Get class by id
    pub fn get(&self, id: ClassId) -> BridgeResult<Arc<ClassDef>> {
        self.inner
            .read()
            .classes
            .get(id.index())
            .cloned()
            .ok_or_else(|| BridgeError::InvalidTarget(format!("unknown {}", id)))
    }

    /// Get class by name
    pub fn by_name(&self, name: &str) -> Option<Arc<ClassDef>> {
        let inner = self.inner.read();
        let id = inner.by_name.get(name)?;
        inner.classes.get(id.index()).cloned()
    }

    /// Class bound to the runtime type of `object`
    pub fn class_of(&self, object: &HostObject) -> Option<ClassId> {
        self.inner.read().by_type.get(&object.type_id()).copied()
    }

    /// The class followed by its ancestors, most-derived first
    pub fn lineage(&self, id: ClassId) -> BridgeResult<Vec<Arc<ClassDef>>> {
        let mut chain = Vec::new();
        let mut next = Some(id);
        while let Some(id) = next {
            let class = self.get(id)?;
            next = class.parent;
            chain.push(class);
        }
        Ok(chain)
    }

    /// Check if instances of `from` may be used where `to` is expected
    pub fn is_assignable(&self, from: ClassId, to: ClassId) -> bool {
        let inner = self.inner.read();
        let mut next = Some(from);
        while let Some(id) = next {
            if id == to {
                return true;
            }
            next = inner.classes.get(id.index()).and_then(|c| c.parent);
        }
        false
    }

    /// Number of registered classes
    pub fn len(&self) -> usize {
        self.inner.read().classes.len()
    }

    /// Check if no class is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for ClassRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("ClassRegistry")
            .field("classes", &inner.by_name.keys().collect::<Vec<_>>())
            .finish()
    }
}
