//! Reloadable object graph
//!
//! Plugin state lives in [`ObjectCell`]s shared through [`ObjectRef`] (type
//! erased) or [`Handle<T>`] (typed). Each cell carries the [`TypeSchema`] of
//! its concrete type, so the reload engine can walk and migrate a graph built
//! by code it was not compiled against.

mod native;
mod schema;

pub use native::NativeValue;
pub use schema::{
    Capability, CommandOutput, CommandSpec, ElementKind, FieldKind, FieldSchema, FieldValue,
    Hook, NativeRejected, NotifyHook, PropertySchema, SchemaBuilder, TypeSchema,
};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::any::{Any, TypeId};
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Weak};

/// Any state type that can sit in an object graph.
pub trait Object: Any + Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any + Send + Sync> Object for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// A state type with a declared schema.
///
/// Usually implemented through [`reflect!`](crate::reflect).
pub trait Reflect: Object + Sized {
    fn schema() -> &'static TypeSchema;
}

/// Shared cell holding one object of the graph.
pub struct ObjectCell<T: ?Sized> {
    schema: &'static TypeSchema,
    type_id: TypeId,
    state: RwLock<T>,
}

/// Type-erased shared reference to a graph object.
pub type ObjectRef = Arc<ObjectCell<dyn Object>>;

/// Weak counterpart of [`ObjectRef`].
pub type WeakObjectRef = Weak<ObjectCell<dyn Object>>;

impl ObjectCell<dyn Object> {
    /// Schema of the concrete type stored in this cell.
    pub fn schema(&self) -> &'static TypeSchema {
        self.schema
    }

    pub fn type_name(&self) -> &'static str {
        self.schema.name()
    }

    /// Whether the cell stores a `T`.
    pub fn is<T: Any>(&self) -> bool {
        self.type_id == TypeId::of::<T>()
    }

    pub fn read(&self) -> RwLockReadGuard<'_, dyn Object + 'static> {
        self.state.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, dyn Object + 'static> {
        self.state.write()
    }
}

impl fmt::Debug for ObjectCell<dyn Object> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectCell")
            .field("type", &self.schema.name())
            .finish_non_exhaustive()
    }
}

/// Identity of a graph object, stable while the object is alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey(usize);

impl ObjectKey {
    pub fn of(object: &ObjectRef) -> Self {
        Self(Arc::as_ptr(object) as *const () as usize)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Typed shared reference to a graph object.
///
/// Plugin state declares its reference fields as `Option<Handle<U>>`.
pub struct Handle<T: Reflect> {
    cell: Arc<ObjectCell<T>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Reflect> Handle<T> {
    pub fn new(value: T) -> Self {
        Self {
            cell: Arc::new(ObjectCell {
                schema: T::schema(),
                type_id: TypeId::of::<T>(),
                state: RwLock::new(value),
            }),
            _marker: PhantomData,
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.cell.state.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.cell.state.write()
    }

    /// Erase the type, sharing the same cell.
    pub fn to_object(&self) -> ObjectRef {
        let object: ObjectRef = self.cell.clone();
        object
    }

    pub fn into_object(self) -> ObjectRef {
        let object: ObjectRef = self.cell;
        object
    }

    /// Recover a typed handle from an erased reference.
    ///
    /// Returns `None` when the cell stores another type.
    pub fn from_object(object: ObjectRef) -> Option<Self> {
        if !object.is::<T>() {
            return None;
        }
        let raw = Arc::into_raw(object) as *const ObjectCell<T>;
        // SAFETY: the cell was allocated as `ObjectCell<T>` (its type id
        // matches `T`) and only unsized afterwards, so the data pointer has
        // the layout of `ObjectCell<T>`.
        let cell = unsafe { Arc::from_raw(raw) };
        Some(Self {
            cell,
            _marker: PhantomData,
        })
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey(Arc::as_ptr(&self.cell) as *const () as usize)
    }

    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.cell, &b.cell)
    }

    pub fn strong_count(this: &Self) -> usize {
        Arc::strong_count(&this.cell)
    }
}

impl<T: Reflect> Clone for Handle<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
            _marker: PhantomData,
        }
    }
}

impl<T: Reflect> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle<{}>({})", self.cell.schema.name(), self.key())
    }
}

/// Implement [`Reflect`] for a type, caching its schema in a `OnceLock`.
///
/// ```rust,ignore
/// #[derive(Default)]
/// struct Counter { hits: u64 }
///
/// graft_kernel::reflect!(Counter, |schema| schema
///     .entry()
///     .value("hits", |c| &c.hits, |c| &mut c.hits)
///     .command("hits", false, |c, _args| println!("{}", c.hits))
///     .build());
/// ```
#[macro_export]
macro_rules! reflect {
    ($ty:ty, |$builder:ident| $body:expr) => {
        impl $crate::object::Reflect for $ty {
            fn schema() -> &'static $crate::object::TypeSchema {
                static SCHEMA: ::std::sync::OnceLock<$crate::object::TypeSchema> =
                    ::std::sync::OnceLock::new();
                SCHEMA.get_or_init(|| {
                    let $builder = $crate::object::TypeSchema::builder::<$ty>(stringify!($ty));
                    $body
                })
            }
        }
    };
}
