//! Declarative type schemas
//!
//! A [`TypeSchema`] lists the fields, properties, commands and lifecycle hooks
//! of one state type. Fields are declared with accessor pairs (a shared lens
//! and a mutable lens), which the builder turns into type-erased readers and
//! writers exchanging [`FieldValue`]s, plus native accessors for fields whose
//! type is shared across module versions.

use super::native::{self, NativeValue};
use super::{Handle, Object, ObjectRef, Reflect};
use crate::error::{FieldError, FieldResult};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::any::{Any, TypeId, type_name};
use std::fmt;
use std::sync::Arc;

type FieldReader = Box<dyn Fn(&dyn Object) -> FieldResult<FieldValue> + Send + Sync>;
type FieldTaker = Box<dyn Fn(&mut dyn Object) -> FieldResult<FieldValue> + Send + Sync>;
type FieldWriter = Box<dyn Fn(&mut dyn Object, FieldValue) -> FieldResult<()> + Send + Sync>;
type PropertyReader = Box<dyn Fn(&dyn Object) -> FieldResult<Option<ObjectRef>> + Send + Sync>;
type CommandInvoker = Arc<dyn Fn(&mut dyn Object, &[String]) -> FieldResult<bool> + Send + Sync>;
type NativeReader = Box<dyn Fn(&dyn Object) -> FieldResult<NativeValue> + Send + Sync>;
type NativeTaker = Box<dyn Fn(&mut dyn Object) -> FieldResult<NativeValue> + Send + Sync>;
type NativeWriter =
    Box<dyn Fn(&mut dyn Object, NativeValue) -> Result<(), NativeRejected> + Send + Sync>;

/// Lifecycle hook run against one object (constructor, startup).
pub type Hook = Box<dyn Fn(&mut dyn Object) -> anyhow::Result<()> + Send + Sync>;

/// Post-reload notification hook.
pub type NotifyHook = Box<dyn Fn(&mut dyn Object) + Send + Sync>;

/// Element category of an array or list field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    /// Self-contained values, copied or moved freely.
    Value,
    /// References to other graph objects.
    Object,
}

/// Category of a field, which selects its migration policy.
#[derive(Clone, Copy)]
pub enum FieldKind {
    /// Primitive or plain-data value.
    Value,
    /// Fixed-size array (`Box<[E]>`).
    Array(ElementKind),
    /// Growable ordered collection (`Vec<E>`).
    List(ElementKind),
    /// Optional reference to another graph object.
    Object {
        /// Schema of the declared target type.
        target: fn() -> &'static TypeSchema,
    },
}

impl FieldKind {
    pub fn label(&self) -> &'static str {
        match self {
            FieldKind::Value => "value",
            FieldKind::Array(ElementKind::Value) => "value array",
            FieldKind::Array(ElementKind::Object) => "object array",
            FieldKind::List(ElementKind::Value) => "value list",
            FieldKind::List(ElementKind::Object) => "object list",
            FieldKind::Object { .. } => "object",
        }
    }

    pub fn is_object(&self) -> bool {
        matches!(self, FieldKind::Object { .. })
    }
}

impl fmt::Debug for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldKind::Object { target } => write!(f, "Object({})", target().name()),
            other => f.write_str(other.label()),
        }
    }
}

/// Value exchanged between field readers and writers.
#[derive(Debug, Clone)]
pub enum FieldValue {
    Value(serde_json::Value),
    Array(Vec<serde_json::Value>),
    List(Vec<serde_json::Value>),
    Object(Option<ObjectRef>),
    /// Contents of an object array or list, read-only.
    Objects(Vec<ObjectRef>),
}

impl FieldValue {
    pub fn label(&self) -> &'static str {
        match self {
            FieldValue::Value(_) => "value",
            FieldValue::Array(_) => "value array",
            FieldValue::List(_) => "value list",
            FieldValue::Object(_) => "object",
            FieldValue::Objects(_) => "objects",
        }
    }
}

/// Capabilities a type can advertise to the reload engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// The unique command root of a module.
    Entry,
    /// Wants a notification after a hot reload.
    Hotload,
}

/// Return shapes accepted from command handlers.
pub trait CommandOutput {
    fn succeeded(self) -> bool;
}

impl CommandOutput for () {
    fn succeeded(self) -> bool {
        true
    }
}

impl CommandOutput for bool {
    fn succeeded(self) -> bool {
        self
    }
}

/// One declared field.
pub struct FieldSchema {
    name: &'static str,
    kind: FieldKind,
    type_name: &'static str,
    reader: Option<FieldReader>,
    taker: Option<FieldTaker>,
    writer: Option<FieldWriter>,
    native: Option<NativeAccess>,
}

/// Accessors exchanging the field's own Rust value.
struct NativeAccess {
    type_id: TypeId,
    reader: NativeReader,
    taker: Option<NativeTaker>,
    writer: NativeWriter,
}

/// A native value a field refused, handed back so it can be restored.
#[derive(Debug)]
pub struct NativeRejected {
    pub error: FieldError,
    pub value: NativeValue,
}

impl FieldSchema {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn kind(&self) -> FieldKind {
        self.kind
    }

    /// Rust type of the field as declared.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Read the current value without changing the object.
    pub fn get(&self, object: &dyn Object) -> FieldResult<FieldValue> {
        match &self.reader {
            Some(reader) => reader(object),
            None => Err(FieldError::NotReadable(self.name)),
        }
    }

    /// Move the value out, leaving the field empty.
    pub fn take(&self, object: &mut dyn Object) -> FieldResult<FieldValue> {
        match &self.taker {
            Some(taker) => taker(object),
            None => Err(FieldError::NotReadable(self.name)),
        }
    }

    pub fn set(&self, object: &mut dyn Object, value: FieldValue) -> FieldResult<()> {
        match &self.writer {
            Some(writer) => writer(object, value),
            None => Err(FieldError::NotWritable(self.name)),
        }
    }

    /// `TypeId` of the field's value when it can be transferred natively.
    ///
    /// Two fields reporting the same id hold the same standard-library type,
    /// so a value read from one can be written into the other bit for bit.
    pub fn native_type(&self) -> Option<TypeId> {
        self.native.as_ref().map(|native| native.type_id)
    }

    /// Clone the current value without going through JSON.
    pub fn get_native(&self, object: &dyn Object) -> FieldResult<NativeValue> {
        match &self.native {
            Some(native) => (native.reader)(object),
            None => Err(FieldError::NotNative(self.name)),
        }
    }

    /// Move a list out natively, leaving the field empty.
    pub fn take_native(&self, object: &mut dyn Object) -> FieldResult<NativeValue> {
        match self.native.as_ref().and_then(|native| native.taker.as_ref()) {
            Some(taker) => taker(object),
            None => Err(FieldError::NotNative(self.name)),
        }
    }

    /// Write a native value. A value of the wrong type is handed back.
    pub fn set_native(
        &self,
        object: &mut dyn Object,
        value: NativeValue,
    ) -> Result<(), NativeRejected> {
        match &self.native {
            Some(native) => (native.writer)(object, value),
            None => Err(NativeRejected {
                error: FieldError::NotNative(self.name),
                value,
            }),
        }
    }
}

impl fmt::Debug for FieldSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldSchema")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("type", &self.type_name)
            .finish()
    }
}

/// Computed, read-only reference exposed to the lifecycle walker.
pub struct PropertySchema {
    name: &'static str,
    reader: PropertyReader,
}

impl PropertySchema {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn get(&self, object: &dyn Object) -> FieldResult<Option<ObjectRef>> {
        (self.reader)(object)
    }
}

/// A command handler declared on a type.
#[derive(Clone)]
pub struct CommandSpec {
    name: String,
    debug_only: bool,
    invoker: CommandInvoker,
}

impl CommandSpec {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn debug_only(&self) -> bool {
        self.debug_only
    }

    /// Run the handler against `object`.
    pub fn invoke(&self, object: &mut dyn Object, args: &[String]) -> FieldResult<bool> {
        (self.invoker)(object, args)
    }
}

impl fmt::Debug for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandSpec")
            .field("name", &self.name)
            .field("debug_only", &self.debug_only)
            .finish()
    }
}

/// Schema of one state type.
pub struct TypeSchema {
    name: &'static str,
    type_id: TypeId,
    entry: bool,
    system: bool,
    allocate: fn() -> ObjectRef,
    fields: Vec<FieldSchema>,
    properties: Vec<PropertySchema>,
    commands: Vec<CommandSpec>,
    constructor: Option<Hook>,
    startup: Option<Hook>,
    on_hotload: Option<NotifyHook>,
}

impl TypeSchema {
    pub fn builder<T: Reflect + Default>(name: &'static str) -> SchemaBuilder<T> {
        SchemaBuilder::new(name)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn is_entry(&self) -> bool {
        self.entry
    }

    /// System types are never walked for commands.
    pub fn is_system(&self) -> bool {
        self.system
    }

    pub fn implements(&self, capability: Capability) -> bool {
        match capability {
            Capability::Entry => self.entry,
            Capability::Hotload => self.on_hotload.is_some(),
        }
    }

    /// Allocate an instance in its default state; no constructor runs.
    pub fn allocate(&self) -> ObjectRef {
        (self.allocate)()
    }

    pub fn fields(&self) -> &[FieldSchema] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|field| field.name == name)
    }

    pub fn properties(&self) -> &[PropertySchema] {
        &self.properties
    }

    pub fn commands(&self) -> &[CommandSpec] {
        &self.commands
    }

    pub fn has_constructor(&self) -> bool {
        self.constructor.is_some()
    }

    pub fn has_startup(&self) -> bool {
        self.startup.is_some()
    }

    /// Run the constructor hook, if any.
    pub fn construct(&self, object: &mut dyn Object) -> anyhow::Result<()> {
        match &self.constructor {
            Some(hook) => hook(object),
            None => Ok(()),
        }
    }

    /// Run the startup hook, if any.
    pub fn startup(&self, object: &mut dyn Object) -> anyhow::Result<()> {
        match &self.startup {
            Some(hook) => hook(object),
            None => Ok(()),
        }
    }

    /// Run the hot-reload notification hook. Returns whether one ran.
    pub fn notify_hotload(&self, object: &mut dyn Object) -> bool {
        match &self.on_hotload {
            Some(hook) => {
                hook(object);
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for TypeSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeSchema")
            .field("name", &self.name)
            .field("entry", &self.entry)
            .field("system", &self.system)
            .field("fields", &self.fields)
            .field("commands", &self.commands)
            .finish_non_exhaustive()
    }
}

fn downcast_ref<T: Reflect>(object: &dyn Object) -> FieldResult<&T> {
    object
        .as_any()
        .downcast_ref::<T>()
        .ok_or(FieldError::ObjectMismatch {
            expected: type_name::<T>(),
        })
}

fn downcast_mut<T: Reflect>(object: &mut dyn Object) -> FieldResult<&mut T> {
    object
        .as_any_mut()
        .downcast_mut::<T>()
        .ok_or(FieldError::ObjectMismatch {
            expected: type_name::<T>(),
        })
}

fn encode<V: Serialize>(field: &'static str, value: &V) -> FieldResult<serde_json::Value> {
    serde_json::to_value(value).map_err(|source| FieldError::Encode { field, source })
}

fn encode_all<V: Serialize>(
    field: &'static str,
    values: &[V],
) -> FieldResult<Vec<serde_json::Value>> {
    values.iter().map(|value| encode(field, value)).collect()
}

fn decode<V: DeserializeOwned>(field: &'static str, value: serde_json::Value) -> FieldResult<V> {
    serde_json::from_value(value).map_err(|source| FieldError::Decode { field, source })
}

fn decode_all<V: DeserializeOwned>(
    field: &'static str,
    values: Vec<serde_json::Value>,
) -> FieldResult<Vec<V>> {
    values.into_iter().map(|value| decode(field, value)).collect()
}

/// Native accessors for a field of type `F`, if `F` is a shared type.
fn native_access<T, F, G, M>(
    name: &'static str,
    get: Arc<G>,
    get_mut: Arc<M>,
) -> Option<NativeAccess>
where
    T: Reflect,
    F: 'static,
    G: Fn(&T) -> &F + Send + Sync + 'static,
    M: Fn(&mut T) -> &mut F + Send + Sync + 'static,
{
    if !native::is_shared::<F>() {
        return None;
    }
    let reader: NativeReader = Box::new(move |object: &dyn Object| {
        let state = downcast_ref::<T>(object)?;
        native::clone_shared(get(state) as &dyn Any).ok_or(FieldError::NotNative(name))
    });
    let writer: NativeWriter = Box::new(move |object: &mut dyn Object, value: NativeValue| {
        let state = match downcast_mut::<T>(object) {
            Ok(state) => state,
            Err(error) => return Err(NativeRejected { error, value }),
        };
        match value.downcast::<F>() {
            Ok(value) => {
                *get_mut(state) = *value;
                Ok(())
            }
            Err(value) => Err(NativeRejected {
                error: FieldError::TypeMismatch {
                    field: name,
                    expected: type_name::<F>(),
                },
                value,
            }),
        }
    });
    Some(NativeAccess {
        type_id: TypeId::of::<F>(),
        reader,
        taker: None,
        writer,
    })
}

fn allocate_default<T: Reflect + Default>() -> ObjectRef {
    Handle::new(T::default()).into_object()
}

/// Builder for a [`TypeSchema`] describing `T`.
pub struct SchemaBuilder<T> {
    schema: TypeSchema,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T: Reflect + Default> SchemaBuilder<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            schema: TypeSchema {
                name,
                type_id: TypeId::of::<T>(),
                entry: false,
                system: false,
                allocate: allocate_default::<T>,
                fields: Vec::new(),
                properties: Vec::new(),
                commands: Vec::new(),
                constructor: None,
                startup: None,
                on_hotload: None,
            },
            _marker: std::marker::PhantomData,
        }
    }

    /// Mark the type as the module's command root.
    pub fn entry(mut self) -> Self {
        self.schema.entry = true;
        self
    }

    /// Mark the type as a platform type the walker never descends into.
    pub fn system(mut self) -> Self {
        self.schema.system = true;
        self
    }

    fn push_field(&mut self, field: FieldSchema) {
        self.schema.fields.retain(|existing| existing.name != field.name);
        self.schema.fields.push(field);
    }

    /// Declare a plain-data field.
    pub fn value<V, G, M>(mut self, name: &'static str, get: G, get_mut: M) -> Self
    where
        V: Serialize + DeserializeOwned + 'static,
        G: Fn(&T) -> &V + Send + Sync + 'static,
        M: Fn(&mut T) -> &mut V + Send + Sync + 'static,
    {
        let get = Arc::new(get);
        let get_mut = Arc::new(get_mut);
        let native = native_access::<T, V, G, M>(name, Arc::clone(&get), Arc::clone(&get_mut));

        let reader: FieldReader = Box::new(move |object: &dyn Object| {
            let state = downcast_ref::<T>(object)?;
            encode(name, get(state)).map(FieldValue::Value)
        });
        let writer: FieldWriter = Box::new(move |object: &mut dyn Object, value: FieldValue| {
            let state = downcast_mut::<T>(object)?;
            match value {
                FieldValue::Value(value) => {
                    *get_mut(state) = decode(name, value)?;
                    Ok(())
                }
                other => Err(FieldError::KindMismatch {
                    field: name,
                    expected: "value",
                    actual: other.label(),
                }),
            }
        });
        self.push_field(FieldSchema {
            name,
            kind: FieldKind::Value,
            type_name: type_name::<V>(),
            reader: Some(reader),
            taker: None,
            writer: Some(writer),
            native,
        });
        self
    }

    /// Declare a fixed-size array of plain-data elements.
    pub fn array<V, G, M>(mut self, name: &'static str, get: G, get_mut: M) -> Self
    where
        V: Serialize + DeserializeOwned + 'static,
        G: Fn(&T) -> &Box<[V]> + Send + Sync + 'static,
        M: Fn(&mut T) -> &mut Box<[V]> + Send + Sync + 'static,
    {
        let get = Arc::new(get);
        let get_mut = Arc::new(get_mut);
        let native =
            native_access::<T, Box<[V]>, G, M>(name, Arc::clone(&get), Arc::clone(&get_mut));

        let reader: FieldReader = Box::new(move |object: &dyn Object| {
            let state = downcast_ref::<T>(object)?;
            encode_all(name, get(state)).map(FieldValue::Array)
        });
        let writer: FieldWriter = Box::new(move |object: &mut dyn Object, value: FieldValue| {
            let state = downcast_mut::<T>(object)?;
            match value {
                FieldValue::Array(values) => {
                    *get_mut(state) = decode_all::<V>(name, values)?.into_boxed_slice();
                    Ok(())
                }
                other => Err(FieldError::KindMismatch {
                    field: name,
                    expected: "value array",
                    actual: other.label(),
                }),
            }
        });
        self.push_field(FieldSchema {
            name,
            kind: FieldKind::Array(ElementKind::Value),
            type_name: type_name::<Box<[V]>>(),
            reader: Some(reader),
            taker: None,
            writer: Some(writer),
            native,
        });
        self
    }

    /// Declare a growable list of plain-data elements.
    ///
    /// Lists are moved during migration: the old object's list is left empty.
    pub fn list<V, G, M>(mut self, name: &'static str, get: G, get_mut: M) -> Self
    where
        V: Serialize + DeserializeOwned + 'static,
        G: Fn(&T) -> &Vec<V> + Send + Sync + 'static,
        M: Fn(&mut T) -> &mut Vec<V> + Send + Sync + 'static,
    {
        let get = Arc::new(get);
        let get_mut = Arc::new(get_mut);
        let mut native =
            native_access::<T, Vec<V>, G, M>(name, Arc::clone(&get), Arc::clone(&get_mut));
        if let Some(access) = native.as_mut() {
            let take_lens = Arc::clone(&get_mut);
            access.taker = Some(Box::new(move |object: &mut dyn Object| {
                let state = downcast_mut::<T>(object)?;
                let list = take_lens(state);
                let moved =
                    native::clone_shared(&*list as &dyn Any).ok_or(FieldError::NotNative(name))?;
                drop(std::mem::take(list));
                Ok(moved)
            }));
        }

        let take_lens = Arc::clone(&get_mut);
        let reader: FieldReader = Box::new(move |object: &dyn Object| {
            let state = downcast_ref::<T>(object)?;
            encode_all(name, get(state)).map(FieldValue::List)
        });
        let taker: FieldTaker = Box::new(move |object: &mut dyn Object| {
            let state = downcast_mut::<T>(object)?;
            let list = take_lens(state);
            let values = encode_all(name, list)?;
            drop(std::mem::take(list));
            Ok(FieldValue::List(values))
        });
        let writer: FieldWriter = Box::new(move |object: &mut dyn Object, value: FieldValue| {
            let state = downcast_mut::<T>(object)?;
            match value {
                FieldValue::List(values) => {
                    *get_mut(state) = decode_all(name, values)?;
                    Ok(())
                }
                other => Err(FieldError::KindMismatch {
                    field: name,
                    expected: "value list",
                    actual: other.label(),
                }),
            }
        });
        self.push_field(FieldSchema {
            name,
            kind: FieldKind::List(ElementKind::Value),
            type_name: type_name::<Vec<V>>(),
            reader: Some(reader),
            taker: Some(taker),
            writer: Some(writer),
            native,
        });
        self
    }

    /// Declare an optional reference to another graph object.
    pub fn object<U, G, M>(mut self, name: &'static str, get: G, get_mut: M) -> Self
    where
        U: Reflect,
        G: Fn(&T) -> &Option<Handle<U>> + Send + Sync + 'static,
        M: Fn(&mut T) -> &mut Option<Handle<U>> + Send + Sync + 'static,
    {
        let reader: FieldReader = Box::new(move |object: &dyn Object| {
            let state = downcast_ref::<T>(object)?;
            Ok(FieldValue::Object(get(state).as_ref().map(Handle::to_object)))
        });
        let writer: FieldWriter = Box::new(move |object: &mut dyn Object, value: FieldValue| {
            let state = downcast_mut::<T>(object)?;
            match value {
                FieldValue::Object(None) => {
                    *get_mut(state) = None;
                    Ok(())
                }
                FieldValue::Object(Some(target)) => {
                    let handle =
                        Handle::<U>::from_object(target).ok_or(FieldError::ReferenceMismatch {
                            field: name,
                            expected: type_name::<U>(),
                        })?;
                    *get_mut(state) = Some(handle);
                    Ok(())
                }
                other => Err(FieldError::KindMismatch {
                    field: name,
                    expected: "object",
                    actual: other.label(),
                }),
            }
        });
        self.push_field(FieldSchema {
            name,
            kind: FieldKind::Object {
                target: <U as Reflect>::schema,
            },
            type_name: type_name::<Option<Handle<U>>>(),
            reader: Some(reader),
            taker: None,
            writer: Some(writer),
            native: None,
        });
        self
    }

    /// Declare an array of object references.
    ///
    /// Such fields cannot be migrated; declaring them lets a reload fail
    /// loudly instead of silently dropping the data. The lens only lets the
    /// engine see which objects the array keeps alive.
    pub fn object_array<U, G>(mut self, name: &'static str, get: G) -> Self
    where
        U: Reflect,
        G: Fn(&T) -> &Box<[Handle<U>]> + Send + Sync + 'static,
    {
        let reader: FieldReader = Box::new(move |object: &dyn Object| {
            let state = downcast_ref::<T>(object)?;
            Ok(FieldValue::Objects(get(state).iter().map(Handle::to_object).collect()))
        });
        self.push_field(FieldSchema {
            name,
            kind: FieldKind::Array(ElementKind::Object),
            type_name: type_name::<Box<[Handle<U>]>>(),
            reader: Some(reader),
            taker: None,
            writer: None,
            native: None,
        });
        self
    }

    /// Declare a list of object references. Not migratable, see [`Self::object_array`].
    pub fn object_list<U, G>(mut self, name: &'static str, get: G) -> Self
    where
        U: Reflect,
        G: Fn(&T) -> &Vec<Handle<U>> + Send + Sync + 'static,
    {
        let reader: FieldReader = Box::new(move |object: &dyn Object| {
            let state = downcast_ref::<T>(object)?;
            Ok(FieldValue::Objects(get(state).iter().map(Handle::to_object).collect()))
        });
        self.push_field(FieldSchema {
            name,
            kind: FieldKind::List(ElementKind::Object),
            type_name: type_name::<Vec<Handle<U>>>(),
            reader: Some(reader),
            taker: None,
            writer: None,
            native: None,
        });
        self
    }

    /// Declare a computed reference the walker follows. Not migrated.
    pub fn property<U, G>(mut self, name: &'static str, get: G) -> Self
    where
        U: Reflect,
        G: Fn(&T) -> Option<Handle<U>> + Send + Sync + 'static,
    {
        let reader: PropertyReader = Box::new(move |object: &dyn Object| {
            let state = downcast_ref::<T>(object)?;
            Ok(get(state).map(Handle::into_object))
        });
        self.schema.properties.push(PropertySchema { name, reader });
        self
    }

    /// Declare a command handler.
    ///
    /// Handlers return `()` (always succeeds) or `bool`.
    pub fn command<R, F>(mut self, name: impl Into<String>, debug_only: bool, handler: F) -> Self
    where
        R: CommandOutput,
        F: Fn(&mut T, &[String]) -> R + Send + Sync + 'static,
    {
        let invoker: CommandInvoker =
            Arc::new(move |object: &mut dyn Object, args: &[String]| {
                let state = downcast_mut::<T>(object)?;
                Ok(handler(state, args).succeeded())
            });
        self.schema.commands.push(CommandSpec {
            name: name.into(),
            debug_only,
            invoker,
        });
        self
    }

    /// Parameterless constructor, run on cold start before `startup`.
    pub fn constructor<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.schema.constructor = Some(Box::new(move |object: &mut dyn Object| {
            hook(downcast_mut::<T>(object)?)
        }));
        self
    }

    /// Startup hook, run once on cold start only.
    pub fn startup<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.schema.startup = Some(Box::new(move |object: &mut dyn Object| {
            hook(downcast_mut::<T>(object)?)
        }));
        self
    }

    /// Notification run on every migrated object after a hot reload.
    pub fn on_hotload<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut T) + Send + Sync + 'static,
    {
        self.schema.on_hotload = Some(Box::new(move |object: &mut dyn Object| {
            match downcast_mut::<T>(object) {
                Ok(state) => hook(state),
                Err(err) => tracing::warn!("Skipping hot-reload notification: {}", err),
            }
        }));
        self
    }

    pub fn build(self) -> TypeSchema {
        self.schema
    }
}
