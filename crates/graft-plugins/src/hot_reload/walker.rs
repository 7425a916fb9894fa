//! Lifecycle walker
//!
//! Depth-first traversal of a live object graph that installs or removes the
//! commands declared by each reachable object's schema, plus the wider
//! liveness traversal that decides when a module's code is no longer used.

use super::panic_message;
use graft_kernel::object::WeakObjectRef;
use graft_kernel::{
    CommandCallback, CommandTable, ElementKind, FieldKind, FieldValue, ObjectKey, ObjectRef,
};
use std::collections::HashSet;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Result of one walk over a graph.
#[derive(Debug, Default)]
pub struct WalkSummary {
    /// Command names registered or removed
    pub commands: Vec<String>,
    /// Objects visited, in visit order
    pub objects: Vec<WeakObjectRef>,
}

impl WalkSummary {
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }
}

/// Visit every object reachable from `root` through object fields and
/// properties, at most once each. System types are not entered.
pub fn walk(root: &ObjectRef, visit: &mut dyn FnMut(&ObjectRef)) {
    let mut visited = HashSet::new();
    walk_object(root, &mut visited, visit);
}

fn walk_object(
    object: &ObjectRef,
    visited: &mut HashSet<ObjectKey>,
    visit: &mut dyn FnMut(&ObjectRef),
) {
    if !visited.insert(ObjectKey::of(object)) {
        return;
    }
    visit(object);

    for child in children(object) {
        if child.schema().is_system() {
            debug!("Not walking system type {}", child.type_name());
            continue;
        }
        walk_object(&child, visited, visit);
    }
}

/// Every object reachable from `root`, at most once each.
///
/// Unlike [`walk`] this enters system types and the members of object arrays
/// and lists: any of them keeps the module that defines it in use.
pub fn collect_objects(root: &ObjectRef) -> Vec<WeakObjectRef> {
    let mut visited = HashSet::new();
    let mut pending = vec![Arc::clone(root)];
    let mut objects = Vec::new();

    while let Some(object) = pending.pop() {
        if !visited.insert(ObjectKey::of(&object)) {
            continue;
        }
        objects.push(Arc::downgrade(&object));
        pending.extend(references(&object, true));
    }
    objects
}

/// Direct references of `object`, read under one short lock.
fn children(object: &ObjectRef) -> Vec<ObjectRef> {
    references(object, false)
}

fn references(object: &ObjectRef, collections: bool) -> Vec<ObjectRef> {
    let schema = object.schema();
    let state = object.read();
    let mut children = Vec::new();

    for field in schema.fields() {
        let wanted = match field.kind() {
            FieldKind::Object { .. } => true,
            FieldKind::Array(ElementKind::Object) | FieldKind::List(ElementKind::Object) => {
                collections
            }
            _ => false,
        };
        if !wanted {
            continue;
        }
        match field.get(&*state) {
            Ok(FieldValue::Object(Some(child))) => children.push(child),
            Ok(FieldValue::Objects(members)) => children.extend(members),
            Ok(_) => {}
            Err(err) => warn!("Cannot read {}.{}: {}", schema.name(), field.name(), err),
        }
    }

    for property in schema.properties() {
        match property.get(&*state) {
            Ok(Some(child)) => children.push(child),
            Ok(None) => {}
            Err(err) => warn!("Cannot read {}.{}: {}", schema.name(), property.name(), err),
        }
    }

    children
}

/// Register every command declared in the graph under `root`.
///
/// Name conflicts are logged and skipped.
pub fn register_commands(table: &dyn CommandTable, root: &ObjectRef) -> WalkSummary {
    let mut summary = WalkSummary::default();

    walk(root, &mut |object| {
        summary.objects.push(Arc::downgrade(object));

        for spec in object.schema().commands() {
            let target = Arc::downgrade(object);
            let handler = spec.clone();
            let callback: CommandCallback = Arc::new(move |args: &[String]| {
                let Some(object) = target.upgrade() else {
                    warn!("Command '{}' target was released", handler.name());
                    return false;
                };
                let result = catch_unwind(AssertUnwindSafe(|| {
                    handler.invoke(&mut *object.write(), args)
                }));
                match result {
                    Ok(Ok(succeeded)) => succeeded,
                    Ok(Err(err)) => {
                        warn!("Command '{}' failed: {}", handler.name(), err);
                        false
                    }
                    Err(panic) => {
                        error!(
                            "Command '{}' panicked: {}",
                            handler.name(),
                            panic_message(panic.as_ref())
                        );
                        false
                    }
                }
            });

            match table.register(spec.name(), spec.debug_only(), callback) {
                Ok(()) => summary.commands.push(spec.name().to_string()),
                Err(err) => warn!(
                    "Failed to register command '{}' of {}: {}",
                    spec.name(),
                    object.type_name(),
                    err
                ),
            }
        }
    });

    debug!(
        "Registered {} commands over {} objects",
        summary.commands.len(),
        summary.objects.len()
    );
    summary
}

/// Remove every command declared in the graph under `root`.
pub fn unregister_commands(table: &dyn CommandTable, root: &ObjectRef) -> WalkSummary {
    let mut summary = WalkSummary::default();

    walk(root, &mut |object| {
        summary.objects.push(Arc::downgrade(object));

        for spec in object.schema().commands() {
            if table.remove(spec.name()) {
                summary.commands.push(spec.name().to_string());
            } else {
                debug!("Command '{}' was not registered", spec.name());
            }
        }
    });

    debug!(
        "Removed {} commands over {} objects",
        summary.commands.len(),
        summary.objects.len()
    );
    summary
}
