//! Graph adapter
//!
//! Populates a freshly allocated object graph from an old one. Fields are
//! matched by exact name; the new field's kind selects the policy:
//!
//! | new field            | policy                                           |
//! |----------------------|--------------------------------------------------|
//! | value                | copied                                           |
//! | value array          | copied                                           |
//! | value list           | moved, the old list is left empty                |
//! | object reference     | migrated recursively, shared identity preserved  |
//! | object array or list | unsupported, the migration fails                 |
//!
//! New fields without an old counterpart keep their default value; old
//! fields without a new counterpart are dropped. Incompatible values are
//! skipped with a warning.
//!
//! When both sides declare the same standard-library type the value is
//! transferred natively, so NaN, infinities and 128-bit integers survive.
//! Anything else goes through JSON, which also absorbs type drift such as
//! `u32` becoming `u64`.

use super::context::MigrationContext;
use graft_kernel::{ElementKind, FieldKind, FieldSchema, FieldValue, ObjectKey, ObjectRef};
use tracing::{debug, warn};

/// Migration error types
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum MigrationError {
    #[error("Unsupported state transfer of nested array '{owner}.{field}' ({element})")]
    UnsupportedArray {
        owner: String,
        field: String,
        element: String,
    },

    #[error("Unsupported state transfer of object list '{owner}.{field}' ({element})")]
    UnsupportedList {
        owner: String,
        field: String,
        element: String,
    },

    #[error("Object {type_name} {key} was already migrated")]
    AlreadyMapped { type_name: String, key: String },
}

impl MigrationError {
    /// Whether the error comes from a field shape the adapter cannot migrate.
    pub fn is_unsupported(&self) -> bool {
        matches!(
            self,
            MigrationError::UnsupportedArray { .. } | MigrationError::UnsupportedList { .. }
        )
    }
}

/// Migrate `old` into `new`, which must be a fresh object.
///
/// `old` is mapped before its fields are visited, so references back to an
/// ancestor resolve to the ancestor's counterpart.
pub fn adapt_instance(
    ctx: &mut MigrationContext,
    old: &ObjectRef,
    new: &ObjectRef,
) -> Result<(), MigrationError> {
    ctx.map_reference(old, new)?;

    let old_schema = old.schema();
    let new_schema = new.schema();
    debug!(
        "Adapting {} {} -> {}",
        old_schema.name(),
        ObjectKey::of(old),
        new_schema.name()
    );

    for new_field in new_schema.fields() {
        match old_schema.field(new_field.name()) {
            Some(old_field) => adapt_field(ctx, old, old_field, new, new_field)?,
            None => debug!(
                "{}.{} has no old counterpart, keeping default",
                new_schema.name(),
                new_field.name()
            ),
        }
    }

    for old_field in old_schema.fields() {
        if new_schema.field(old_field.name()).is_none() {
            debug!("{}.{} was removed, dropping", old_schema.name(), old_field.name());
        }
    }

    Ok(())
}

fn adapt_field(
    ctx: &mut MigrationContext,
    old: &ObjectRef,
    old_field: &FieldSchema,
    new: &ObjectRef,
    new_field: &FieldSchema,
) -> Result<(), MigrationError> {
    let owner = new.type_name();
    let name = new_field.name();

    match new_field.kind() {
        FieldKind::Array(ElementKind::Object) => Err(MigrationError::UnsupportedArray {
            owner: owner.to_string(),
            field: name.to_string(),
            element: new_field.type_name().to_string(),
        }),
        FieldKind::List(ElementKind::Object) => Err(MigrationError::UnsupportedList {
            owner: owner.to_string(),
            field: name.to_string(),
            element: new_field.type_name().to_string(),
        }),
        FieldKind::Value | FieldKind::Array(ElementKind::Value) => {
            if !same_kind(old_field.kind(), new_field.kind()) {
                skip_incompatible(owner, old_field, new_field);
                return Ok(());
            }
            if shares_native_type(old_field, new_field) {
                copy_native(old, old_field, new, new_field);
                return Ok(());
            }
            let value = match old_field.get(&*old.read()) {
                Ok(value) => value,
                Err(err) => {
                    warn!("Skipping {}.{}: {}", owner, name, err);
                    return Ok(());
                }
            };
            if let Err(err) = new_field.set(&mut *new.write(), value) {
                warn!("Skipping {}.{}: {}", owner, name, err);
            }
            Ok(())
        }
        FieldKind::List(ElementKind::Value) => {
            if !same_kind(old_field.kind(), new_field.kind()) {
                skip_incompatible(owner, old_field, new_field);
                return Ok(());
            }
            transfer_list(old, old_field, new, new_field);
            Ok(())
        }
        FieldKind::Object { .. } => {
            if !old_field.kind().is_object() {
                skip_incompatible(owner, old_field, new_field);
                return Ok(());
            }
            adapt_reference(ctx, old, old_field, new, new_field)
        }
    }
}

fn same_kind(old: FieldKind, new: FieldKind) -> bool {
    match (old, new) {
        (FieldKind::Value, FieldKind::Value) => true,
        (FieldKind::Array(a), FieldKind::Array(b)) | (FieldKind::List(a), FieldKind::List(b)) => {
            a == b
        }
        (FieldKind::Object { .. }, FieldKind::Object { .. }) => true,
        _ => false,
    }
}

/// Both sides hold the same standard-library type, so the value can skip JSON.
fn shares_native_type(old_field: &FieldSchema, new_field: &FieldSchema) -> bool {
    old_field.native_type().is_some() && old_field.native_type() == new_field.native_type()
}

fn copy_native(old: &ObjectRef, old_field: &FieldSchema, new: &ObjectRef, new_field: &FieldSchema) {
    let value = match old_field.get_native(&*old.read()) {
        Ok(value) => value,
        Err(err) => {
            warn!("Skipping {}.{}: {}", new.type_name(), new_field.name(), err);
            return;
        }
    };
    if let Err(rejected) = new_field.set_native(&mut *new.write(), value) {
        warn!("Skipping {}.{}: {}", new.type_name(), new_field.name(), rejected.error);
    }
}

fn skip_incompatible(owner: &str, old_field: &FieldSchema, new_field: &FieldSchema) {
    warn!(
        "Skipping {}.{}: {} ({}) cannot become {} ({})",
        owner,
        new_field.name(),
        old_field.kind().label(),
        old_field.type_name(),
        new_field.kind().label(),
        new_field.type_name()
    );
}

/// Move a value list from `old` to `new`, restoring it on failure.
fn transfer_list(old: &ObjectRef, old_field: &FieldSchema, new: &ObjectRef, new_field: &FieldSchema) {
    if shares_native_type(old_field, new_field) {
        move_native_list(old, old_field, new, new_field);
        return;
    }

    let taken = match old_field.take(&mut *old.write()) {
        Ok(value) => value,
        Err(err) => {
            warn!("Skipping {}.{}: {}", new.type_name(), new_field.name(), err);
            return;
        }
    };

    if let Err(err) = new_field.set(&mut *new.write(), taken.clone()) {
        warn!(
            "Skipping {}.{}: {}, restoring old list",
            new.type_name(),
            new_field.name(),
            err
        );
        if let Err(err) = old_field.set(&mut *old.write(), taken) {
            warn!("Failed to restore {}.{}: {}", old.type_name(), old_field.name(), err);
        }
    }
}

fn move_native_list(
    old: &ObjectRef,
    old_field: &FieldSchema,
    new: &ObjectRef,
    new_field: &FieldSchema,
) {
    let taken = match old_field.take_native(&mut *old.write()) {
        Ok(value) => value,
        Err(err) => {
            warn!("Skipping {}.{}: {}", new.type_name(), new_field.name(), err);
            return;
        }
    };

    if let Err(rejected) = new_field.set_native(&mut *new.write(), taken) {
        warn!(
            "Skipping {}.{}: {}, restoring old list",
            new.type_name(),
            new_field.name(),
            rejected.error
        );
        if let Err(restore) = old_field.set_native(&mut *old.write(), rejected.value) {
            warn!(
                "Failed to restore {}.{}: {}",
                old.type_name(),
                old_field.name(),
                restore.error
            );
        }
    }
}

fn adapt_reference(
    ctx: &mut MigrationContext,
    old: &ObjectRef,
    old_field: &FieldSchema,
    new: &ObjectRef,
    new_field: &FieldSchema,
) -> Result<(), MigrationError> {
    let FieldKind::Object { target } = new_field.kind() else {
        return Ok(());
    };

    let old_target = match old_field.get(&*old.read()) {
        Ok(FieldValue::Object(target)) => target,
        Ok(other) => {
            warn!(
                "Skipping {}.{}: expected object, got {}",
                new.type_name(),
                new_field.name(),
                other.label()
            );
            return Ok(());
        }
        Err(err) => {
            warn!("Skipping {}.{}: {}", new.type_name(), new_field.name(), err);
            return Ok(());
        }
    };

    let new_target = match old_target {
        None => None,
        Some(old_target) => match ctx.lookup(&old_target) {
            Some(mapped) => Some(mapped),
            None => {
                let created = ctx.create(target());
                adapt_instance(ctx, &old_target, &created)?;
                Some(created)
            }
        },
    };

    if let Err(err) = new_field.set(&mut *new.write(), FieldValue::Object(new_target)) {
        warn!("Skipping {}.{}: {}", new.type_name(), new_field.name(), err);
    }
    Ok(())
}
