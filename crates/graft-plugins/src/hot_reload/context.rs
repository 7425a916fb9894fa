//! Per-reload migration scratch state.

use super::adapter::MigrationError;
use graft_kernel::{Capability, ObjectKey, ObjectRef, TypeSchema};
use std::collections::HashMap;
use tracing::debug;

/// Arena of objects created during one migration.
///
/// Every new object gets a stable index; an old object maps to exactly one
/// index. The context also pins the old objects it has seen so their
/// identity keys stay valid until it is dropped.
#[derive(Default)]
pub struct MigrationContext {
    new_objects: Vec<ObjectRef>,
    new_index: HashMap<ObjectKey, usize>,
    reference_map: HashMap<ObjectKey, usize>,
    origins: Vec<Option<ObjectRef>>,
}

impl MigrationContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a default-initialized instance of `schema`. No constructor runs.
    pub fn create(&mut self, schema: &'static TypeSchema) -> ObjectRef {
        let object = schema.allocate();
        self.adopt(&object);
        object
    }

    fn adopt(&mut self, object: &ObjectRef) -> usize {
        let key = ObjectKey::of(object);
        if let Some(index) = self.new_index.get(&key) {
            return *index;
        }
        let index = self.new_objects.len();
        self.new_objects.push(object.clone());
        self.origins.push(None);
        self.new_index.insert(key, index);
        index
    }

    /// Record that `new` replaces `old`.
    pub fn map_reference(&mut self, old: &ObjectRef, new: &ObjectRef) -> Result<(), MigrationError> {
        let old_key = ObjectKey::of(old);
        if self.reference_map.contains_key(&old_key) {
            return Err(MigrationError::AlreadyMapped {
                type_name: old.type_name().to_string(),
                key: old_key.to_string(),
            });
        }
        let index = self.adopt(new);
        self.reference_map.insert(old_key, index);
        self.origins[index] = Some(old.clone());
        debug!(
            "Mapped {} {} -> {} #{}",
            old.type_name(),
            old_key,
            new.type_name(),
            index
        );
        Ok(())
    }

    /// The counterpart of `old`, if already migrated.
    pub fn lookup(&self, old: &ObjectRef) -> Option<ObjectRef> {
        self.reference_map
            .get(&ObjectKey::of(old))
            .map(|index| self.new_objects[*index].clone())
    }

    /// The old object `new` was migrated from.
    pub fn origin_of(&self, new: &ObjectRef) -> Option<&ObjectRef> {
        let index = self.new_index.get(&ObjectKey::of(new))?;
        self.origins[*index].as_ref()
    }

    /// Created objects whose type declares `capability`, in creation order.
    pub fn objects_implementing(&self, capability: Capability) -> Vec<ObjectRef> {
        self.new_objects
            .iter()
            .filter(|object| object.schema().implements(capability))
            .cloned()
            .collect()
    }

    pub fn new_objects(&self) -> &[ObjectRef] {
        &self.new_objects
    }

    pub fn mapped_count(&self) -> usize {
        self.reference_map.len()
    }
}

impl Drop for MigrationContext {
    fn drop(&mut self) {
        debug!(
            "Disposing migration context ({} created, {} mapped)",
            self.new_objects.len(),
            self.reference_map.len()
        );
        self.reference_map.clear();
        self.new_index.clear();
        self.origins.clear();
    }
}
