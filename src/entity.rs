use crate::math::{Quat, Vec3};
use crate::protocol::EntityId;
use ahash::AHashMap;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub position: Vec3,
    pub orientation: Quat,
    pub scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            orientation: Quat::IDENTITY,
            scale: Vec3::ONE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Entity {
    pub id: EntityId,
    pub path: String,
    pub transform: Transform,
}

/// Indexed registry mapping entity ids to their current handles, with a
/// path index for re-resolution. An entity rebuilt in place gets a fresh
/// id under the same path; holders of the old id recover through
/// `resolve_or_repath` instead of failing permanently.
#[derive(Debug, Default)]
pub struct EntityRegistry {
    entities: AHashMap<EntityId, Entity>,
    by_path: AHashMap<String, EntityId>,
    next_id: EntityId,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn(&mut self, path: impl Into<String>, transform: Transform) -> EntityId {
        let path = path.into();
        self.next_id += 1;
        let id = self.next_id;
        if let Some(previous) = self.by_path.insert(path.clone(), id) {
            self.entities.remove(&previous);
        }
        self.entities.insert(
            id,
            Entity {
                id,
                path,
                transform,
            },
        );
        id
    }

    pub fn despawn(&mut self, id: EntityId) -> bool {
        match self.entities.remove(&id) {
            Some(entity) => {
                // Keep the path index only if it still points at this id.
                if self.by_path.get(&entity.path) == Some(&id) {
                    self.by_path.remove(&entity.path);
                }
                true
            }
            None => false,
        }
    }

    /// Destroys and recreates the entity at `path` in place, preserving its
    /// transform under a new id.
    pub fn rebuild(&mut self, path: &str) -> Option<EntityId> {
        let old_id = self.by_path.get(path).copied()?;
        let transform = self.entities.remove(&old_id)?.transform;

        self.next_id += 1;
        let id = self.next_id;
        self.by_path.insert(path.to_string(), id);
        self.entities.insert(
            id,
            Entity {
                id,
                path: path.to_string(),
                transform,
            },
        );
        Some(id)
    }

    pub fn resolve(&self, id: EntityId) -> Option<&Entity> {
        self.entities.get(&id)
    }

    pub fn resolve_mut(&mut self, id: EntityId) -> Option<&mut Entity> {
        self.entities.get_mut(&id)
    }

    pub fn resolve_path(&self, path: &str) -> Option<EntityId> {
        self.by_path.get(path).copied()
    }

    /// Returns the live id for a cached reference, falling back to a path
    /// lookup when the cached id is stale. Returns None only when nothing
    /// lives at the path either.
    pub fn resolve_or_repath(&self, id: EntityId, path: &str) -> Option<EntityId> {
        if self.entities.contains_key(&id) {
            return Some(id);
        }
        let successor = self.resolve_path(path)?;
        debug!(stale = id, live = successor, path, "re-resolved stale entity reference");
        Some(successor)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}
