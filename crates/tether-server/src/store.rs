//! Entity storage.
//!
//! The protocol treats entities as opaque. A store only guarantees key
//! uniqueness per kind and key-ordered listing; ownership and visibility are
//! enforced by the handlers.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use tether_core::{Entity, TetherError};

/// Where entities live.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Insert a new entity. Fails with `DuplicateKey` if `(kind, key)` exists.
    async fn insert(&self, entity: Entity) -> Result<Entity, TetherError>;

    /// Replace an existing entity. Fails with `NotFound` if it is absent.
    async fn replace(&self, entity: Entity) -> Result<Entity, TetherError>;

    /// Delete and return an entity.
    async fn delete(&self, kind: &str, key: &str) -> Option<Entity>;

    /// Read one entity.
    async fn get(&self, kind: &str, key: &str) -> Option<Entity>;

    /// Every entity of `kind`, in key order.
    async fn list(&self, kind: &str) -> Vec<Entity>;
}

/// In-process [`EntityStore`].
#[derive(Debug, Default)]
pub struct MemoryEntityStore {
    entities: RwLock<BTreeMap<(String, String), Entity>>,
}

impl MemoryEntityStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entities.
    pub fn len(&self) -> usize {
        self.entities.read().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.entities.read().is_empty()
    }
}

fn slot(kind: &str, key: &str) -> (String, String) {
    (kind.to_owned(), key.to_owned())
}

#[async_trait]
impl EntityStore for MemoryEntityStore {
    async fn insert(&self, entity: Entity) -> Result<Entity, TetherError> {
        let mut entities = self.entities.write();
        let id = slot(&entity.kind, &entity.key);
        if entities.contains_key(&id) {
            return Err(TetherError::DuplicateKey { key: entity.key });
        }
        let _ = entities.insert(id, entity.clone());
        Ok(entity)
    }

    async fn replace(&self, entity: Entity) -> Result<Entity, TetherError> {
        let mut entities = self.entities.write();
        match entities.get_mut(&slot(&entity.kind, &entity.key)) {
            Some(existing) => {
                *existing = entity.clone();
                Ok(entity)
            }
            None => Err(TetherError::not_found(format!("{}/{}", entity.kind, entity.key))),
        }
    }

    async fn delete(&self, kind: &str, key: &str) -> Option<Entity> {
        self.entities.write().remove(&slot(kind, key))
    }

    async fn get(&self, kind: &str, key: &str) -> Option<Entity> {
        self.entities.read().get(&slot(kind, key)).cloned()
    }

    async fn list(&self, kind: &str) -> Vec<Entity> {
        self.entities
            .read()
            .range(slot(kind, "")..)
            .take_while(|((k, _), _)| k == kind)
            .map(|(_, entity)| entity.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;
    use tether_core::{UserId, Visibility};

    fn entity(kind: &str, key: &str) -> Entity {
        Entity {
            kind: kind.into(),
            key: key.into(),
            owner: UserId::from("u1"),
            visibility: Visibility::Public,
            version: 1,
            data: json!({}),
        }
    }

    #[tokio::test]
    async fn insert_rejects_duplicate_key() {
        let store = MemoryEntityStore::new();
        let _ = store.insert(entity("listing", "a")).await.unwrap();
        let mut clash = entity("listing", "a");
        clash.data = json!({ "other": true });
        assert_matches!(store.insert(clash).await, Err(TetherError::DuplicateKey { key }) if key == "a");
        assert_eq!(store.get("listing", "a").await.unwrap().data, json!({}));
    }

    #[tokio::test]
    async fn same_key_in_different_kinds_is_fine() {
        let store = MemoryEntityStore::new();
        assert!(store.insert(entity("listing", "a")).await.is_ok());
        assert!(store.insert(entity("order", "a")).await.is_ok());
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn list_is_key_ordered_and_kind_scoped() {
        let store = MemoryEntityStore::new();
        for key in ["c", "a", "b"] {
            let _ = store.insert(entity("listing", key)).await.unwrap();
        }
        let _ = store.insert(entity("listings", "z")).await.unwrap();
        let _ = store.insert(entity("order", "a")).await.unwrap();

        let keys: Vec<String> = store.list("listing").await.into_iter().map(|e| e.key).collect();
        assert_eq!(keys, ["a", "b", "c"]);
    }

    #[tokio::test]
    async fn replace_requires_existing() {
        let store = MemoryEntityStore::new();
        assert_matches!(store.replace(entity("listing", "a")).await, Err(TetherError::NotFound { .. }));

        let _ = store.insert(entity("listing", "a")).await.unwrap();
        let mut next = entity("listing", "a");
        next.version = 2;
        assert_eq!(store.replace(next).await.unwrap().version, 2);
        assert_eq!(store.get("listing", "a").await.unwrap().version, 2);
    }

    #[tokio::test]
    async fn delete_returns_last_state() {
        let store = MemoryEntityStore::new();
        let _ = store.insert(entity("listing", "a")).await.unwrap();
        assert_eq!(store.delete("listing", "a").await.unwrap().key, "a");
        assert!(store.delete("listing", "a").await.is_none());
        assert!(store.is_empty());
    }
}
