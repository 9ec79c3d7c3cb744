//! Identity gallery.
//!
//! The gallery is read on every recognized face and written only when a human asks to
//! remember someone. Readers take an `Arc<GallerySnapshot>` and keep it for the whole
//! frame; writers (remember, forget) persist first, then publish a fresh snapshot. A
//! reader never sees a half-written identity and never blocks on storage.

use std::sync::{Arc, RwLock};

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::{Persistence, PersistenceError, RetryPolicy};

pub type IdentityId = u64;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Known,
    Delivery,
    #[default]
    Unknown,
}

impl Category {
    pub fn as_str(self) -> &'static str {
        match self {
            Category::Known => "known",
            Category::Delivery => "delivery",
            Category::Unknown => "unknown",
        }
    }
}

impl std::str::FromStr for Category {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> anyhow::Result<Self> {
        match value {
            "known" => Ok(Category::Known),
            "delivery" => Ok(Category::Delivery),
            "unknown" => Ok(Category::Unknown),
            other => Err(anyhow!("unknown category '{}'", other)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub id: IdentityId,
    pub display_name: String,
    /// Stored exactly as enrolled; not normalized.
    pub embedding: Vec<f32>,
    pub category: Category,
    pub photo_reference: Option<String>,
}

impl Identity {
    pub fn summary(&self) -> IdentitySummary {
        IdentitySummary {
            id: self.id,
            display_name: self.display_name.clone(),
            category: self.category,
        }
    }
}

/// Identity without its embedding, carried on events and alerts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentitySummary {
    pub id: IdentityId,
    pub display_name: String,
    pub category: Category,
}

/// Identity to be written. `replaces` updates an existing row instead of creating one.
#[derive(Clone, Debug, PartialEq)]
pub struct NewIdentity {
    pub replaces: Option<IdentityId>,
    pub display_name: String,
    pub embedding: Vec<f32>,
    pub category: Category,
    pub photo_reference: Option<String>,
}

impl NewIdentity {
    pub fn into_identity(self, id: IdentityId) -> Identity {
        Identity {
            id,
            display_name: self.display_name,
            embedding: self.embedding,
            category: self.category,
            photo_reference: self.photo_reference,
        }
    }
}

#[derive(Debug, Error)]
pub enum GalleryError {
    #[error("embedding dimension {actual} does not match gallery dimension {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("identity write failed: {0}")]
    Persistence(#[from] PersistenceError),
}

// ----------------------------------------------------------------------------
// Snapshot
// ----------------------------------------------------------------------------

/// Immutable view of the gallery. Identities are sorted by ascending id.
#[derive(Clone, Debug, Default)]
pub struct GallerySnapshot {
    dimension: usize,
    version: u64,
    identities: Vec<Identity>,
}

impl GallerySnapshot {
    /// Build a snapshot, setting aside identities whose embedding length is not `dimension`.
    pub fn new(dimension: usize, identities: Vec<Identity>) -> (Self, Vec<Identity>) {
        let (mut accepted, rejected): (Vec<_>, Vec<_>) = identities
            .into_iter()
            .partition(|identity| identity.embedding.len() == dimension);
        accepted.sort_by_key(|identity| identity.id);
        accepted.dedup_by_key(|identity| identity.id);
        (
            Self {
                dimension,
                version: 0,
                identities: accepted,
            },
            rejected,
        )
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Bumped on every published change.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn identities(&self) -> &[Identity] {
        &self.identities
    }

    pub fn get(&self, id: IdentityId) -> Option<&Identity> {
        self.identities
            .binary_search_by_key(&id, |identity| identity.id)
            .ok()
            .map(|pos| &self.identities[pos])
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    /// Identities without embeddings, ascending id.
    pub fn summaries(&self) -> Vec<IdentitySummary> {
        self.identities.iter().map(Identity::summary).collect()
    }

    fn with_identity(&self, identity: Identity) -> Self {
        let mut identities = self.identities.clone();
        match identities.binary_search_by_key(&identity.id, |existing| existing.id) {
            Ok(pos) => identities[pos] = identity,
            Err(pos) => identities.insert(pos, identity),
        }
        Self {
            dimension: self.dimension,
            version: self.version + 1,
            identities,
        }
    }

    fn without_identity(&self, id: IdentityId) -> Self {
        Self {
            dimension: self.dimension,
            version: self.version + 1,
            identities: self
                .identities
                .iter()
                .filter(|identity| identity.id != id)
                .cloned()
                .collect(),
        }
    }
}

// ----------------------------------------------------------------------------
// IdentityGallery
// ----------------------------------------------------------------------------

pub struct IdentityGallery {
    current: RwLock<Arc<GallerySnapshot>>,
    store: Arc<dyn Persistence>,
    retry: RetryPolicy,
}

impl IdentityGallery {
    /// Load every stored identity. Rows with the wrong embedding length are skipped with a
    /// warning; they stay in storage untouched.
    pub fn load(
        store: Arc<dyn Persistence>,
        dimension: usize,
        retry: RetryPolicy,
    ) -> anyhow::Result<Self> {
        let identities = retry.run("gallery load", || store.load_gallery())?;
        let (snapshot, rejected) = GallerySnapshot::new(dimension, identities);
        for identity in &rejected {
            log::warn!(
                "gallery: identity {} ({}) has {}-dim embedding, expected {}; excluded from matching",
                identity.id,
                identity.display_name,
                identity.embedding.len(),
                dimension
            );
        }
        log::info!(
            "gallery: loaded {} identities ({}-dim)",
            snapshot.len(),
            dimension
        );
        Ok(Self {
            current: RwLock::new(Arc::new(snapshot)),
            store,
            retry,
        })
    }

    /// Current snapshot. Cheap; hold it for as long as one frame needs a stable view.
    pub fn snapshot(&self) -> Arc<GallerySnapshot> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub fn dimension(&self) -> usize {
        self.snapshot().dimension()
    }

    /// Persist an identity and publish it to readers.
    ///
    /// Storage is written first, with retry. Readers see the new identity only after the
    /// write succeeded; on failure the published gallery is unchanged.
    pub fn persist(&self, identity: NewIdentity) -> Result<Identity, GalleryError> {
        let expected = self.dimension();
        if identity.embedding.len() != expected {
            return Err(GalleryError::DimensionMismatch {
                expected,
                actual: identity.embedding.len(),
            });
        }
        let id = self
            .retry
            .run("identity write", || self.store.save_identity(&identity))?;
        let stored = identity.into_identity(id);

        let mut current = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let next = current.with_identity(stored.clone());
        *current = Arc::new(next);
        log::info!(
            "gallery: stored identity {} ({}, {})",
            stored.id,
            stored.display_name,
            stored.category.as_str()
        );
        Ok(stored)
    }

    /// Delete an identity from storage, then from the published gallery.
    ///
    /// Returns `Ok(false)` when storage has no such id. Snapshots already handed out keep
    /// the identity until their holders drop them.
    pub fn remove(&self, id: IdentityId) -> Result<bool, GalleryError> {
        let removed = self
            .retry
            .run("identity delete", || self.store.delete_identity(id))?;

        let mut current = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if current.get(id).is_some() {
            let next = current.without_identity(id);
            *current = Arc::new(next);
        }
        if removed {
            log::info!("gallery: removed identity {}", id);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStore;
    use crate::test_util::identity;
    use std::time::Duration;

    fn new_identity(name: &str, embedding: Vec<f32>) -> NewIdentity {
        NewIdentity {
            replaces: None,
            display_name: name.to_string(),
            embedding,
            category: Category::Known,
            photo_reference: None,
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            attempts: 3,
            backoff: Duration::ZERO,
        }
    }

    #[test]
    fn load_excludes_wrong_dimension_identities() -> anyhow::Result<()> {
        let store = Arc::new(InMemoryStore::with_identities(vec![
            identity(1, "Ana", vec![1.0, 0.0]),
            identity(2, "Bad", vec![1.0, 0.0, 0.0]),
        ]));
        let gallery = IdentityGallery::load(store, 2, fast_retry())?;
        let snapshot = gallery.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.get(2).is_none());
        Ok(())
    }

    #[test]
    fn persist_publishes_new_snapshot_without_touching_old_one() -> anyhow::Result<()> {
        let gallery = IdentityGallery::load(Arc::new(InMemoryStore::new()), 2, fast_retry())?;
        let before = gallery.snapshot();
        let stored = gallery.persist(new_identity("Ana", vec![0.3, 0.4]))?;

        assert!(before.is_empty());
        let after = gallery.snapshot();
        assert_eq!(after.len(), 1);
        assert_eq!(after.version(), before.version() + 1);
        assert_eq!(after.get(stored.id).map(|i| i.embedding.clone()), Some(vec![0.3, 0.4]));
        Ok(())
    }

    #[test]
    fn persist_replaces_existing_identity_in_place() -> anyhow::Result<()> {
        let store = Arc::new(InMemoryStore::with_identities(vec![identity(
            5,
            "Visitor",
            vec![1.0, 0.0],
        )]));
        let gallery = IdentityGallery::load(store, 2, fast_retry())?;
        let mut update = new_identity("Ana", vec![0.0, 1.0]);
        update.replaces = Some(5);
        gallery.persist(update)?;

        let snapshot = gallery.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.get(5).map(|i| i.display_name.as_str()), Some("Ana"));
        Ok(())
    }

    #[test]
    fn persist_retries_transient_failures() -> anyhow::Result<()> {
        let store = Arc::new(InMemoryStore::new());
        store.inject_transient_failures(2);
        let gallery = IdentityGallery::load(store, 2, fast_retry())?;
        gallery.persist(new_identity("Ana", vec![1.0, 1.0]))?;
        assert_eq!(gallery.snapshot().len(), 1);
        Ok(())
    }

    #[test]
    fn failed_persist_leaves_gallery_unchanged() -> anyhow::Result<()> {
        let store = Arc::new(InMemoryStore::new());
        store.inject_transient_failures(5);
        let gallery = IdentityGallery::load(store, 2, fast_retry())?;
        let result = gallery.persist(new_identity("Ana", vec![1.0, 1.0]));
        assert!(matches!(result, Err(GalleryError::Persistence(_))));
        assert!(gallery.snapshot().is_empty());
        Ok(())
    }

    #[test]
    fn remove_deletes_from_store_and_publishes_new_snapshot() -> anyhow::Result<()> {
        let store = Arc::new(InMemoryStore::with_identities(vec![
            identity(1, "Ana", vec![1.0, 0.0]),
            identity(2, "Bo", vec![0.0, 1.0]),
        ]));
        let gallery = IdentityGallery::load(store.clone(), 2, fast_retry())?;
        let before = gallery.snapshot();

        assert!(gallery.remove(1)?);
        let after = gallery.snapshot();
        assert_eq!(after.version(), before.version() + 1);
        assert_eq!(after.summaries().iter().map(|i| i.id).collect::<Vec<_>>(), vec![2]);
        // the reader holding the old snapshot still sees Ana
        assert!(before.get(1).is_some());
        assert_eq!(store.load_gallery()?.len(), 1);

        assert!(!gallery.remove(1)?);
        assert_eq!(gallery.snapshot().version(), after.version());
        Ok(())
    }

    #[test]
    fn failed_remove_leaves_gallery_unchanged() -> anyhow::Result<()> {
        let store = Arc::new(InMemoryStore::with_identities(vec![identity(
            1,
            "Ana",
            vec![1.0, 0.0],
        )]));
        let gallery = IdentityGallery::load(store.clone(), 2, fast_retry())?;
        store.inject_transient_failures(5);
        assert!(matches!(gallery.remove(1), Err(GalleryError::Persistence(_))));
        assert!(gallery.snapshot().get(1).is_some());
        Ok(())
    }

    #[test]
    fn persist_rejects_wrong_dimension() -> anyhow::Result<()> {
        let gallery = IdentityGallery::load(Arc::new(InMemoryStore::new()), 3, fast_retry())?;
        let result = gallery.persist(new_identity("Ana", vec![1.0]));
        assert!(matches!(
            result,
            Err(GalleryError::DimensionMismatch {
                expected: 3,
                actual: 1
            })
        ));
        Ok(())
    }
}
