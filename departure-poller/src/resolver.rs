use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::info;

use crate::error::ResolverError;

/// Cached lookup of slowly changing reference data keyed by an id from the change feed.
#[async_trait]
pub trait Resolver: Send + Sync {
    type Key;
    type Value;

    fn name(&self) -> &'static str;

    /// Read the latest snapshot. Never blocks on a refresh in progress.
    fn lookup(&self, key: &Self::Key) -> Option<Self::Value>;

    /// Reload the snapshot, returning whether it changed.
    async fn refresh(&self) -> Result<bool, ResolverError>;
}

/// Loads a complete reference snapshot from the source of truth.
#[async_trait]
pub trait SnapshotLoader: Send + Sync {
    type Key: Eq + Hash + Send + Sync;
    type Value: Clone + PartialEq + Send + Sync;

    fn name(&self) -> &'static str;

    async fn load(&self) -> Result<HashMap<Self::Key, Self::Value>, ResolverError>;
}

/// A `Resolver` holding an immutable snapshot that is swapped wholesale on refresh.
pub struct SnapshotResolver<L: SnapshotLoader> {
    loader: L,
    snapshot: RwLock<Arc<HashMap<L::Key, L::Value>>>,
    // Refreshes of the same resolver must not overlap.
    refreshing: Mutex<()>,
}

impl<L: SnapshotLoader> SnapshotResolver<L> {
    pub fn new(loader: L) -> Self {
        Self {
            loader,
            snapshot: RwLock::new(Arc::new(HashMap::new())),
            refreshing: Mutex::new(()),
        }
    }

    pub fn len(&self) -> usize {
        self.current().len()
    }

    pub fn is_empty(&self) -> bool {
        self.current().is_empty()
    }

    fn current(&self) -> Arc<HashMap<L::Key, L::Value>> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl<L: SnapshotLoader> Resolver for SnapshotResolver<L> {
    type Key = L::Key;
    type Value = L::Value;

    fn name(&self) -> &'static str {
        self.loader.name()
    }

    fn lookup(&self, key: &L::Key) -> Option<L::Value> {
        self.current().get(key).cloned()
    }

    async fn refresh(&self) -> Result<bool, ResolverError> {
        let _refreshing = self.refreshing.lock().await;

        let loaded = self.loader.load().await?;
        if *self.current() == loaded {
            return Ok(false);
        }

        info!(
            "{} reference data changed, now holding {} entries",
            self.loader.name(),
            loaded.len()
        );
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(loaded);
        Ok(true)
    }
}
