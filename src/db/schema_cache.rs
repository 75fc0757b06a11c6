use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::db::introspect::SchemaIntrospector;
use crate::db::schema::SchemaSnapshot;
use crate::db::store::{Session, StoreError};

/// Caches the latest schema snapshot.
///
/// Readers receive an `Arc` to an immutable snapshot; refreshing replaces the
/// cached `Arc` and never touches one already handed out. A snapshot read
/// before an invalidation is returned to its caller but never cached.
pub struct SchemaCache {
    enabled: bool,
    /// Bumped by every invalidation
    generation: AtomicU64,
    snapshot: RwLock<Option<Arc<SchemaSnapshot>>>,
    /// Last refresh timestamp
    last_refresh: RwLock<Option<chrono::DateTime<chrono::Utc>>>,
}

impl SchemaCache {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            generation: AtomicU64::new(0),
            snapshot: RwLock::new(None),
            last_refresh: RwLock::new(None),
        }
    }

    /// The cached snapshot, or a fresh one introspected through `session`.
    pub async fn get_or_refresh(
        &self,
        session: &Session,
        introspector: Arc<dyn SchemaIntrospector>,
    ) -> Result<Arc<SchemaSnapshot>, StoreError> {
        if self.enabled {
            if let Some(snapshot) = self.snapshot.read().await.as_ref() {
                debug!("Using cached schema snapshot from {}", snapshot.taken_at);
                return Ok(Arc::clone(snapshot));
            }
        }

        self.refresh(session, introspector).await
    }

    pub async fn refresh(
        &self,
        session: &Session,
        introspector: Arc<dyn SchemaIntrospector>,
    ) -> Result<Arc<SchemaSnapshot>, StoreError> {
        let generation = self.generation.load(Ordering::SeqCst);
        let snapshot = Arc::new(session.run(move |conn| introspector.snapshot(conn)).await?);

        if self.enabled {
            let mut cached = self.snapshot.write().await;
            if self.generation.load(Ordering::SeqCst) == generation {
                *cached = Some(Arc::clone(&snapshot));
                *self.last_refresh.write().await = Some(snapshot.taken_at);
                info!("Schema cache refreshed: {} tables", snapshot.tables.len());
            } else {
                debug!("Schema changed during introspection; not caching the snapshot");
            }
        }

        Ok(snapshot)
    }

    /// Drops the cached snapshot; the next request introspects again.
    pub async fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let mut snapshot = self.snapshot.write().await;
        *self.last_refresh.write().await = None;
        if snapshot.take().is_some() {
            info!("Schema cache invalidated");
        }
    }

    pub async fn cached(&self) -> Option<Arc<SchemaSnapshot>> {
        self.snapshot.read().await.clone()
    }

    pub async fn last_refresh(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        *self.last_refresh.read().await
    }
}
