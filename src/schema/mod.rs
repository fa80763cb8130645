//! Schema Service
//!
//! Introspects data sources, detects relationships, and caches one immutable
//! snapshot per data source with a TTL.

pub mod relationships;
pub mod snapshot;

pub use relationships::{Relationship, RelationshipSource};
pub use snapshot::{ColumnInfo, SchemaSnapshot, SemanticType, TableInfo};

use crate::connectors::DataSourceHandle;
use crate::error::{EngineError, Result};
use moka::future::Cache;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

pub struct SchemaService {
    snapshots: Cache<String, Arc<SchemaSnapshot>>,
}

impl SchemaService {
    pub fn new(ttl: Duration) -> Self {
        Self {
            snapshots: Cache::builder().time_to_live(ttl).build(),
        }
    }

    /// Cached snapshot for the data source, built on first use.
    ///
    /// Concurrent first requests share one introspection. With `force_refresh`
    /// a new snapshot is built and swapped in; readers keep the old one until then.
    pub async fn get_snapshot(
        &self,
        handle: &DataSourceHandle,
        force_refresh: bool,
    ) -> Result<Arc<SchemaSnapshot>> {
        if force_refresh {
            let snapshot = Arc::new(build_snapshot(handle).await?);
            self.snapshots
                .insert(handle.id().to_string(), Arc::clone(&snapshot))
                .await;
            return Ok(snapshot);
        }
        self.snapshots
            .try_get_with(handle.id().to_string(), async {
                build_snapshot(handle).await.map(Arc::new)
            })
            .await
            .map_err(|e: Arc<EngineError>| (*e).clone())
    }

    /// Drop the cached snapshot so the next request re-introspects.
    pub async fn invalidate(&self, data_source_id: &str) {
        self.snapshots.invalidate(data_source_id).await;
        info!("Schema snapshot invalidated for {}", data_source_id);
    }

    pub async fn cached(&self, data_source_id: &str) -> Option<Arc<SchemaSnapshot>> {
        self.snapshots.get(data_source_id).await
    }

    /// Evict expired snapshots now rather than on next access.
    pub async fn sweep_expired(&self) {
        self.snapshots.run_pending_tasks().await;
    }
}

async fn build_snapshot(handle: &DataSourceHandle) -> Result<SchemaSnapshot> {
    let started = Instant::now();
    let raw = handle
        .connector()
        .introspect()
        .await
        .map_err(|e| EngineError::Schema(format!("{}: {}", handle.id(), e)))?;
    let snapshot = SchemaSnapshot::build(handle.id(), &raw);
    info!(
        "Built schema snapshot for {}: {} tables, {} relationships in {:?}",
        handle.id(),
        snapshot.table_count(),
        snapshot.relationships().len(),
        started.elapsed()
    );
    Ok(snapshot)
}
