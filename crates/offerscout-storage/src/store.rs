use async_trait::async_trait;
use chrono::{DateTime, Utc};
use offerscout_core::{
    ConflictFilter, ConflictRecord, ConflictStatus, LastRunSummary, OfferFields, PageRequest,
    RunFilter, RunPage, RunRecord, SourceConfig, SourceEntry, StoredOffer,
};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("source `{0}` not found")]
    SourceNotFound(String),
    #[error("offer `{0}` not found")]
    OfferNotFound(String),
    #[error("offer `{0}` already exists")]
    OfferExists(String),
    #[error("conflict {0} not found")]
    ConflictNotFound(Uuid),
    #[error("conflict {0} is already resolved")]
    ConflictResolved(Uuid),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Narrow contract the engine holds with the system of record.
///
/// Each call is individually atomic; nothing spans calls.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn find_offer_by_name(&self, name: &str) -> Result<Option<StoredOffer>, StoreError>;

    async fn insert_offer(&self, offer: &StoredOffer) -> Result<(), StoreError>;

    async fn update_offer(
        &self,
        name: &str,
        fields: &OfferFields,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn create_conflict(&self, conflict: &ConflictRecord) -> Result<(), StoreError>;

    /// The open conflict for an entity, if any. At most one is pending per entity.
    async fn find_pending_conflict(
        &self,
        entity_name: &str,
    ) -> Result<Option<ConflictRecord>, StoreError>;

    /// Replaces the run, changes and proposed values of a still-pending conflict.
    async fn refresh_conflict(&self, conflict: &ConflictRecord) -> Result<(), StoreError>;

    async fn write_run_record(&self, run: &RunRecord) -> Result<(), StoreError>;

    async fn update_source_summary(
        &self,
        source_id: &str,
        summary: &LastRunSummary,
    ) -> Result<(), StoreError>;

    async fn load_source(&self, source_id: &str) -> Result<Option<SourceEntry>, StoreError>;

    /// Highest priority first, then by source id.
    async fn list_sources(&self) -> Result<Vec<SourceEntry>, StoreError>;

    /// Insert or replace a config, keeping any last-run summary.
    async fn save_source(&self, config: &SourceConfig) -> Result<(), StoreError>;

    /// Newest first.
    async fn query_runs(
        &self,
        filter: &RunFilter,
        page: PageRequest,
    ) -> Result<RunPage, StoreError>;

    /// Newest first.
    async fn list_conflicts(
        &self,
        filter: &ConflictFilter,
    ) -> Result<Vec<ConflictRecord>, StoreError>;

    async fn get_conflict(&self, id: Uuid) -> Result<Option<ConflictRecord>, StoreError>;

    /// Moves a pending conflict to `status`; resolved conflicts are never reopened.
    async fn set_conflict_status(
        &self,
        id: Uuid,
        status: ConflictStatus,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}
