use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use offerscout_core::{
    ConflictFilter, ConflictRecord, ConflictStatus, LastRunSummary, OfferFields, PageRequest,
    RunFilter, RunPage, RunRecord, SourceConfig, SourceEntry, StoredOffer,
};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{RecordStore, StoreError};

#[derive(Debug, Default)]
struct MemoryState {
    sources: HashMap<String, SourceEntry>,
    offers: HashMap<String, StoredOffer>,
    runs: Vec<RunRecord>,
    conflicts: Vec<ConflictRecord>,
}

/// Single-process store for tests and local runs.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    state: Mutex<MemoryState>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn with_sources(configs: impl IntoIterator<Item = SourceConfig>) -> Self {
        let store = Self::new();
        {
            let mut state = store.state.lock().await;
            for config in configs {
                state.sources.insert(
                    config.source_id.clone(),
                    SourceEntry {
                        config,
                        last_run: None,
                    },
                );
            }
        }
        store
    }

    pub async fn offers(&self) -> Vec<StoredOffer> {
        let mut offers = self.state.lock().await.offers.values().cloned().collect::<Vec<_>>();
        offers.sort_by(|a, b| a.name.cmp(&b.name));
        offers
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn find_offer_by_name(&self, name: &str) -> Result<Option<StoredOffer>, StoreError> {
        Ok(self.state.lock().await.offers.get(name).cloned())
    }

    async fn insert_offer(&self, offer: &StoredOffer) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.offers.contains_key(&offer.name) {
            return Err(StoreError::OfferExists(offer.name.clone()));
        }
        state.offers.insert(offer.name.clone(), offer.clone());
        Ok(())
    }

    async fn update_offer(
        &self,
        name: &str,
        fields: &OfferFields,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let offer = state
            .offers
            .get_mut(name)
            .ok_or_else(|| StoreError::OfferNotFound(name.to_string()))?;
        offer.reward_amount = fields.reward_amount;
        offer.required_payments = fields.required_payments;
        offer.pay_in_threshold = fields.pay_in_threshold;
        offer.expiry = fields.expiry;
        offer.updated_at = at;
        Ok(())
    }

    async fn create_conflict(&self, conflict: &ConflictRecord) -> Result<(), StoreError> {
        self.state.lock().await.conflicts.push(conflict.clone());
        Ok(())
    }

    async fn find_pending_conflict(
        &self,
        entity_name: &str,
    ) -> Result<Option<ConflictRecord>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .conflicts
            .iter()
            .find(|c| c.status == ConflictStatus::Pending && c.entity_name == entity_name)
            .cloned())
    }

    async fn refresh_conflict(&self, conflict: &ConflictRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let existing = state
            .conflicts
            .iter_mut()
            .find(|c| c.id == conflict.id)
            .ok_or(StoreError::ConflictNotFound(conflict.id))?;
        if existing.status != ConflictStatus::Pending {
            return Err(StoreError::ConflictResolved(conflict.id));
        }
        existing.run_id = conflict.run_id;
        existing.source_id = conflict.source_id.clone();
        existing.changes = conflict.changes.clone();
        existing.proposed = conflict.proposed.clone();
        Ok(())
    }

    async fn write_run_record(&self, run: &RunRecord) -> Result<(), StoreError> {
        self.state.lock().await.runs.push(run.clone());
        Ok(())
    }

    async fn update_source_summary(
        &self,
        source_id: &str,
        summary: &LastRunSummary,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let entry = state
            .sources
            .get_mut(source_id)
            .ok_or_else(|| StoreError::SourceNotFound(source_id.to_string()))?;
        entry.last_run = Some(summary.clone());
        Ok(())
    }

    async fn load_source(&self, source_id: &str) -> Result<Option<SourceEntry>, StoreError> {
        Ok(self.state.lock().await.sources.get(source_id).cloned())
    }

    async fn list_sources(&self) -> Result<Vec<SourceEntry>, StoreError> {
        let mut sources = self
            .state
            .lock()
            .await
            .sources
            .values()
            .cloned()
            .collect::<Vec<_>>();
        sources.sort_by(|a, b| {
            b.config
                .priority
                .cmp(&a.config.priority)
                .then_with(|| a.config.source_id.cmp(&b.config.source_id))
        });
        Ok(sources)
    }

    async fn save_source(&self, config: &SourceConfig) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let last_run = state
            .sources
            .get(&config.source_id)
            .and_then(|entry| entry.last_run.clone());
        state.sources.insert(
            config.source_id.clone(),
            SourceEntry {
                config: config.clone(),
                last_run,
            },
        );
        Ok(())
    }

    async fn query_runs(
        &self,
        filter: &RunFilter,
        page: PageRequest,
    ) -> Result<RunPage, StoreError> {
        let state = self.state.lock().await;
        let mut matching = state
            .runs
            .iter()
            .filter(|run| filter.matches(run))
            .cloned()
            .collect::<Vec<_>>();
        matching.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        let total = matching.len();
        let runs = matching
            .into_iter()
            .skip(page.offset())
            .take(page.page_size)
            .collect();
        Ok(RunPage { runs, total })
    }

    async fn list_conflicts(
        &self,
        filter: &ConflictFilter,
    ) -> Result<Vec<ConflictRecord>, StoreError> {
        let state = self.state.lock().await;
        let mut conflicts = state
            .conflicts
            .iter()
            .filter(|c| filter.matches(c))
            .cloned()
            .collect::<Vec<_>>();
        conflicts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(conflicts)
    }

    async fn get_conflict(&self, id: Uuid) -> Result<Option<ConflictRecord>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .conflicts
            .iter()
            .find(|c| c.id == id)
            .cloned())
    }

    async fn set_conflict_status(
        &self,
        id: Uuid,
        status: ConflictStatus,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let conflict = state
            .conflicts
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or(StoreError::ConflictNotFound(id))?;
        if conflict.status != ConflictStatus::Pending {
            return Err(StoreError::ConflictResolved(id));
        }
        conflict.status = status;
        conflict.resolved_at = Some(at);
        Ok(())
    }
}
