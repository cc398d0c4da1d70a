use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use offerscout_core::{
    CandidateRecord, LastRunSummary, RunRecord, RunStage, RunStatus, SourceConfig,
};
use offerscout_extract::{assemble, CompiledPatterns};
use offerscout_storage::{ArtifactStore, PageFetcher, RecordStore, StoreError};
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::reconcile::{ReconcileContext, ReconcileOutcome, Reconciler, UpdatePolicy};

pub const ALREADY_RUNNING: &str = "already_running";
pub const UNKNOWN_SOURCE: &str = "unknown_source";
pub const CANCELLED: &str = "cancelled";

/// Which sources currently hold a run lease, and the stage each run has reached.
#[derive(Debug, Default)]
pub struct RunRegistry {
    active: Mutex<HashMap<String, RunStage>>,
}

impl RunRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, RunStage>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Check-and-set in one critical section; `None` when the source already has a run.
    pub fn try_acquire(self: &Arc<Self>, source_id: &str) -> Option<RunLease> {
        let mut active = self.lock();
        if active.contains_key(source_id) {
            return None;
        }
        active.insert(source_id.to_string(), RunStage::Idle);
        Some(RunLease {
            registry: Arc::clone(self),
            source_id: source_id.to_string(),
        })
    }

    pub fn stage(&self, source_id: &str) -> RunStage {
        self.lock().get(source_id).copied().unwrap_or(RunStage::Idle)
    }

    pub fn is_running(&self, source_id: &str) -> bool {
        self.lock().contains_key(source_id)
    }
}

/// Exclusive right to run one source. Released on drop, including during unwinding.
#[derive(Debug)]
pub struct RunLease {
    registry: Arc<RunRegistry>,
    source_id: String,
}

impl RunLease {
    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn advance(&self, stage: RunStage) {
        if let Some(current) = self.registry.lock().get_mut(&self.source_id) {
            *current = stage;
        }
    }
}

impl Drop for RunLease {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.source_id);
    }
}

#[derive(Debug, Error)]
pub enum RunRejected {
    #[error("a run for `{0}` is already in progress")]
    AlreadyRunning(String),
    #[error("source `{0}` not found")]
    UnknownSource(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RunRejected {
    pub fn reason(&self) -> &'static str {
        match self {
            RunRejected::AlreadyRunning(_) => ALREADY_RUNNING,
            RunRejected::UnknownSource(_) => UNKNOWN_SOURCE,
            RunRejected::Store(_) => "store_unavailable",
        }
    }
}

/// Immediate answer to a run request; the run's result is observed through run records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunRequestOutcome {
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
}

impl RunRequestOutcome {
    pub fn accepted(run_id: Uuid) -> Self {
        Self {
            accepted: true,
            reason: None,
            run_id: Some(run_id),
        }
    }

    pub fn rejected(reason: &str) -> Self {
        Self {
            accepted: false,
            reason: Some(reason.to_string()),
            run_id: None,
        }
    }
}

/// A spawned run. Dropping the handle detaches the run; it keeps going.
#[derive(Debug)]
pub struct RunHandle {
    pub run_id: Uuid,
    cancel: CancellationToken,
    join: JoinHandle<RunRecord>,
}

impl RunHandle {
    /// Takes effect at the next stage boundary.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn wait(self) -> anyhow::Result<RunRecord> {
        self.join.await.context("run task did not complete")
    }
}

/// Result of exercising a config without touching the record store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestReport {
    pub success: bool,
    pub candidates: Vec<CandidateRecord>,
    pub errors: Vec<String>,
}

impl TestReport {
    fn failed(error: String) -> Self {
        Self {
            success: false,
            candidates: Vec::new(),
            errors: vec![error],
        }
    }
}

struct RunProgress {
    deals_found: u32,
    errors: Vec<String>,
    artifact_hash: Option<String>,
}

enum StageOutcome {
    Continue,
    Stop(RunStage),
}

#[derive(Clone)]
pub struct RunOrchestrator {
    store: Arc<dyn RecordStore>,
    fetcher: Arc<dyn PageFetcher>,
    registry: Arc<RunRegistry>,
    reconciler: Reconciler,
    artifacts: Option<ArtifactStore>,
    shutdown: CancellationToken,
}

impl RunOrchestrator {
    pub fn new(store: Arc<dyn RecordStore>, fetcher: Arc<dyn PageFetcher>) -> Self {
        Self {
            store,
            fetcher,
            registry: RunRegistry::new(),
            reconciler: Reconciler::default(),
            artifacts: None,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_policy(mut self, policy: UpdatePolicy) -> Self {
        self.reconciler = Reconciler::new(policy);
        self
    }

    pub fn with_artifacts(mut self, artifacts: ArtifactStore) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    /// Cancelling this token cancels every run started afterwards or still in flight.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<RunRegistry> {
        &self.registry
    }

    pub fn stage(&self, source_id: &str) -> RunStage {
        self.registry.stage(source_id)
    }

    /// Acquire the source's lease, load its config and spawn the run.
    pub async fn start_run(&self, source_id: &str) -> Result<RunHandle, RunRejected> {
        let lease = self
            .registry
            .try_acquire(source_id)
            .ok_or_else(|| RunRejected::AlreadyRunning(source_id.to_string()))?;
        let entry = self
            .store
            .load_source(source_id)
            .await?
            .ok_or_else(|| RunRejected::UnknownSource(source_id.to_string()))?;

        let run_id = Uuid::new_v4();
        let cancel = self.shutdown.child_token();
        let orchestrator = self.clone();
        let token = cancel.clone();
        let join = tokio::spawn(async move {
            orchestrator
                .execute(run_id, entry.config, lease, token)
                .await
        });
        Ok(RunHandle { run_id, cancel, join })
    }

    pub async fn run_source(&self, source_id: &str) -> RunRequestOutcome {
        match self.start_run(source_id).await {
            Ok(handle) => RunRequestOutcome::accepted(handle.run_id),
            Err(rejected) => {
                info!(source_id, reason = rejected.reason(), "run request rejected");
                RunRequestOutcome::rejected(rejected.reason())
            }
        }
    }

    /// Trigger every active source, highest priority first.
    pub async fn run_active_sources(&self) -> anyhow::Result<Vec<(String, RunRequestOutcome)>> {
        let sources = self.store.list_sources().await.context("listing sources")?;
        let mut outcomes = Vec::new();
        for entry in sources.into_iter().filter(|e| e.config.is_active) {
            let outcome = self.run_source(&entry.config.source_id).await;
            outcomes.push((entry.config.source_id, outcome));
        }
        Ok(outcomes)
    }

    async fn execute(
        &self,
        run_id: Uuid,
        config: SourceConfig,
        lease: RunLease,
        cancel: CancellationToken,
    ) -> RunRecord {
        let started_at = Utc::now();
        let span = info_span!("source_run", source_id = %config.source_id, %run_id);
        async move {
            let mut progress = RunProgress {
                deals_found: 0,
                errors: Vec::new(),
                artifact_hash: None,
            };
            let terminal = self
                .pipeline(run_id, &config, &lease, &cancel, &mut progress, started_at)
                .await;
            lease.advance(terminal);

            let status = terminal.status().unwrap_or(RunStatus::Failed);
            let run = RunRecord {
                run_id,
                source_id: config.source_id.clone(),
                started_at,
                finished_at: Utc::now(),
                status,
                deals_found: progress.deals_found,
                errors: progress.errors,
                artifact_hash: progress.artifact_hash,
            };
            self.finalize(&run).await;
            info!(
                status = %run.status,
                deals_found = run.deals_found,
                errors = run.errors.len(),
                "run finished"
            );
            run
        }
        .instrument(span)
        .await
    }

    async fn finalize(&self, run: &RunRecord) {
        if let Err(err) = self.store.write_run_record(run).await {
            error!(error = %err, "failed to write run record");
        }
        let summary = LastRunSummary {
            status: run.status,
            deals_found: run.deals_found,
            at: run.finished_at,
        };
        if let Err(err) = self.store.update_source_summary(&run.source_id, &summary).await {
            warn!(error = %err, "run record written but source summary update failed");
        }
    }

    /// Cancellation is only observed here, between stages.
    fn checkpoint(
        &self,
        lease: &RunLease,
        cancel: &CancellationToken,
        next: RunStage,
        progress: &mut RunProgress,
    ) -> StageOutcome {
        if cancel.is_cancelled() {
            progress.errors.push(CANCELLED.to_string());
            return StageOutcome::Stop(RunStage::Failed);
        }
        lease.advance(next);
        StageOutcome::Continue
    }

    async fn pipeline(
        &self,
        run_id: Uuid,
        config: &SourceConfig,
        lease: &RunLease,
        cancel: &CancellationToken,
        progress: &mut RunProgress,
        started_at: DateTime<Utc>,
    ) -> RunStage {
        let compiled = match CompiledPatterns::compile(config) {
            Ok(compiled) => compiled,
            Err(err) => {
                progress.errors.push(format!("config error: {err}"));
                return RunStage::Failed;
            }
        };

        if let StageOutcome::Stop(stage) =
            self.checkpoint(lease, cancel, RunStage::Fetching, progress)
        {
            return stage;
        }
        let page = match self
            .fetcher
            .fetch_page(&config.source_id, &config.url, &config.options)
            .await
        {
            Ok(page) => page,
            Err(err) => {
                progress.errors.push(format!("fetch failed: {err}"));
                return RunStage::Failed;
            }
        };
        if let Some(artifacts) = &self.artifacts {
            match artifacts.store_page(&config.source_id, &page).await {
                Ok(artifact) => progress.artifact_hash = Some(artifact.content_hash),
                Err(err) => warn!(error = %err, "artifact capture failed"),
            }
        }

        if let StageOutcome::Stop(stage) =
            self.checkpoint(lease, cancel, RunStage::Locating, progress)
        {
            return stage;
        }
        let fragments = compiled.location.locate(&page.body);
        if fragments.is_empty() {
            progress.errors.push(format!(
                "no containers matched `{}`",
                config.location_patterns.container
            ));
            return RunStage::Failed;
        }

        if let StageOutcome::Stop(stage) =
            self.checkpoint(lease, cancel, RunStage::Extracting, progress)
        {
            return stage;
        }
        let today = started_at.date_naive();
        let candidates = fragments
            .iter()
            .map(|fragment| assemble(fragment, &compiled.fields, &config.options, today))
            .collect::<Vec<_>>();
        let mut defective = 0usize;
        for candidate in candidates.iter().filter(|c| !c.is_usable()) {
            defective += 1;
            progress.errors.push(format!(
                "container {}: {}",
                candidate.container_index,
                candidate.defect_messages().join("; ")
            ));
        }
        let usable = candidates
            .iter()
            .filter(|c| c.is_usable())
            .filter_map(|c| c.offer.as_ref())
            .collect::<Vec<_>>();
        progress.deals_found = u32::try_from(usable.len()).unwrap_or(u32::MAX);
        if usable.is_empty() {
            progress.errors.push("no usable candidates".to_string());
            return RunStage::Failed;
        }

        if let StageOutcome::Stop(stage) =
            self.checkpoint(lease, cancel, RunStage::Reconciling, progress)
        {
            return stage;
        }
        let ctx = ReconcileContext {
            run_id,
            source_id: config.source_id.clone(),
            at: Utc::now(),
        };
        let mut conflicts = 0usize;
        let mut store_errors = 0usize;
        for offer in usable {
            match self.reconciler.reconcile(self.store.as_ref(), &ctx, offer).await {
                Ok(ReconcileOutcome::Conflict { .. }) => conflicts += 1,
                Ok(outcome) => {
                    debug!(entity = %offer.name, outcome = outcome.label(), "reconciled");
                }
                Err(err) => {
                    store_errors += 1;
                    progress.errors.push(format!("store error for `{}`: {err}", offer.name));
                }
            }
        }

        if defective > 0 || conflicts > 0 || store_errors > 0 {
            RunStage::PartiallySucceeded
        } else {
            RunStage::Succeeded
        }
    }

    /// Runs fetch, locate and extract for `url` with `config`. Never reads or writes the store.
    pub async fn test_config(&self, url: &str, config: &SourceConfig) -> TestReport {
        test_config(self.fetcher.as_ref(), url, config, Utc::now().date_naive()).await
    }
}

pub async fn test_config(
    fetcher: &dyn PageFetcher,
    url: &str,
    config: &SourceConfig,
    today: NaiveDate,
) -> TestReport {
    let mut config = config.clone();
    config.url = url.to_string();
    let compiled = match CompiledPatterns::compile(&config) {
        Ok(compiled) => compiled,
        Err(err) => return TestReport::failed(format!("config error: {err}")),
    };
    let page = match fetcher.fetch_page(&config.source_id, &config.url, &config.options).await {
        Ok(page) => page,
        Err(err) => return TestReport::failed(format!("fetch failed: {err}")),
    };

    let fragments = compiled.location.locate(&page.body);
    let candidates = fragments
        .iter()
        .map(|fragment| assemble(fragment, &compiled.fields, &config.options, today))
        .collect::<Vec<_>>();

    let mut errors = Vec::new();
    if candidates.is_empty() {
        errors.push(format!(
            "no containers matched `{}`",
            config.location_patterns.container
        ));
    }
    for candidate in candidates.iter().filter(|c| !c.is_usable()) {
        errors.push(format!(
            "container {}: {}",
            candidate.container_index,
            candidate.defect_messages().join("; ")
        ));
    }
    TestReport {
        success: candidates.iter().any(CandidateRecord::is_usable),
        candidates,
        errors,
    }
}
