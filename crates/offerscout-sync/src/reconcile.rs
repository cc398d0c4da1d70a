use chrono::{DateTime, NaiveDate, Utc};
use offerscout_core::{
    ConflictRecord, ConflictStatus, FieldChange, OfferField, OfferFields, StoredOffer,
};
use offerscout_storage::{RecordStore, StoreError};
use tracing::{debug, info};
use uuid::Uuid;

/// Amounts closer than this are treated as equal.
pub const AMOUNT_EPSILON: f64 = 0.005;

/// Boundary between changes applied directly and changes held for an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdatePolicy {
    pub max_auto_fields: usize,
}

impl Default for UpdatePolicy {
    fn default() -> Self {
        Self { max_auto_fields: 1 }
    }
}

impl UpdatePolicy {
    /// A reward change is never applied silently, whatever else changed alongside it.
    pub fn auto_accepts(&self, changes: &[FieldChange]) -> bool {
        !changes.iter().any(|c| c.field == OfferField::RewardAmount)
            && changes.len() <= self.max_auto_fields
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    New,
    Unchanged,
    Updated { changes: Vec<FieldChange> },
    Conflict { changes: Vec<FieldChange> },
}

impl ReconcileOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ReconcileOutcome::New => "new",
            ReconcileOutcome::Unchanged => "unchanged",
            ReconcileOutcome::Updated { .. } => "updated",
            ReconcileOutcome::Conflict { .. } => "conflict",
        }
    }
}

fn amount_text(value: f64) -> String {
    format!("{value:.2}")
}

fn optional_amount_text(value: Option<f64>) -> String {
    value.map(amount_text).unwrap_or_else(|| "none".to_string())
}

fn optional_date_text(value: Option<NaiveDate>) -> String {
    value.map(|d| d.to_string()).unwrap_or_else(|| "none".to_string())
}

fn amounts_equal(a: f64, b: f64) -> bool {
    (a - b).abs() < AMOUNT_EPSILON
}

fn optional_amounts_equal(a: Option<f64>, b: Option<f64>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => amounts_equal(a, b),
        (None, None) => true,
        _ => false,
    }
}

fn same_proposal(a: &OfferFields, b: &OfferFields) -> bool {
    a.name == b.name
        && amounts_equal(a.reward_amount, b.reward_amount)
        && a.required_payments == b.required_payments
        && optional_amounts_equal(a.pay_in_threshold, b.pay_in_threshold)
        && a.expiry == b.expiry
}

/// Compared fields only; the name is the lookup key and never diverges.
pub fn diff_fields(stored: &StoredOffer, candidate: &OfferFields) -> Vec<FieldChange> {
    let mut changes = Vec::new();
    if !amounts_equal(stored.reward_amount, candidate.reward_amount) {
        changes.push(FieldChange {
            field: OfferField::RewardAmount,
            old: amount_text(stored.reward_amount),
            new: amount_text(candidate.reward_amount),
        });
    }
    if stored.required_payments != candidate.required_payments {
        changes.push(FieldChange {
            field: OfferField::RequiredPayments,
            old: stored.required_payments.to_string(),
            new: candidate.required_payments.to_string(),
        });
    }
    if !optional_amounts_equal(stored.pay_in_threshold, candidate.pay_in_threshold) {
        changes.push(FieldChange {
            field: OfferField::PayInThreshold,
            old: optional_amount_text(stored.pay_in_threshold),
            new: optional_amount_text(candidate.pay_in_threshold),
        });
    }
    if stored.expiry != candidate.expiry {
        changes.push(FieldChange {
            field: OfferField::Expiry,
            old: optional_date_text(stored.expiry),
            new: optional_date_text(candidate.expiry),
        });
    }
    changes
}

/// Identifies the run a reconciliation belongs to.
#[derive(Debug, Clone)]
pub struct ReconcileContext {
    pub run_id: Uuid,
    pub source_id: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct Reconciler {
    policy: UpdatePolicy,
}

impl Reconciler {
    pub fn new(policy: UpdatePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> UpdatePolicy {
        self.policy
    }

    pub fn classify(
        &self,
        candidate: &OfferFields,
        stored: Option<&StoredOffer>,
    ) -> ReconcileOutcome {
        let Some(stored) = stored else {
            return ReconcileOutcome::New;
        };
        let changes = diff_fields(stored, candidate);
        if changes.is_empty() {
            ReconcileOutcome::Unchanged
        } else if self.policy.auto_accepts(&changes) {
            ReconcileOutcome::Updated { changes }
        } else {
            ReconcileOutcome::Conflict { changes }
        }
    }

    /// Looks up the stored record by exact name and performs the write the outcome calls for.
    pub async fn reconcile(
        &self,
        store: &dyn RecordStore,
        ctx: &ReconcileContext,
        candidate: &OfferFields,
    ) -> Result<ReconcileOutcome, StoreError> {
        let stored = store.find_offer_by_name(&candidate.name).await?;
        let outcome = self.classify(candidate, stored.as_ref());
        match &outcome {
            ReconcileOutcome::New => {
                store
                    .insert_offer(&StoredOffer::from_fields(&ctx.source_id, candidate, ctx.at))
                    .await?;
            }
            ReconcileOutcome::Unchanged => {}
            ReconcileOutcome::Updated { .. } => {
                store.update_offer(&candidate.name, candidate, ctx.at).await?;
            }
            ReconcileOutcome::Conflict { changes } => {
                hold_for_review(store, ctx, candidate, changes).await?;
            }
        }
        Ok(outcome)
    }
}

/// Keeps one pending conflict per entity: an identical divergence is left alone, a different
/// one replaces the proposal of the open conflict.
async fn hold_for_review(
    store: &dyn RecordStore,
    ctx: &ReconcileContext,
    candidate: &OfferFields,
    changes: &[FieldChange],
) -> Result<(), StoreError> {
    if let Some(pending) = store.find_pending_conflict(&candidate.name).await? {
        if same_proposal(&pending.proposed, candidate) {
            debug!(
                entity = %candidate.name,
                conflict_id = %pending.id,
                "divergence already pending"
            );
            return Ok(());
        }
        let conflict_id = pending.id;
        let refreshed = ConflictRecord {
            run_id: ctx.run_id,
            source_id: ctx.source_id.clone(),
            changes: changes.to_vec(),
            proposed: candidate.clone(),
            ..pending
        };
        match store.refresh_conflict(&refreshed).await {
            Ok(()) => {
                info!(
                    source_id = %ctx.source_id,
                    entity = %candidate.name,
                    %conflict_id,
                    fields = changes.len(),
                    "pending conflict refreshed with newer values"
                );
                return Ok(());
            }
            // Resolved in the meantime; the divergence gets a conflict of its own.
            Err(StoreError::ConflictResolved(_)) => {}
            Err(err) => return Err(err),
        }
    }

    let conflict = ConflictRecord {
        id: Uuid::new_v4(),
        run_id: ctx.run_id,
        source_id: ctx.source_id.clone(),
        entity_name: candidate.name.clone(),
        changes: changes.to_vec(),
        proposed: candidate.clone(),
        status: ConflictStatus::Pending,
        created_at: ctx.at,
        resolved_at: None,
    };
    store.create_conflict(&conflict).await?;
    info!(
        source_id = %ctx.source_id,
        entity = %candidate.name,
        conflict_id = %conflict.id,
        fields = changes.len(),
        "divergence held for operator review"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use offerscout_core::ConflictFilter;
    use offerscout_storage::MemoryRecordStore;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).single().unwrap()
    }

    fn acme() -> OfferFields {
        OfferFields {
            name: "Acme Bank".to_string(),
            reward_amount: 150.0,
            required_payments: 2,
            pay_in_threshold: Some(1000.0),
            expiry: NaiveDate::from_ymd_opt(2099, 12, 31),
        }
    }

    fn stored(fields: &OfferFields) -> StoredOffer {
        StoredOffer::from_fields("acme", fields, at())
    }

    fn ctx() -> ReconcileContext {
        ReconcileContext {
            run_id: Uuid::new_v4(),
            source_id: "acme".to_string(),
            at: at(),
        }
    }

    #[test]
    fn missing_record_is_new() {
        assert_eq!(Reconciler::default().classify(&acme(), None), ReconcileOutcome::New);
    }

    #[test]
    fn reward_change_is_always_a_conflict() {
        let reconciler = Reconciler::new(UpdatePolicy { max_auto_fields: 10 });
        let existing = stored(&acme());
        let mut candidate = acme();
        candidate.reward_amount = 175.0;
        let outcome = reconciler.classify(&candidate, Some(&existing));
        assert_eq!(
            outcome,
            ReconcileOutcome::Conflict {
                changes: vec![FieldChange {
                    field: OfferField::RewardAmount,
                    old: "150.00".to_string(),
                    new: "175.00".to_string(),
                }]
            }
        );
    }

    #[test]
    fn single_non_reward_change_is_applied_directly() {
        let existing = stored(&acme());
        let mut candidate = acme();
        candidate.expiry = NaiveDate::from_ymd_opt(2100, 1, 31);
        let outcome = Reconciler::default().classify(&candidate, Some(&existing));
        assert!(matches!(outcome, ReconcileOutcome::Updated { ref changes } if changes.len() == 1));
    }

    #[test]
    fn several_changes_at_once_need_review() {
        let existing = stored(&acme());
        let mut candidate = acme();
        candidate.expiry = None;
        candidate.required_payments = 1;
        let outcome = Reconciler::default().classify(&candidate, Some(&existing));
        assert_eq!(outcome.label(), "conflict");
    }

    #[test]
    fn sub_penny_noise_is_not_a_change() {
        let existing = stored(&acme());
        let mut candidate = acme();
        candidate.reward_amount = 150.001;
        assert!(diff_fields(&existing, &candidate).is_empty());
    }

    #[tokio::test]
    async fn identical_candidate_is_unchanged_and_not_written() {
        let store = MemoryRecordStore::new();
        store.insert_offer(&stored(&acme())).await.unwrap();

        let later = ReconcileContext {
            at: at() + chrono::Duration::days(1),
            ..ctx()
        };
        let outcome = Reconciler::default()
            .reconcile(&store, &later, &acme())
            .await
            .unwrap();

        assert_eq!(outcome, ReconcileOutcome::Unchanged);
        assert_eq!(store.offers().await[0].updated_at, at());
        assert!(store.list_conflicts(&ConflictFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn single_expiry_change_is_written_through() {
        let store = MemoryRecordStore::new();
        store.insert_offer(&stored(&acme())).await.unwrap();
        let mut candidate = acme();
        candidate.expiry = NaiveDate::from_ymd_opt(2100, 6, 30);

        let later = ReconcileContext {
            at: at() + chrono::Duration::days(1),
            ..ctx()
        };
        let outcome = Reconciler::default()
            .reconcile(&store, &later, &candidate)
            .await
            .unwrap();

        assert_eq!(outcome.label(), "updated");
        let offers = store.offers().await;
        assert_eq!(offers[0].expiry, NaiveDate::from_ymd_opt(2100, 6, 30));
        assert_eq!(offers[0].reward_amount, 150.0);
        assert_eq!(offers[0].updated_at, later.at);
        assert!(store.list_conflicts(&ConflictFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn repeated_divergence_keeps_one_pending_conflict() {
        let store = MemoryRecordStore::new();
        store.insert_offer(&stored(&acme())).await.unwrap();
        let mut candidate = acme();
        candidate.reward_amount = 200.0;

        let first = ctx();
        let reconciler = Reconciler::default();
        reconciler.reconcile(&store, &first, &candidate).await.unwrap();
        let outcome = reconciler.reconcile(&store, &ctx(), &candidate).await.unwrap();

        assert_eq!(outcome.label(), "conflict");
        let conflicts = store.list_conflicts(&ConflictFilter::default()).await.unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].run_id, first.run_id);
    }

    #[tokio::test]
    async fn newer_divergence_refreshes_the_pending_conflict() {
        let store = MemoryRecordStore::new();
        store.insert_offer(&stored(&acme())).await.unwrap();
        let reconciler = Reconciler::default();
        let mut candidate = acme();
        candidate.reward_amount = 200.0;
        reconciler.reconcile(&store, &ctx(), &candidate).await.unwrap();

        candidate.reward_amount = 250.0;
        let second = ctx();
        reconciler.reconcile(&store, &second, &candidate).await.unwrap();

        let conflicts = store.list_conflicts(&ConflictFilter::default()).await.unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].run_id, second.run_id);
        assert_eq!(conflicts[0].proposed.reward_amount, 250.0);
        assert_eq!(conflicts[0].changes[0].new, "250.00");
    }

    #[tokio::test]
    async fn divergence_after_a_resolution_opens_a_new_conflict() {
        let store = MemoryRecordStore::new();
        store.insert_offer(&stored(&acme())).await.unwrap();
        let reconciler = Reconciler::default();
        let mut candidate = acme();
        candidate.reward_amount = 200.0;
        reconciler.reconcile(&store, &ctx(), &candidate).await.unwrap();
        let first = store.find_pending_conflict("Acme Bank").await.unwrap().unwrap();
        store
            .set_conflict_status(first.id, ConflictStatus::Rejected, at())
            .await
            .unwrap();

        reconciler.reconcile(&store, &ctx(), &candidate).await.unwrap();

        let pending = store.find_pending_conflict("Acme Bank").await.unwrap().unwrap();
        assert_ne!(pending.id, first.id);
        assert_eq!(store.list_conflicts(&ConflictFilter::default()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn conflict_creates_a_pending_record_without_writing_through() {
        let store = MemoryRecordStore::new();
        store.insert_offer(&stored(&acme())).await.unwrap();
        let mut candidate = acme();
        candidate.reward_amount = 200.0;

        let context = ctx();
        let outcome = Reconciler::default()
            .reconcile(&store, &context, &candidate)
            .await
            .unwrap();

        assert_eq!(outcome.label(), "conflict");
        assert_eq!(store.offers().await[0].reward_amount, 150.0);
        let conflicts = store.list_conflicts(&ConflictFilter::default()).await.unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].run_id, context.run_id);
        assert_eq!(conflicts[0].status, ConflictStatus::Pending);
        assert_eq!(conflicts[0].proposed, candidate);
    }
}
