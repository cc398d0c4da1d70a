use chrono::{DateTime, Utc};
use offerscout_core::{
    ConflictDecision, ConflictRecord, ConflictStatus, OfferField, OfferFields, StoredOffer,
};
use offerscout_storage::{RecordStore, StoreError};
use tracing::{error, info};
use uuid::Uuid;

/// Apply an operator decision.
///
/// The pending status is claimed before the offer is touched, so a decision that loses a race
/// writes nothing. Accepting replaces only the reviewed fields of the current stored record.
pub async fn resolve_conflict(
    store: &dyn RecordStore,
    id: Uuid,
    decision: ConflictDecision,
) -> Result<ConflictRecord, StoreError> {
    let conflict = store
        .get_conflict(id)
        .await?
        .ok_or(StoreError::ConflictNotFound(id))?;
    if conflict.status != ConflictStatus::Pending {
        return Err(StoreError::ConflictResolved(id));
    }

    let now = Utc::now();
    let status = decision.resulting_status();
    store.set_conflict_status(id, status, now).await?;

    if decision == ConflictDecision::Accept {
        if let Err(err) = apply_proposal(store, &conflict, now).await {
            error!(
                conflict_id = %id,
                entity = %conflict.entity_name,
                error = %err,
                "conflict accepted but offer write failed"
            );
            return Err(err);
        }
    }
    info!(
        conflict_id = %id,
        entity = %conflict.entity_name,
        status = status.as_str(),
        "conflict resolved"
    );

    Ok(ConflictRecord {
        status,
        resolved_at: Some(now),
        ..conflict
    })
}

async fn apply_proposal(
    store: &dyn RecordStore,
    conflict: &ConflictRecord,
    at: DateTime<Utc>,
) -> Result<(), StoreError> {
    let insert = || StoredOffer::from_fields(&conflict.source_id, &conflict.proposed, at);
    let Some(current) = store.find_offer_by_name(&conflict.entity_name).await? else {
        return store.insert_offer(&insert()).await;
    };
    match store
        .update_offer(&conflict.entity_name, &overlay_reviewed(&current, conflict), at)
        .await
    {
        Err(StoreError::OfferNotFound(_)) => store.insert_offer(&insert()).await,
        other => other,
    }
}

/// Current values with the fields named in the conflict taken from its proposal.
fn overlay_reviewed(current: &StoredOffer, conflict: &ConflictRecord) -> OfferFields {
    let proposed = &conflict.proposed;
    let mut fields = OfferFields {
        name: current.name.clone(),
        reward_amount: current.reward_amount,
        required_payments: current.required_payments,
        pay_in_threshold: current.pay_in_threshold,
        expiry: current.expiry,
    };
    for change in &conflict.changes {
        match change.field {
            OfferField::Name => {}
            OfferField::RewardAmount => fields.reward_amount = proposed.reward_amount,
            OfferField::RequiredPayments => fields.required_payments = proposed.required_payments,
            OfferField::PayInThreshold => fields.pay_in_threshold = proposed.pay_in_threshold,
            OfferField::Expiry => fields.expiry = proposed.expiry,
        }
    }
    fields
}
