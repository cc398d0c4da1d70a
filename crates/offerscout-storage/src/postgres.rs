use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use offerscout_core::{
    ConflictFilter, ConflictRecord, ConflictStatus, FieldChange, LastRunSummary, OfferFields,
    PageRequest, RunFilter, RunPage, RunRecord, RunStatus, SourceConfig, SourceEntry, StoredOffer,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use uuid::Uuid;

use crate::{RecordStore, StoreError};

/// PostgreSQL-backed record store. Schema lives in the workspace `migrations/` directory.
#[derive(Debug, Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn to_u32(value: i32, column: &str) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::Corrupt(format!("negative {column}: {value}")))
}

fn to_i32(value: u32, column: &str) -> Result<i32, StoreError> {
    i32::try_from(value).map_err(|_| StoreError::Corrupt(format!("{column} out of range: {value}")))
}

fn parse_enum<T: std::str::FromStr<Err = String>>(raw: &str) -> Result<T, StoreError> {
    raw.parse::<T>().map_err(StoreError::Corrupt)
}

fn offer_from_row(row: &PgRow) -> Result<StoredOffer, StoreError> {
    Ok(StoredOffer {
        name: row.try_get("name")?,
        source_id: row.try_get("source_id")?,
        reward_amount: row.try_get("reward_amount")?,
        required_payments: to_u32(row.try_get("required_payments")?, "required_payments")?,
        pay_in_threshold: row.try_get("pay_in_threshold")?,
        expiry: row.try_get::<Option<NaiveDate>, _>("expiry")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn run_from_row(row: &PgRow) -> Result<RunRecord, StoreError> {
    let status: String = row.try_get("status")?;
    let errors: Json<Vec<String>> = row.try_get("errors_json")?;
    Ok(RunRecord {
        run_id: row.try_get("run_id")?,
        source_id: row.try_get("source_id")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        status: parse_enum::<RunStatus>(&status)?,
        deals_found: to_u32(row.try_get("deals_found")?, "deals_found")?,
        errors: errors.0,
        artifact_hash: row.try_get("artifact_hash")?,
    })
}

fn conflict_from_row(row: &PgRow) -> Result<ConflictRecord, StoreError> {
    let status: String = row.try_get("status")?;
    let changes: Json<Vec<FieldChange>> = row.try_get("changes_json")?;
    let proposed: Json<OfferFields> = row.try_get("proposed_json")?;
    Ok(ConflictRecord {
        id: row.try_get("id")?,
        run_id: row.try_get("run_id")?,
        source_id: row.try_get("source_id")?,
        entity_name: row.try_get("entity_name")?,
        changes: changes.0,
        proposed: proposed.0,
        status: parse_enum::<ConflictStatus>(&status)?,
        created_at: row.try_get("created_at")?,
        resolved_at: row.try_get("resolved_at")?,
    })
}

fn source_from_row(row: &PgRow) -> Result<SourceEntry, StoreError> {
    let config: Json<SourceConfig> = row.try_get("config_json")?;
    let status: Option<String> = row.try_get("last_run_status")?;
    let deals: Option<i32> = row.try_get("last_deals_found")?;
    let at: Option<DateTime<Utc>> = row.try_get("last_run_at")?;
    let last_run = match (status, at) {
        (Some(status), Some(at)) => Some(LastRunSummary {
            status: parse_enum::<RunStatus>(&status)?,
            deals_found: to_u32(deals.unwrap_or(0), "last_deals_found")?,
            at,
        }),
        _ => None,
    };
    Ok(SourceEntry {
        config: config.0,
        last_run,
    })
}

const SOURCE_COLUMNS: &str =
    "config_json, last_run_status, last_deals_found, last_run_at";

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn find_offer_by_name(&self, name: &str) -> Result<Option<StoredOffer>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT name, source_id, reward_amount, required_payments,
                   pay_in_threshold, expiry, updated_at
              FROM offers
             WHERE name = $1
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(offer_from_row).transpose()
    }

    async fn insert_offer(&self, offer: &StoredOffer) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO offers (name, source_id, reward_amount, required_payments,
                                pay_in_threshold, expiry, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (name) DO NOTHING
            "#,
        )
        .bind(&offer.name)
        .bind(&offer.source_id)
        .bind(offer.reward_amount)
        .bind(to_i32(offer.required_payments, "required_payments")?)
        .bind(offer.pay_in_threshold)
        .bind(offer.expiry)
        .bind(offer.updated_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::OfferExists(offer.name.clone()));
        }
        Ok(())
    }

    async fn update_offer(
        &self,
        name: &str,
        fields: &OfferFields,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE offers
               SET reward_amount = $2,
                   required_payments = $3,
                   pay_in_threshold = $4,
                   expiry = $5,
                   updated_at = $6
             WHERE name = $1
            "#,
        )
        .bind(name)
        .bind(fields.reward_amount)
        .bind(to_i32(fields.required_payments, "required_payments")?)
        .bind(fields.pay_in_threshold)
        .bind(fields.expiry)
        .bind(at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::OfferNotFound(name.to_string()));
        }
        Ok(())
    }

    async fn create_conflict(&self, conflict: &ConflictRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO conflicts (id, run_id, source_id, entity_name, changes_json,
                                   proposed_json, status, created_at, resolved_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(conflict.id)
        .bind(conflict.run_id)
        .bind(&conflict.source_id)
        .bind(&conflict.entity_name)
        .bind(Json(&conflict.changes))
        .bind(Json(&conflict.proposed))
        .bind(conflict.status.as_str())
        .bind(conflict.created_at)
        .bind(conflict.resolved_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_pending_conflict(
        &self,
        entity_name: &str,
    ) -> Result<Option<ConflictRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, run_id, source_id, entity_name, changes_json, proposed_json,
                   status, created_at, resolved_at
              FROM conflicts
             WHERE entity_name = $1
               AND status = 'pending'
             ORDER BY created_at DESC
             LIMIT 1
            "#,
        )
        .bind(entity_name)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(conflict_from_row).transpose()
    }

    async fn refresh_conflict(&self, conflict: &ConflictRecord) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE conflicts
               SET run_id = $2,
                   source_id = $3,
                   changes_json = $4,
                   proposed_json = $5
             WHERE id = $1
               AND status = 'pending'
            "#,
        )
        .bind(conflict.id)
        .bind(conflict.run_id)
        .bind(&conflict.source_id)
        .bind(Json(&conflict.changes))
        .bind(Json(&conflict.proposed))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(self.not_pending(conflict.id).await);
        }
        Ok(())
    }

    async fn write_run_record(&self, run: &RunRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO run_records (run_id, source_id, started_at, finished_at, status,
                                     deals_found, errors_json, artifact_hash)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(run.run_id)
        .bind(&run.source_id)
        .bind(run.started_at)
        .bind(run.finished_at)
        .bind(run.status.as_str())
        .bind(to_i32(run.deals_found, "deals_found")?)
        .bind(Json(&run.errors))
        .bind(&run.artifact_hash)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_source_summary(
        &self,
        source_id: &str,
        summary: &LastRunSummary,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE sources
               SET last_run_status = $2,
                   last_deals_found = $3,
                   last_run_at = $4
             WHERE source_id = $1
            "#,
        )
        .bind(source_id)
        .bind(summary.status.as_str())
        .bind(to_i32(summary.deals_found, "deals_found")?)
        .bind(summary.at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::SourceNotFound(source_id.to_string()));
        }
        Ok(())
    }

    async fn load_source(&self, source_id: &str) -> Result<Option<SourceEntry>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {SOURCE_COLUMNS} FROM sources WHERE source_id = $1"
        ))
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(source_from_row).transpose()
    }

    async fn list_sources(&self) -> Result<Vec<SourceEntry>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {SOURCE_COLUMNS} FROM sources ORDER BY priority DESC, source_id"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(source_from_row).collect()
    }

    async fn save_source(&self, config: &SourceConfig) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO sources (source_id, name, url, priority, is_active, config_json, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, NOW())
            ON CONFLICT (source_id) DO UPDATE
               SET name = EXCLUDED.name,
                   url = EXCLUDED.url,
                   priority = EXCLUDED.priority,
                   is_active = EXCLUDED.is_active,
                   config_json = EXCLUDED.config_json,
                   updated_at = NOW()
            "#,
        )
        .bind(&config.source_id)
        .bind(&config.name)
        .bind(&config.url)
        .bind(config.priority)
        .bind(config.is_active)
        .bind(Json(config))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn query_runs(
        &self,
        filter: &RunFilter,
        page: PageRequest,
    ) -> Result<RunPage, StoreError> {
        const WHERE: &str = r#"
             WHERE ($1::text IS NULL OR source_id = $1)
               AND ($2::text IS NULL OR status = $2)
               AND ($3::timestamptz IS NULL OR started_at >= $3)
               AND ($4::timestamptz IS NULL OR started_at <= $4)
        "#;
        let status = filter.status.map(|s| s.as_str());

        let total: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM run_records {WHERE}"))
            .bind(filter.source_id.as_deref())
            .bind(status)
            .bind(filter.from)
            .bind(filter.to)
            .fetch_one(&self.pool)
            .await?;

        let rows = sqlx::query(&format!(
            r#"
            SELECT run_id, source_id, started_at, finished_at, status,
                   deals_found, errors_json, artifact_hash
              FROM run_records
              {WHERE}
             ORDER BY started_at DESC
             LIMIT $5 OFFSET $6
            "#
        ))
        .bind(filter.source_id.as_deref())
        .bind(status)
        .bind(filter.from)
        .bind(filter.to)
        .bind(i64::try_from(page.page_size).unwrap_or(i64::MAX))
        .bind(i64::try_from(page.offset()).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        let runs = rows.iter().map(run_from_row).collect::<Result<Vec<_>, _>>()?;
        Ok(RunPage {
            runs,
            total: usize::try_from(total).unwrap_or(0),
        })
    }

    async fn list_conflicts(
        &self,
        filter: &ConflictFilter,
    ) -> Result<Vec<ConflictRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, run_id, source_id, entity_name, changes_json, proposed_json,
                   status, created_at, resolved_at
              FROM conflicts
             WHERE ($1::text IS NULL OR status = $1)
               AND ($2::text IS NULL OR source_id = $2)
             ORDER BY created_at DESC
            "#,
        )
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.source_id.as_deref())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(conflict_from_row).collect()
    }

    async fn get_conflict(&self, id: Uuid) -> Result<Option<ConflictRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, run_id, source_id, entity_name, changes_json, proposed_json,
                   status, created_at, resolved_at
              FROM conflicts
             WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(conflict_from_row).transpose()
    }

    async fn set_conflict_status(
        &self,
        id: Uuid,
        status: ConflictStatus,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE conflicts
               SET status = $2,
                   resolved_at = $3
             WHERE id = $1
               AND status = 'pending'
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(self.not_pending(id).await);
        }
        Ok(())
    }
}

impl PgRecordStore {
    /// Explains why a `status = 'pending'` guarded update touched no row.
    async fn not_pending(&self, id: Uuid) -> StoreError {
        match self.get_conflict(id).await {
            Ok(Some(_)) => StoreError::ConflictResolved(id),
            Ok(None) => StoreError::ConflictNotFound(id),
            Err(err) => err,
        }
    }
}
