// Execution Ledger - the de-duplication authority for automation runs
//
// An entry means "this automation already ran for this card while it sat in
// this column". Entries are written only after a fully clean action batch and
// removed when the card leaves the column, so a later re-entry can fire the
// same automation again.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ExecutionLedger {
    db_pool: PgPool,
}

impl ExecutionLedger {
    pub fn new(db_pool: PgPool) -> Self {
        Self { db_pool }
    }

    /// True if the automation already executed for this card/column within the
    /// current dwell window (`since` = the card's `moved_to_column_at`, or its
    /// creation time when it was never moved).
    pub async fn has_executed(
        &self,
        automation_id: Uuid,
        card_id: Uuid,
        column_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<bool, sqlx::Error> {
        sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(
                 SELECT 1 FROM automation_executions
                 WHERE automation_id = $1 AND card_id = $2 AND column_id = $3
                 AND executed_at >= $4
             )",
        )
        .bind(automation_id)
        .bind(card_id)
        .bind(column_id)
        .bind(since)
        .fetch_one(&self.db_pool)
        .await
    }

    /// Record a completed run. The conditional insert is the serialization
    /// point: two concurrent triggers for the same automation/card/column
    /// cannot both insert, so at most one entry exists per dwell window.
    /// Returns false when another run already recorded.
    pub async fn record(
        &self,
        automation_id: Uuid,
        card_id: Uuid,
        column_id: Uuid,
        metadata: serde_json::Value,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "INSERT INTO automation_executions
                 (id, automation_id, card_id, column_id, executed_at, metadata)
             VALUES ($1, $2, $3, $4, NOW(), $5)
             ON CONFLICT (automation_id, card_id, column_id) DO NOTHING",
        )
        .bind(Uuid::new_v4())
        .bind(automation_id)
        .bind(card_id)
        .bind(column_id)
        .bind(metadata)
        .execute(&self.db_pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Drop the entries tied to a column the card is leaving. Invoked by the
    /// transition path before any new automation is matched.
    pub async fn purge(&self, card_id: Uuid, column_id: Uuid) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "DELETE FROM automation_executions WHERE card_id = $1 AND column_id = $2",
        )
        .bind(card_id)
        .bind(column_id)
        .execute(&self.db_pool)
        .await?;

        let purged = result.rows_affected();
        if purged > 0 {
            debug!(
                "Purged {} ledger entries for card {} leaving column {}",
                purged, card_id, column_id
            );
        }

        Ok(purged)
    }
}
