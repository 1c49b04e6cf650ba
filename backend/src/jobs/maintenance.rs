// Maintenance Jobs - periodic cleanup of engine bookkeeping

use sqlx::PgPool;
use tracing::info;

pub struct MaintenanceJobs;

impl MaintenanceJobs {
    /// Drop ledger entries past the retention window. Dedup only needs the
    /// current dwell period; old entries are kept around for operational
    /// inspection, not correctness.
    pub async fn prune_execution_ledger(
        pool: &PgPool,
        retention_days: i32,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "DELETE FROM automation_executions
             WHERE executed_at < NOW() - make_interval(days => $1)",
        )
        .bind(retention_days)
        .execute(pool)
        .await?;

        let pruned = result.rows_affected();
        if pruned > 0 {
            info!("Pruned {} execution ledger entries older than {} days", pruned, retention_days);
        }

        Ok(pruned)
    }

    /// Drop ledger entries whose card no longer exists.
    pub async fn cleanup_orphaned_executions(pool: &PgPool) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "DELETE FROM automation_executions e
             WHERE NOT EXISTS (SELECT 1 FROM cards c WHERE c.id = e.card_id)",
        )
        .execute(pool)
        .await?;

        let removed = result.rows_affected();
        if removed > 0 {
            info!("Removed {} orphaned execution ledger entries", removed);
        }

        Ok(removed)
    }
}
