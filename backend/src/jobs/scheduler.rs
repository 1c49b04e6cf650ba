// Job Scheduler - central scheduler for all background jobs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler as TokioScheduler, JobSchedulerError};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::{DwellCheckerJob, MaintenanceJobs};
use crate::automation::AutomationEngine;

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Scheduler error: {0}")]
    SchedulerError(#[from] JobSchedulerError),
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),
    #[error("Job execution error: {0}")]
    ExecutionError(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

pub type JobResult<T> = Result<T, JobError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// How often the dwell checker sweeps all cards
    pub dwell_check_interval_minutes: u32,

    /// Retention window for execution ledger entries
    pub ledger_retention_days: i32,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            dwell_check_interval_minutes: 5,
            ledger_retention_days: 90,
        }
    }
}

impl JobConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(interval) = std::env::var("DWELL_CHECK_INTERVAL_MINUTES") {
            if let Ok(n) = interval.parse() {
                config.dwell_check_interval_minutes = n;
            }
        }

        if let Ok(retention) = std::env::var("LEDGER_RETENTION_DAYS") {
            if let Ok(n) = retention.parse() {
                config.ledger_retention_days = n;
            }
        }

        config
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobExecutionLog {
    pub id: Uuid,
    pub job_name: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: JobStatus,
    pub items_processed: i32,
    pub errors: Vec<String>,
    pub duration_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
    PartialFailure,
}

pub struct JobScheduler {
    scheduler: TokioScheduler,
    db_pool: PgPool,
    engine: AutomationEngine,
    config: JobConfig,
    execution_logs: Arc<RwLock<Vec<JobExecutionLog>>>,
}

impl JobScheduler {
    pub async fn new(
        db_pool: PgPool,
        engine: AutomationEngine,
        config: JobConfig,
    ) -> JobResult<Self> {
        let scheduler = TokioScheduler::new().await?;

        Ok(Self {
            scheduler,
            db_pool,
            engine,
            config,
            execution_logs: Arc::new(RwLock::new(Vec::new())),
        })
    }

    pub async fn start(&self) -> JobResult<()> {
        info!("Starting background job scheduler");

        self.schedule_dwell_checker().await?;
        self.schedule_daily_cleanup().await?;

        self.scheduler.start().await?;

        info!("Background job scheduler started successfully");
        Ok(())
    }

    pub async fn shutdown(&mut self) -> JobResult<()> {
        info!("Shutting down background job scheduler");
        self.scheduler.shutdown().await?;
        Ok(())
    }

    async fn schedule_dwell_checker(&self) -> JobResult<()> {
        let interval = self.config.dwell_check_interval_minutes;
        let cron_expr = format!("0 */{} * * * *", interval); // Every N minutes

        let db_pool = self.db_pool.clone();
        let engine = self.engine.clone();
        let logs = self.execution_logs.clone();

        let job = Job::new_async(cron_expr.as_str(), move |_uuid, _lock| {
            let db_pool = db_pool.clone();
            let engine = engine.clone();
            let logs = logs.clone();

            Box::pin(async move {
                let log_id = Uuid::new_v4();
                let started_at = Utc::now();

                info!("Running dwell checker job");

                let checker = DwellCheckerJob::new(db_pool, engine);

                match checker.run().await {
                    Ok(result) => {
                        let completed_at = Utc::now();
                        let duration = (completed_at - started_at).num_milliseconds();

                        let log = JobExecutionLog {
                            id: log_id,
                            job_name: "Dwell Checker".to_string(),
                            started_at,
                            completed_at: Some(completed_at),
                            status: if result.errors.is_empty() {
                                JobStatus::Completed
                            } else {
                                JobStatus::PartialFailure
                            },
                            items_processed: result.cards_scanned,
                            errors: result.errors,
                            duration_ms: Some(duration),
                        };

                        let mut logs = logs.write().await;
                        logs.push(log);
                        // Keep only last 100 logs
                        if logs.len() > 100 {
                            logs.remove(0);
                        }

                        info!(
                            "Dwell checker completed: {} cards scanned, {} automations fired, {} batches failed",
                            result.cards_scanned, result.automations_triggered, result.batches_failed
                        );
                    }
                    Err(e) => {
                        error!("Dwell checker failed: {}", e);
                    }
                }
            })
        })?;

        self.scheduler.add(job).await?;
        info!("Scheduled dwell checker to run every {} minutes", interval);

        Ok(())
    }

    async fn schedule_daily_cleanup(&self) -> JobResult<()> {
        let retention_days = self.config.ledger_retention_days;
        let db_pool = self.db_pool.clone();

        // Run at 3 AM every day
        let job = Job::new_async("0 0 3 * * *", move |_uuid, _lock| {
            let db_pool = db_pool.clone();

            Box::pin(async move {
                info!("Running daily cleanup tasks");

                if let Err(e) =
                    MaintenanceJobs::prune_execution_ledger(&db_pool, retention_days).await
                {
                    warn!("Execution ledger pruning failed: {}", e);
                }

                if let Err(e) = MaintenanceJobs::cleanup_orphaned_executions(&db_pool).await {
                    warn!("Orphaned execution cleanup failed: {}", e);
                }

                info!("Daily cleanup completed");
            })
        })?;

        self.scheduler.add(job).await?;
        info!("Scheduled daily cleanup at 3 AM");

        Ok(())
    }

    pub async fn get_execution_logs(&self) -> Vec<JobExecutionLog> {
        self.execution_logs.read().await.clone()
    }

    pub async fn run_job_now(&self, job_name: &str) -> JobResult<()> {
        match job_name {
            "dwell_checker" => {
                let checker = DwellCheckerJob::new(self.db_pool.clone(), self.engine.clone());
                checker
                    .run()
                    .await
                    .map_err(|e| JobError::ExecutionError(e.to_string()))?;
            }
            "ledger_cleanup" => {
                MaintenanceJobs::prune_execution_ledger(
                    &self.db_pool,
                    self.config.ledger_retention_days,
                )
                .await?;
                MaintenanceJobs::cleanup_orphaned_executions(&self.db_pool).await?;
            }
            _ => return Err(JobError::ConfigError(format!("Unknown job: {}", job_name))),
        }

        Ok(())
    }
}
