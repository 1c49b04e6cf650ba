// Dwell Checker Job - fires time_in_column automations
//
// Periodic sweep over all cards: compute how long each card has sat in its
// current column and run any time-based automation whose threshold is met and
// whose ledger entry is absent. The sweep keeps no state of its own; running
// it twice back-to-back cannot double-execute because the ledger is checked
// under the same dedup key the transition path uses.

use chrono::Utc;
use sqlx::PgPool;
use tracing::{error, info};

use laneflow_shared::Card;

use crate::automation::{batch_is_clean, AutomationEngine, TriggerKind};

pub struct DwellCheckerJob {
    db_pool: PgPool,
    engine: AutomationEngine,
}

#[derive(Debug, Default)]
pub struct DwellCheckResult {
    pub cards_scanned: i32,
    pub automations_triggered: i32,
    pub batches_failed: i32,
    pub errors: Vec<String>,
}

impl DwellCheckerJob {
    pub fn new(db_pool: PgPool, engine: AutomationEngine) -> Self {
        Self { db_pool, engine }
    }

    pub async fn run(&self) -> Result<DwellCheckResult, sqlx::Error> {
        let mut result = DwellCheckResult::default();

        let cards = sqlx::query_as::<_, Card>(
            "SELECT * FROM cards ORDER BY moved_to_column_at ASC NULLS FIRST",
        )
        .fetch_all(&self.db_pool)
        .await?;

        let now = Utc::now();

        // Due batches run concurrently so one card's funnel delays do not hold
        // up the rest of the sweep, but they are all joined before the tick
        // returns: a scan that starts after this one sees their ledger entries.
        let mut batches = Vec::new();

        for card in &cards {
            result.cards_scanned += 1;

            // Dwell counts from the last move, or from creation for cards
            // that were never explicitly moved.
            let since = card.moved_to_column_at.unwrap_or(card.created_at);
            let dwell_minutes = (now - since).num_minutes();

            let automations = match self
                .engine
                .automations_for(card.column_id, TriggerKind::TimeInColumn)
                .await
            {
                Ok(automations) => automations,
                Err(e) => {
                    result.errors.push(format!(
                        "Failed to load time automations for column {}: {}",
                        card.column_id, e
                    ));
                    continue;
                }
            };

            for automation in &automations {
                let Some(threshold) = automation.time_threshold_minutes() else {
                    continue;
                };

                if dwell_minutes < threshold {
                    continue;
                }

                match self
                    .engine
                    .ledger()
                    .has_executed(automation.id, card.id, card.column_id, since)
                    .await
                {
                    Ok(true) => continue,
                    Ok(false) => {}
                    Err(e) => {
                        result.errors.push(format!(
                            "Ledger check failed for automation '{}' on card {}: {}",
                            automation.name, card.id, e
                        ));
                        continue;
                    }
                }

                info!(
                    "Card {} dwelled {}m in column {} (threshold {}m), firing automation '{}'",
                    card.id, dwell_minutes, card.column_id, threshold, automation.name
                );

                let engine = self.engine.clone();
                let automation = automation.clone();
                let card = card.clone();
                batches.push(tokio::spawn(async move {
                    let outcomes = engine
                        .run_automation(
                            &automation,
                            &card,
                            card.column_id,
                            since,
                            TriggerKind::TimeInColumn,
                        )
                        .await;
                    batch_is_clean(&outcomes)
                }));

                result.automations_triggered += 1;
            }
        }

        for batch in batches {
            match batch.await {
                Ok(clean) => {
                    if !clean {
                        result.batches_failed += 1;
                    }
                }
                Err(e) => {
                    result.errors.push(format!("Automation batch task failed: {}", e));
                    result.batches_failed += 1;
                }
            }
        }

        if !result.errors.is_empty() {
            error!(
                "Dwell check finished with {} errors over {} cards",
                result.errors.len(),
                result.cards_scanned
            );
        }

        Ok(result)
    }
}
