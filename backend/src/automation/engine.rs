// Automation Engine - column automation matching and orchestration
//
// The engine does not own column transitions; it observes them. The card
// mutation path classifies the transition, purges stale ledger entries, and
// hands the updated card to `process_transition`. The dwell scanner reuses the
// same matcher/executor/ledger path for time-based triggers.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::json;
use sqlx::{FromRow, PgPool};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use laneflow_shared::Card;

use super::actions::{batch_is_clean, ActionKind, ActionResult, AutomationAction};
use super::ledger::ExecutionLedger;
use super::resolver::EntityResolver;
use super::triggers::{classify_transition, AutomationTrigger, TransitionKind, TriggerKind};
use crate::services::MessageDispatcher;
use crate::websocket::{WsManager, WsMessage};

/// Automation-driven card moves can chain (move action fires the target
/// column's automations, which may move again). The chain is capped so two
/// columns configured to move cards at each other cannot recurse unbounded.
pub(super) const MAX_MOVE_CHAIN: u32 = 8;

/// A column automation with its ordered triggers and actions
#[derive(Debug, Clone, Serialize)]
pub struct Automation {
    pub id: Uuid,
    pub column_id: Uuid,
    pub name: String,
    pub active: bool,
    pub triggers: Vec<AutomationTrigger>,
    pub actions: Vec<AutomationAction>,
}

impl Automation {
    /// Smallest positive dwell threshold among the automation's
    /// `time_in_column` triggers, in minutes.
    pub fn time_threshold_minutes(&self) -> Option<i64> {
        self.triggers
            .iter()
            .filter_map(|t| t.threshold_minutes())
            .min()
    }
}

#[derive(Debug, FromRow)]
struct AutomationRow {
    id: Uuid,
    column_id: Uuid,
    name: String,
    active: bool,
}

#[derive(Debug, FromRow)]
struct TriggerRow {
    kind: String,
    time_value: Option<i32>,
    time_unit: Option<String>,
}

#[derive(Debug, FromRow)]
struct ActionRow {
    id: Uuid,
    kind: String,
    action_order: i32,
    config: serde_json::Value,
}

#[derive(Clone)]
pub struct AutomationEngine {
    pub(super) db_pool: PgPool,
    pub(super) dispatcher: MessageDispatcher,
    pub(super) ws_manager: WsManager,
    pub(super) ledger: ExecutionLedger,
    pub(super) resolver: EntityResolver,
}

impl AutomationEngine {
    pub fn new(db_pool: PgPool, dispatcher: MessageDispatcher, ws_manager: WsManager) -> Self {
        let ledger = ExecutionLedger::new(db_pool.clone());
        let resolver = EntityResolver::new(db_pool.clone());
        Self {
            db_pool,
            dispatcher,
            ws_manager,
            ledger,
            resolver,
        }
    }

    pub fn ledger(&self) -> &ExecutionLedger {
        &self.ledger
    }

    /// Active automations on a column whose trigger list contains `kind`,
    /// each with its ordered actions. Inactive automations and automations
    /// lacking the trigger kind are silently excluded.
    pub async fn automations_for(
        &self,
        column_id: Uuid,
        kind: TriggerKind,
    ) -> Result<Vec<Automation>, sqlx::Error> {
        let rows = sqlx::query_as::<_, AutomationRow>(
            "SELECT a.id, a.column_id, a.name, a.active
             FROM automations a
             WHERE a.column_id = $1 AND a.active = true
             AND EXISTS (
                 SELECT 1 FROM automation_triggers t
                 WHERE t.automation_id = a.id AND t.kind = $2
             )
             ORDER BY a.created_at ASC",
        )
        .bind(column_id)
        .bind(kind.as_str())
        .fetch_all(&self.db_pool)
        .await?;

        let mut automations = Vec::with_capacity(rows.len());
        for row in rows {
            automations.push(self.load_children(row).await?);
        }

        Ok(automations)
    }

    /// Load one automation (any active state) with its triggers and actions.
    pub async fn automation_by_id(&self, id: Uuid) -> Result<Option<Automation>, sqlx::Error> {
        let row = sqlx::query_as::<_, AutomationRow>(
            "SELECT id, column_id, name, active FROM automations WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.db_pool)
        .await?;

        match row {
            Some(row) => Ok(Some(self.load_children(row).await?)),
            None => Ok(None),
        }
    }

    async fn load_children(&self, row: AutomationRow) -> Result<Automation, sqlx::Error> {
        let trigger_rows = sqlx::query_as::<_, TriggerRow>(
            "SELECT kind, time_value, time_unit
             FROM automation_triggers WHERE automation_id = $1
             ORDER BY created_at ASC",
        )
        .bind(row.id)
        .fetch_all(&self.db_pool)
        .await?;

        let triggers = trigger_rows
            .into_iter()
            .filter_map(|t| {
                let Some(kind) = TriggerKind::from_db(&t.kind) else {
                    warn!("Automation {} has unknown trigger kind '{}'", row.id, t.kind);
                    return None;
                };
                Some(AutomationTrigger {
                    kind,
                    time_value: t.time_value,
                    time_unit: t.time_unit.as_deref().and_then(super::triggers::DurationUnit::from_db),
                })
            })
            .collect();

        let action_rows = sqlx::query_as::<_, ActionRow>(
            "SELECT id, kind, action_order, config
             FROM automation_actions WHERE automation_id = $1
             ORDER BY action_order ASC",
        )
        .bind(row.id)
        .fetch_all(&self.db_pool)
        .await?;

        let actions = action_rows
            .into_iter()
            .filter_map(|a| {
                let Some(kind) = ActionKind::from_db(&a.kind) else {
                    warn!("Automation {} has unknown action kind '{}'", row.id, a.kind);
                    return None;
                };
                Some(AutomationAction {
                    id: a.id,
                    kind,
                    order: a.action_order,
                    config: a.config,
                })
            })
            .collect();

        Ok(Automation {
            id: row.id,
            column_id: row.column_id,
            name: row.name,
            active: row.active,
            triggers,
            actions,
        })
    }

    /// React to a classified column transition for a card that has already
    /// been persisted (and whose stale ledger entries were already purged).
    /// Outgoing automations of the old column always run before incoming
    /// automations of the new one. Automation failures are logged, never
    /// surfaced to the mutation caller.
    pub async fn process_transition(
        &self,
        card: &Card,
        previous_column: Option<Uuid>,
        kind: TransitionKind,
    ) {
        self.process_transition_at(card, previous_column, kind, 0)
            .await;
    }

    pub(super) async fn process_transition_at(
        &self,
        card: &Card,
        previous_column: Option<Uuid>,
        kind: TransitionKind,
        hops: u32,
    ) {
        match kind {
            TransitionKind::None => {}
            TransitionKind::Entered => {
                self.run_column_automations(card, card.column_id, TriggerKind::EnteredColumn, hops)
                    .await;
            }
            TransitionKind::Left => {
                if let Some(previous) = previous_column {
                    self.run_column_automations(card, previous, TriggerKind::LeftColumn, hops)
                        .await;
                }
            }
            TransitionKind::Both => {
                if let Some(previous) = previous_column {
                    self.run_column_automations(card, previous, TriggerKind::LeftColumn, hops)
                        .await;
                }
                self.run_column_automations(card, card.column_id, TriggerKind::EnteredColumn, hops)
                    .await;
            }
        }
    }

    async fn run_column_automations(
        &self,
        card: &Card,
        column_id: Uuid,
        trigger: TriggerKind,
        hops: u32,
    ) {
        let automations = match self.automations_for(column_id, trigger).await {
            Ok(automations) => automations,
            Err(e) => {
                error!(
                    "Failed to load {} automations for column {}: {}",
                    trigger.as_str(),
                    column_id,
                    e
                );
                return;
            }
        };

        if automations.is_empty() {
            return;
        }

        let since = card.moved_to_column_at.unwrap_or(card.created_at);

        for automation in &automations {
            match self
                .ledger
                .has_executed(automation.id, card.id, column_id, since)
                .await
            {
                Ok(true) => {
                    debug!(
                        "Automation '{}' already executed for card {} in column {}, skipping",
                        automation.name, card.id, column_id
                    );
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    error!(
                        "Ledger check failed for automation '{}' on card {}: {}",
                        automation.name, card.id, e
                    );
                    continue;
                }
            }

            self.run_automation_at(automation, card, column_id, since, trigger, hops)
                .await;
        }
    }

    /// Run one automation's ordered action batch for a card. Each action is
    /// isolated: a failure is collected and the remaining actions still run.
    /// The ledger entry is recorded only when the whole batch came back clean.
    pub async fn run_automation(
        &self,
        automation: &Automation,
        card: &Card,
        column_id: Uuid,
        since: DateTime<Utc>,
        trigger: TriggerKind,
    ) -> Vec<ActionResult> {
        self.run_automation_at(automation, card, column_id, since, trigger, 0)
            .await
    }

    pub(super) async fn run_automation_at(
        &self,
        automation: &Automation,
        card: &Card,
        column_id: Uuid,
        since: DateTime<Utc>,
        trigger: TriggerKind,
        hops: u32,
    ) -> Vec<ActionResult> {
        info!(
            "Running automation '{}' ({}) for card {} on column {}",
            automation.name,
            trigger.as_str(),
            card.id,
            column_id
        );

        let context = match self.resolver.resolve(card).await {
            Ok(context) => context,
            Err(e) => {
                error!(
                    "Entity resolution failed for card {}, automation '{}' skipped: {}",
                    card.id, automation.name, e
                );
                return Vec::new();
            }
        };

        let mut results = Vec::with_capacity(automation.actions.len());
        for action in &automation.actions {
            let result = self
                .execute_action(automation, action, card, &context, since, hops)
                .await;
            if !result.success {
                warn!(
                    "Action {} of automation '{}' failed for card {}: {}",
                    action.kind.as_str(),
                    automation.name,
                    card.id,
                    result.error.as_deref().unwrap_or("unknown error")
                );
            }
            results.push(result);
        }

        if batch_is_clean(&results) {
            let metadata = json!({
                "trigger": trigger.as_str(),
                "actions": results.len(),
            });
            match self
                .ledger
                .record(automation.id, card.id, column_id, metadata)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    debug!(
                        "Automation '{}' for card {} was recorded by a concurrent run",
                        automation.name, card.id
                    );
                }
                Err(e) => {
                    error!(
                        "Failed to record ledger entry for automation '{}' on card {}: {}",
                        automation.name, card.id, e
                    );
                }
            }
        } else {
            info!(
                "Automation '{}' for card {} had failed actions; withholding ledger entry",
                automation.name, card.id
            );
        }

        results
    }

    /// Move a card to another column and run the transition path. This is the
    /// re-entry point for the `move_to_column` action; the HTTP card surface
    /// goes through the card service instead.
    pub async fn move_card(&self, card_id: Uuid, target_column: Uuid) -> Result<(), sqlx::Error> {
        self.move_card_at(card_id, target_column, 0).await
    }

    pub(super) fn move_card_at(
        &self,
        card_id: Uuid,
        target_column: Uuid,
        hops: u32,
    ) -> BoxFuture<'_, Result<(), sqlx::Error>> {
        Box::pin(async move {
        let Some(card) = fetch_card(&self.db_pool, card_id).await? else {
            warn!("Cannot move card {}: not found", card_id);
            return Ok(());
        };

        let kind = classify_transition(Some(card.column_id), Some(target_column));
        if kind == TransitionKind::None {
            return Ok(());
        }

        let previous = card.column_id;

        sqlx::query(
            "UPDATE cards SET column_id = $2, moved_to_column_at = NOW(), updated_at = NOW()
             WHERE id = $1",
        )
        .bind(card_id)
        .bind(target_column)
        .execute(&self.db_pool)
        .await?;

        // Stale entries for the column being left must be gone before any
        // matching happens, or a leftover record could suppress a legitimate
        // re-entry later.
        self.ledger.purge(card_id, previous).await?;

        let Some(updated) = fetch_card(&self.db_pool, card_id).await? else {
            return Ok(());
        };

        self.notify_card_moved(&updated).await;

        // Boxed: the transition may contain another move_to_column action,
        // which re-enters this function.
        let transition: BoxFuture<'_, ()> =
            Box::pin(self.process_transition_at(&updated, Some(previous), kind, hops));
        transition.await;

        Ok(())
        })
    }

    pub(super) async fn notify_card_moved(&self, card: &Card) {
        let message = WsMessage::new(
            "card.moved",
            json!({
                "card_id": card.id,
                "pipeline_id": card.pipeline_id,
                "column_id": card.column_id,
                "moved_to_column_at": card.moved_to_column_at,
            }),
        );
        self.ws_manager
            .publish_to_pipeline(card.pipeline_id, message)
            .await;
    }

    pub(super) async fn notify_agent_updated(
        &self,
        pipeline_id: Uuid,
        conversation_id: Uuid,
        agent_active: bool,
        agent_id: Option<Uuid>,
    ) {
        let message = WsMessage::new(
            "conversation.agent_updated",
            json!({
                "conversation_id": conversation_id,
                "agent_active": agent_active,
                "agent_id": agent_id,
            }),
        );
        self.ws_manager
            .publish_to_pipeline(pipeline_id, message)
            .await;
    }
}

/// Fetch a card row by id.
pub async fn fetch_card(pool: &PgPool, card_id: Uuid) -> Result<Option<Card>, sqlx::Error> {
    sqlx::query_as::<_, Card>("SELECT * FROM cards WHERE id = $1")
        .bind(card_id)
        .fetch_optional(pool)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::triggers::DurationUnit;

    fn automation_with_triggers(triggers: Vec<AutomationTrigger>) -> Automation {
        Automation {
            id: Uuid::new_v4(),
            column_id: Uuid::new_v4(),
            name: "Follow up".to_string(),
            active: true,
            triggers,
            actions: Vec::new(),
        }
    }

    #[test]
    fn test_time_threshold_picks_smallest() {
        let automation = automation_with_triggers(vec![
            AutomationTrigger {
                kind: TriggerKind::TimeInColumn,
                time_value: Some(2),
                time_unit: Some(DurationUnit::Days),
            },
            AutomationTrigger {
                kind: TriggerKind::TimeInColumn,
                time_value: Some(90),
                time_unit: Some(DurationUnit::Minutes),
            },
        ]);
        assert_eq!(automation.time_threshold_minutes(), Some(90));
    }

    #[test]
    fn test_time_threshold_ignores_other_trigger_kinds() {
        let automation = automation_with_triggers(vec![AutomationTrigger {
            kind: TriggerKind::EnteredColumn,
            time_value: None,
            time_unit: None,
        }]);
        assert_eq!(automation.time_threshold_minutes(), None);
    }
}
