// Action Executor - per-action side effects for automation batches
//
// Every action runs behind a failure boundary: configuration gaps, missing
// related entities and external delivery failures all collapse into a failed
// ActionResult so sibling actions and the surrounding card mutation are never
// aborted.

use chrono::{DateTime, Utc};
use laneflow_shared::{Card, Connection, Conversation, Funnel, FunnelStep};
use regex::Regex;
use std::sync::OnceLock;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::actions::{
    ActionKind, ActionResult, AddAgentConfig, AddTagConfig, AutomationAction, MoveToColumnConfig,
    RemoveAgentConfig, SendFunnelConfig, SendMessageConfig,
};
use super::engine::{Automation, AutomationEngine, MAX_MOVE_CHAIN};
use super::resolver::{CardContext, ConnectionMode};
use crate::services::DispatchError;

#[derive(Error, Debug)]
pub enum ActionError {
    #[error("missing configuration: {0}")]
    Config(String),
    #[error("could not resolve {0} for card")]
    Resolution(&'static str),
    #[error("automation move chain exceeded {0} hops")]
    MoveChain(u32),
    #[error("{failed} of {total} funnel steps failed")]
    FunnelSteps { failed: usize, total: usize },
    #[error("dispatch failed: {0}")]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("invalid action config: {0}")]
    InvalidConfig(#[from] serde_json::Error),
}

impl AutomationEngine {
    /// Execute one action of a batch. Never propagates an error: the outcome
    /// is always folded into an ActionResult.
    pub(super) async fn execute_action(
        &self,
        automation: &Automation,
        action: &AutomationAction,
        card: &Card,
        context: &CardContext,
        since: DateTime<Utc>,
        hops: u32,
    ) -> ActionResult {
        let start = Instant::now();
        debug!(
            "Executing {} action of automation '{}' for card {}",
            action.kind.as_str(),
            automation.name,
            card.id
        );

        let key = idempotency_key(automation.id, card.id, action.id, since);

        let outcome = match action.kind {
            ActionKind::SendMessage => self.execute_send_message(action, card, context, &key).await,
            ActionKind::SendFunnel => self.execute_send_funnel(action, card, context, &key).await,
            ActionKind::AddAgent => self.execute_add_agent(action, card, context).await,
            ActionKind::RemoveAgent => self.execute_remove_agent(action, card, context).await,
            ActionKind::MoveToColumn => self.execute_move_to_column(action, card, hops).await,
            ActionKind::AddTag => self.execute_add_tag(action, card).await,
        };

        let duration = start.elapsed().as_millis() as i64;

        match outcome {
            Ok(()) => ActionResult::success(action).with_duration(duration),
            Err(e) => {
                error!(
                    "{} action of automation '{}' failed for card {}: {}",
                    action.kind.as_str(),
                    automation.name,
                    card.id,
                    e
                );
                ActionResult::failure(action, &e.to_string()).with_duration(duration)
            }
        }
    }

    async fn execute_send_message(
        &self,
        action: &AutomationAction,
        card: &Card,
        context: &CardContext,
        idempotency_key: &str,
    ) -> Result<(), ActionError> {
        let config: SendMessageConfig = serde_json::from_value(action.config.clone())?;

        let conversation = context
            .conversation
            .as_ref()
            .ok_or(ActionError::Resolution("conversation"))?;
        let connection = self
            .connection_for_send(card, context, config.connection_mode, config.connection_id)
            .await?;

        let content = render_template(&config.content, card, context);

        let receipt = self
            .dispatcher
            .send_text(conversation.id, connection.id, &content, idempotency_key)
            .await?;

        info!(
            "Automation message {} sent to conversation {} via connection {}",
            receipt.message_id, conversation.id, connection.id
        );

        Ok(())
    }

    async fn execute_send_funnel(
        &self,
        action: &AutomationAction,
        card: &Card,
        context: &CardContext,
        idempotency_key: &str,
    ) -> Result<(), ActionError> {
        let config: SendFunnelConfig = serde_json::from_value(action.config.clone())?;

        let conversation = context
            .conversation
            .as_ref()
            .ok_or(ActionError::Resolution("conversation"))?;
        let connection = self
            .connection_for_send(card, context, config.connection_mode, config.connection_id)
            .await?;

        let funnel =
            sqlx::query_as::<_, Funnel>("SELECT * FROM funnels WHERE id = $1 AND active = true")
                .bind(config.funnel_id)
                .fetch_optional(&self.db_pool)
                .await?
                .ok_or_else(|| {
                    ActionError::Config(format!("funnel {} not found or inactive", config.funnel_id))
                })?;

        let steps = sqlx::query_as::<_, FunnelStep>(
            "SELECT * FROM funnel_steps WHERE funnel_id = $1 ORDER BY step_order ASC",
        )
        .bind(funnel.id)
        .fetch_all(&self.db_pool)
        .await?;

        if steps.is_empty() {
            return Err(ActionError::Config(format!(
                "funnel '{}' has no steps",
                funnel.name
            )));
        }

        let total = steps.len();
        let mut failed = 0usize;

        for (index, step) in steps.iter().enumerate() {
            let step_key = format!("{}:{}", idempotency_key, index);

            if let Err(e) = self
                .dispatch_funnel_step(step, conversation, &connection, card, context, &step_key)
                .await
            {
                error!(
                    "Funnel '{}' step {} failed for conversation {}: {}",
                    funnel.name, step.step_order, conversation.id, e
                );
                failed += 1;
            }

            // Inter-step pacing: suspend this batch only; other cards and
            // automations keep running on their own tasks.
            if index + 1 < total && step.delay_seconds > 0 {
                tokio::time::sleep(std::time::Duration::from_secs(step.delay_seconds as u64)).await;
            }
        }

        if failed > 0 {
            return Err(ActionError::FunnelSteps { failed, total });
        }

        Ok(())
    }

    async fn dispatch_funnel_step(
        &self,
        step: &FunnelStep,
        conversation: &Conversation,
        connection: &Connection,
        card: &Card,
        context: &CardContext,
        idempotency_key: &str,
    ) -> Result<(), ActionError> {
        match step.kind.as_str() {
            "message" => {
                let content = step.content.as_deref().ok_or_else(|| {
                    ActionError::Config(format!("funnel step {} has no content", step.step_order))
                })?;
                let rendered = render_template(content, card, context);
                self.dispatcher
                    .send_text(conversation.id, connection.id, &rendered, idempotency_key)
                    .await?;
            }
            "audio" | "media" | "document" => {
                let file_url = step.file_url.as_deref().ok_or_else(|| {
                    ActionError::Config(format!("funnel step {} has no file url", step.step_order))
                })?;
                let file_name = step.file_name.as_deref().unwrap_or("attachment");
                self.dispatcher
                    .send_media(
                        conversation.id,
                        connection.id,
                        &step.kind,
                        file_url,
                        file_name,
                        idempotency_key,
                    )
                    .await?;
            }
            other => {
                return Err(ActionError::Config(format!(
                    "funnel step {} has unknown kind '{}'",
                    step.step_order, other
                )));
            }
        }

        Ok(())
    }

    async fn execute_add_agent(
        &self,
        action: &AutomationAction,
        card: &Card,
        context: &CardContext,
    ) -> Result<(), ActionError> {
        let config: AddAgentConfig = serde_json::from_value(action.config.clone())?;

        let conversation = context
            .conversation
            .as_ref()
            .ok_or(ActionError::Resolution("conversation"))?;

        // Explicit config wins, then the conversation's last agent, then the
        // agent configured on the conversation's queue.
        let mut agent_id = config.agent_id.or(conversation.agent_id);
        if agent_id.is_none() {
            if let Some(queue_id) = conversation.queue_id {
                agent_id = sqlx::query_scalar::<_, Option<Uuid>>(
                    "SELECT default_agent_id FROM queues WHERE id = $1",
                )
                .bind(queue_id)
                .fetch_optional(&self.db_pool)
                .await?
                .flatten();
            }
        }

        let Some(agent_id) = agent_id else {
            return Err(ActionError::Config(
                "no agent id configured or inferable for conversation".to_string(),
            ));
        };

        sqlx::query(
            "UPDATE conversations
             SET agent_active = true, agent_id = $2, status = 'open', updated_at = NOW()
             WHERE id = $1",
        )
        .bind(conversation.id)
        .bind(agent_id)
        .execute(&self.db_pool)
        .await?;

        info!(
            "Agent {} activated on conversation {} by automation",
            agent_id, conversation.id
        );

        self.notify_agent_updated(card.pipeline_id, conversation.id, true, Some(agent_id))
            .await;

        Ok(())
    }

    async fn execute_remove_agent(
        &self,
        action: &AutomationAction,
        card: &Card,
        context: &CardContext,
    ) -> Result<(), ActionError> {
        let config: RemoveAgentConfig = serde_json::from_value(action.config.clone())?;

        let conversation_id = context
            .conversation
            .as_ref()
            .map(|c| c.id)
            .ok_or(ActionError::Resolution("conversation"))?;

        // Re-read the conversation: an earlier action in the batch may have
        // toggled the agent after the context snapshot was taken.
        let Some(current) = self.resolver.fetch_conversation(conversation_id).await? else {
            return Err(ActionError::Resolution("conversation"));
        };

        if !current.agent_active {
            info!(
                "Conversation {} has no active agent, remove_agent is a no-op",
                current.id
            );
            return Ok(());
        }

        if let Some(target) = config.agent_id {
            if current.agent_id != Some(target) {
                info!(
                    "Conversation {} active agent {:?} does not match {}, leaving it in place",
                    current.id, current.agent_id, target
                );
                return Ok(());
            }
        }

        sqlx::query(
            "UPDATE conversations SET agent_active = false, updated_at = NOW() WHERE id = $1",
        )
        .bind(current.id)
        .execute(&self.db_pool)
        .await?;

        info!("Agent deactivated on conversation {} by automation", current.id);

        self.notify_agent_updated(card.pipeline_id, current.id, false, current.agent_id)
            .await;

        Ok(())
    }

    async fn execute_move_to_column(
        &self,
        action: &AutomationAction,
        card: &Card,
        hops: u32,
    ) -> Result<(), ActionError> {
        let config: MoveToColumnConfig = serde_json::from_value(action.config.clone())?;

        let Some(target) = config.column_id else {
            return Err(ActionError::Config("no target column configured".to_string()));
        };

        if target == card.column_id {
            info!("Card {} is already in column {}, move is a no-op", card.id, target);
            return Ok(());
        }

        if hops >= MAX_MOVE_CHAIN {
            return Err(ActionError::MoveChain(hops));
        }

        self.move_card_at(card.id, target, hops + 1).await?;

        Ok(())
    }

    async fn execute_add_tag(
        &self,
        action: &AutomationAction,
        card: &Card,
    ) -> Result<(), ActionError> {
        let config: AddTagConfig = serde_json::from_value(action.config.clone())?;

        let Some(tag_id) = config.tag_id else {
            return Err(ActionError::Config("no tag id configured".to_string()));
        };
        let Some(contact_id) = card.contact_id else {
            return Err(ActionError::Resolution("contact"));
        };

        // Upsert: re-tagging an already tagged contact stays a single association.
        sqlx::query(
            "INSERT INTO contact_tags (contact_id, tag_id) VALUES ($1, $2)
             ON CONFLICT (contact_id, tag_id) DO NOTHING",
        )
        .bind(contact_id)
        .bind(tag_id)
        .execute(&self.db_pool)
        .await?;

        info!("Tag {} associated with contact {} by automation", tag_id, contact_id);

        Ok(())
    }

    async fn connection_for_send(
        &self,
        card: &Card,
        context: &CardContext,
        mode: Option<ConnectionMode>,
        specific_id: Option<Uuid>,
    ) -> Result<Connection, ActionError> {
        match mode {
            None => context
                .connection
                .clone()
                .ok_or(ActionError::Resolution("connection")),
            Some(mode) => self
                .resolver
                .select_connection(card.workspace_id, card.contact_id, mode, specific_id)
                .await?
                .ok_or(ActionError::Resolution("connection")),
        }
    }
}

/// Stable per-invocation idempotency key for outbound dispatches. The same
/// automation retried within the same dwell window produces the same key, so
/// the transport sink can de-duplicate replays.
pub fn idempotency_key(
    automation_id: Uuid,
    card_id: Uuid,
    action_id: Uuid,
    since: DateTime<Utc>,
) -> String {
    format!(
        "auto:{}:{}:{}:{}",
        automation_id,
        card_id,
        action_id,
        since.timestamp()
    )
}

static TEMPLATE_VAR: OnceLock<Regex> = OnceLock::new();

/// Replace `{{...}}` placeholders in message content with card/contact data.
/// Unknown placeholders are left untouched.
pub fn render_template(template: &str, card: &Card, context: &CardContext) -> String {
    let re = TEMPLATE_VAR.get_or_init(|| Regex::new(r"\{\{\s*([^}]+?)\s*\}\}").unwrap());

    let mut result = template.to_string();
    for capture in re.captures_iter(template) {
        let value = match &capture[1] {
            "card.title" => Some(card.title.clone()),
            "card.status" => Some(card.status.clone()),
            "card.value" => card.value.map(|v| v.to_string()),
            "contact.name" => context.contact.as_ref().map(|c| c.name.clone()),
            "contact.phone" => context.contact.as_ref().and_then(|c| c.phone.clone()),
            "contact.email" => context.contact.as_ref().and_then(|c| c.email.clone()),
            _ => None,
        };

        if let Some(value) = value {
            result = result.replace(&capture[0], &value);
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use laneflow_shared::Contact;
    use rust_decimal::Decimal;

    fn sample_card() -> Card {
        Card {
            id: Uuid::new_v4(),
            workspace_id: Uuid::new_v4(),
            pipeline_id: Uuid::new_v4(),
            column_id: Uuid::new_v4(),
            contact_id: None,
            conversation_id: None,
            title: "Proposta ACME".to_string(),
            value: Some(Decimal::new(150000, 2)),
            status: "open".to_string(),
            assigned_to: None,
            tags: Vec::new(),
            moved_to_column_at: None,
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    fn context_with_contact(name: &str) -> CardContext {
        CardContext {
            contact: Some(Contact {
                id: Uuid::new_v4(),
                workspace_id: Uuid::new_v4(),
                name: name.to_string(),
                phone: Some("+5511999990000".to_string()),
                email: None,
                created_at: Utc::now(),
                updated_at: None,
            }),
            conversation: None,
            connection: None,
        }
    }

    #[test]
    fn test_render_template_substitutes_known_vars() {
        let card = sample_card();
        let context = context_with_contact("Maria");

        let rendered = render_template(
            "Olá {{contact.name}}, sobre {{ card.title }} ({{card.value}})",
            &card,
            &context,
        );

        assert_eq!(rendered, "Olá Maria, sobre Proposta ACME (1500.00)");
    }

    #[test]
    fn test_render_template_leaves_unknown_vars() {
        let card = sample_card();
        let context = CardContext::default();

        let rendered = render_template("{{contact.name}} - {{mystery}}", &card, &context);

        // contact is unresolved and {{mystery}} is unknown; both stay as-is.
        assert_eq!(rendered, "{{contact.name}} - {{mystery}}");
    }

    #[test]
    fn test_idempotency_key_is_stable_per_invocation() {
        let automation_id = Uuid::new_v4();
        let card_id = Uuid::new_v4();
        let action_id = Uuid::new_v4();
        let since = Utc::now();

        let a = idempotency_key(automation_id, card_id, action_id, since);
        let b = idempotency_key(automation_id, card_id, action_id, since);
        assert_eq!(a, b);

        let other_window = idempotency_key(
            automation_id,
            card_id,
            action_id,
            since + chrono::Duration::minutes(5),
        );
        assert_ne!(a, other_window);
    }
}
