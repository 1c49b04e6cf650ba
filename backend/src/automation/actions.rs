// Automation Actions - the side-effecting steps an automation can run

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::resolver::ConnectionMode;

/// Kinds of actions a column automation can execute
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    SendMessage,
    SendFunnel,
    AddAgent,
    RemoveAgent,
    MoveToColumn,
    AddTag,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SendMessage => "send_message",
            Self::SendFunnel => "send_funnel",
            Self::AddAgent => "add_agent",
            Self::RemoveAgent => "remove_agent",
            Self::MoveToColumn => "move_to_column",
            Self::AddTag => "add_tag",
        }
    }

    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "send_message" => Some(Self::SendMessage),
            "send_funnel" => Some(Self::SendFunnel),
            "add_agent" => Some(Self::AddAgent),
            "remove_agent" => Some(Self::RemoveAgent),
            "move_to_column" => Some(Self::MoveToColumn),
            "add_tag" => Some(Self::AddTag),
            _ => None,
        }
    }
}

/// One action of an automation, executed in ascending `order`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationAction {
    pub id: Uuid,
    pub kind: ActionKind,
    pub order: i32,
    pub config: serde_json::Value,
}

// ===== Per-kind configuration blobs =====

#[derive(Debug, Clone, Deserialize)]
pub struct SendMessageConfig {
    pub content: String,
    #[serde(default)]
    pub connection_mode: Option<ConnectionMode>,
    #[serde(default)]
    pub connection_id: Option<Uuid>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendFunnelConfig {
    pub funnel_id: Uuid,
    #[serde(default)]
    pub connection_mode: Option<ConnectionMode>,
    #[serde(default)]
    pub connection_id: Option<Uuid>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AddAgentConfig {
    #[serde(default)]
    pub agent_id: Option<Uuid>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoveAgentConfig {
    /// None clears whichever agent is active; Some clears only that agent.
    #[serde(default)]
    pub agent_id: Option<Uuid>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MoveToColumnConfig {
    #[serde(default)]
    pub column_id: Option<Uuid>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AddTagConfig {
    #[serde(default)]
    pub tag_id: Option<Uuid>,
}

/// Result of executing one action
#[derive(Debug, Clone, Serialize)]
pub struct ActionResult {
    pub action_id: Uuid,
    pub kind: ActionKind,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: i64,
}

impl ActionResult {
    pub fn success(action: &AutomationAction) -> Self {
        Self {
            action_id: action.id,
            kind: action.kind,
            success: true,
            error: None,
            duration_ms: 0,
        }
    }

    pub fn failure(action: &AutomationAction, error: &str) -> Self {
        Self {
            action_id: action.id,
            kind: action.kind,
            success: false,
            error: Some(error.to_string()),
            duration_ms: 0,
        }
    }

    pub fn with_duration(mut self, duration_ms: i64) -> Self {
        self.duration_ms = duration_ms;
        self
    }
}

/// A batch is recorded in the execution ledger only when every action succeeded.
/// An empty batch is vacuously clean so an actionless automation does not
/// re-fire on every scan.
pub fn batch_is_clean(results: &[ActionResult]) -> bool {
    results.iter().all(|r| r.success)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn action(kind: ActionKind, config: serde_json::Value) -> AutomationAction {
        AutomationAction {
            id: Uuid::new_v4(),
            kind,
            order: 0,
            config,
        }
    }

    #[test]
    fn test_action_kind_serde_snake_case() {
        assert_eq!(
            serde_json::to_value(ActionKind::SendFunnel).unwrap(),
            json!("send_funnel")
        );
        let kind: ActionKind = serde_json::from_value(json!("move_to_column")).unwrap();
        assert_eq!(kind, ActionKind::MoveToColumn);
    }

    #[test]
    fn test_send_message_config_defaults() {
        let config: SendMessageConfig =
            serde_json::from_value(json!({ "content": "Olá {{contact.name}}" })).unwrap();
        assert_eq!(config.content, "Olá {{contact.name}}");
        assert!(config.connection_mode.is_none());
        assert!(config.connection_id.is_none());
    }

    #[test]
    fn test_send_message_config_specific_mode() {
        let id = Uuid::new_v4();
        let config: SendMessageConfig = serde_json::from_value(json!({
            "content": "hi",
            "connection_mode": "specific",
            "connection_id": id,
        }))
        .unwrap();
        assert_eq!(config.connection_mode, Some(ConnectionMode::Specific));
        assert_eq!(config.connection_id, Some(id));
    }

    #[test]
    fn test_missing_required_config_is_a_parse_error() {
        assert!(serde_json::from_value::<SendMessageConfig>(json!({})).is_err());
        assert!(serde_json::from_value::<SendFunnelConfig>(json!({})).is_err());
    }

    #[test]
    fn test_optional_targets_parse_as_none() {
        let config: MoveToColumnConfig = serde_json::from_value(json!({})).unwrap();
        assert!(config.column_id.is_none());
        let config: AddTagConfig = serde_json::from_value(json!({})).unwrap();
        assert!(config.tag_id.is_none());
    }

    #[test]
    fn test_batch_is_clean() {
        let a = action(ActionKind::AddTag, json!({}));
        let ok = ActionResult::success(&a);
        let bad = ActionResult::failure(&a, "no tag id configured");

        assert!(batch_is_clean(&[ok.clone(), ok.clone()]));
        assert!(!batch_is_clean(&[ok.clone(), bad, ok]));
        assert!(batch_is_clean(&[]));
    }
}
