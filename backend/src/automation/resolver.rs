// Entity Resolver - related-aggregate lookups for action execution
//
// Actions depend on the card's contact, conversation and connection. A card
// often lacks a direct conversation link, so resolution falls back through an
// ordered list of lookups; a miss is not an error, it just makes the dependent
// action a logged no-op.

use laneflow_shared::{Card, Connection, Contact, Conversation};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

/// Policy for choosing which channel connection a message goes out through
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionMode {
    /// Most recent connection used with this contact
    Last,
    /// First connected connection of the workspace, by creation order
    Default,
    /// A configured connection id; must currently be connected
    Specific,
}

/// Related aggregates resolved for one card
#[derive(Debug, Clone, Default)]
pub struct CardContext {
    pub contact: Option<Contact>,
    pub conversation: Option<Conversation>,
    pub connection: Option<Connection>,
}

#[derive(Debug, Clone)]
pub struct EntityResolver {
    db_pool: PgPool,
}

impl EntityResolver {
    pub fn new(db_pool: PgPool) -> Self {
        Self { db_pool }
    }

    /// Resolve the card's contact, conversation and connection.
    ///
    /// Conversation resolution order: the card's direct link, then the most
    /// recent open conversation of the card's contact (same workspace) that
    /// has a connection. The connection is taken from whichever conversation
    /// was found.
    pub async fn resolve(&self, card: &Card) -> Result<CardContext, sqlx::Error> {
        let contact = match card.contact_id {
            Some(contact_id) => self.fetch_contact(contact_id).await?,
            None => None,
        };

        let mut conversation = match card.conversation_id {
            Some(conversation_id) => self.fetch_conversation(conversation_id).await?,
            None => None,
        };

        if conversation.is_none() {
            if let Some(contact_id) = card.contact_id {
                conversation = self
                    .latest_open_conversation(card.workspace_id, contact_id)
                    .await?;
            }
        }

        let connection = match conversation.as_ref().and_then(|c| c.connection_id) {
            Some(connection_id) => self.fetch_connection(connection_id).await?,
            None => None,
        };

        Ok(CardContext {
            contact,
            conversation,
            connection,
        })
    }

    /// Pick a connection for a message-bearing action according to the
    /// configured mode. Returns None when the mode cannot produce a usable
    /// connection (e.g. a `specific` connection that is not connected).
    pub async fn select_connection(
        &self,
        workspace_id: Uuid,
        contact_id: Option<Uuid>,
        mode: ConnectionMode,
        specific_id: Option<Uuid>,
    ) -> Result<Option<Connection>, sqlx::Error> {
        match mode {
            ConnectionMode::Last => {
                let Some(contact_id) = contact_id else {
                    return Ok(None);
                };
                sqlx::query_as::<_, Connection>(
                    "SELECT cn.* FROM connections cn
                     JOIN conversations cv ON cv.connection_id = cn.id
                     WHERE cv.workspace_id = $1 AND cv.contact_id = $2
                     ORDER BY cv.last_message_at DESC NULLS LAST, cv.created_at DESC
                     LIMIT 1",
                )
                .bind(workspace_id)
                .bind(contact_id)
                .fetch_optional(&self.db_pool)
                .await
            }
            ConnectionMode::Default => {
                sqlx::query_as::<_, Connection>(
                    "SELECT * FROM connections
                     WHERE workspace_id = $1 AND status = 'connected'
                     ORDER BY created_at ASC
                     LIMIT 1",
                )
                .bind(workspace_id)
                .fetch_optional(&self.db_pool)
                .await
            }
            ConnectionMode::Specific => {
                let Some(connection_id) = specific_id else {
                    return Ok(None);
                };
                sqlx::query_as::<_, Connection>(
                    "SELECT * FROM connections WHERE id = $1 AND status = 'connected'",
                )
                .bind(connection_id)
                .fetch_optional(&self.db_pool)
                .await
            }
        }
    }

    pub async fn fetch_conversation(
        &self,
        conversation_id: Uuid,
    ) -> Result<Option<Conversation>, sqlx::Error> {
        sqlx::query_as::<_, Conversation>("SELECT * FROM conversations WHERE id = $1")
            .bind(conversation_id)
            .fetch_optional(&self.db_pool)
            .await
    }

    async fn fetch_contact(&self, contact_id: Uuid) -> Result<Option<Contact>, sqlx::Error> {
        sqlx::query_as::<_, Contact>("SELECT * FROM contacts WHERE id = $1")
            .bind(contact_id)
            .fetch_optional(&self.db_pool)
            .await
    }

    async fn fetch_connection(
        &self,
        connection_id: Uuid,
    ) -> Result<Option<Connection>, sqlx::Error> {
        sqlx::query_as::<_, Connection>("SELECT * FROM connections WHERE id = $1")
            .bind(connection_id)
            .fetch_optional(&self.db_pool)
            .await
    }

    async fn latest_open_conversation(
        &self,
        workspace_id: Uuid,
        contact_id: Uuid,
    ) -> Result<Option<Conversation>, sqlx::Error> {
        sqlx::query_as::<_, Conversation>(
            "SELECT * FROM conversations
             WHERE workspace_id = $1 AND contact_id = $2
             AND status = 'open' AND connection_id IS NOT NULL
             ORDER BY last_message_at DESC NULLS LAST, created_at DESC
             LIMIT 1",
        )
        .bind(workspace_id)
        .bind(contact_id)
        .fetch_optional(&self.db_pool)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_mode_serde() {
        assert_eq!(
            serde_json::to_value(ConnectionMode::Last).unwrap(),
            serde_json::json!("last")
        );
        let mode: ConnectionMode = serde_json::from_value(serde_json::json!("default")).unwrap();
        assert_eq!(mode, ConnectionMode::Default);
        assert!(serde_json::from_value::<ConnectionMode>(serde_json::json!("random")).is_err());
    }
}
