use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use futures::{sink::SinkExt, stream::StreamExt};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::AppState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsMessage {
    pub event_type: String,
    pub payload: serde_json::Value,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl WsMessage {
    pub fn new(event_type: &str, payload: serde_json::Value) -> Self {
        Self {
            event_type: event_type.to_string(),
            payload,
            timestamp: chrono::Utc::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WsConnection {
    pub id: Uuid,
    /// Pipeline channel the client subscribed to; None receives all events.
    pub pipeline_id: Option<Uuid>,
    pub sender: broadcast::Sender<WsMessage>,
}

#[derive(Clone)]
pub struct WsManager {
    connections: Arc<RwLock<HashMap<Uuid, WsConnection>>>,
}

impl WsManager {
    pub fn new() -> Self {
        Self {
            connections: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn add_connection(&self, conn: WsConnection) {
        let mut connections = self.connections.write().await;
        connections.insert(conn.id, conn);
    }

    pub async fn remove_connection(&self, id: &Uuid) {
        let mut connections = self.connections.write().await;
        connections.remove(id);
    }

    /// Publish an event on a pipeline's channel. Fire-and-forget: clients with
    /// no live receiver are skipped and send errors are logged, never returned.
    pub async fn publish_to_pipeline(&self, pipeline_id: Uuid, message: WsMessage) {
        let connections = self.connections.read().await;
        for conn in connections.values() {
            if conn.pipeline_id.is_none() || conn.pipeline_id == Some(pipeline_id) {
                if let Err(e) = conn.sender.send(message.clone()) {
                    tracing::debug!("Websocket publish to connection {} dropped: {}", conn.id, e);
                }
            }
        }
    }

    pub async fn broadcast_all(&self, message: WsMessage) {
        let connections = self.connections.read().await;
        for conn in connections.values() {
            if let Err(e) = conn.sender.send(message.clone()) {
                tracing::debug!("Websocket broadcast to connection {} dropped: {}", conn.id, e);
            }
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }
}

impl Default for WsManager {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Deserialize)]
pub struct WsQuery {
    pub pipeline_id: Option<Uuid>,
}

pub async fn websocket_handler(
    Query(query): Query<WsQuery>,
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, query.pipeline_id))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, pipeline_id: Option<Uuid>) {
    let (mut sender, mut receiver) = socket.split();
    let connection_id = Uuid::new_v4();

    let (tx, mut rx) = broadcast::channel(100);

    let connection = WsConnection {
        id: connection_id,
        pipeline_id,
        sender: tx.clone(),
    };

    state.ws_manager.add_connection(connection).await;

    let _ = sender
        .send(Message::Text(
            serde_json::json!({
                "event_type": "connected",
                "payload": {
                    "connection_id": connection_id,
                    "pipeline_id": pipeline_id,
                }
            })
            .to_string(),
        ))
        .await;

    let mut send_task = tokio::spawn(async move {
        while let Ok(msg) = rx.recv().await {
            let Ok(text) = serde_json::to_string(&msg) else {
                continue;
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => {
                    if let Ok(client_msg) = serde_json::from_str::<WsMessage>(&text) {
                        if client_msg.event_type == "ping" {
                            let _ = tx.send(WsMessage::new("pong", serde_json::json!({})));
                        }
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = (&mut send_task) => recv_task.abort(),
        _ = (&mut recv_task) => send_task.abort(),
    };

    state.ws_manager.remove_connection(&connection_id).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_skips_other_pipelines() {
        let manager = WsManager::new();
        let pipeline_a = Uuid::new_v4();
        let pipeline_b = Uuid::new_v4();

        let (tx_a, mut rx_a) = broadcast::channel(8);
        let (tx_b, mut rx_b) = broadcast::channel(8);

        manager
            .add_connection(WsConnection {
                id: Uuid::new_v4(),
                pipeline_id: Some(pipeline_a),
                sender: tx_a,
            })
            .await;
        manager
            .add_connection(WsConnection {
                id: Uuid::new_v4(),
                pipeline_id: Some(pipeline_b),
                sender: tx_b,
            })
            .await;

        manager
            .publish_to_pipeline(pipeline_a, WsMessage::new("card.moved", serde_json::json!({})))
            .await;

        let received = rx_a.recv().await.unwrap();
        assert_eq!(received.event_type, "card.moved");
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_publish_without_receiver_is_non_fatal() {
        let manager = WsManager::new();
        let pipeline_id = Uuid::new_v4();

        let (tx, rx) = broadcast::channel(8);
        drop(rx);

        manager
            .add_connection(WsConnection {
                id: Uuid::new_v4(),
                pipeline_id: Some(pipeline_id),
                sender: tx,
            })
            .await;

        // Must not panic or error even though the receiver is gone.
        manager
            .publish_to_pipeline(pipeline_id, WsMessage::new("card.moved", serde_json::json!({})))
            .await;
    }
}
