//! Realtime insert feed over the database's Phoenix-channel WebSocket.
//!
//! One socket per subscription: join `realtime:public:<table>` with a
//! `postgres_changes` INSERT filter on `session_id`, forward inserted rows, and
//! send a heartbeat every 30s. When the socket closes the subscription ends and the
//! caller decides whether to reopen it.

use super::{StoreError, Subscription};
use crate::model::Message;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const JOIN_TIMEOUT: Duration = Duration::from_secs(10);
const FEED_CAPACITY: usize = 64;

/// A Phoenix channel frame.
#[derive(Debug, Deserialize)]
struct Frame {
    #[serde(default)]
    topic: String,
    event: String,
    #[serde(default)]
    payload: Value,
    #[serde(rename = "ref", default)]
    reference: Option<String>,
}

#[derive(Clone)]
pub struct RealtimeClient {
    socket_url: String,
    table: String,
}

impl RealtimeClient {
    /// `base_url` is the http(s) project URL; the socket URL is derived from it.
    pub fn new(base_url: &str, api_key: &str, table: &str) -> Self {
        let base = base_url.trim_end_matches('/');
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            base.to_string()
        };
        Self {
            socket_url: format!("{}/realtime/v1/websocket?apikey={}&vsn=1.0.0", ws_base, api_key),
            table: table.to_string(),
        }
    }

    fn topic(&self) -> String {
        format!("realtime:public:{}", self.table)
    }

    fn join_frame(&self, session_id: &str) -> String {
        json!({
            "topic": self.topic(),
            "event": "phx_join",
            "payload": {
                "config": {
                    "postgres_changes": [{
                        "event": "INSERT",
                        "schema": "public",
                        "table": self.table,
                        "filter": format!("session_id=eq.{}", session_id),
                    }]
                }
            },
            "ref": "1",
        })
        .to_string()
    }

    /// Connect, join the conversation's insert feed and wait for the join reply.
    pub async fn subscribe(&self, session_id: &str) -> Result<Subscription, StoreError> {
        let (mut ws, _) = tokio_tungstenite::connect_async(self.socket_url.as_str())
            .await
            .map_err(|e| StoreError::Subscribe(e.to_string()))?;
        ws.send(WsMessage::Text(self.join_frame(session_id)))
            .await
            .map_err(|e| StoreError::Subscribe(e.to_string()))?;

        let joined = tokio::time::timeout(JOIN_TIMEOUT, async {
            while let Some(msg) = ws.next().await {
                let msg = msg.map_err(|e| e.to_string())?;
                let WsMessage::Text(text) = msg else { continue };
                let Ok(frame) = serde_json::from_str::<Frame>(&text) else {
                    continue;
                };
                if frame.event == "phx_reply" && frame.reference.as_deref() == Some("1") {
                    let status = frame.payload.get("status").and_then(|s| s.as_str());
                    return if status == Some("ok") {
                        Ok(())
                    } else {
                        Err(format!("join rejected: {}", frame.payload))
                    };
                }
            }
            Err("socket closed before join reply".to_string())
        })
        .await
        .map_err(|_| StoreError::Subscribe("timed out waiting for join reply".to_string()))?;
        joined.map_err(StoreError::Subscribe)?;
        log::debug!("realtime: joined {} for session {}", self.topic(), session_id);

        let (tx, rx) = mpsc::channel(FEED_CAPACITY);
        let session_id = session_id.to_string();
        let task = tokio::spawn(async move {
            let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
            heartbeat.tick().await;
            let mut next_ref: u64 = 2;
            loop {
                tokio::select! {
                    _ = heartbeat.tick() => {
                        let frame = json!({
                            "topic": "phoenix",
                            "event": "heartbeat",
                            "payload": {},
                            "ref": next_ref.to_string(),
                        });
                        next_ref += 1;
                        if ws.send(WsMessage::Text(frame.to_string())).await.is_err() {
                            log::debug!("realtime: heartbeat failed, closing feed");
                            return;
                        }
                    }
                    msg = ws.next() => {
                        let text = match msg {
                            Some(Ok(WsMessage::Text(text))) => text,
                            Some(Ok(WsMessage::Close(_))) | None => {
                                log::debug!("realtime: socket closed");
                                return;
                            }
                            Some(Ok(_)) => continue,
                            Some(Err(e)) => {
                                log::debug!("realtime: socket error: {}", e);
                                return;
                            }
                        };
                        let Ok(frame) = serde_json::from_str::<Frame>(&text) else {
                            continue;
                        };
                        if frame.event == "phx_error" || frame.event == "phx_close" {
                            log::debug!("realtime: channel {} ended ({})", frame.topic, frame.event);
                            return;
                        }
                        if let Some(row) = parse_insert(&frame.event, &frame.payload) {
                            if row.session_id != session_id {
                                continue;
                            }
                            if tx.send(row).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        });
        Ok(Subscription::new(rx, task))
    }
}

/// Extract the inserted row from a change frame. Handles both `postgres_changes`
/// (`payload.data.record`) and the older `INSERT` event (`payload.record`).
pub fn parse_insert(event: &str, payload: &Value) -> Option<Message> {
    let record = match event {
        "postgres_changes" => {
            let data = payload.get("data")?;
            if data.get("type").and_then(|t| t.as_str()) != Some("INSERT") {
                return None;
            }
            data.get("record")?
        }
        "INSERT" => payload.get("record")?,
        _ => return None,
    };
    match serde_json::from_value(record.clone()) {
        Ok(row) => Some(row),
        Err(e) => {
            log::debug!("realtime: ignoring malformed record: {}", e);
            None
        }
    }
}
