//! Realtime channel client.
//!
//! The platform speaks Phoenix channel frames (`{topic, event, payload, ref}`)
//! over a WebSocket. One connection carries one channel: we join
//! `realtime:{topic}` with the subscription's `postgres_changes` bindings,
//! heartbeat on the `phoenix` topic, and forward row changes to the sink.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt as _, StreamExt as _};
use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;

use crate::backend::{
    ChangeEvent, ChangeKind, ChannelMessage, ChannelSink, SubscriptionSpec, Table,
};

pub const HEARTBEAT_SECS: u64 = 25;
const INITIAL_BACKOFF_SECS: u64 = 2;
const MAX_BACKOFF_SECS: u64 = 60;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
}

impl Frame {
    pub fn join(topic: &str, payload: serde_json::Value, reference: u64) -> Self {
        Self {
            topic: channel_topic(topic),
            event: "phx_join".into(),
            payload,
            reference: Some(reference.to_string()),
        }
    }

    pub fn heartbeat(reference: u64) -> Self {
        Self {
            topic: "phoenix".into(),
            event: "heartbeat".into(),
            payload: serde_json::json!({}),
            reference: Some(reference.to_string()),
        }
    }

    pub fn encode(&self) -> String {
        // A struct of strings and a Value cannot fail to serialize.
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn decode(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }
}

pub fn channel_topic(topic: &str) -> String {
    format!("realtime:{topic}")
}

/// `phx_join` payload for a subscription.
pub fn join_payload(spec: &SubscriptionSpec, access_token: &str) -> serde_json::Value {
    let changes: Vec<serde_json::Value> = spec
        .bindings
        .iter()
        .map(|b| {
            let mut clause = serde_json::json!({
                "event": b.kind.as_str(),
                "schema": "public",
                "table": b.table.as_str(),
            });
            if let Some(filter) = &b.filter {
                clause["filter"] = serde_json::Value::String(filter.clone());
            }
            clause
        })
        .collect();
    serde_json::json!({
        "config": {
            "broadcast": { "self": false },
            "presence": { "key": "" },
            "postgres_changes": changes,
        },
        "access_token": access_token,
    })
}

/// What one inbound frame means for the channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    JoinOk,
    JoinRejected(String),
    Change(ChangeEvent),
    Closed(String),
    Other,
}

pub fn interpret(frame: &Frame, channel: &str, join_ref: &str) -> Inbound {
    match frame.event.as_str() {
        "phx_reply" if frame.topic == channel && frame.reference.as_deref() == Some(join_ref) => {
            if frame.payload.get("status").and_then(|s| s.as_str()) == Some("ok") {
                Inbound::JoinOk
            } else {
                let reason = frame
                    .payload
                    .pointer("/response/reason")
                    .and_then(|r| r.as_str())
                    .unwrap_or("join rejected");
                Inbound::JoinRejected(reason.to_string())
            }
        }
        "postgres_changes" if frame.topic == channel => {
            let data = &frame.payload["data"];
            let kind = data["type"].as_str().and_then(ChangeKind::from_name);
            let table = data["table"].as_str().and_then(Table::from_name);
            match (kind, table) {
                (Some(kind), Some(table)) => Inbound::Change(ChangeEvent {
                    table,
                    kind,
                    record: data["record"].clone(),
                }),
                _ => Inbound::Other,
            }
        }
        "phx_error" | "phx_close" if frame.topic == channel => {
            Inbound::Closed(frame.event.clone())
        }
        _ => Inbound::Other,
    }
}

/// Keep one channel alive until the sink's receiver goes away (or the task
/// is aborted by releasing its subscription). Reconnects with exponential
/// backoff and reports every drop to the sink.
///
/// `access_token` is a blocking call asked again before every join, so a
/// reconnect after the token rotated joins with the new one.
pub async fn channel_loop<F>(
    ws_url: String,
    spec: SubscriptionSpec,
    access_token: F,
    sink: ChannelSink,
) where
    F: Fn() -> String + Send + Sync + 'static,
{
    let access_token = Arc::new(access_token);
    let topic = spec.topic.clone();
    let mut backoff_secs = INITIAL_BACKOFF_SECS;

    loop {
        if sink.is_closed() {
            return;
        }
        let token = {
            let access_token = Arc::clone(&access_token);
            tokio::task::spawn_blocking(move || access_token())
                .await
                .unwrap_or_default()
        };
        let join = join_payload(&spec, &token);
        let reason = match run_connection(&ws_url, &topic, &join, &sink).await {
            Ok(joined) => {
                if joined {
                    backoff_secs = INITIAL_BACKOFF_SECS;
                }
                "connection closed".to_string()
            }
            Err(e) => e,
        };
        if sink.is_closed() {
            return;
        }

        crate::hlog!(
            "realtime: channel {} dropped (retry in {}s): {}",
            topic,
            backoff_secs,
            reason
        );
        let dropped = ChannelMessage::Dropped {
            topic: topic.clone(),
            reason,
        };
        if sink.send(dropped).is_err() {
            return;
        }

        tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
        backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
    }
}

/// One connection's lifetime. `Ok(joined)` on a clean close.
async fn run_connection(
    ws_url: &str,
    topic: &str,
    join: &serde_json::Value,
    sink: &ChannelSink,
) -> Result<bool, String> {
    let (ws_stream, _response) = tokio_tungstenite::connect_async(ws_url)
        .await
        .map_err(|e| format!("connect failed: {e}"))?;
    let (mut write, mut read) = ws_stream.split();

    let channel = channel_topic(topic);
    let mut next_ref = 1u64;
    let join_ref = next_ref.to_string();
    write
        .send(WsMessage::Text(Frame::join(topic, join.clone(), next_ref).encode()))
        .await
        .map_err(|e| format!("join send failed: {e}"))?;
    next_ref += 1;

    let mut joined = false;
    let mut heartbeat = tokio::time::interval(Duration::from_secs(HEARTBEAT_SECS));
    heartbeat.tick().await;

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                write
                    .send(WsMessage::Text(Frame::heartbeat(next_ref).encode()))
                    .await
                    .map_err(|e| format!("heartbeat failed: {e}"))?;
                next_ref += 1;
            }
            _ = sink.closed() => {
                let _ = write.send(WsMessage::Close(None)).await;
                return Ok(joined);
            }
            msg = read.next() => match msg {
                Some(Ok(WsMessage::Text(text))) => {
                    let Some(frame) = Frame::decode(&text) else {
                        continue;
                    };
                    let forward = match interpret(&frame, &channel, &join_ref) {
                        Inbound::JoinOk => {
                            joined = true;
                            crate::hlog!("realtime: joined {}", topic);
                            ChannelMessage::Joined { topic: topic.to_string() }
                        }
                        Inbound::JoinRejected(reason) => {
                            return Err(format!("join rejected: {reason}"));
                        }
                        Inbound::Change(event) => ChannelMessage::Change(event),
                        Inbound::Closed(reason) => return Err(reason),
                        Inbound::Other => continue,
                    };
                    if sink.send(forward).is_err() {
                        return Ok(joined);
                    }
                }
                Some(Ok(WsMessage::Ping(data))) => {
                    let _ = write.send(WsMessage::Pong(data)).await;
                }
                Some(Ok(WsMessage::Close(_))) | None => return Ok(joined),
                Some(Err(e)) => return Err(format!("socket error: {e}")),
                Some(Ok(_)) => {}
            }
        }
    }
}
