//! C7's Agent Event Bus Gateway (spec.md §4.7): hydrates a browser
//! subscription from the persisted `Agent` row plus recent stream
//! history, forwards live pub/sub events to the socket, closes gaps with
//! a periodic re-sync, and writes the authoritative snapshot back to the
//! state store on an interval. Grounded on the teacher's `ws/update.rs`
//! relay (resubscribe a shared receiver, `tokio::select!` against a
//! cancellation token, forward to the socket) adapted from a single
//! process-wide update channel to one broadcast room per agent.
//!
//! Wire convention (not specified by spec.md, chosen here since C6 - the
//! publisher writing to these keys - doesn't exist yet): every `XADD` and
//! `PUBLISH` carries exactly one field/payload named `data`, holding a
//! JSON-serialized `AgentEvent`.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use dashmap::DashMap;
use database::StateStore;
use futures_util::{SinkExt, StreamExt};
use kalpana_client::entities::agent::{
  Agent, AgentEvent, AgentEventKind, AgentStatus, ChatMessage, ChatRole, FileEdit, ToolCall,
  ToolCallState, channel_key, stream_key,
};
use kalpana_client::entities::kalpana_timestamp;
use redis::AsyncCommands;
use serde::Serialize;
use tokio::sync::{Mutex, broadcast};

const ROOM_CAPACITY: usize = 256;
const HYDRATE_REPLAY_COUNT: usize = 500;
const SYNC_INTERVAL: Duration = Duration::from_secs(1);
const WRITEBACK_INTERVAL: Duration = Duration::from_secs(5);

/// The authoritative in-memory projection for one agent, advanced only by
/// the reducer. `last_stream_id` is what makes periodic sync idempotent:
/// it only ever moves forward, so a gap-closing `XRANGE` never re-applies
/// an already-seen `text-delta`.
struct Snapshot {
  status: AgentStatus,
  conversation_history: Vec<ChatMessage>,
  tool_calls: Vec<ToolCall>,
  files_edited: Vec<FileEdit>,
  last_stream_id: String,
  last_message_at: i64,
  /// Set by the reducer whenever it changes something that should be
  /// persisted; cleared by writeback once flushed (spec.md §4.7 step 4).
  dirty: bool,
}

impl Snapshot {
  fn from_agent(agent: &Agent) -> Self {
    Snapshot {
      status: agent.status,
      conversation_history: agent.conversation_history.clone(),
      tool_calls: agent.tool_calls.clone(),
      files_edited: agent.files_edited.clone(),
      last_stream_id: "0".to_string(),
      last_message_at: agent.last_message_at.unwrap_or(0),
      dirty: false,
    }
  }
}

#[derive(Serialize)]
struct AgentStateMessage<'a> {
  #[serde(rename = "type")]
  kind: &'static str,
  agent_id: &'a str,
  status: AgentStatus,
  conversation_history: &'a [ChatMessage],
  tool_calls: &'a [ToolCall],
  files_edited: &'a [FileEdit],
  last_message_at: i64,
}

/// What gets broadcast to a room: either a live event forwarded unchanged
/// from pub/sub, or a full pre-serialized `agent-state` snapshot emitted
/// by the periodic sync (spec.md §4.7 step 3).
#[derive(Clone)]
enum RoomMessage {
  Event(AgentEvent),
  Snapshot(Arc<str>),
}

pub struct GatewayState {
  db: Arc<database::Client>,
  conn: redis::aio::MultiplexedConnection,
  redis_client: Arc<redis::Client>,
  snapshots: DashMap<String, Mutex<Snapshot>>,
  rooms: DashMap<String, broadcast::Sender<RoomMessage>>,
}

pub struct Gateway {
  state: Arc<GatewayState>,
}

impl Gateway {
  pub async fn new(
    db: Arc<database::Client>,
    redis_client: Arc<redis::Client>,
  ) -> anyhow::Result<Self> {
    let conn = redis_client.get_multiplexed_async_connection().await?;
    Ok(Gateway {
      state: Arc::new(GatewayState {
        db,
        conn,
        redis_client,
        snapshots: DashMap::new(),
        rooms: DashMap::new(),
      }),
    })
  }

  pub fn router(&self) -> Router {
    Router::new()
      .route("/ws/agents/{id}", get(ws_handler))
      .with_state(self.state.clone())
  }

  /// Starts the three process-wide background loops (spec.md §4.7 steps
  /// 2-4). Called once from `main`, independent of how many sockets ever
  /// connect.
  pub fn spawn_background_tasks(&self) {
    spawn_pubsub_forwarder(self.state.clone());
    spawn_periodic_sync(self.state.clone());
    spawn_writeback(self.state.clone());
  }
}

async fn ws_handler(
  State(state): State<Arc<GatewayState>>,
  Path(agent_id): Path<String>,
  ws: WebSocketUpgrade,
) -> impl IntoResponse {
  ws.on_upgrade(move |socket| handle_socket(state, agent_id, socket))
}

async fn handle_socket(state: Arc<GatewayState>, agent_id: String, mut socket: WebSocket) {
  let Some(agent) = hydrate(&state, &agent_id).await else {
    let _ = socket
      .send(Message::text(
        serde_json::json!({ "type": "error", "message": "agent not found" }).to_string(),
      ))
      .await;
    let _ = socket.close().await;
    return;
  };

  let snapshot_json = {
    let entry = state.snapshots.get(&agent_id).expect("just hydrated");
    let snapshot = entry.lock().await;
    serde_json::to_string(&AgentStateMessage {
      kind: "agent-state",
      agent_id: &agent_id,
      status: snapshot.status,
      conversation_history: &strip_streaming(&snapshot.conversation_history),
      tool_calls: &snapshot.tool_calls,
      files_edited: &snapshot.files_edited,
      last_message_at: snapshot.last_message_at,
    })
    .unwrap_or_default()
  };
  drop(agent);

  if socket.send(Message::text(snapshot_json)).await.is_err() {
    return;
  }

  let mut receiver = state
    .rooms
    .entry(agent_id.clone())
    .or_insert_with(|| broadcast::channel(ROOM_CAPACITY).0)
    .subscribe();

  let (mut sender_half, mut receiver_half) = socket.split();

  let forward = async {
    loop {
      match receiver.recv().await {
        Ok(RoomMessage::Event(event)) => {
          let Ok(json) = serde_json::to_string(&event) else { continue };
          if sender_half.send(Message::text(json)).await.is_err() {
            break;
          }
        }
        Ok(RoomMessage::Snapshot(json)) => {
          if sender_half.send(Message::text(json.to_string())).await.is_err() {
            break;
          }
        }
        Err(broadcast::error::RecvError::Lagged(_)) => continue,
        Err(broadcast::error::RecvError::Closed) => break,
      }
    }
  };

  let inbound = async {
    while let Some(msg) = receiver_half.next().await {
      match msg {
        Ok(Message::Close(_)) | Err(_) => break,
        _ => {}
      }
    }
  };

  tokio::select! {
    _ = forward => {}
    _ = inbound => {}
  }
}

/// Loads the persisted row and replays up to 500 recent stream entries
/// through the reducer, inserting (or refreshing) the in-memory snapshot.
/// Returns `None` if the agent doesn't exist.
async fn hydrate(state: &Arc<GatewayState>, agent_id: &str) -> Option<()> {
  if state.snapshots.contains_key(agent_id) {
    return Some(());
  }

  let agent = state.db.agents.find_by_id(agent_id).await.ok()??;
  let mut snapshot = Snapshot::from_agent(&agent);

  let mut conn = state.conn.clone();
  let replay: redis::RedisResult<redis::streams::StreamRangeReply> = conn
    .xrevrange_count(stream_key(agent_id), "+", "-", HYDRATE_REPLAY_COUNT)
    .await;
  if let Ok(reply) = replay {
    for stream_id in reply.ids.into_iter().rev() {
      if let Some(event) = decode_stream_event(agent_id, &stream_id) {
        apply_event(&mut snapshot, &event);
        snapshot.last_stream_id = stream_id.id.clone();
      }
    }
  }
  snapshot.dirty = false;

  state.snapshots.insert(agent_id.to_string(), Mutex::new(snapshot));
  Some(())
}

fn decode_stream_event(agent_id: &str, entry: &redis::streams::StreamId) -> Option<AgentEvent> {
  let raw = entry.map.get("data")?;
  let text: String = redis::FromRedisValue::from_redis_value(raw).ok()?;
  match serde_json::from_str::<AgentEvent>(&text) {
    Ok(event) => Some(event),
    Err(e) => {
      tracing::warn!("agent {agent_id}: malformed stream entry {}: {e}", entry.id);
      None
    }
  }
}

fn strip_streaming(messages: &[ChatMessage]) -> Vec<ChatMessage> {
  messages
    .iter()
    .map(|m| ChatMessage { role: m.role, content: m.content.clone(), streaming: false })
    .collect()
}

/// Step 2: subscribes once, process-wide, to every agent's event
/// channel via the `agent:*:events` pattern, applies each event to its
/// snapshot, and rebroadcasts unchanged to the room.
fn spawn_pubsub_forwarder(state: Arc<GatewayState>) {
  tokio::spawn(async move {
    loop {
      match state.redis_client.get_async_pubsub().await {
        Ok(mut pubsub) => {
          if let Err(e) = pubsub.psubscribe("agent:*:events").await {
            tracing::warn!("gateway: psubscribe failed, retrying: {e}");
            tokio::time::sleep(Duration::from_secs(1)).await;
            continue;
          }
          let mut stream = pubsub.on_message();
          while let Some(msg) = stream.next().await {
            let Ok(channel) = msg.get_channel_name().parse::<String>() else { continue };
            let Some(agent_id) = agent_id_from_channel(&channel) else { continue };
            let Ok(payload) = msg.get_payload::<String>() else { continue };
            let Ok(event) = serde_json::from_str::<AgentEvent>(&payload) else { continue };

            if let Some(entry) = state.snapshots.get(&agent_id) {
              let mut snapshot = entry.lock().await;
              apply_event(&mut snapshot, &event);
            }
            if let Some(room) = state.rooms.get(&agent_id) {
              let _ = room.send(RoomMessage::Event(event));
            }
          }
        }
        Err(e) => {
          tracing::warn!("gateway: failed to open pub/sub connection, retrying: {e}");
        }
      }
      tokio::time::sleep(Duration::from_secs(1)).await;
    }
  });
}

fn agent_id_from_channel(channel: &str) -> Option<String> {
  channel.strip_prefix("agent:")?.strip_suffix(":events").map(str::to_string)
}

/// Step 3: every second, for each agent with at least one live
/// subscriber, pulls anything the pub/sub path might have missed and
/// re-emits a full snapshot.
fn spawn_periodic_sync(state: Arc<GatewayState>) {
  tokio::spawn(async move {
    loop {
      tokio::time::sleep(SYNC_INTERVAL).await;

      let agent_ids: Vec<String> = state
        .rooms
        .iter()
        .filter(|r| r.value().receiver_count() > 0)
        .map(|r| r.key().clone())
        .collect();

      for agent_id in agent_ids {
        let Some(entry) = state.snapshots.get(&agent_id) else { continue };
        let mut snapshot = entry.lock().await;

        let mut conn = state.conn.clone();
        let start = format!("({}", snapshot.last_stream_id);
        let gap: redis::RedisResult<redis::streams::StreamRangeReply> =
          conn.xrange(stream_key(&agent_id), start, "+").await;

        let Ok(reply) = gap else { continue };
        if reply.ids.is_empty() {
          continue;
        }
        for stream_id in &reply.ids {
          if let Some(event) = decode_stream_event(&agent_id, stream_id) {
            apply_event(&mut snapshot, &event);
          }
          snapshot.last_stream_id = stream_id.id.clone();
        }

        if let Some(room) = state.rooms.get(&agent_id) {
          let message = AgentStateMessage {
            kind: "agent-state",
            agent_id: &agent_id,
            status: snapshot.status,
            conversation_history: &strip_streaming(&snapshot.conversation_history),
            tool_calls: &snapshot.tool_calls,
            files_edited: &snapshot.files_edited,
            last_message_at: snapshot.last_message_at,
          };
          if let Ok(json) = serde_json::to_string(&message) {
            let _ = room.send(RoomMessage::Snapshot(Arc::from(json)));
          }
        }
      }
    }
  });
}

/// Step 4: every five seconds, flushes dirty snapshots' status and
/// `lastMessageAt` back to the `Agent` row; on a record-missing error
/// (the agent was deleted), drops the in-memory state entirely.
fn spawn_writeback(state: Arc<GatewayState>) {
  tokio::spawn(async move {
    loop {
      tokio::time::sleep(WRITEBACK_INTERVAL).await;

      let agent_ids: Vec<String> =
        state.snapshots.iter().map(|e| e.key().clone()).collect();

      for agent_id in agent_ids {
        let has_subscribers =
          state.rooms.get(&agent_id).map(|r| r.receiver_count() > 0).unwrap_or(false);

        let (dirty, patch) = {
          let Some(entry) = state.snapshots.get(&agent_id) else { continue };
          let mut snapshot = entry.lock().await;
          if !snapshot.dirty {
            (false, None)
          } else {
            snapshot.dirty = false;
            let conversation_history = strip_streaming(&snapshot.conversation_history);
            let patch = bson::doc! {
              "status": bson::to_bson(&snapshot.status).unwrap_or_default(),
              "conversation_history": bson::to_bson(&conversation_history).unwrap_or_default(),
              "tool_calls": bson::to_bson(&snapshot.tool_calls).unwrap_or_default(),
              "files_edited": bson::to_bson(&snapshot.files_edited).unwrap_or_default(),
              "last_message_at": snapshot.last_message_at,
              "updated_at": kalpana_timestamp(),
            };
            (true, Some(patch))
          }
        };

        if dirty {
          if let Some(patch) = patch {
            match state.db.agents.update(&agent_id, patch).await {
              Ok(()) => {}
              Err(e) => {
                tracing::debug!(
                  "gateway writeback: agent {agent_id} missing or update failed, dropping state: {e}"
                );
                state.snapshots.remove(&agent_id);
                state.rooms.remove(&agent_id);
                continue;
              }
            }
          }
        }

        if !has_subscribers && !dirty {
          // No live viewers and nothing pending: safe to evict so the map
          // doesn't grow unbounded across every agent that ever ran.
          state.snapshots.remove(&agent_id);
          state.rooms.remove(&agent_id);
        }
      }
    }
  });
}

/// The snapshot reducer (spec.md §4.7 "Snapshot reducer"): mutates
/// `snapshot` in place for one event, in stream order.
fn apply_event(snapshot: &mut Snapshot, event: &AgentEvent) {
  match &event.kind {
    AgentEventKind::TextDelta { text_delta } => {
      let appended = snapshot
        .conversation_history
        .last_mut()
        .filter(|m| m.streaming && matches!(m.role, ChatRole::Assistant))
        .map(|m| m.content.push_str(text_delta))
        .is_some();
      if !appended {
        snapshot.conversation_history.push(ChatMessage {
          role: ChatRole::Assistant,
          content: text_delta.clone(),
          streaming: true,
        });
      }
    }
    AgentEventKind::ToolCall { tool_call_id, tool_name, args } => {
      if !snapshot.tool_calls.iter().any(|t| &t.id == tool_call_id) {
        snapshot.tool_calls.push(ToolCall {
          id: tool_call_id.clone(),
          name: tool_name.clone(),
          args: args.clone(),
          state: ToolCallState::Executing,
          result: None,
        });
      }
      clear_trailing_streaming(snapshot);
    }
    AgentEventKind::ToolResult { tool_call_id, result, .. } => {
      if let Some(call) = snapshot.tool_calls.iter_mut().find(|t| &t.id == tool_call_id) {
        call.state = ToolCallState::Complete;
        call.result = Some(result.clone());
      }
    }
    AgentEventKind::FileEdit { file_edit } => {
      snapshot.files_edited.push(file_edit.clone());
    }
    AgentEventKind::Status { status } => {
      snapshot.status = *status;
      if !matches!(status, AgentStatus::Running) {
        clear_trailing_streaming(snapshot);
      }
    }
    AgentEventKind::Finish {} => {
      snapshot.status = AgentStatus::Completed;
      clear_trailing_streaming(snapshot);
    }
    AgentEventKind::Error { .. } => {
      snapshot.status = AgentStatus::Failed;
      clear_trailing_streaming(snapshot);
    }
  }
  snapshot.last_message_at = event.timestamp;
  snapshot.dirty = true;
}

fn clear_trailing_streaming(snapshot: &mut Snapshot) {
  if let Some(last) = snapshot.conversation_history.last_mut() {
    last.streaming = false;
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn base_snapshot() -> Snapshot {
    Snapshot {
      status: AgentStatus::Running,
      conversation_history: vec![],
      tool_calls: vec![],
      files_edited: vec![],
      last_stream_id: "0".to_string(),
      last_message_at: 0,
      dirty: false,
    }
  }

  fn event(kind: AgentEventKind) -> AgentEvent {
    AgentEvent { agent_id: "a1".to_string(), timestamp: 42, kind }
  }

  #[test]
  fn text_delta_appends_to_open_assistant_message() {
    let mut snapshot = base_snapshot();
    apply_event(&mut snapshot, &event(AgentEventKind::TextDelta { text_delta: "Hel".into() }));
    apply_event(&mut snapshot, &event(AgentEventKind::TextDelta { text_delta: "lo".into() }));
    assert_eq!(snapshot.conversation_history.len(), 1);
    assert_eq!(snapshot.conversation_history[0].content, "Hello");
    assert!(snapshot.conversation_history[0].streaming);
  }

  #[test]
  fn tool_call_is_idempotent_and_clears_streaming() {
    let mut snapshot = base_snapshot();
    apply_event(&mut snapshot, &event(AgentEventKind::TextDelta { text_delta: "thinking".into() }));
    let call = AgentEventKind::ToolCall {
      tool_call_id: "c1".into(),
      tool_name: "read_file".into(),
      args: serde_json::json!({"path": "a.rs"}),
    };
    apply_event(&mut snapshot, &event(call.clone()));
    apply_event(&mut snapshot, &event(call));
    assert_eq!(snapshot.tool_calls.len(), 1);
    assert!(!snapshot.conversation_history[0].streaming);
  }

  #[test]
  fn tool_result_marks_matching_call_complete() {
    let mut snapshot = base_snapshot();
    apply_event(
      &mut snapshot,
      &event(AgentEventKind::ToolCall {
        tool_call_id: "c1".into(),
        tool_name: "read_file".into(),
        args: serde_json::Value::Null,
      }),
    );
    apply_event(
      &mut snapshot,
      &event(AgentEventKind::ToolResult {
        tool_call_id: "c1".into(),
        tool_name: "read_file".into(),
        result: serde_json::json!({"ok": true}),
      }),
    );
    assert_eq!(snapshot.tool_calls[0].state, ToolCallState::Complete);
    assert!(snapshot.tool_calls[0].result.is_some());
  }

  #[test]
  fn finish_completes_and_clears_streaming() {
    let mut snapshot = base_snapshot();
    apply_event(&mut snapshot, &event(AgentEventKind::TextDelta { text_delta: "done".into() }));
    apply_event(&mut snapshot, &event(AgentEventKind::Finish {}));
    assert_eq!(snapshot.status, AgentStatus::Completed);
    assert!(!snapshot.conversation_history[0].streaming);
  }

  #[test]
  fn error_marks_failed_and_clears_streaming() {
    let mut snapshot = base_snapshot();
    apply_event(&mut snapshot, &event(AgentEventKind::TextDelta { text_delta: "oops".into() }));
    apply_event(&mut snapshot, &event(AgentEventKind::Error { message: "boom".into() }));
    assert_eq!(snapshot.status, AgentStatus::Failed);
    assert!(!snapshot.conversation_history[0].streaming);
  }

  #[test]
  fn channel_name_parses_agent_id() {
    assert_eq!(agent_id_from_channel("agent:a1:events"), Some("a1".to_string()));
    assert_eq!(agent_id_from_channel("other:a1:events"), None);
  }
}
