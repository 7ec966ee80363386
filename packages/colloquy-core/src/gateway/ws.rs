//! WebSocket handler for bot audio ingestion.
//!
//! Connection lifecycle: AwaitingConfig (one JSON frame, 10 s budget) →
//! Ready (SERVER_READY + session_start on the outbound stream) → Running
//! (binary PCM + control frames) → Draining (session_end, DISCONNECT).
//! A single bad frame never ends a session; protocol errors before the
//! session exists do.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::sink::SinkExt;
use futures::stream::{SplitSink, SplitStream, StreamExt};
use tokio::sync::mpsc;

use crate::gateway::registry::Admission;
use crate::gateway::session::Session;
use crate::gateway::GatewayState;
use crate::limits;
use crate::wire::{ControlMessage, ServerMessage, SessionConfig, LEAVING_MEETING};

/// RAII guard that frees the admission slot when the connection ends,
/// however it ends.
struct SlotGuard {
    uid: String,
    state: GatewayState,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.state.registry.remove(&self.uid);
        log::info!("[WS] Slot released: {}", self.uid);
    }
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<GatewayState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

async fn handle_ws(socket: WebSocket, state: GatewayState) {
    let (mut sender, mut receiver) = socket.split();

    // AwaitingConfig: exactly one JSON config frame within the budget.
    let config = match await_config(&mut receiver).await {
        Ok(config) => config,
        Err(reason) => {
            let _ = sender
                .send(Message::Text(
                    ServerMessage::error("", &reason).to_json().into(),
                ))
                .await;
            let _ = sender.close().await;
            return;
        }
    };

    if let Some(requested) = config.max_clients {
        state.registry.tighten_max_clients(requested);
    }

    // Admission: over the cap the bot gets a WAIT estimate and the socket
    // closes; it is expected to retry later.
    if let Admission::Full { wait_minutes } = state.registry.try_admit(&config.uid) {
        log::info!(
            "[WS] Server full, {} told to wait ~{} min",
            config.uid,
            wait_minutes
        );
        let _ = sender
            .send(Message::Text(
                ServerMessage::wait(&config.uid, wait_minutes).to_json().into(),
            ))
            .await;
        let _ = sender.close().await;
        return;
    }
    let _slot = SlotGuard {
        uid: config.uid.clone(),
        state: state.clone(),
    };

    // Writer task: the read loop and the ASR worker both enqueue frames
    // here, so neither ever blocks on the socket.
    let (out_tx, out_rx) = mpsc::channel::<String>(64);
    let writer = tokio::spawn(write_loop(sender, out_rx));

    let session = Session::new(&config, out_tx);
    log::info!(
        "[WS] Session {} ready (meeting={}, platform={})",
        session.uid,
        session.meeting_id,
        session.platform
    );

    session
        .send_to_client(ServerMessage::ready(&session.uid, state.transcriber.name()))
        .await;

    if let Err(e) = state
        .relay
        .session_start(
            &session.uid,
            &session.token,
            &session.platform,
            &session.meeting_id,
            session.started_at,
        )
        .await
    {
        log::error!("[WS] {} failed to publish session_start: {}", session.uid, e);
    }

    let worker = tokio::spawn(
        Arc::clone(&session).asr_worker(Arc::clone(&state.transcriber), state.relay.clone()),
    );

    // Running: per-connection lifetime is enforced here; the bot may only
    // shorten it.
    let lifetime = config
        .max_connection_time
        .map(Duration::from_secs)
        .unwrap_or_else(|| state.registry.max_connection_time())
        .min(state.registry.max_connection_time());
    let deadline = tokio::time::sleep(lifetime);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => {
                log::info!("[WS] {} reached max connection time", session.uid);
                break;
            }
            message = receiver.next() => match message {
                Some(Ok(Message::Binary(data))) => {
                    if data.as_ref() == limits::END_OF_AUDIO {
                        log::info!("[WS] {} sent END_OF_AUDIO", session.uid);
                        break;
                    }
                    session.push_audio(&decode_f32le(&data));
                }
                Some(Ok(Message::Text(text))) => {
                    if handle_control(&session, &text) {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                _ => {}
            }
        }
    }

    // Draining: give the worker a bounded window to flush, then announce
    // the end of the session downstream and to the bot.
    session.cancel.cancel();
    let worker_abort = worker.abort_handle();
    if tokio::time::timeout(Duration::from_secs(limits::DRAIN_DEADLINE_SECS), worker)
        .await
        .is_err()
    {
        log::warn!("[WS] {} worker missed the drain deadline, aborting", session.uid);
        worker_abort.abort();
    }

    if let Err(e) = state
        .relay
        .session_end(
            &session.uid,
            &session.token,
            &session.platform,
            &session.meeting_id,
        )
        .await
    {
        log::error!("[WS] {} failed to publish session_end: {}", session.uid, e);
    }

    session.send_to_client(ServerMessage::disconnect(&session.uid)).await;
    drop(session);
    // Writer drains queued frames, then exits once all senders are gone.
    let _ = tokio::time::timeout(Duration::from_secs(1), writer).await;
}

/// Waits for the mandatory config frame.
async fn await_config(receiver: &mut SplitStream<WebSocket>) -> Result<SessionConfig, String> {
    let budget = Duration::from_secs(limits::CONFIG_FRAME_TIMEOUT_SECS);
    let frame = tokio::time::timeout(budget, receiver.next())
        .await
        .map_err(|_| "no config frame within 10s".to_string())?;

    match frame {
        Some(Ok(Message::Text(text))) => serde_json::from_str::<SessionConfig>(&text)
            .map_err(|e| format!("invalid config frame: {e}")),
        Some(Ok(_)) => Err("expected a JSON config frame first".into()),
        Some(Err(e)) => Err(format!("socket error before config: {e}")),
        None => Err("connection closed before config".into()),
    }
}

/// Dispatches a runtime text frame. Returns `true` when the session should
/// start draining.
fn handle_control(session: &Arc<Session>, text: &str) -> bool {
    match serde_json::from_str::<ControlMessage>(text) {
        Ok(ControlMessage::SpeakerActivityUpdate { timestamp, speakers }) => {
            session.record_speaker_activity(&timestamp, &speakers);
            false
        }
        Ok(ControlMessage::SessionControl { payload }) => {
            if payload.event == LEAVING_MEETING {
                log::info!("[WS] {} leaving meeting", session.uid);
                true
            } else {
                log::debug!(
                    "[WS] {} unhandled session_control event {:?}",
                    session.uid,
                    payload.event
                );
                false
            }
        }
        Err(_) => {
            // Unknown message types are logged and dropped; they must not
            // take the session down.
            log::debug!(
                "[WS] {} dropped unknown frame: {}",
                session.uid,
                text.chars().take(120).collect::<String>()
            );
            false
        }
    }
}

async fn write_loop(mut sink: SplitSink<WebSocket, Message>, mut rx: mpsc::Receiver<String>) {
    while let Some(frame) = rx.recv().await {
        if sink.send(Message::Text(frame.into())).await.is_err() {
            break;
        }
    }
    let _ = sink.close().await;
}

/// Decodes little-endian Float32 PCM, ignoring a trailing partial sample.
fn decode_f32le(data: &[u8]) -> Vec<f32> {
    data.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn f32le_decoding_round_trips() {
        let samples = [0.5f32, -0.25, 1.0];
        let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        assert_eq!(decode_f32le(&bytes), samples);
    }

    #[test]
    fn trailing_partial_sample_is_ignored() {
        let mut bytes = 0.5f32.to_le_bytes().to_vec();
        bytes.push(0xFF);
        assert_eq!(decode_f32le(&bytes).len(), 1);
    }
}
