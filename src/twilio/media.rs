use std::collections::HashMap;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio_tungstenite::tungstenite::Message as AiMessage;

use crate::memory::{self, Role};
use crate::openai::{self, RealtimeEvent};
use crate::registry::phone_room;
use crate::{greeting, AppState};

/// Twilio Media Stream WebSocket event types.
#[derive(Debug, Deserialize)]
#[serde(tag = "event")]
#[serde(rename_all = "lowercase")]
#[allow(dead_code)]
enum StreamEvent {
    Connected {
        #[serde(default)]
        protocol: Option<String>,
    },
    Start {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        start: StartMetadata,
    },
    Media {
        media: MediaPayload,
    },
    Mark {
        #[serde(rename = "streamSid")]
        stream_sid: String,
    },
    Stop {
        #[serde(rename = "streamSid")]
        stream_sid: String,
    },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(dead_code)]
struct StartMetadata {
    call_sid: String,
    #[serde(default)]
    custom_parameters: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct MediaPayload {
    payload: String, // base64-encoded mu-law audio
}

/// Per-connection relay state. The stream sid arrives in the carrier's
/// `start` event; until then no outbound audio can be addressed.
#[derive(Default)]
struct RelayState {
    stream_sid: Option<String>,
    call_sid: String,
    room_id: String,
}

impl RelayState {
    /// Wrap an AI audio delta in the carrier's media envelope, or `None`
    /// while the stream sid is still unknown (the delta is dropped).
    fn envelope_for_delta(&self, payload_b64: &str) -> Option<String> {
        let sid = self.stream_sid.as_ref()?;
        Some(
            serde_json::json!({
                "event": "media",
                "streamSid": sid,
                "media": { "payload": payload_b64 }
            })
            .to_string(),
        )
    }
}

/// WebSocket upgrade handler for GET /twilio/media.
pub async fn handle_media_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_media_stream(socket, state))
}

/// Bridge one live phone call to one realtime voice-AI session.
///
/// Pure relay: audio deltas from the AI become carrier media frames, caller
/// media frames become AI input-audio appends. Malformed frames on either
/// side are dropped. Closing either socket closes the other — there is no
/// recovery path; the caller must redial.
async fn handle_media_stream(mut socket: WebSocket, state: AppState) {
    tracing::info!("Media stream connected");

    let ai = match openai::connect(&state.config.openai).await {
        Ok(ws) => ws,
        Err(e) => {
            tracing::error!("Realtime backend unavailable, dropping call: {e}");
            return;
        }
    };
    let (mut ai_tx, mut ai_rx) = ai.split();

    // Configure the session and ask for the opening turn before any audio
    // flows.
    let setup = [
        openai::session_update(&state.config.openai),
        openai::response_create(&greeting::opening_line(&state.config.openai.concierge_name)),
    ];
    for event in setup {
        if let Err(e) = ai_tx.send(AiMessage::Text(event.to_string().into())).await {
            tracing::error!("Realtime session setup failed: {e}");
            return;
        }
    }

    let mut relay = RelayState::default();

    loop {
        tokio::select! {
            // Caller side
            ws_msg = socket.recv() => {
                let msg = match ws_msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::info!(call_sid = %relay.call_sid, "Media stream closed");
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::warn!("Media stream error: {e}");
                        break;
                    }
                    _ => continue,
                };

                let event: StreamEvent = match serde_json::from_str(&msg) {
                    Ok(e) => e,
                    Err(e) => {
                        tracing::debug!("Unparsable stream event dropped: {e}");
                        continue;
                    }
                };

                match event {
                    StreamEvent::Connected { .. } => {
                        tracing::debug!("Stream handshake");
                    }
                    StreamEvent::Start { stream_sid, start } => {
                        relay.call_sid = start.call_sid.clone();
                        let params = start.custom_parameters.unwrap_or_default();
                        relay.room_id = params
                            .get("room")
                            .cloned()
                            .or_else(|| params.get("from").map(|f| phone_room(f)))
                            .unwrap_or_else(|| phone_room(&relay.call_sid));
                        relay.stream_sid = Some(stream_sid);

                        tracing::info!(
                            call_sid = %relay.call_sid,
                            room_id = %relay.room_id,
                            "Stream started, relaying"
                        );

                        if !relay.call_sid.is_empty() {
                            let from = params.get("from").cloned().unwrap_or_default();
                            state
                                .registry
                                .persist_active_call(&relay.room_id, &relay.call_sid, &from)
                                .await;

                            // Reconnecting leg (e.g. after a relay summary):
                            // seed the session with what was already said.
                            if let Some(mem) = memory::load(&state.store, &relay.call_sid).await {
                                if !mem.turns.is_empty() {
                                    let update = openai::session_append_context(
                                        &state.config.openai,
                                        &memory::recent_context(&mem),
                                    );
                                    if let Err(e) = ai_tx
                                        .send(AiMessage::Text(update.to_string().into()))
                                        .await
                                    {
                                        tracing::warn!("Context update failed: {e}");
                                        break;
                                    }
                                }
                            }
                        }
                    }
                    StreamEvent::Media { media } => {
                        let event = openai::input_audio_append(&media.payload);
                        if let Err(e) = ai_tx.send(AiMessage::Text(event.to_string().into())).await {
                            tracing::warn!("Realtime socket write failed: {e}");
                            break;
                        }
                    }
                    StreamEvent::Mark { .. } => {
                        tracing::debug!("Mark received");
                    }
                    StreamEvent::Stop { .. } => {
                        tracing::info!(call_sid = %relay.call_sid, "Stream stopped");
                        break;
                    }
                }
            }

            // AI side
            ai_msg = ai_rx.next() => {
                let text = match ai_msg {
                    Some(Ok(AiMessage::Text(text))) => text,
                    Some(Ok(AiMessage::Close(_))) | None => {
                        tracing::info!(call_sid = %relay.call_sid, "Realtime socket closed");
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::warn!("Realtime socket error: {e}");
                        break;
                    }
                    _ => continue,
                };

                let Some(event) = openai::decode_event(&text) else {
                    tracing::debug!("Non-JSON realtime frame dropped");
                    continue;
                };

                match event {
                    RealtimeEvent::AudioDelta(payload) => {
                        // No stream sid yet: the carrier can't route this.
                        let Some(envelope) = relay.envelope_for_delta(&payload) else {
                            tracing::debug!("Audio delta before stream start dropped");
                            continue;
                        };
                        if let Err(e) = socket.send(Message::Text(envelope.into())).await {
                            tracing::warn!("Caller socket write failed: {e}");
                            break;
                        }
                    }
                    RealtimeEvent::AssistantTranscript(text) => {
                        record(&state, &relay, Role::Assistant, &text).await;
                    }
                    RealtimeEvent::UserTranscript(text) => {
                        record(&state, &relay, Role::User, &text).await;
                    }
                    RealtimeEvent::Error(message) => {
                        tracing::warn!(call_sid = %relay.call_sid, "Realtime error event: {message}");
                    }
                    RealtimeEvent::Ignored => {}
                }
            }
        }
    }

    // Fail-together: whichever side broke, close the peer too.
    let _ = ai_tx.close().await;
    tracing::info!(call_sid = %relay.call_sid, "Relay session ended");
}

async fn record(state: &AppState, relay: &RelayState, role: Role, text: &str) {
    if relay.call_sid.is_empty() {
        return;
    }
    memory::record_turn(
        &state.store,
        &relay.call_sid,
        &relay.room_id,
        role,
        text,
        state.config.relay.memory_turns,
    )
    .await;
}
