use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::HeaderValue;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::config::OpenAiConfig;

pub type RealtimeSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, thiserror::Error)]
pub enum RealtimeError {
    #[error("invalid realtime endpoint: {0}")]
    Endpoint(String),
    #[error("realtime connect failed: {0}")]
    Connect(String),
}

/// Open the realtime voice-AI socket with the bearer credential in the
/// connection handshake.
pub async fn connect(config: &OpenAiConfig) -> Result<RealtimeSocket, RealtimeError> {
    let endpoint = format!("wss://api.openai.com/v1/realtime?model={}", config.model);
    let mut request = endpoint
        .clone()
        .into_client_request()
        .map_err(|e| RealtimeError::Endpoint(e.to_string()))?;

    let auth = HeaderValue::from_str(&format!("Bearer {}", config.api_key))
        .map_err(|e| RealtimeError::Endpoint(e.to_string()))?;
    let headers = request.headers_mut();
    headers.insert("Authorization", auth);
    headers.insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

    let (socket, _response) = connect_async(request)
        .await
        .map_err(|e| RealtimeError::Connect(e.to_string()))?;

    tracing::info!(model = %config.model, "Realtime socket connected");
    Ok(socket)
}

/// One-shot session configuration: telephony codec both ways, server VAD,
/// and the concierge instructions.
pub fn session_update(config: &OpenAiConfig) -> Value {
    json!({
        "type": "session.update",
        "session": {
            "voice": config.voice,
            "modalities": ["audio", "text"],
            "input_audio_format": "g711_ulaw",
            "output_audio_format": "g711_ulaw",
            "input_audio_transcription": { "model": "whisper-1" },
            "turn_detection": { "type": "server_vad" },
            "instructions": config.instructions,
        }
    })
}

/// Re-send instructions with a transcript digest appended, so a resumed
/// call picks up where the earlier relay session left off.
pub fn session_append_context(config: &OpenAiConfig, context: &str) -> Value {
    json!({
        "type": "session.update",
        "session": {
            "instructions": format!(
                "{}\n\nRecent conversation on this call:\n{context}",
                config.instructions
            ),
        }
    })
}

/// Ask the AI to produce the opening turn, seeded with a greeting line.
pub fn response_create(opening_line: &str) -> Value {
    json!({
        "type": "response.create",
        "response": {
            "modalities": ["audio", "text"],
            "instructions": format!("Open the call by saying: {opening_line}"),
        }
    })
}

/// Wrap one base64 mu-law frame from the caller.
pub fn input_audio_append(payload_b64: &str) -> Value {
    json!({
        "type": "input_audio_buffer.append",
        "audio": payload_b64,
    })
}

/// Decoded realtime events the relay cares about. Everything else — and any
/// unrecognized type string — lands in `Ignored` so it never reaches core
/// logic as untyped data.
#[derive(Debug, Clone, PartialEq)]
pub enum RealtimeEvent {
    /// Base64 mu-law audio chunk for the caller.
    AudioDelta(String),
    /// Transcript of a finished assistant turn.
    AssistantTranscript(String),
    /// Transcript of a finished caller utterance.
    UserTranscript(String),
    Error(String),
    Ignored,
}

/// Decode one text frame from the realtime socket. Non-JSON frames are
/// protocol noise and return `None`.
pub fn decode_event(raw: &str) -> Option<RealtimeEvent> {
    let value: Value = serde_json::from_str(raw).ok()?;
    let event_type = value.get("type").and_then(|t| t.as_str()).unwrap_or("");

    let event = match event_type {
        "response.audio.delta" => {
            let delta = value
                .get("delta")
                .and_then(|d| d.as_str())
                .or_else(|| value.get("audio").and_then(|a| a.as_str()));
            match delta {
                Some(b64) => RealtimeEvent::AudioDelta(b64.to_string()),
                None => RealtimeEvent::Ignored,
            }
        }
        "response.audio_transcript.done" => text_field(&value, "transcript")
            .map(RealtimeEvent::AssistantTranscript)
            .unwrap_or(RealtimeEvent::Ignored),
        "conversation.item.input_audio_transcription.completed" => text_field(&value, "transcript")
            .map(RealtimeEvent::UserTranscript)
            .unwrap_or(RealtimeEvent::Ignored),
        "error" => {
            let message = value
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .unwrap_or("unknown realtime error");
            RealtimeEvent::Error(message.to_string())
        }
        _ => RealtimeEvent::Ignored,
    };

    Some(event)
}

fn text_field(value: &Value, field: &str) -> Option<String> {
    value
        .get(field)
        .and_then(|t| t.as_str())
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}
