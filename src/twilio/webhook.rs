use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use axum::Form;
use serde::Deserialize;

use crate::registry::phone_room;
use crate::twilio::twiml;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct VoiceForm {
    #[serde(rename = "CallSid", default)]
    pub call_sid: String,
    #[serde(rename = "From", default)]
    pub from: String,
}

/// Handle POST /twilio/voice — carrier webhook for incoming calls.
///
/// Registers the leg under its `phone:<E.164>` room so later webhook
/// invocations (and the agent's bridge tool) can find it, then connects the
/// call to the media-stream relay.
pub async fn handle_voice(State(state): State<AppState>, Form(form): Form<VoiceForm>) -> Response {
    let room_id = phone_room(&form.from);
    tracing::info!(call_sid = %form.call_sid, from = %form.from, room_id = %room_id, "Inbound call");

    if !form.call_sid.is_empty() {
        state
            .registry
            .persist_active_call(&room_id, &form.call_sid, &form.from)
            .await;
    }

    let ws_url = media_stream_url(&state.config.server.external_url);
    xml(twiml::connect_stream(&ws_url, &room_id))
}

#[derive(Debug, Deserialize)]
pub struct ConferenceQuery {
    pub conf: String,
}

/// Handle POST /twilio/conference/join — instruction document that parks the
/// original caller's leg in the bridge conference while the third party is
/// being reached.
pub async fn handle_conference_join(Query(query): Query<ConferenceQuery>) -> Response {
    tracing::info!(conf = %query.conf, "Caller joining conference");
    xml(twiml::join_conference(&query.conf))
}

#[derive(Debug, Deserialize)]
pub struct ResumeQuery {
    #[serde(default)]
    pub say: String,
    #[serde(default)]
    pub room: String,
}

/// Handle POST /twilio/resume — speak the relay outcome to the original
/// caller, then reconnect their leg to the media-stream relay so the
/// conversation continues.
pub async fn handle_resume(
    State(state): State<AppState>,
    Query(query): Query<ResumeQuery>,
) -> Response {
    tracing::info!(room = %query.room, say_len = query.say.len(), "Resuming caller with summary");

    let ws_url = media_stream_url(&state.config.server.external_url);
    if query.say.is_empty() {
        return xml(twiml::connect_stream(&ws_url, &query.room));
    }
    xml(twiml::say_and_resume(&query.say, &ws_url, &query.room))
}

pub fn media_stream_url(external_url: &str) -> String {
    format!(
        "{}/twilio/media",
        external_url
            .replace("https://", "wss://")
            .replace("http://", "ws://")
    )
}

fn xml(body: String) -> Response {
    ([("Content-Type", "text/xml")], body).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_url_switches_scheme() {
        assert_eq!(
            media_stream_url("https://concierge.example.com"),
            "wss://concierge.example.com/twilio/media"
        );
        assert_eq!(
            media_stream_url("http://localhost:8080"),
            "ws://localhost:8080/twilio/media"
        );
    }
}
