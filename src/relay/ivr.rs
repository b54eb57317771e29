use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use axum::Form;
use serde::Deserialize;

use crate::relay::{self, RelaySession, RelayStatus};
use crate::twilio::twiml;
use crate::AppState;

/// The third party's leg walks through Greeting -> Confirming ->
/// (ReplyCollecting) -> Finalized, one webhook per transition. Every path
/// out of Confirming/ReplyCollecting finalizes the session exactly once via
/// `relay::finalize_session`, which also resumes the original caller.

#[derive(Debug, Deserialize)]
pub struct SessionQuery {
    pub session: String,
}

/// Speech-gather result as the carrier POSTs it.
#[derive(Debug, Deserialize, Default)]
pub struct GatherForm {
    #[serde(rename = "SpeechResult", default)]
    pub speech_result: Option<String>,
    #[serde(rename = "CallSid", default)]
    pub call_sid: Option<String>,
}

/// Greeting: the third party answered. Speak the message, then ask whether
/// they want to reply.
pub async fn handle_answer(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
) -> Response {
    let Some(session) = relay::load_session(&state.store, &query.session).await else {
        tracing::warn!(session = %query.session, "Answer webhook for unknown session");
        return xml(twiml::say_and_hangup(
            "Sorry, this message is no longer available. Goodbye.",
        ));
    };

    tracing::info!(session_id = %session.session_id, "Third party answered, greeting");

    let text = format!(
        "Hello, this is an automated call from {}. I have a message for you: {}. \
         Would you like to send a reply?",
        state.config.openai.concierge_name, session.message
    );
    let confirm_url = format!(
        "{}/twilio/relay/confirm?session={}",
        state.config.server.external_url,
        twiml::query_escape(&session.session_id)
    );
    xml(twiml::say_and_gather(&text, &confirm_url))
}

/// Confirming: classify the yes/no answer. Yes collects a reply; no or
/// unclear delivers without one.
pub async fn handle_confirm(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
    Form(form): Form<GatherForm>,
) -> Response {
    let Some(session) = relay::load_session(&state.store, &query.session).await else {
        return xml(twiml::say_and_hangup("Sorry, something went wrong. Goodbye."));
    };

    let transcript = form.speech_result.unwrap_or_default();
    let verdict = classify_confirm(&transcript);
    tracing::info!(
        session_id = %session.session_id,
        call_sid = %form.call_sid.as_deref().unwrap_or(""),
        transcript = %transcript,
        verdict = ?verdict,
        "Reply confirmation gathered"
    );

    match verdict {
        Confirm::Yes => {
            let reply_url = format!(
                "{}/twilio/relay/reply?session={}",
                state.config.server.external_url,
                twiml::query_escape(&session.session_id)
            );
            xml(twiml::say_and_gather(
                "Okay, please say your reply after the beep, then stay on the line.",
                &reply_url,
            ))
        }
        Confirm::No | Confirm::Unclear => {
            let confirm_raw = if transcript.trim().is_empty() {
                None
            } else {
                Some(transcript.clone())
            };
            let summary = no_reply_summary(&session);
            relay::finalize_session(
                &state,
                &session,
                RelayStatus::DeliveredNoReply,
                confirm_raw,
                None,
                &summary,
            )
            .await;
            xml(twiml::say_and_hangup(
                "Alright, the message has been delivered. Goodbye.",
            ))
        }
    }
}

/// ReplyCollecting: whatever was heard becomes the reply, even nothing.
pub async fn handle_reply(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
    Form(form): Form<GatherForm>,
) -> Response {
    let Some(session) = relay::load_session(&state.store, &query.session).await else {
        return xml(twiml::say_and_hangup("Sorry, something went wrong. Goodbye."));
    };

    let reply = form.speech_result.unwrap_or_default().trim().to_string();
    tracing::info!(
        session_id = %session.session_id,
        call_sid = %form.call_sid.as_deref().unwrap_or(""),
        reply_len = reply.len(),
        "Reply collected"
    );

    let summary = reply_summary(&session, &reply);
    relay::finalize_session(
        &state,
        &session,
        RelayStatus::DeliveredWithReply,
        None,
        Some(reply),
        &summary,
    )
    .await;

    xml(twiml::say_and_hangup(
        "Thank you, I'll pass that along. Goodbye.",
    ))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirm {
    Yes,
    No,
    Unclear,
}

const YES_WORDS: &[&str] = &[
    "yes", "yeah", "yep", "yup", "sure", "okay", "ok", "absolutely", "definitely", "please",
];

const NO_WORDS: &[&str] = &["no", "nope", "nah", "don't", "dont", "not"];

/// Keyword classification of the confirm transcript. No confidence
/// threshold; anything ambiguous is Unclear and defaults to not replying.
pub fn classify_confirm(transcript: &str) -> Confirm {
    let lower = transcript.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| !c.is_ascii_alphanumeric() && c != '\'')
        .filter(|w| !w.is_empty())
        .collect();

    let has_no = words.iter().any(|w| NO_WORDS.contains(w));
    let has_yes = words.iter().any(|w| YES_WORDS.contains(w));

    // "no" anywhere beats "yes": "no thanks, it's okay" is a decline.
    if has_no {
        Confirm::No
    } else if has_yes {
        Confirm::Yes
    } else {
        Confirm::Unclear
    }
}

fn no_reply_summary(session: &RelaySession) -> String {
    relay::truncate_summary(&format!(
        "I delivered your message: \"{}\". They didn't want to reply.",
        session.message
    ))
}

fn reply_summary(session: &RelaySession, reply: &str) -> String {
    let text = if reply.is_empty() {
        format!(
            "I delivered your message: \"{}\". They wanted to reply but I couldn't hear one.",
            session.message
        )
    } else {
        format!(
            "I delivered your message: \"{}\". They replied: \"{reply}\".",
            session.message
        )
    };
    relay::truncate_summary(&text)
}


fn xml(body: String) -> Response {
    ([("Content-Type", "text/xml")], body).into_response()
}
