use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Form;
use serde::Deserialize;

use crate::relay::{self, RelayStatus};
use crate::AppState;

/// Carrier call-status values, decoded at the boundary. Anything
/// unrecognized lands in `Other` and is ignored as non-terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CarrierStatus {
    Completed,
    Busy,
    NoAnswer,
    Failed,
    Canceled,
    Other(String),
}

impl CarrierStatus {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "completed" => CarrierStatus::Completed,
            "busy" => CarrierStatus::Busy,
            "no-answer" => CarrierStatus::NoAnswer,
            "failed" => CarrierStatus::Failed,
            "canceled" => CarrierStatus::Canceled,
            other => CarrierStatus::Other(other.to_string()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, CarrierStatus::Other(_))
    }

    pub fn as_str(&self) -> &str {
        match self {
            CarrierStatus::Completed => "completed",
            CarrierStatus::Busy => "busy",
            CarrierStatus::NoAnswer => "no-answer",
            CarrierStatus::Failed => "failed",
            CarrierStatus::Canceled => "canceled",
            CarrierStatus::Other(s) => s,
        }
    }
}

/// Status callback payload, form-encoded by the carrier.
#[derive(Debug, Deserialize)]
pub struct StatusCallbackForm {
    #[serde(rename = "CallSid", default)]
    pub call_sid: String,
    #[serde(rename = "CallStatus", default)]
    pub call_status: String,
    #[serde(rename = "CallDuration", default)]
    pub call_duration: Option<String>,
}

/// What the router did with one status event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    /// This event performed the sole finalize for its session.
    Finalized,
    /// Session was already terminal; duplicate ignored.
    AlreadyFinal,
    /// The sid belongs to no tracked callee leg.
    Unknown,
    /// Not a terminal status; nothing to do.
    NonTerminal,
}

/// POST /twilio/status — single entry point for terminal call-status events.
///
/// Always answers 200: carriers treat handler errors as a reason to retry
/// aggressively.
pub async fn handle_status(
    State(state): State<AppState>,
    Form(form): Form<StatusCallbackForm>,
) -> Response {
    let routed = route_status(&state, &form.call_sid, &form.call_status).await;
    tracing::info!(
        call_sid = %form.call_sid,
        call_status = %form.call_status,
        duration = form.call_duration.as_deref().unwrap_or("-"),
        routed = ?routed,
        "Status callback"
    );
    StatusCode::OK.into_response()
}

pub async fn route_status(state: &AppState, call_sid: &str, raw_status: &str) -> Routed {
    let status = CarrierStatus::parse(raw_status);
    if !status.is_terminal() {
        return Routed::NonTerminal;
    }

    // Only callee legs of relay sessions are tracked here; status events for
    // anything else (e.g. plain notification calls) are ignored.
    let Some(session) = relay::session_for_callee(&state.store, call_sid).await else {
        return Routed::Unknown;
    };

    if session.status.is_terminal() {
        return Routed::AlreadyFinal;
    }

    let summary = carrier_summary(&status);
    let finalized = relay::finalize_session(
        state,
        &session,
        RelayStatus::Final(status.as_str().to_string()),
        None,
        None,
        summary,
    )
    .await;

    if finalized {
        Routed::Finalized
    } else {
        // Lost the race to an IVR transition between the read and the write.
        Routed::AlreadyFinal
    }
}

fn carrier_summary(status: &CarrierStatus) -> &'static str {
    match status {
        CarrierStatus::Busy => "I tried to reach them, but the line was busy.",
        CarrierStatus::NoAnswer => "I called them, but they didn't answer.",
        CarrierStatus::Failed => "I couldn't reach them; the call failed.",
        CarrierStatus::Canceled => "The call was canceled before they picked up.",
        CarrierStatus::Completed | CarrierStatus::Other(_) => {
            "The call ended before they could respond."
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::{RelayMode, RelaySession};
    use crate::test_state;
    use chrono::Utc;

    #[test]
    fn terminal_statuses_decode() {
        assert!(CarrierStatus::parse("completed").is_terminal());
        assert!(CarrierStatus::parse("busy").is_terminal());
        assert!(CarrierStatus::parse("no-answer").is_terminal());
        assert!(CarrierStatus::parse("failed").is_terminal());
        assert!(CarrierStatus::parse("canceled").is_terminal());
        assert!(!CarrierStatus::parse("ringing").is_terminal());
        assert!(!CarrierStatus::parse("in-progress").is_terminal());
        assert_eq!(
            CarrierStatus::parse("weird"),
            CarrierStatus::Other("weird".to_string())
        );
    }

    async fn seeded(state: &crate::AppState, status: RelayStatus) -> RelaySession {
        let session = RelaySession {
            session_id: "rs_status".to_string(),
            caller_call_sid: "CA_caller".to_string(),
            callee_call_sid: Some("CA_callee".to_string()),
            room_id: "roomA".to_string(),
            message: "msg".to_string(),
            status,
            mode: RelayMode::Conference,
            recipient_confirm: None,
            recipient_reply: Some("that works".to_string()),
            updated_at: Utc::now(),
        };
        relay::save_session(&state.store, &session).await;
        relay::index_callee(&state.store, "CA_callee", "rs_status").await;
        session
    }

    #[tokio::test]
    async fn no_answer_performs_the_sole_finalize() {
        let state = test_state();
        seeded(&state, RelayStatus::Pending).await;

        let routed = route_status(&state, "CA_callee", "no-answer").await;
        assert_eq!(routed, Routed::Finalized);

        let stored = relay::load_session(&state.store, "rs_status").await.unwrap();
        assert_eq!(stored.status, RelayStatus::Final("no-answer".to_string()));
        assert!(carrier_summary(&CarrierStatus::NoAnswer).contains("didn't answer"));
    }

    #[tokio::test]
    async fn duplicate_terminal_callback_is_a_no_op() {
        let state = test_state();
        seeded(&state, RelayStatus::DeliveredWithReply).await;

        let routed = route_status(&state, "CA_callee", "completed").await;
        assert_eq!(routed, Routed::AlreadyFinal);

        // The delivered session keeps its reply untouched.
        let stored = relay::load_session(&state.store, "rs_status").await.unwrap();
        assert_eq!(stored.status, RelayStatus::DeliveredWithReply);
        assert_eq!(stored.recipient_reply.as_deref(), Some("that works"));
    }

    #[tokio::test]
    async fn untracked_sid_is_ignored() {
        let state = test_state();
        assert_eq!(
            route_status(&state, "CA_random", "completed").await,
            Routed::Unknown
        );
    }

    #[tokio::test]
    async fn non_terminal_status_is_ignored() {
        let state = test_state();
        seeded(&state, RelayStatus::Pending).await;
        assert_eq!(
            route_status(&state, "CA_callee", "ringing").await,
            Routed::NonTerminal
        );
        let stored = relay::load_session(&state.store, "rs_status").await.unwrap();
        assert_eq!(stored.status, RelayStatus::Pending);
    }
}
