pub mod ivr;
pub mod orchestrator;
pub mod status;

use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::store::KvStore;
use crate::twilio::twiml;
use crate::AppState;

/// Lifecycle of a third-party message relay.
///
/// `pending` moves to exactly one of the terminal values; terminal sessions
/// are logically closed and must never be mutated again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum RelayStatus {
    Pending,
    DeliveredNoReply,
    DeliveredWithReply,
    /// Finalized by a terminal carrier status before any IVR transition,
    /// e.g. `final_no-answer`.
    Final(String),
}

impl RelayStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RelayStatus::Pending)
    }
}

impl From<RelayStatus> for String {
    fn from(status: RelayStatus) -> String {
        match status {
            RelayStatus::Pending => "pending".to_string(),
            RelayStatus::DeliveredNoReply => "delivered_no_reply".to_string(),
            RelayStatus::DeliveredWithReply => "delivered_with_reply".to_string(),
            RelayStatus::Final(carrier) => format!("final_{carrier}"),
        }
    }
}

impl TryFrom<String> for RelayStatus {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.as_str() {
            "pending" => Ok(RelayStatus::Pending),
            "delivered_no_reply" => Ok(RelayStatus::DeliveredNoReply),
            "delivered_with_reply" => Ok(RelayStatus::DeliveredWithReply),
            other => match other.strip_prefix("final_") {
                Some(carrier) => Ok(RelayStatus::Final(carrier.to_string())),
                None => Err(format!("unknown relay status: {other}")),
            },
        }
    }
}

/// How the third-party leg relates to the original caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RelayMode {
    /// Caller is parked in a conference and resumed with a summary.
    Conference,
    /// Caller was unreachable at bridge time; deliver the message only.
    MessageOnly,
}

/// Tracked state of one "deliver a message, maybe collect a reply"
/// transaction across its webhook invocations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySession {
    pub session_id: String,
    pub caller_call_sid: String,
    #[serde(default)]
    pub callee_call_sid: Option<String>,
    pub room_id: String,
    pub message: String,
    pub status: RelayStatus,
    pub mode: RelayMode,
    #[serde(default)]
    pub recipient_confirm: Option<String>,
    #[serde(default)]
    pub recipient_reply: Option<String>,
    pub updated_at: DateTime<Utc>,
}

fn session_key(session_id: &str) -> String {
    format!("relay:session:{session_id}")
}

fn callee_key(callee_call_sid: &str) -> String {
    format!("relay:callee:{callee_call_sid}")
}

pub fn new_session_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(char::from)
        .collect();
    format!("rs_{suffix}")
}

pub async fn save_session(store: &KvStore, session: &RelaySession) {
    store
        .set_json(&session_key(&session.session_id), session)
        .await;
}

pub async fn load_session(store: &KvStore, session_id: &str) -> Option<RelaySession> {
    store.get_json(&session_key(session_id)).await
}

/// Record `callee_call_sid -> session_id` so the status router can find the
/// owning session from a sid-only webhook payload.
pub async fn index_callee(store: &KvStore, callee_call_sid: &str, session_id: &str) {
    store
        .set_json(&callee_key(callee_call_sid), &session_id.to_string())
        .await;
}

pub async fn session_for_callee(store: &KvStore, callee_call_sid: &str) -> Option<RelaySession> {
    let session_id: String = store.get_json(&callee_key(callee_call_sid)).await?;
    load_session(store, &session_id).await
}

/// Cap a spoken summary to what fits in a callback URL.
pub const SUMMARY_MAX_CHARS: usize = 900;

pub fn truncate_summary(summary: &str) -> String {
    if summary.chars().count() <= SUMMARY_MAX_CHARS {
        return summary.to_string();
    }
    summary.chars().take(SUMMARY_MAX_CHARS).collect()
}

/// Finalize a session and resume the original caller with a spoken summary.
///
/// The single exactly-once gate for every finalizing path (IVR confirm/reply
/// and the status router): a session that is already terminal is left
/// untouched and no second caller redirect is issued. Returns whether this
/// call performed the transition.
pub async fn finalize_session(
    state: &AppState,
    session: &RelaySession,
    status: RelayStatus,
    recipient_confirm: Option<String>,
    recipient_reply: Option<String>,
    summary: &str,
) -> bool {
    // Re-read before writing: another webhook may have finalized in between.
    let current = load_session(&state.store, &session.session_id).await;
    if let Some(ref current) = current {
        if current.status.is_terminal() {
            tracing::info!(
                session_id = %session.session_id,
                status = ?current.status,
                "Session already finalized, ignoring duplicate transition"
            );
            return false;
        }
    }

    let mut updated = current.unwrap_or_else(|| session.clone());
    updated.status = status;
    if recipient_confirm.is_some() {
        updated.recipient_confirm = recipient_confirm;
    }
    if recipient_reply.is_some() {
        updated.recipient_reply = recipient_reply;
    }
    updated.updated_at = Utc::now();
    save_session(&state.store, &updated).await;

    if updated.mode == RelayMode::MessageOnly {
        tracing::info!(
            session_id = %updated.session_id,
            "Message-only session finalized, no caller to resume"
        );
        return true;
    }

    let summary = truncate_summary(summary);
    let resume_url = format!(
        "{}/twilio/resume?say={}&room={}",
        state.config.server.external_url,
        twiml::query_escape(&summary),
        twiml::query_escape(&updated.room_id)
    );

    let accepted = state
        .twilio
        .redirect_call(&updated.caller_call_sid, &resume_url)
        .await;
    if !accepted {
        // The caller may have hung up already; the session state stands.
        tracing::warn!(
            session_id = %updated.session_id,
            caller_call_sid = %updated.caller_call_sid,
            "Caller resume redirect was not accepted"
        );
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_round_trip() {
        for status in [
            RelayStatus::Pending,
            RelayStatus::DeliveredNoReply,
            RelayStatus::DeliveredWithReply,
            RelayStatus::Final("no-answer".to_string()),
        ] {
            let s: String = status.clone().into();
            assert_eq!(RelayStatus::try_from(s).unwrap(), status);
        }
        assert_eq!(
            String::from(RelayStatus::Final("busy".to_string())),
            "final_busy"
        );
    }

    #[test]
    fn unknown_status_string_is_rejected() {
        assert!(RelayStatus::try_from("ringing".to_string()).is_err());
    }

    #[test]
    fn only_pending_is_non_terminal() {
        assert!(!RelayStatus::Pending.is_terminal());
        assert!(RelayStatus::DeliveredNoReply.is_terminal());
        assert!(RelayStatus::DeliveredWithReply.is_terminal());
        assert!(RelayStatus::Final("failed".to_string()).is_terminal());
    }

    #[test]
    fn summary_is_capped() {
        let long = "x".repeat(2000);
        assert_eq!(truncate_summary(&long).chars().count(), SUMMARY_MAX_CHARS);
        assert_eq!(truncate_summary("short"), "short");
    }

    #[test]
    fn session_ids_are_distinct() {
        let a = new_session_id();
        let b = new_session_id();
        assert_ne!(a, b);
        assert!(a.starts_with("rs_"));
    }

    #[tokio::test]
    async fn callee_index_finds_session() {
        let store = KvStore::in_memory();
        let session = RelaySession {
            session_id: "rs_test".to_string(),
            caller_call_sid: "CA_caller".to_string(),
            callee_call_sid: Some("CA_callee".to_string()),
            room_id: "roomA".to_string(),
            message: "hi".to_string(),
            status: RelayStatus::Pending,
            mode: RelayMode::Conference,
            recipient_confirm: None,
            recipient_reply: None,
            updated_at: Utc::now(),
        };
        save_session(&store, &session).await;
        index_callee(&store, "CA_callee", "rs_test").await;

        let found = session_for_callee(&store, "CA_callee").await.unwrap();
        assert_eq!(found.session_id, "rs_test");
        assert!(session_for_callee(&store, "CA_other").await.is_none());
    }
}
