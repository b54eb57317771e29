use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::registry::phone_room;
use crate::relay::{self, RelayMode, RelaySession, RelayStatus};
use crate::twilio::client::StartOutcome;
use crate::twilio::twiml;
use crate::AppState;

/// Input to `call_third_party` — the one agent tool this engine exposes.
#[derive(Debug, Clone, Deserialize)]
pub struct ThirdPartyRequest {
    /// Target phone number; accepts bare 10-digit US, 11-digit with country
    /// code, `00`-prefixed international, or E.164.
    #[serde(default)]
    pub phone: String,
    /// Message to speak to the third party.
    #[serde(default)]
    pub message: String,
    /// Room/conversation id of the live caller, if the agent knows it.
    #[serde(default)]
    pub room_id: Option<String>,
    /// Direct caller call sid, if the agent already has one.
    #[serde(default)]
    pub call_sid: Option<String>,
    /// Caller's own number, for the `phone:<E.164>` room fallback.
    #[serde(default)]
    pub from_phone: Option<String>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BridgeError {
    #[error("no target phone number provided")]
    MissingPhone,
    #[error("target phone number not understood: {0}")]
    InvalidPhone(String),
    #[error("no message provided")]
    MissingMessage,
    #[error("message too long: {got} chars (max {max})")]
    MessageTooLong { got: usize, max: usize },
    #[error("no active call could be resolved for this request")]
    NoActiveCall,
    #[error("same bridge attempted too recently, retry in {remaining_secs}s")]
    RateLimited { remaining_secs: u64 },
}

#[derive(Debug, Clone, Serialize)]
pub struct BridgeSteps {
    pub caller_redirected: bool,
    pub callee_dialed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BridgeOutcome {
    pub ok: bool,
    pub session_id: String,
    pub conf_name: String,
    pub caller_call_sid: String,
    pub third_party_sid: Option<String>,
    pub mode: RelayMode,
    pub steps: BridgeSteps,
}

#[derive(Debug, Serialize, Deserialize)]
struct CooldownRecord {
    at: DateTime<Utc>,
}

/// Bridge a third party into the live caller's call: park the caller in a
/// conference, dial the target into the relay IVR, and hand the rest to the
/// IVR webhooks and the status router.
///
/// Validation failures are rejected before any side effect. A caller leg
/// that cannot be redirected (hung up already) degrades the bridge to
/// message-only delivery rather than aborting.
pub async fn call_third_party(
    state: &AppState,
    req: ThirdPartyRequest,
) -> Result<BridgeOutcome, BridgeError> {
    let phone_raw = req.phone.trim();
    if phone_raw.is_empty() {
        return Err(BridgeError::MissingPhone);
    }
    let phone = normalize_phone(phone_raw)
        .ok_or_else(|| BridgeError::InvalidPhone(phone_raw.to_string()))?;

    let message = req.message.trim().to_string();
    if message.is_empty() {
        return Err(BridgeError::MissingMessage);
    }
    let max = state.config.relay.message_max_chars;
    if message.chars().count() > max {
        return Err(BridgeError::MessageTooLong {
            got: message.chars().count(),
            max,
        });
    }

    let caller_call_sid = state
        .registry
        .resolve_active_call_sid(
            req.call_sid.as_deref(),
            req.room_id.as_deref(),
            req.from_phone.as_deref(),
        )
        .await
        .ok_or(BridgeError::NoActiveCall)?;

    // Cooldown guard: read-then-write on a timestamp record. Two concurrent
    // first requests can both pass the read; last-write-wins is accepted.
    let fingerprint = cooldown_fingerprint(&phone, &caller_call_sid, &message);
    let key = cooldown_key(&fingerprint);
    let window = state.config.relay.cooldown_secs;
    if let Some(record) = state.store.get_json::<CooldownRecord>(&key).await {
        let elapsed = Utc::now().signed_duration_since(record.at).num_seconds();
        if elapsed >= 0 && (elapsed as u64) < window {
            let remaining_secs = window - elapsed as u64;
            tracing::info!(fingerprint, remaining_secs, "Bridge rate-limited");
            return Err(BridgeError::RateLimited { remaining_secs });
        }
    }
    // Stamp before any network call to narrow the duplicate-request race.
    state
        .store
        .set_json(&key, &CooldownRecord { at: Utc::now() })
        .await;

    let room_id = req
        .room_id
        .clone()
        .or_else(|| req.from_phone.as_deref().map(phone_room))
        .unwrap_or_else(|| phone_room(&phone));
    let conf_name = conference_name(req.room_id.as_deref(), &caller_call_sid);

    let external = &state.config.server.external_url;

    // Park the caller. Failure here (e.g. the caller already hung up) does
    // not block delivery of the message itself.
    let join_url = format!(
        "{external}/twilio/conference/join?conf={}",
        twiml::query_escape(&conf_name)
    );
    let caller_redirected = state.twilio.redirect_call(&caller_call_sid, &join_url).await;
    let mode = if caller_redirected {
        RelayMode::Conference
    } else {
        tracing::warn!(
            caller_call_sid = %caller_call_sid,
            "Caller leg not redirectable, degrading to message-only delivery"
        );
        RelayMode::MessageOnly
    };

    let session_id = relay::new_session_id();
    let mut session = RelaySession {
        session_id: session_id.clone(),
        caller_call_sid: caller_call_sid.clone(),
        callee_call_sid: None,
        room_id,
        message: message.clone(),
        status: RelayStatus::Pending,
        mode,
        recipient_confirm: None,
        recipient_reply: None,
        updated_at: Utc::now(),
    };
    relay::save_session(&state.store, &session).await;

    let answer_url = format!(
        "{external}/twilio/relay/answer?session={}",
        twiml::query_escape(&session_id)
    );
    let status_url = format!("{external}/twilio/status");
    let dial = state
        .twilio
        .start_call(&phone, &answer_url, Some(&status_url))
        .await;

    let third_party_sid = match &dial {
        StartOutcome::Started(sid) => {
            session.callee_call_sid = Some(sid.clone());
            session.updated_at = Utc::now();
            relay::save_session(&state.store, &session).await;
            relay::index_callee(&state.store, sid, &session_id).await;
            Some(sid.clone())
        }
        StartOutcome::Skipped => None,
        StartOutcome::Errored(reason) => {
            tracing::error!(session_id = %session_id, "Third-party dial failed: {reason}");
            None
        }
    };

    let outcome = BridgeOutcome {
        ok: true,
        session_id,
        conf_name,
        caller_call_sid,
        steps: BridgeSteps {
            caller_redirected,
            callee_dialed: third_party_sid.is_some(),
        },
        third_party_sid,
        mode,
    };
    tracing::info!(
        session_id = %outcome.session_id,
        conf_name = %outcome.conf_name,
        mode = ?outcome.mode,
        caller_redirected = outcome.steps.caller_redirected,
        callee_dialed = outcome.steps.callee_dialed,
        "Third-party bridge set up"
    );
    Ok(outcome)
}

/// Normalize a phone number to E.164.
pub fn normalize_phone(raw: &str) -> Option<String> {
    let cleaned: String = raw
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '(' | ')' | '.'))
        .collect();

    if let Some(rest) = cleaned.strip_prefix('+') {
        if (8..=15).contains(&rest.len()) && rest.chars().all(|c| c.is_ascii_digit()) {
            return Some(cleaned);
        }
        return None;
    }

    if !cleaned.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    if let Some(rest) = cleaned.strip_prefix("00") {
        if (8..=15).contains(&rest.len()) {
            return Some(format!("+{rest}"));
        }
        return None;
    }

    match cleaned.len() {
        10 => Some(format!("+1{cleaned}")),
        11 if cleaned.starts_with('1') => Some(format!("+{cleaned}")),
        _ => None,
    }
}

/// Dedup fingerprint for the cooldown guard: enough of the phone, caller sid
/// and message prefix to identify "the same ask again". The 24-char message
/// prefix means two long messages sharing a prefix collide inside the
/// window; accepted.
fn cooldown_fingerprint(phone: &str, caller_call_sid: &str, message: &str) -> String {
    let digits: String = phone.chars().filter(|c| c.is_ascii_digit()).collect();
    let phone_tail = tail_chars(&digits, 4);
    let sid_tail = tail_chars(caller_call_sid, 6);
    let msg_head: String = message.chars().take(24).collect();
    sanitize_token(&format!("{phone_tail}_{sid_tail}_{msg_head}"))
}

// Char-based, not byte-based: the sid arrives verbatim from the request body
// and may not be ASCII.
fn tail_chars(s: &str, n: usize) -> String {
    let skip = s.chars().count().saturating_sub(n);
    s.chars().skip(skip).collect()
}

fn cooldown_key(fingerprint: &str) -> String {
    format!("relay:cooldown:{fingerprint}")
}

/// Stable conference name: room id, else caller sid, else a timestamp —
/// sanitized to a safe identifier character set.
pub fn conference_name(room_id: Option<&str>, caller_call_sid: &str) -> String {
    let base = match room_id {
        Some(room) if !room.is_empty() => room.to_string(),
        _ if !caller_call_sid.is_empty() => caller_call_sid.to_string(),
        _ => Utc::now().timestamp().to_string(),
    };
    format!("bridge_{}", sanitize_token(&base))
}

fn sanitize_token(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_state;

    #[test]
    fn normalizes_us_and_international_numbers() {
        assert_eq!(normalize_phone("3129990000").as_deref(), Some("+13129990000"));
        assert_eq!(
            normalize_phone("13129990000").as_deref(),
            Some("+13129990000")
        );
        assert_eq!(
            normalize_phone("0034612345678").as_deref(),
            Some("+34612345678")
        );
        assert_eq!(
            normalize_phone("+34612345678").as_deref(),
            Some("+34612345678")
        );
        assert_eq!(
            normalize_phone("(312) 999-0000").as_deref(),
            Some("+13129990000")
        );
    }

    #[test]
    fn normalized_numbers_are_plus_then_digits() {
        for input in ["3129990000", "13129990000", "003312998167", "+447700900123"] {
            let n = normalize_phone(input).unwrap();
            assert!(n.starts_with('+'));
            assert!(n[1..].chars().all(|c| c.is_ascii_digit()), "{n}");
        }
    }

    #[test]
    fn rejects_garbage_numbers() {
        assert!(normalize_phone("12345").is_none());
        assert!(normalize_phone("call me maybe").is_none());
        assert!(normalize_phone("+12ab34567890").is_none());
        assert!(normalize_phone("").is_none());
    }

    #[test]
    fn conference_name_prefers_room_then_sid() {
        assert_eq!(
            conference_name(Some("phone:+13312998167"), "CA123"),
            "bridge_phone__13312998167"
        );
        assert_eq!(conference_name(None, "CA123"), "bridge_CA123");
        assert!(conference_name(Some(""), "").starts_with("bridge_"));
    }

    #[test]
    fn fingerprint_collides_on_shared_message_prefix() {
        // Known limitation: only the first 24 chars of the message count.
        let a = cooldown_fingerprint(
            "+13129990000",
            "CA123456",
            "Please tell them that the meeting moved to Tuesday",
        );
        let b = cooldown_fingerprint(
            "+13129990000",
            "CA123456",
            "Please tell them that the package arrived",
        );
        assert_eq!(a, b);

        let c = cooldown_fingerprint("+13129990001", "CA123456", "Please tell them");
        assert_ne!(a, c);
    }

    #[test]
    fn fingerprint_handles_non_ascii_sid() {
        // Sids come straight from the request body; multibyte input must not
        // land on a char boundary error.
        let fp = cooldown_fingerprint("+13129990000", "€€a", "hello");
        assert!(fp.ends_with("_hello"));
        assert_eq!(
            cooldown_fingerprint("+13129990000", "日本語のsid", "hi"),
            cooldown_fingerprint("+13129990000", "x日本語のsid", "hi"),
        );
    }

    #[tokio::test]
    async fn missing_inputs_fail_before_side_effects() {
        let state = test_state();
        let err = call_third_party(
            &state,
            ThirdPartyRequest {
                phone: String::new(),
                message: "hi".to_string(),
                room_id: None,
                call_sid: None,
                from_phone: None,
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err, BridgeError::MissingPhone);

        let err = call_third_party(
            &state,
            ThirdPartyRequest {
                phone: "3129990000".to_string(),
                message: "   ".to_string(),
                room_id: None,
                call_sid: None,
                from_phone: None,
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err, BridgeError::MissingMessage);
    }

    #[tokio::test]
    async fn oversized_message_is_rejected() {
        let state = test_state();
        let err = call_third_party(
            &state,
            ThirdPartyRequest {
                phone: "3129990000".to_string(),
                message: "x".repeat(801),
                room_id: None,
                call_sid: Some("CA123".to_string()),
                from_phone: None,
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, BridgeError::MessageTooLong { got: 801, max: 800 }));
    }

    #[tokio::test]
    async fn unresolvable_caller_rejects_with_no_side_effects() {
        let state = test_state();
        let err = call_third_party(
            &state,
            ThirdPartyRequest {
                phone: "3129990000".to_string(),
                message: "Table confirmed for 7pm".to_string(),
                room_id: Some("unknown-room".to_string()),
                call_sid: None,
                from_phone: None,
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err, BridgeError::NoActiveCall);

        // No cooldown record was stamped for the attempt.
        let fp = cooldown_fingerprint("+13129990000", "", "Table confirmed for 7pm");
        assert!(state.store.get(&cooldown_key(&fp)).await.is_none());
    }

    #[tokio::test]
    async fn bridge_sets_up_session_and_conference() {
        let state = test_state();
        state
            .registry
            .persist_active_call("phone:+13312998167", "CA123", "+13312998167")
            .await;

        let outcome = call_third_party(
            &state,
            ThirdPartyRequest {
                phone: "3129990000".to_string(),
                message: "Table confirmed for 7pm".to_string(),
                room_id: Some("phone:+13312998167".to_string()),
                call_sid: None,
                from_phone: None,
            },
        )
        .await
        .unwrap();

        assert_eq!(outcome.caller_call_sid, "CA123");
        assert_eq!(outcome.conf_name, "bridge_phone__13312998167");
        // Unconfigured carrier client: redirect declined, dial skipped.
        assert!(!outcome.steps.caller_redirected);
        assert_eq!(outcome.mode, RelayMode::MessageOnly);
        assert!(outcome.third_party_sid.is_none());

        let session = relay::load_session(&state.store, &outcome.session_id)
            .await
            .unwrap();
        assert_eq!(session.message, "Table confirmed for 7pm");
        assert_eq!(session.status, RelayStatus::Pending);
        assert_eq!(session.room_id, "phone:+13312998167");
    }

    #[tokio::test]
    async fn repeat_within_cooldown_is_rate_limited() {
        let state = test_state();
        state
            .registry
            .persist_active_call("roomA", "CA123", "+13312998167")
            .await;

        let req = ThirdPartyRequest {
            phone: "3129990000".to_string(),
            message: "Table confirmed for 7pm".to_string(),
            room_id: Some("roomA".to_string()),
            call_sid: None,
            from_phone: None,
        };

        call_third_party(&state, req.clone()).await.unwrap();

        // Pretend the first attempt happened 2 seconds ago.
        let fp = cooldown_fingerprint("+13129990000", "CA123", "Table confirmed for 7pm");
        state
            .store
            .set_json(
                &cooldown_key(&fp),
                &CooldownRecord {
                    at: Utc::now() - chrono::Duration::seconds(2),
                },
            )
            .await;

        match call_third_party(&state, req.clone()).await.unwrap_err() {
            BridgeError::RateLimited { remaining_secs } => {
                assert!((9..=10).contains(&remaining_secs), "{remaining_secs}");
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }

        // Once the window has elapsed, an identical request goes through.
        state
            .store
            .set_json(
                &cooldown_key(&fp),
                &CooldownRecord {
                    at: Utc::now() - chrono::Duration::seconds(13),
                },
            )
            .await;
        assert!(call_third_party(&state, req).await.is_ok());
    }

    #[tokio::test]
    async fn concurrent_first_requests_tolerate_last_write_wins() {
        // The cooldown check is read-then-write with no lock: both of two
        // near-simultaneous first requests may pass. The guard only promises
        // a record exists afterwards, not strict exclusion.
        let state = test_state();
        state
            .registry
            .persist_active_call("roomA", "CA123", "+13312998167")
            .await;

        let req = ThirdPartyRequest {
            phone: "3129990000".to_string(),
            message: "ping".to_string(),
            room_id: Some("roomA".to_string()),
            call_sid: None,
            from_phone: None,
        };
        let (a, b) = tokio::join!(
            call_third_party(&state, req.clone()),
            call_third_party(&state, req.clone())
        );
        let successes = [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count();
        assert!(successes >= 1);

        let fp = cooldown_fingerprint("+13129990000", "CA123", "ping");
        assert!(state.store.get(&cooldown_key(&fp)).await.is_some());
    }
}
