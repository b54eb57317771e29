use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::KvStore;

/// The call the concierge currently believes is live for a room.
///
/// Entries are best-known, not guaranteed-live: they are overwritten on every
/// new inbound leg and never deleted, so consumers must tolerate stale sids.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveCall {
    pub room_id: String,
    pub call_sid: String,
    pub from: String,
    pub updated_at: DateTime<Utc>,
}

const LAST_ACTIVE_KEY: &str = "call:active:last";

fn room_key(room_id: &str) -> String {
    format!("call:active:{room_id}")
}

/// Synthesized room id for callers we only know by phone number.
pub fn phone_room(from: &str) -> String {
    format!("phone:{from}")
}

/// Registry of active calls, keyed by room id in the KV store.
///
/// Webhook handlers are stateless and may not know the room id the agent
/// layer is using, so lookups degrade through several keys before giving up.
#[derive(Clone)]
pub struct CallRegistry {
    store: KvStore,
}

impl CallRegistry {
    pub fn new(store: KvStore) -> Self {
        Self { store }
    }

    /// Upsert the room mapping and the global last-active pointer.
    pub async fn persist_active_call(&self, room_id: &str, call_sid: &str, from: &str) {
        let entry = ActiveCall {
            room_id: room_id.to_string(),
            call_sid: call_sid.to_string(),
            from: from.to_string(),
            updated_at: Utc::now(),
        };
        tracing::info!(room_id, call_sid, from, "Active call registered");
        self.store.set_json(&room_key(room_id), &entry).await;
        self.store.set_json(LAST_ACTIVE_KEY, &entry).await;
    }

    /// Resolve the live caller leg for an orchestration request.
    ///
    /// Order: explicit call sid, room mapping, `phone:<E.164>` room derived
    /// from the caller number, then the last-active fallback. Returns `None`
    /// when nothing matches; callers treat that as a precondition failure.
    pub async fn resolve_active_call_sid(
        &self,
        call_sid: Option<&str>,
        room_id: Option<&str>,
        from_phone: Option<&str>,
    ) -> Option<String> {
        if let Some(sid) = call_sid {
            if !sid.is_empty() {
                return Some(sid.to_string());
            }
        }

        if let Some(room) = room_id {
            if let Some(entry) = self.lookup(&room_key(room)).await {
                return Some(entry.call_sid);
            }
        }

        if let Some(from) = from_phone {
            if let Some(entry) = self.lookup(&room_key(&phone_room(from))).await {
                return Some(entry.call_sid);
            }
        }

        if let Some(entry) = self.lookup(LAST_ACTIVE_KEY).await {
            tracing::debug!(call_sid = %entry.call_sid, "Resolved via last-active fallback");
            return Some(entry.call_sid);
        }

        None
    }

    async fn lookup(&self, key: &str) -> Option<ActiveCall> {
        self.store.get_json(key).await
    }
}
