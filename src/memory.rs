use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::KvStore;

/// Rolling transcript of a call's conversational loop.
///
/// Keyed by call sid, capped to the most recent N turns. Never explicitly
/// deleted; an ended call simply stops being written to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallMemory {
    pub started_at: DateTime<Utc>,
    pub room_id: String,
    pub turns: Vec<Turn>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub text: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

fn memory_key(call_sid: &str) -> String {
    format!("memory:{call_sid}")
}

/// Append a turn, creating the memory record on the first one and dropping
/// the oldest turns beyond `max_turns`.
pub async fn record_turn(
    store: &KvStore,
    call_sid: &str,
    room_id: &str,
    role: Role,
    text: &str,
    max_turns: usize,
) {
    let key = memory_key(call_sid);
    let mut memory: CallMemory = store.get_json(&key).await.unwrap_or_else(|| CallMemory {
        started_at: Utc::now(),
        room_id: room_id.to_string(),
        turns: Vec::new(),
    });

    memory.turns.push(Turn {
        role,
        text: text.to_string(),
        at: Utc::now(),
    });
    if memory.turns.len() > max_turns {
        let excess = memory.turns.len() - max_turns;
        memory.turns.drain(..excess);
    }

    store.set_json(&key, &memory).await;
}

pub async fn load(store: &KvStore, call_sid: &str) -> Option<CallMemory> {
    store.get_json(&memory_key(call_sid)).await
}

/// Compact transcript digest for seeding a resumed AI session.
pub fn recent_context(memory: &CallMemory) -> String {
    memory
        .turns
        .iter()
        .map(|t| {
            let role = match t.role {
                Role::User => "caller",
                Role::Assistant => "concierge",
            };
            format!("{role}: {}", t.text)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_turn_creates_memory() {
        let store = KvStore::in_memory();
        record_turn(&store, "CA1", "roomA", Role::User, "hello", 12).await;

        let mem = load(&store, "CA1").await.unwrap();
        assert_eq!(mem.room_id, "roomA");
        assert_eq!(mem.turns.len(), 1);
        assert_eq!(mem.turns[0].role, Role::User);
        assert_eq!(mem.turns[0].text, "hello");
    }

    #[tokio::test]
    async fn window_drops_oldest_first() {
        let store = KvStore::in_memory();
        for i in 0..5 {
            record_turn(&store, "CA1", "roomA", Role::User, &format!("t{i}"), 3).await;
        }

        let mem = load(&store, "CA1").await.unwrap();
        let texts: Vec<&str> = mem.turns.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, vec!["t2", "t3", "t4"]);
    }

    #[tokio::test]
    async fn context_digest_labels_roles() {
        let store = KvStore::in_memory();
        record_turn(&store, "CA1", "roomA", Role::User, "any tables tonight?", 12).await;
        record_turn(&store, "CA1", "roomA", Role::Assistant, "Checking now.", 12).await;

        let mem = load(&store, "CA1").await.unwrap();
        let ctx = recent_context(&mem);
        assert_eq!(ctx, "caller: any tables tonight?\nconcierge: Checking now.");
    }

    #[tokio::test]
    async fn calls_do_not_share_memory() {
        let store = KvStore::in_memory();
        record_turn(&store, "CA1", "roomA", Role::User, "a", 12).await;
        record_turn(&store, "CA2", "roomB", Role::Assistant, "b", 12).await;

        assert_eq!(load(&store, "CA1").await.unwrap().turns.len(), 1);
        assert_eq!(load(&store, "CA2").await.unwrap().room_id, "roomB");
    }
}
