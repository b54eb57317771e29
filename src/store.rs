use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;

/// Best-effort JSON key-value store shared across stateless webhook handlers.
///
/// Values live in a process-local map and are mirrored to one JSON file per
/// key when a backing directory is configured. Reads prefer the in-memory
/// copy and fall back to the file. Writes to the file are best-effort: a
/// failed write is logged and the in-memory value stands, so callers must
/// never assume durability across process restarts.
#[derive(Clone)]
pub struct KvStore {
    dir: Option<PathBuf>,
    mem: Arc<Mutex<HashMap<String, Value>>>,
}

impl KvStore {
    /// Open a store backed by `dir`, falling back to memory-only if the
    /// directory cannot be created.
    pub fn open(dir: &str) -> Self {
        if dir.is_empty() {
            tracing::info!("KV store: memory-only (no directory configured)");
            return Self::in_memory();
        }

        let path = PathBuf::from(dir);
        match std::fs::create_dir_all(&path) {
            Ok(()) => {
                tracing::info!(dir = %path.display(), "KV store: file-backed");
                Self {
                    dir: Some(path),
                    mem: Arc::new(Mutex::new(HashMap::new())),
                }
            }
            Err(e) => {
                tracing::warn!(dir = %path.display(), "KV store directory unavailable, memory-only: {e}");
                Self::in_memory()
            }
        }
    }

    pub fn in_memory() -> Self {
        Self {
            dir: None,
            mem: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        if let Some(v) = self.mem.lock().await.get(key) {
            return Some(v.clone());
        }

        // Cold read from the backing file (e.g. after a restart)
        let path = self.key_path(key)?;
        let bytes = tokio::fs::read(&path).await.ok()?;
        let value: Value = serde_json::from_slice(&bytes).ok()?;
        self.mem
            .lock()
            .await
            .insert(key.to_string(), value.clone());
        Some(value)
    }

    pub async fn set(&self, key: &str, value: Value) {
        self.mem
            .lock()
            .await
            .insert(key.to_string(), value.clone());

        if let Some(path) = self.key_path(key) {
            match serde_json::to_vec_pretty(&value) {
                Ok(bytes) => {
                    if let Err(e) = tokio::fs::write(&path, bytes).await {
                        tracing::warn!(key, "KV file write failed, in-memory only: {e}");
                    }
                }
                Err(e) => tracing::warn!(key, "KV value not serializable: {e}"),
            }
        }
    }

    /// Typed read. A value that fails to deserialize is treated as absent.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.get(key).await?;
        match serde_json::from_value(value) {
            Ok(t) => Some(t),
            Err(e) => {
                tracing::warn!(key, "KV value has unexpected shape: {e}");
                None
            }
        }
    }

    /// Typed write.
    pub async fn set_json<T: Serialize>(&self, key: &str, value: &T) {
        match serde_json::to_value(value) {
            Ok(v) => self.set(key, v).await,
            Err(e) => tracing::warn!(key, "KV value not serializable: {e}"),
        }
    }

    fn key_path(&self, key: &str) -> Option<PathBuf> {
        let dir = self.dir.as_ref()?;
        Some(dir.join(format!("{}.json", safe_filename(key))))
    }
}

/// Map a KV key to a filesystem-safe name.
fn safe_filename(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
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
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Probe {
        n: u32,
        label: String,
    }

    #[tokio::test]
    async fn set_then_get_roundtrips() {
        let store = KvStore::in_memory();
        store
            .set_json(
                "probe:a",
                &Probe {
                    n: 7,
                    label: "x".to_string(),
                },
            )
            .await;

        let got: Option<Probe> = store.get_json("probe:a").await;
        assert_eq!(
            got,
            Some(Probe {
                n: 7,
                label: "x".to_string()
            })
        );
    }

    #[tokio::test]
    async fn missing_key_is_none() {
        let store = KvStore::in_memory();
        assert!(store.get("nope").await.is_none());
    }

    #[tokio::test]
    async fn overwrite_wins() {
        let store = KvStore::in_memory();
        store.set("k", serde_json::json!({"v": 1})).await;
        store.set("k", serde_json::json!({"v": 2})).await;
        assert_eq!(store.get("k").await.unwrap()["v"], 2);
    }

    #[tokio::test]
    async fn file_backed_survives_memory_loss() {
        let dir = std::env::temp_dir().join(format!("relay-kv-test-{}", rand_suffix()));
        let store = KvStore::open(dir.to_str().unwrap());
        store.set("call:active:room1", serde_json::json!({"sid": "CA1"})).await;

        // A fresh store over the same directory simulates a process restart.
        let reopened = KvStore::open(dir.to_str().unwrap());
        let got = reopened.get("call:active:room1").await.unwrap();
        assert_eq!(got["sid"], "CA1");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn unusable_directory_degrades_to_memory() {
        // A path under a regular file cannot be created as a directory.
        let file = std::env::temp_dir().join(format!("relay-kv-file-{}", rand_suffix()));
        std::fs::write(&file, b"x").unwrap();
        let bad_dir = file.join("sub");

        let store = KvStore::open(bad_dir.to_str().unwrap());
        store.set("k", serde_json::json!(1)).await;
        assert_eq!(store.get("k").await.unwrap(), serde_json::json!(1));

        let _ = std::fs::remove_file(&file);
    }

    #[test]
    fn filenames_are_sanitized() {
        assert_eq!(
            safe_filename("call:active:phone:+13312998167"),
            "call_active_phone__13312998167"
        );
        assert_eq!(safe_filename("plain-key.v2"), "plain-key.v2");
    }

    fn rand_suffix() -> u32 {
        rand::random()
    }
}
