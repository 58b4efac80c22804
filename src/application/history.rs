//! Browsing history: most-recently-visited threads, newest first.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::warn;

use super::error::StoreError;

const MAX_ENTRIES: usize = 50;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub board: String,
    pub no: u64,
    pub title: String,
    #[serde(with = "time::serde::rfc3339")]
    pub visited_at: OffsetDateTime,
}

/// JSON-file-backed visit history, deduplicated per thread and capped.
pub struct HistoryStore {
    path: PathBuf,
    state: Mutex<Vec<HistoryEntry>>,
}

impl HistoryStore {
    pub async fn open(path: PathBuf) -> Self {
        let state = match fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(entries) => entries,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "Discarding unreadable history file");
                    Vec::new()
                }
            },
            Err(_) => Vec::new(),
        };
        Self {
            path,
            state: Mutex::new(state),
        }
    }

    pub async fn list(&self) -> Vec<HistoryEntry> {
        self.state.lock().await.clone()
    }

    /// Record a visit. An existing entry for the same thread moves to the
    /// front with a fresh timestamp.
    pub async fn record(&self, board: &str, no: u64, title: String) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.retain(|entry| !(entry.board == board && entry.no == no));
        state.insert(
            0,
            HistoryEntry {
                board: board.to_string(),
                no,
                title,
                visited_at: OffsetDateTime::now_utc(),
            },
        );
        state.truncate(MAX_ENTRIES);
        self.persist(&state).await
    }

    pub async fn remove(&self, board: &str, no: u64) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let before = state.len();
        state.retain(|entry| !(entry.board == board && entry.no == no));
        let removed = state.len() != before;
        if removed {
            self.persist(&state).await?;
        }
        Ok(removed)
    }

    pub async fn clear(&self) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.clear();
        self.persist(&state).await
    }

    async fn persist(&self, state: &[HistoryEntry]) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let body = serde_json::to_vec_pretty(state)?;
        fs::write(&self.path, body).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> (tempfile::TempDir, HistoryStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::open(dir.path().join("history.json")).await;
        (dir, store)
    }

    #[tokio::test]
    async fn revisits_move_to_the_front_without_duplicating() {
        let (_dir, store) = store().await;
        store.record("g", 1, "first".into()).await.unwrap();
        store.record("g", 2, "second".into()).await.unwrap();
        store.record("g", 1, "first again".into()).await.unwrap();

        let entries = store.list().await;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].no, 1);
        assert_eq!(entries[0].title, "first again");
        assert_eq!(entries[1].no, 2);
    }

    #[tokio::test]
    async fn history_is_capped() {
        let (_dir, store) = store().await;
        for no in 0..60 {
            store.record("g", no, format!("thread {no}")).await.unwrap();
        }

        let entries = store.list().await;
        assert_eq!(entries.len(), MAX_ENTRIES);
        assert_eq!(entries[0].no, 59);
    }

    #[tokio::test]
    async fn entries_survive_reopening() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        {
            let store = HistoryStore::open(path.clone()).await;
            store.record("wg", 7, "papes".into()).await.unwrap();
        }

        let reopened = HistoryStore::open(path).await;
        let entries = reopened.list().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].board, "wg");
    }

    #[tokio::test]
    async fn remove_and_clear() {
        let (_dir, store) = store().await;
        store.record("g", 1, "a".into()).await.unwrap();
        store.record("g", 2, "b".into()).await.unwrap();

        assert!(store.remove("g", 1).await.unwrap());
        assert!(!store.remove("g", 1).await.unwrap());
        assert_eq!(store.list().await.len(), 1);

        store.clear().await.unwrap();
        assert!(store.list().await.is_empty());
    }
}
