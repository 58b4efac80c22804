//! Per-board keyword filters for catalog views.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::warn;

use crate::domain::models::{CatalogThread, strip_html};

use super::error::StoreError;

/// Which text a filter inspects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterField {
    #[default]
    Subject,
    Comment,
    Both,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Filter {
    pub id: u64,
    pub keyword: String,
    #[serde(default)]
    pub field: FilterField,
    #[serde(default)]
    pub case_sensitive: bool,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewFilter {
    pub keyword: String,
    #[serde(default)]
    pub field: FilterField,
    #[serde(default)]
    pub case_sensitive: bool,
}

impl Filter {
    fn matches(&self, thread: &CatalogThread) -> bool {
        if !self.enabled || self.keyword.is_empty() {
            return false;
        }

        // Keywords match the text a reader sees, not the markup.
        let subject = strip_html(thread.sub.as_deref().unwrap_or(""));
        let comment = strip_html(thread.com.as_deref().unwrap_or(""));
        let haystack = match self.field {
            FilterField::Subject => subject,
            FilterField::Comment => comment,
            FilterField::Both => format!("{subject} {comment}"),
        };

        if self.case_sensitive {
            haystack.contains(&self.keyword)
        } else {
            haystack
                .to_lowercase()
                .contains(&self.keyword.to_lowercase())
        }
    }
}

/// JSON-file-backed filter collection, keyed by board.
pub struct FilterStore {
    path: PathBuf,
    state: Mutex<HashMap<String, Vec<Filter>>>,
}

impl FilterStore {
    /// Load existing filters; a missing or unreadable file starts empty.
    pub async fn open(path: PathBuf) -> Self {
        let state = match fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(filters) => filters,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "Discarding unreadable filter file");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        Self {
            path,
            state: Mutex::new(state),
        }
    }

    pub async fn for_board(&self, board: &str) -> Vec<Filter> {
        self.state
            .lock()
            .await
            .get(board)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn add(&self, board: &str, new: NewFilter) -> Result<Filter, StoreError> {
        let mut state = self.state.lock().await;
        let filters = state.entry(board.to_string()).or_default();
        let id = filters.iter().map(|f| f.id + 1).max().unwrap_or(0);
        let filter = Filter {
            id,
            keyword: new.keyword,
            field: new.field,
            case_sensitive: new.case_sensitive,
            enabled: true,
        };
        filters.push(filter.clone());
        self.persist(&state).await?;
        Ok(filter)
    }

    /// Returns false when no filter with that id exists for the board.
    pub async fn remove(&self, board: &str, id: u64) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let Some(filters) = state.get_mut(board) else {
            return Ok(false);
        };
        let before = filters.len();
        filters.retain(|filter| filter.id != id);
        let removed = filters.len() != before;
        if removed {
            self.persist(&state).await?;
        }
        Ok(removed)
    }

    pub async fn toggle(&self, board: &str, id: u64) -> Result<Option<Filter>, StoreError> {
        let mut state = self.state.lock().await;
        let Some(filter) = state
            .get_mut(board)
            .and_then(|filters| filters.iter_mut().find(|filter| filter.id == id))
        else {
            return Ok(None);
        };
        filter.enabled = !filter.enabled;
        let toggled = filter.clone();
        self.persist(&state).await?;
        Ok(Some(toggled))
    }

    /// Drop threads matched by any enabled filter for the board.
    pub async fn apply(&self, board: &str, threads: Vec<CatalogThread>) -> Vec<CatalogThread> {
        let filters = self.for_board(board).await;
        if filters.is_empty() {
            return threads;
        }
        threads
            .into_iter()
            .filter(|thread| !filters.iter().any(|filter| filter.matches(thread)))
            .collect()
    }

    async fn persist(&self, state: &HashMap<String, Vec<Filter>>) -> Result<(), StoreError> {
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

    fn thread(no: u64, sub: Option<&str>, com: Option<&str>) -> CatalogThread {
        serde_json::from_value(serde_json::json!({
            "no": no,
            "sub": sub,
            "com": com,
        }))
        .unwrap()
    }

    async fn store() -> (tempfile::TempDir, FilterStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FilterStore::open(dir.path().join("filters.json")).await;
        (dir, store)
    }

    #[tokio::test]
    async fn matching_threads_are_hidden() {
        let (_dir, store) = store().await;
        store
            .add(
                "g",
                NewFilter {
                    keyword: "crypto".to_string(),
                    field: FilterField::Both,
                    case_sensitive: false,
                },
            )
            .await
            .unwrap();

        let threads = vec![
            thread(1, Some("CRYPTO general"), None),
            thread(2, None, Some("talk about crypto here")),
            thread(3, Some("rust thread"), Some("systems programming")),
        ];
        let kept = store.apply("g", threads).await;

        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].no, 3);
    }

    #[tokio::test]
    async fn keywords_match_across_markup() {
        let (_dir, store) = store().await;
        store
            .add(
                "g",
                NewFilter {
                    keyword: "crypto".to_string(),
                    field: FilterField::Comment,
                    case_sensitive: false,
                },
            )
            .await
            .unwrap();

        let kept = store
            .apply("g", vec![thread(1, None, Some("cry<wbr>pto general"))])
            .await;
        assert!(kept.is_empty());
    }

    #[tokio::test]
    async fn disabled_filters_do_not_hide() {
        let (_dir, store) = store().await;
        let filter = store
            .add(
                "g",
                NewFilter {
                    keyword: "hidden".to_string(),
                    ..NewFilter::default()
                },
            )
            .await
            .unwrap();
        store.toggle("g", filter.id).await.unwrap();

        let kept = store
            .apply("g", vec![thread(1, Some("hidden gem"), None)])
            .await;
        assert_eq!(kept.len(), 1);
    }

    #[tokio::test]
    async fn filters_are_scoped_to_their_board() {
        let (_dir, store) = store().await;
        store
            .add(
                "g",
                NewFilter {
                    keyword: "spam".to_string(),
                    ..NewFilter::default()
                },
            )
            .await
            .unwrap();

        let kept = store
            .apply("wg", vec![thread(1, Some("spam wallpapers"), None)])
            .await;
        assert_eq!(kept.len(), 1);
    }

    #[tokio::test]
    async fn filters_survive_reopening() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("filters.json");
        {
            let store = FilterStore::open(path.clone()).await;
            store
                .add(
                    "g",
                    NewFilter {
                        keyword: "persisted".to_string(),
                        ..NewFilter::default()
                    },
                )
                .await
                .unwrap();
        }

        let reopened = FilterStore::open(path).await;
        let filters = reopened.for_board("g").await;
        assert_eq!(filters.len(), 1);
        assert_eq!(filters[0].keyword, "persisted");
    }

    #[tokio::test]
    async fn ids_are_not_reused_after_removal() {
        let (_dir, store) = store().await;
        let first = store
            .add("g", NewFilter { keyword: "a".into(), ..NewFilter::default() })
            .await
            .unwrap();
        let second = store
            .add("g", NewFilter { keyword: "b".into(), ..NewFilter::default() })
            .await
            .unwrap();
        assert!(store.remove("g", first.id).await.unwrap());

        let third = store
            .add("g", NewFilter { keyword: "c".into(), ..NewFilter::default() })
            .await
            .unwrap();
        assert_ne!(third.id, second.id);
        assert!(!store.remove("g", 999).await.unwrap());
    }
}
