//! User preference blob with default merging.

use std::path::PathBuf;

use serde_json::{Map, Value, json};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::warn;

use super::error::StoreError;

fn default_settings() -> Map<String, Value> {
    let defaults = json!({
        "theme": "dark",
        "autoRefresh": false,
        "refreshInterval": 60,
        "showStickyThreads": true,
        "maxThreadsPerPage": 50,
        "imageHoverPreview": true,
        "compactView": false,
        "quickBoards": ["g", "wg", "v", "tv", "x"],
    });
    match defaults {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// JSON-file-backed user settings. Reads merge stored values over the
/// defaults, so new keys appear without migration.
pub struct SettingsStore {
    path: PathBuf,
    state: Mutex<Map<String, Value>>,
}

impl SettingsStore {
    pub async fn open(path: PathBuf) -> Self {
        let state = match fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<Map<String, Value>>(&bytes) {
                Ok(map) => map,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "Discarding unreadable settings file");
                    Map::new()
                }
            },
            Err(_) => Map::new(),
        };
        Self {
            path,
            state: Mutex::new(state),
        }
    }

    pub async fn get(&self) -> Map<String, Value> {
        let mut merged = default_settings();
        for (key, value) in self.state.lock().await.iter() {
            merged.insert(key.clone(), value.clone());
        }
        merged
    }

    /// Replace stored settings with the provided object.
    pub async fn save(&self, settings: Map<String, Value>) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        *state = settings;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let body = serde_json::to_vec_pretty(&*state)?;
        fs::write(&self.path, body).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn defaults_are_merged_under_saved_values() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::open(dir.path().join("settings.json")).await;

        let mut update = Map::new();
        update.insert("theme".to_string(), json!("light"));
        store.save(update).await.unwrap();

        let merged = store.get().await;
        assert_eq!(merged["theme"], json!("light"));
        assert_eq!(merged["autoRefresh"], json!(false));
    }

    #[tokio::test]
    async fn settings_survive_reopening() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        {
            let store = SettingsStore::open(path.clone()).await;
            let mut update = Map::new();
            update.insert("compactView".to_string(), json!(true));
            store.save(update).await.unwrap();
        }

        let reopened = SettingsStore::open(path).await;
        assert_eq!(reopened.get().await["compactView"], json!(true));
    }
}
