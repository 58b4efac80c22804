//! Two-tier disk store for upstream media.
//!
//! Thumbnails and full images live in separate tiers under the cache root.
//! The in-memory record index is the single source of truth at runtime; it is
//! rebuilt from a directory scan on startup, so only access recency is lost
//! across restarts.

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use metrics::{counter, gauge};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::fs;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, instrument, warn};

use crate::domain::keys::{ImageKey, ImageVariant, is_valid_board, parse_cached_file};
use crate::infra::upstream::{FetchError, Upstream, UpstreamUrls};

const METRIC_IMAGE_HIT: &str = "ukiyo_image_cache_hit_total";
const METRIC_IMAGE_MISS: &str = "ukiyo_image_cache_miss_total";
const METRIC_IMAGE_BYTES: &str = "ukiyo_image_cache_bytes";

const TEMP_SUFFIX: &str = ".part";

#[derive(Debug, Error)]
pub enum ImageError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("image store io failure: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct ImageRecord {
    pub key: ImageKey,
    pub size_bytes: u64,
    pub created_at: OffsetDateTime,
    pub last_accessed: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageStats {
    pub total_bytes: u64,
    pub thumb_count: u64,
    pub full_count: u64,
}

pub struct ImageCache {
    root: PathBuf,
    index: DashMap<ImageKey, ImageRecord>,
    inflight: DashMap<ImageKey, Arc<Mutex<()>>>,
    upstream: Arc<dyn Upstream>,
    urls: UpstreamUrls,
    capacity_bytes: u64,
    capacity_signal: Arc<Notify>,
}

impl ImageCache {
    /// Open the store rooted at `root`, creating both tiers and rebuilding
    /// the record index from whatever is already on disk.
    pub async fn open(
        root: PathBuf,
        upstream: Arc<dyn Upstream>,
        urls: UpstreamUrls,
        capacity_bytes: u64,
    ) -> Result<Self, ImageError> {
        for variant in [ImageVariant::Thumb, ImageVariant::Full] {
            fs::create_dir_all(root.join(variant.dir_name())).await?;
        }

        let cache = Self {
            root,
            index: DashMap::new(),
            inflight: DashMap::new(),
            upstream,
            urls,
            capacity_bytes,
            capacity_signal: Arc::new(Notify::new()),
        };
        cache.scan().await?;

        let stats = cache.stats();
        gauge!(METRIC_IMAGE_BYTES).set(stats.total_bytes as f64);
        info!(
            thumbs = stats.thumb_count,
            fulls = stats.full_count,
            total_bytes = stats.total_bytes,
            "Image cache index rebuilt from disk"
        );
        Ok(cache)
    }

    async fn scan(&self) -> Result<(), std::io::Error> {
        for variant in [ImageVariant::Thumb, ImageVariant::Full] {
            let tier = self.root.join(variant.dir_name());
            let mut boards = fs::read_dir(&tier).await?;
            while let Some(board_entry) = boards.next_entry().await? {
                if !board_entry.file_type().await?.is_dir() {
                    continue;
                }
                let board = board_entry.file_name().to_string_lossy().to_string();
                if !is_valid_board(&board) {
                    warn!(board, "Skipping unrecognized board directory during scan");
                    continue;
                }

                let mut files = fs::read_dir(board_entry.path()).await?;
                while let Some(file_entry) = files.next_entry().await? {
                    let name = file_entry.file_name().to_string_lossy().to_string();
                    if name.ends_with(TEMP_SUFFIX) {
                        // Leftover from an interrupted write.
                        let _ = fs::remove_file(file_entry.path()).await;
                        continue;
                    }
                    let Some(key) = parse_cached_file(&board, variant, &name) else {
                        debug!(board, name, "Skipping unrecognized cache file");
                        continue;
                    };

                    let metadata = file_entry.metadata().await?;
                    let stamp = metadata
                        .modified()
                        .map(OffsetDateTime::from)
                        .unwrap_or_else(|_| OffsetDateTime::now_utc());
                    self.index.insert(
                        key.clone(),
                        ImageRecord {
                            key,
                            size_bytes: metadata.len(),
                            created_at: stamp,
                            last_accessed: stamp,
                        },
                    );
                }
            }
        }
        Ok(())
    }

    /// Serve the image from disk, downloading and storing it on a miss.
    /// Returns the absolute path of the cached file.
    #[instrument(skip(self), fields(key = %key))]
    pub async fn fetch(&self, key: &ImageKey) -> Result<PathBuf, ImageError> {
        if let Some(path) = self.touch_hit(key).await {
            counter!(METRIC_IMAGE_HIT, "variant" => key.variant.dir_name()).increment(1);
            return Ok(path);
        }

        let gate = {
            let entry = self
                .inflight
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())));
            Arc::clone(entry.value())
        };

        let result = {
            let _permit = gate.lock().await;

            match self.touch_hit(key).await {
                Some(path) => {
                    counter!(METRIC_IMAGE_HIT, "variant" => key.variant.dir_name()).increment(1);
                    Ok(path)
                }
                None => {
                    counter!(METRIC_IMAGE_MISS, "variant" => key.variant.dir_name()).increment(1);
                    self.download(key).await
                }
            }
        };

        // The gate may only leave the map once no caller still holds a clone
        // of it; otherwise a late arrival would install a second gate and
        // race a queued waiter onto the same temp file.
        drop(gate);
        self.inflight
            .remove_if(key, |_, gate| Arc::strong_count(gate) == 1);
        result
    }

    async fn download(&self, key: &ImageKey) -> Result<PathBuf, ImageError> {
        let url = self.urls.image(key);
        let bytes = self.upstream.fetch(&url).await?;
        let path = self.write_atomic(key, &bytes).await?;

        let now = OffsetDateTime::now_utc();
        self.index.insert(
            key.clone(),
            ImageRecord {
                key: key.clone(),
                size_bytes: bytes.len() as u64,
                created_at: now,
                last_accessed: now,
            },
        );

        let stats = self.stats();
        gauge!(METRIC_IMAGE_BYTES).set(stats.total_bytes as f64);
        if self.full_tier_bytes() > self.capacity_bytes {
            self.capacity_signal.notify_one();
        }

        debug!(key = %key, bytes = bytes.len(), "Image stored");
        Ok(path)
    }

    /// Write through a sibling temp file and rename into place. The
    /// single-flight gate guarantees one writer per key, so the temp name
    /// cannot collide.
    async fn write_atomic(&self, key: &ImageKey, bytes: &[u8]) -> Result<PathBuf, std::io::Error> {
        let final_path = self.absolute_path(key);
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let temp_path = final_path.with_file_name(format!("{}{TEMP_SUFFIX}", key.file_name()));
        fs::write(&temp_path, bytes).await?;
        fs::rename(&temp_path, &final_path).await?;
        Ok(final_path)
    }

    /// A hit requires the file to still be on disk. Anything can delete a
    /// cache file out from under the index; a dead record is dropped so the
    /// caller falls through to a fresh download.
    async fn touch_hit(&self, key: &ImageKey) -> Option<PathBuf> {
        if !self.index.contains_key(key) {
            return None;
        }

        let path = self.absolute_path(key);
        if fs::metadata(&path).await.is_err() {
            warn!(key = %key, "Cached file vanished from disk, dropping its record");
            self.index.remove(key);
            gauge!(METRIC_IMAGE_BYTES).set(self.stats().total_bytes as f64);
            return None;
        }

        let mut record = self.index.get_mut(key)?;
        record.last_accessed = OffsetDateTime::now_utc();
        Some(path)
    }

    pub fn absolute_path(&self, key: &ImageKey) -> PathBuf {
        self.root.join(key.rel_path())
    }

    /// Remove the record and its file. A missing file is treated as success.
    pub async fn remove(&self, key: &ImageKey) -> Result<u64, ImageError> {
        let freed = self
            .index
            .remove(key)
            .map(|(_, record)| record.size_bytes)
            .unwrap_or(0);

        match fs::remove_file(self.absolute_path(key)).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(ImageError::Io(err)),
        }

        gauge!(METRIC_IMAGE_BYTES).set(self.stats().total_bytes as f64);
        Ok(freed)
    }

    /// Drop both tiers entirely and start from an empty index.
    pub async fn clear(&self) -> Result<(), ImageError> {
        self.index.clear();
        for variant in [ImageVariant::Thumb, ImageVariant::Full] {
            let tier = self.root.join(variant.dir_name());
            if fs::metadata(&tier).await.is_ok() {
                fs::remove_dir_all(&tier).await?;
            }
            fs::create_dir_all(&tier).await?;
        }
        gauge!(METRIC_IMAGE_BYTES).set(0.0);
        Ok(())
    }

    /// Whether a download currently holds the key's in-flight gate.
    pub fn is_locked(&self, key: &ImageKey) -> bool {
        self.inflight
            .get(key)
            .map(|gate| gate.try_lock().is_err())
            .unwrap_or(false)
    }

    pub fn records(&self) -> Vec<ImageRecord> {
        self.index.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn stats(&self) -> ImageStats {
        let mut stats = ImageStats {
            total_bytes: 0,
            thumb_count: 0,
            full_count: 0,
        };
        for entry in self.index.iter() {
            stats.total_bytes += entry.size_bytes;
            match entry.key.variant {
                ImageVariant::Thumb => stats.thumb_count += 1,
                ImageVariant::Full => stats.full_count += 1,
            }
        }
        stats
    }

    pub fn full_tier_bytes(&self) -> u64 {
        self.index
            .iter()
            .filter(|entry| entry.key.variant == ImageVariant::Full)
            .map(|entry| entry.size_bytes)
            .sum()
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_bytes
    }

    pub fn capacity_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.capacity_signal)
    }

    #[cfg(test)]
    pub(crate) fn backdate(&self, key: &ImageKey, created_at: OffsetDateTime, last_accessed: OffsetDateTime) {
        if let Some(mut record) = self.index.get_mut(key) {
            record.created_at = created_at;
            record.last_accessed = last_accessed;
        }
    }
}
