//! Cache eviction: periodic age pass plus capacity-driven LRU size pass.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use crate::cache::images::ImageCache;
use crate::cache::metadata::MetadataCache;
use crate::domain::keys::ImageVariant;

const METRIC_AGED_OUT: &str = "ukiyo_janitor_aged_out_total";
const METRIC_EVICTED: &str = "ukiyo_janitor_evicted_total";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub aged_out: usize,
    pub evicted: usize,
    pub bytes_freed: u64,
    pub metadata_purged: usize,
}

/// Owns eviction policy for both caches. Runs from a periodic task, from the
/// image cache's capacity signal, or on demand via [`CacheJanitor::sweep`].
pub struct CacheJanitor {
    images: Arc<ImageCache>,
    metadata: Arc<MetadataCache>,
    max_age: Duration,
}

impl CacheJanitor {
    pub fn new(images: Arc<ImageCache>, metadata: Arc<MetadataCache>, max_age: Duration) -> Self {
        Self {
            images,
            metadata,
            max_age,
        }
    }

    /// One full pass: expire metadata, age out old images of either variant,
    /// then evict full images in least-recently-accessed order until the
    /// tier fits its capacity. Records with a download in flight are skipped.
    #[instrument(skip(self))]
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport {
            metadata_purged: self.metadata.purge_expired(),
            ..SweepReport::default()
        };

        let cutoff = OffsetDateTime::now_utc() - self.max_age;
        for record in self.images.records() {
            if record.created_at >= cutoff || self.images.is_locked(&record.key) {
                continue;
            }
            match self.images.remove(&record.key).await {
                Ok(freed) => {
                    counter!(METRIC_AGED_OUT).increment(1);
                    report.aged_out += 1;
                    report.bytes_freed += freed;
                }
                Err(err) => warn!(key = %record.key, error = %err, "Failed to age out record"),
            }
        }

        let capacity = self.images.capacity_bytes();
        if self.images.full_tier_bytes() > capacity {
            let mut candidates: Vec<_> = self
                .images
                .records()
                .into_iter()
                .filter(|record| record.key.variant == ImageVariant::Full)
                .collect();
            candidates.sort_by_key(|record| record.last_accessed);

            for record in candidates {
                if self.images.full_tier_bytes() <= capacity {
                    break;
                }
                if self.images.is_locked(&record.key) {
                    continue;
                }
                match self.images.remove(&record.key).await {
                    Ok(freed) => {
                        counter!(METRIC_EVICTED).increment(1);
                        report.evicted += 1;
                        report.bytes_freed += freed;
                    }
                    Err(err) => warn!(key = %record.key, error = %err, "Failed to evict record"),
                }
            }
        }

        if report != SweepReport::default() {
            info!(
                aged_out = report.aged_out,
                evicted = report.evicted,
                bytes_freed = report.bytes_freed,
                metadata_purged = report.metadata_purged,
                "Cache sweep complete"
            );
        }
        report
    }

    /// Run sweeps on a cadence and whenever the image cache reports a
    /// capacity overflow, until the returned handle is stopped.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> JanitorHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let capacity_signal = self.images.capacity_signal();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // interval fires immediately; the startup sweep is not wanted.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = capacity_signal.notified() => {}
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                        continue;
                    }
                }
                self.sweep().await;
            }
            debug!("Cache janitor stopped");
        });

        JanitorHandle {
            stop: stop_tx,
            task,
        }
    }
}

/// Stop signal plus join handle for the spawned janitor task.
pub struct JanitorHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl JanitorHandle {
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use bytes::Bytes;

    use crate::config::MetadataSettings;
    use crate::domain::keys::ImageKey;
    use crate::infra::upstream::{FetchError, Upstream, UpstreamUrls};

    use super::*;

    struct FakeUpstream {
        body_len: usize,
        calls: AtomicUsize,
    }

    impl FakeUpstream {
        fn new(body_len: usize) -> Arc<Self> {
            Arc::new(Self {
                body_len,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Upstream for FakeUpstream {
        async fn fetch(&self, _url: &str) -> Result<Bytes, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Bytes::from(vec![0u8; self.body_len]))
        }
    }

    fn urls() -> UpstreamUrls {
        UpstreamUrls::new("http://api.test", "http://media.test")
    }

    fn metadata(upstream: Arc<FakeUpstream>) -> Arc<MetadataCache> {
        Arc::new(MetadataCache::new(
            upstream,
            urls(),
            MetadataSettings {
                ttl: Duration::from_secs(600),
                boards_ttl: Duration::from_secs(3_600),
                archived_ttl: Duration::from_secs(24 * 3_600),
                stale_fallback: true,
            },
        ))
    }

    async fn images(root: std::path::PathBuf, upstream: Arc<FakeUpstream>, capacity: u64) -> Arc<ImageCache> {
        Arc::new(
            ImageCache::open(root, upstream, urls(), capacity)
                .await
                .expect("cache opens"),
        )
    }

    #[tokio::test]
    async fn age_pass_removes_old_records_of_both_variants() {
        let dir = tempfile::tempdir().unwrap();
        let upstream = FakeUpstream::new(10);
        let images = images(dir.path().to_path_buf(), Arc::clone(&upstream), 10_000).await;

        let old_thumb = ImageKey::thumb("g", 1);
        let old_full = ImageKey::full("g", 2, ".jpg");
        let new_full = ImageKey::full("g", 3, ".jpg");
        for key in [&old_thumb, &old_full, &new_full] {
            images.fetch(key).await.unwrap();
        }

        let ancient = OffsetDateTime::now_utc() - Duration::from_secs(48 * 3_600);
        images.backdate(&old_thumb, ancient, ancient);
        images.backdate(&old_full, ancient, ancient);

        let janitor = CacheJanitor::new(
            Arc::clone(&images),
            metadata(Arc::clone(&upstream)),
            Duration::from_secs(24 * 3_600),
        );
        let report = janitor.sweep().await;

        assert_eq!(report.aged_out, 2);
        assert_eq!(report.evicted, 0);
        assert_eq!(report.bytes_freed, 20);
        let stats = images.stats();
        assert_eq!(stats.thumb_count, 0);
        assert_eq!(stats.full_count, 1);
        assert!(!images.absolute_path(&old_full).exists());
        assert!(images.absolute_path(&new_full).exists());
    }

    #[tokio::test]
    async fn size_pass_evicts_least_recently_accessed_fulls_only() {
        let dir = tempfile::tempdir().unwrap();
        let upstream = FakeUpstream::new(100);
        // Capacity fits two full images out of three.
        let images = images(dir.path().to_path_buf(), Arc::clone(&upstream), 250).await;

        let thumb = ImageKey::thumb("g", 9);
        let full_a = ImageKey::full("g", 1, ".jpg");
        let full_b = ImageKey::full("g", 2, ".jpg");
        let full_c = ImageKey::full("g", 3, ".jpg");
        for key in [&thumb, &full_a, &full_b, &full_c] {
            images.fetch(key).await.unwrap();
        }

        let now = OffsetDateTime::now_utc();
        images.backdate(&full_a, now, now - Duration::from_secs(30));
        images.backdate(&full_b, now, now - Duration::from_secs(300));
        images.backdate(&full_c, now, now - Duration::from_secs(3));

        let janitor = CacheJanitor::new(
            Arc::clone(&images),
            metadata(Arc::clone(&upstream)),
            Duration::from_secs(24 * 3_600),
        );
        let report = janitor.sweep().await;

        assert_eq!(report.evicted, 1);
        assert!(images.full_tier_bytes() <= 250);
        assert!(!images.absolute_path(&full_b).exists(), "coldest full evicted");
        assert!(images.absolute_path(&full_a).exists());
        assert!(images.absolute_path(&full_c).exists());
        assert!(images.absolute_path(&thumb).exists(), "thumbs are never size-evicted");
    }

    #[tokio::test]
    async fn capacity_signal_triggers_a_sweep() {
        let dir = tempfile::tempdir().unwrap();
        let upstream = FakeUpstream::new(100);
        let images = images(dir.path().to_path_buf(), Arc::clone(&upstream), 150).await;

        let janitor = Arc::new(CacheJanitor::new(
            Arc::clone(&images),
            metadata(Arc::clone(&upstream)),
            Duration::from_secs(24 * 3_600),
        ));
        let handle = janitor.spawn(Duration::from_secs(3_600));

        images.fetch(&ImageKey::full("g", 1, ".jpg")).await.unwrap();
        images.fetch(&ImageKey::full("g", 2, ".jpg")).await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while images.full_tier_bytes() > 150 {
            assert!(
                tokio::time::Instant::now() < deadline,
                "sweep did not run after capacity overflow"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        handle.stop().await;
    }

    #[tokio::test]
    async fn stop_signal_halts_the_janitor_promptly() {
        let dir = tempfile::tempdir().unwrap();
        let upstream = FakeUpstream::new(10);
        let images = images(dir.path().to_path_buf(), Arc::clone(&upstream), 1_000).await;

        let janitor = Arc::new(CacheJanitor::new(
            images,
            metadata(upstream),
            Duration::from_secs(24 * 3_600),
        ));
        let handle = janitor.spawn(Duration::from_secs(3_600));

        tokio::time::timeout(Duration::from_secs(1), handle.stop())
            .await
            .expect("janitor stops promptly");
    }
}
