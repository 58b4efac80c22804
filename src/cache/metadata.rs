//! TTL cache for upstream JSON documents.
//!
//! Entries are replaced whole, misses are coalesced per key, and transient
//! upstream failures can be answered from the previous entry. `NotFound` is
//! authoritative: it removes the entry and always propagates.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use metrics::counter;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use crate::config::MetadataSettings;
use crate::domain::keys::{MetaKey, ResourceKind};
use crate::domain::models::{self, CatalogPage, Thread};
use crate::infra::upstream::{FetchError, Upstream, UpstreamUrls};

const METRIC_META_HIT: &str = "ukiyo_meta_cache_hit_total";
const METRIC_META_MISS: &str = "ukiyo_meta_cache_miss_total";
const METRIC_META_STALE: &str = "ukiyo_meta_cache_stale_served_total";

/// How long a served-stale entry counts as fresh again. During an outage the
/// upstream is re-probed at most once per window instead of on every request.
const STALE_RECHECK: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
struct MetaEntry {
    payload: Bytes,
    expires_at: OffsetDateTime,
}

impl MetaEntry {
    fn is_fresh(&self, now: OffsetDateTime) -> bool {
        now < self.expires_at
    }
}

/// Per-kind entry counts, surfaced by the stats endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataStats {
    pub boards: u64,
    pub catalogs: u64,
    pub threads: u64,
}

pub struct MetadataCache {
    entries: DashMap<MetaKey, MetaEntry>,
    inflight: DashMap<MetaKey, Arc<Mutex<()>>>,
    upstream: Arc<dyn Upstream>,
    urls: UpstreamUrls,
    settings: MetadataSettings,
}

impl MetadataCache {
    pub fn new(
        upstream: Arc<dyn Upstream>,
        urls: UpstreamUrls,
        settings: MetadataSettings,
    ) -> Self {
        Self {
            entries: DashMap::new(),
            inflight: DashMap::new(),
            upstream,
            urls,
            settings,
        }
    }

    /// Fetch-or-serve the document identified by `key`.
    #[instrument(skip(self), fields(key = %key))]
    pub async fn get(&self, key: &MetaKey) -> Result<Bytes, FetchError> {
        let now = OffsetDateTime::now_utc();
        if let Some(payload) = self.fresh_payload(key, now) {
            counter!(METRIC_META_HIT, "kind" => key.kind().as_str()).increment(1);
            return Ok(payload);
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

            // A coalesced waiter finds the entry its leader just refreshed.
            let now = OffsetDateTime::now_utc();
            match self.fresh_payload(key, now) {
                Some(payload) => {
                    counter!(METRIC_META_HIT, "kind" => key.kind().as_str()).increment(1);
                    Ok(payload)
                }
                None => {
                    counter!(METRIC_META_MISS, "kind" => key.kind().as_str()).increment(1);
                    self.refresh(key).await
                }
            }
        };

        // The gate may only leave the map once no caller still holds a clone
        // of it; otherwise a late arrival would install a second gate and
        // fetch concurrently with a queued waiter.
        drop(gate);
        self.inflight
            .remove_if(key, |_, gate| Arc::strong_count(gate) == 1);
        result
    }

    async fn refresh(&self, key: &MetaKey) -> Result<Bytes, FetchError> {
        let url = self.url_for(key);
        match self.upstream.fetch(&url).await {
            Ok(raw) => {
                let (payload, ttl) = self.normalize(key, raw)?;
                let now = OffsetDateTime::now_utc();
                self.entries.insert(
                    key.clone(),
                    MetaEntry {
                        payload: payload.clone(),
                        expires_at: now + ttl,
                    },
                );
                debug!(key = %key, ttl_secs = ttl.as_secs(), "Metadata entry refreshed");
                Ok(payload)
            }
            Err(FetchError::NotFound) => {
                // The document is gone upstream; stale copies must not outlive it.
                self.entries.remove(key);
                Err(FetchError::NotFound)
            }
            Err(err) if err.is_transient() && self.settings.stale_fallback => {
                match self.entries.get_mut(key) {
                    Some(mut entry) => {
                        counter!(METRIC_META_STALE, "kind" => key.kind().as_str()).increment(1);
                        warn!(key = %key, error = %err, "Serving stale metadata during upstream outage");
                        // Each failed refresh already paid the full retry
                        // budget; push the next probe out a little so requests
                        // inside the window serve stale without blocking.
                        entry.expires_at = OffsetDateTime::now_utc() + STALE_RECHECK;
                        Ok(entry.payload.clone())
                    }
                    None => Err(err),
                }
            }
            Err(err) => Err(err),
        }
    }

    fn normalize(&self, key: &MetaKey, raw: Bytes) -> Result<(Bytes, Duration), FetchError> {
        match key.kind() {
            ResourceKind::Boards => Ok((raw, self.settings.boards_ttl)),
            ResourceKind::Catalog => {
                let pages: Vec<CatalogPage> = serde_json::from_slice(&raw)
                    .map_err(|err| FetchError::Payload(format!("catalog decode: {err}")))?;
                let threads = models::flatten_catalog(pages);
                let payload = serde_json::to_vec(&threads)
                    .map_err(|err| FetchError::Payload(format!("catalog encode: {err}")))?;
                Ok((Bytes::from(payload), self.settings.ttl))
            }
            ResourceKind::Thread => {
                let thread: Thread = serde_json::from_slice(&raw)
                    .map_err(|err| FetchError::Payload(format!("thread decode: {err}")))?;
                let ttl = if thread.is_immutable() {
                    self.settings.archived_ttl
                } else {
                    self.settings.ttl
                };
                Ok((raw, ttl))
            }
        }
    }

    fn url_for(&self, key: &MetaKey) -> String {
        match key {
            MetaKey::Boards => self.urls.boards(),
            MetaKey::Catalog { board } => self.urls.catalog(board),
            MetaKey::Thread { board, no } => self.urls.thread(board, *no),
        }
    }

    fn fresh_payload(&self, key: &MetaKey, now: OffsetDateTime) -> Option<Bytes> {
        self.entries
            .get(key)
            .filter(|entry| entry.is_fresh(now))
            .map(|entry| entry.payload.clone())
    }

    /// Drop entries past their TTL. Stale entries are normally kept for
    /// outage fallback; the janitor calls this on its age pass so they do
    /// not accumulate forever.
    pub fn purge_expired(&self) -> usize {
        let now = OffsetDateTime::now_utc();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_fresh(now));
        before - self.entries.len()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn stats(&self) -> MetadataStats {
        let mut stats = MetadataStats {
            boards: 0,
            catalogs: 0,
            threads: 0,
        };
        for entry in self.entries.iter() {
            match entry.key().kind() {
                ResourceKind::Boards => stats.boards += 1,
                ResourceKind::Catalog => stats.catalogs += 1,
                ResourceKind::Thread => stats.threads += 1,
            }
        }
        stats
    }
}
