//! Ukiyo Cache System
//!
//! Two stores sit between the HTTP surface and the upstream:
//!
//! - **Metadata cache**: TTL-bounded upstream JSON documents (board list,
//!   catalogs, threads), coalesced per key, with stale fallback on outages.
//! - **Image cache**: on-disk media in two tiers (long-lived thumbnails,
//!   size-capped full images) with an in-memory record index.
//!
//! The [`CacheJanitor`] owns eviction: a periodic age pass plus an LRU size
//! pass driven by the image cache's capacity signal.

mod images;
mod janitor;
mod metadata;

pub use images::{ImageCache, ImageError, ImageRecord, ImageStats};
pub use janitor::{CacheJanitor, JanitorHandle, SweepReport};
pub use metadata::{MetadataCache, MetadataStats};
