//! ukiyo: a polite local mirror for an imageboard's JSON API and media.
//!
//! All upstream traffic flows through a single paced fetch client. Metadata
//! documents live in a TTL cache with per-key request coalescing and stale
//! fallback; media lives in a two-tier disk cache swept by a janitor task.

pub mod application;
pub mod cache;
pub mod config;
pub mod domain;
pub mod infra;
pub mod util;
