//! Domain layer types and invariants.

pub mod keys;
pub mod models;
