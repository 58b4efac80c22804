//! Application services layer.

pub mod error;
pub mod filters;
pub mod history;
pub mod settings;
