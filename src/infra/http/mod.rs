//! HTTP surface: the local mirror API.

mod api;

pub use api::{ApiState, build_router};
