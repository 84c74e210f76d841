//! HTTP surface: cache and rate-limit middleware and the operator router.

pub mod app;
pub mod middleware;
