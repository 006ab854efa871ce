//! HTTP gateway: the request pipeline in front of the worker pool.
//!
//! - [`proxy`]: the `POST /run` handler — admission, allocation, signed
//!   delegation, retry-aware replay and the streaming proxy itself.
//! - [`rate_limit`]: per-source token buckets with TTL eviction.

pub mod proxy;
pub mod rate_limit;
