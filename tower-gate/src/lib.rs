//! # Tower Gate
//!
//! `tower-gate` embeds a [`gate_limit::Limiter`] in front of any
//! [Tower](https://github.com/tower-rs/tower) service.
//!
//! The [`GateLayer`] gates each request through the shared limiter:
//!
//! 1. **Queueing**: requests wait for capacity by default, parking on the
//!    limiter's own retry hint rather than busy-polling.
//! 2. **Fail Fast**: with [`GateLayer::with_fail_fast`], throttled requests
//!    are rejected immediately with [`GateError::RateLimited`] carrying a
//!    retry-after hint.
//! 3. **Timeouts**: with [`GateLayer::with_timeout`], the combined queue
//!    wait and request execution are bounded, failing with
//!    [`GateError::Timeout`].

mod error;
mod layer;
mod service;


pub use error::GateError;
pub use layer::GateLayer;
pub use service::GateService;
