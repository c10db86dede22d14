use std::sync::Arc;
use std::time::Duration;

use tower::Layer;

use gate_limit::Limiter;

use crate::service::GateService;

/// Applies a [`Limiter`] admission gate to requests.
#[derive(Clone, Debug)]
pub struct GateLayer {
    limiter: Arc<Limiter>,
    fail_fast: bool,
    timeout: Option<Duration>,
}

impl GateLayer {
    /// Create a GateLayer sharing `limiter` across all gated services.
    pub fn new(limiter: Arc<Limiter>) -> Self {
        GateLayer {
            limiter,
            fail_fast: false,
            timeout: None,
        }
    }

    /// Set whether gated services should fail immediately when throttled
    /// instead of queueing for capacity.
    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    /// Set a unified budget for queue wait plus request execution.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl<S> Layer<S> for GateLayer {
    type Service = GateService<S>;

    fn layer(&self, service: S) -> Self::Service {
        let mut svc = GateService::new(service, Arc::clone(&self.limiter))
            .with_fail_fast(self.fail_fast);
        if let Some(timeout) = self.timeout {
            svc = svc.with_timeout(timeout);
        }
        svc
    }
}
