use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;
use std::time::Duration;

use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::metrics::Counter;
use pin_project_lite::pin_project;
use tokio::time::Instant;
use tokio::time::Sleep;
use tokio::time::Timeout;
use tokio::time::sleep;
use tokio::time::timeout;
use tower::BoxError;
use tower::Service;

use gate_limit::Limiter;

use crate::error::GateError;

#[derive(Clone, Debug)]
struct GateServiceMetrics {
    throttled: Counter<u64>,
}

/// A service that admits requests through a [`Limiter`] before handing them
/// to the inner service.
///
/// When the limiter has no capacity, `poll_ready` either fails immediately
/// with [`GateError::RateLimited`] (fail-fast mode) or parks on a sleep for
/// the limiter's retry hint and tries again.
#[derive(Debug)]
pub struct GateService<S> {
    inner: S,
    limiter: Arc<Limiter>,
    sleep: Option<Pin<Box<Sleep>>>,
    permit_acquired: bool,
    fail_fast: bool,
    timeout: Option<Duration>,
    wait_start: Option<Instant>,
    instruments: GateServiceMetrics,
}

pin_project! {
    /// A future that wraps the inner service future with a timeout.
    pub struct ResponseFuture<F> {
        #[pin]
        inner: Timeout<F>,
    }
}

impl<F, T, E> Future for ResponseFuture<F>
where
    F: Future<Output = Result<T, E>>,
    E: From<BoxError>,
{
    type Output = Result<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        match this.inner.poll(cx) {
            Poll::Ready(Ok(res)) => Poll::Ready(res),
            Poll::Ready(Err(_)) => Poll::Ready(Err(E::from(Box::new(GateError::Timeout)))),
            Poll::Pending => Poll::Pending,
        }
    }
}

// Manually implement Clone because Pin<Box<Sleep>> cannot be cloned
impl<S> Clone for GateService<S>
where
    S: Clone,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            limiter: Arc::clone(&self.limiter),
            // The clone starts with a fresh wait state
            sleep: None,
            permit_acquired: false,
            fail_fast: self.fail_fast,
            timeout: self.timeout,
            wait_start: None,
            instruments: self.instruments.clone(),
        }
    }
}

impl<S, Req> Service<Req> for GateService<S>
where
    S: Service<Req, Error = BoxError>,
    Req: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = ResponseFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // 1. If we are currently sleeping, check if we're done
        if let Some(ref mut fut) = self.sleep {
            match fut.as_mut().poll(cx) {
                Poll::Ready(_) => {
                    self.sleep = None;
                    // We woke up; the wait budget may be spent.
                    if let Some(timeout) = self.timeout
                        && let Some(start) = self.wait_start
                        && start.elapsed() >= timeout
                    {
                        self.wait_start = None;
                        return Poll::Ready(Err(Box::new(GateError::Timeout)));
                    }
                }
                Poll::Pending => return Poll::Pending,
            }
        }

        // 2. Check inner service readiness FIRST to avoid over-consuming tokens
        match self.inner.poll_ready(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Ready(Ok(())) => {}
        }

        // 3. Ask the limiter if we don't have a permit yet
        if !self.permit_acquired {
            if let Some(timeout) = self.timeout {
                let start = *self.wait_start.get_or_insert(Instant::now());
                if start.elapsed() >= timeout {
                    self.wait_start = None;
                    return Poll::Ready(Err(Box::new(GateError::Timeout)));
                }
            }

            let reservation = self.limiter.reserve();
            let retry_after = reservation.delay();
            if retry_after.is_zero() {
                self.permit_acquired = true;
            } else {
                // We only wanted the wait hint; hand the unit back so a
                // competing caller can take it while we sleep.
                reservation.cancel();

                let mode = if self.fail_fast { "fail_fast" } else { "queued" };
                self.instruments
                    .throttled
                    .add(1, &[KeyValue::new("mode", mode)]);

                if self.fail_fast {
                    return Poll::Ready(Err(Box::new(GateError::RateLimited { retry_after })));
                }

                let start = *self.wait_start.get_or_insert(Instant::now());
                let sleep_duration = if let Some(timeout) = self.timeout {
                    let remaining = timeout.saturating_sub(start.elapsed());
                    if remaining.is_zero() {
                        self.wait_start = None;
                        return Poll::Ready(Err(Box::new(GateError::Timeout)));
                    }
                    std::cmp::min(retry_after, remaining)
                } else {
                    retry_after
                };

                let mut sleep_fut = Box::pin(sleep(sleep_duration));
                match sleep_fut.as_mut().poll(cx) {
                    Poll::Pending => {
                        self.sleep = Some(sleep_fut);
                        return Poll::Pending;
                    }
                    Poll::Ready(_) => {
                        // Immediate wakeup (sleep(0) or similar)
                        cx.waker().wake_by_ref();
                        return Poll::Pending;
                    }
                }
            }
        }

        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Req) -> Self::Future {
        self.permit_acquired = false;
        let start = self.wait_start.take();
        let timeout_duration = match (self.timeout, start) {
            (Some(t), Some(s)) => t.saturating_sub(s.elapsed()),
            (Some(t), None) => t,
            (None, _) => Duration::from_secs(3600 * 24 * 365), // Effective infinity
        };

        ResponseFuture {
            inner: timeout(timeout_duration, self.inner.call(req)),
        }
    }
}

impl<S> GateService<S> {
    pub fn new(inner: S, limiter: Arc<Limiter>) -> Self {
        let meter = global::meter("gate_service");
        let instruments = GateServiceMetrics {
            throttled: meter.u64_counter("throttled").build(),
        };

        Self {
            inner,
            limiter,
            sleep: None,
            permit_acquired: false,
            fail_fast: false,
            timeout: None,
            wait_start: None,
            instruments,
        }
    }

    /// Set whether the service should fail immediately when throttled.
    ///
    /// If `true`, the service returns [`GateError::RateLimited`] with a
    /// retry hint instead of queueing for capacity.
    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    /// Set a unified budget covering both the queue wait and request
    /// execution. Exceeding it yields [`GateError::Timeout`].
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}
