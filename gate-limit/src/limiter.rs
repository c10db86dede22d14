use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Duration;

use quanta::Clock;
use quanta::Instant;

use crate::Limit;
use crate::Reservation;
use crate::WaitError;
use crate::limit::INF_DURATION;

#[derive(Debug)]
pub(crate) struct State {
    pub(crate) limit: Limit,
    pub(crate) burst: usize,
    pub(crate) tokens: f64,
    /// When `tokens` was last brought up to date.
    pub(crate) last: Instant,
    /// `time_to_act` of the most recently granted reservation. Bounds how
    /// much a cancellation may refund.
    pub(crate) last_event: Instant,
}

impl State {
    /// Computes the token count as of `now` without committing it.
    ///
    /// Returns the clamped reference time (defends against clock
    /// regressions) and the advanced count.
    pub(crate) fn advance(&self, now: Instant) -> (Instant, f64) {
        let base = if now < self.last { now } else { self.last };
        let delta = self.limit.tokens_from_duration(now.duration_since(base));
        let tokens = (self.tokens + delta).min(self.burst as f64);
        (base, tokens)
    }
}

/// A token bucket that admits callers at up to `limit` units per second,
/// with bursts of up to `burst` units.
///
/// The bucket starts full and refills continuously; checks are lazy, so no
/// background task runs. All operations lock one mutex for the duration of
/// the decision; blocking waits sleep outside the lock, after their
/// reservation is already committed.
#[derive(Debug)]
pub struct Limiter {
    clock: Clock,
    state: Mutex<State>,
}

impl Limiter {
    /// Creates a limiter admitting `limit` units per second with a burst
    /// capacity of `burst`. The bucket starts full.
    pub fn new(limit: Limit, burst: usize) -> Self {
        Self::with_clock(limit, burst, Clock::new())
    }

    /// Creates a limiter driven by the given clock. Pass a `Clock::mock()`
    /// for deterministic tests.
    pub fn with_clock(limit: Limit, burst: usize, clock: Clock) -> Self {
        let now = clock.now();
        Limiter {
            state: Mutex::new(State {
                limit,
                burst,
                tokens: burst as f64,
                last: now,
                last_event: now,
            }),
            clock,
        }
    }

    /// The current instant on this limiter's clock. Time-parameterized
    /// operations expect instants from the same clock.
    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    /// The current rate.
    pub fn limit(&self) -> Limit {
        self.state().limit
    }

    /// The current maximum burst size.
    pub fn burst(&self) -> usize {
        self.state().burst
    }

    /// Reports whether one unit may be consumed right now.
    pub fn allow(&self) -> bool {
        self.allow_n(self.clock.now(), 1)
    }

    /// Reports whether `n` units may be consumed at `now`. Never waits: the
    /// units are either available immediately or the request is refused.
    pub fn allow_n(&self, now: Instant, n: usize) -> bool {
        self.reserve_internal(now, n, Duration::ZERO).ok()
    }

    /// Reserves one unit, waiting as long as necessary.
    pub fn reserve(&self) -> Reservation<'_> {
        self.reserve_n(self.clock.now(), 1)
    }

    /// Reserves `n` units as of `now`.
    ///
    /// The returned [`Reservation`] reports whether the request can ever
    /// succeed and how long to wait before acting; an unwanted reservation
    /// may be canceled to refund its units.
    pub fn reserve_n(&self, now: Instant, n: usize) -> Reservation<'_> {
        self.reserve_internal(now, n, INF_DURATION)
    }

    /// Blocks until one unit is available.
    pub async fn wait(&self) -> Result<(), WaitError> {
        self.wait_n(1).await
    }

    /// Blocks until `n` units are available.
    ///
    /// Fails fast with [`WaitError::ExceedsBurst`] when the request can
    /// never be satisfied. Dropping the returned future mid-wait cancels the
    /// underlying reservation and refunds its units.
    pub async fn wait_n(&self, n: usize) -> Result<(), WaitError> {
        self.wait_inner(n, None).await
    }

    /// Like [`Limiter::wait_n`], but gives up with
    /// [`WaitError::DeadlineExceeded`] if the units cannot be obtained
    /// before `deadline`.
    pub async fn wait_n_until(&self, n: usize, deadline: Instant) -> Result<(), WaitError> {
        self.wait_inner(n, Some(deadline)).await
    }

    /// Changes the rate. Accrual up to now is settled under the old rate
    /// first; the new rate applies to all operations sequenced after.
    pub fn set_limit(&self, new_limit: Limit) {
        self.set_limit_at(self.clock.now(), new_limit);
    }

    pub fn set_limit_at(&self, now: Instant, new_limit: Limit) {
        let mut state = self.state();
        let (_, tokens) = state.advance(now);
        state.last = now;
        state.tokens = tokens;
        state.limit = new_limit;
    }

    /// Changes the burst capacity. Stored tokens above a lowered burst are
    /// clamped lazily, on the next advance.
    pub fn set_burst(&self, new_burst: usize) {
        self.set_burst_at(self.clock.now(), new_burst);
    }

    pub fn set_burst_at(&self, now: Instant, new_burst: usize) {
        let mut state = self.state();
        let (_, tokens) = state.advance(now);
        state.last = now;
        state.tokens = tokens;
        state.burst = new_burst;
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("limiter state poisoned")
    }

    /// The single decision routine every public operation reduces to.
    fn reserve_internal(&self, now: Instant, n: usize, max_wait: Duration) -> Reservation<'_> {
        let mut state = self.state();

        // A zero-size request consumes nothing and always succeeds.
        if n == 0 {
            return Reservation::granted(self, 0, now, state.limit);
        }

        if state.limit.is_infinite() {
            return Reservation::granted(self, n, now, state.limit);
        }

        if state.limit.is_zero() {
            // A zero rate never refills; burst is a one-time allowance
            // consumed from the burst itself.
            if state.burst >= n {
                state.burst -= n;
                return Reservation::granted(self, n, now, state.limit);
            }
            return Reservation::denied(self, now, state.limit);
        }

        let (base, tokens) = state.advance(now);
        let remaining = tokens - n as f64;
        let wait = if remaining < 0.0 {
            state.limit.duration_from_tokens(-remaining)
        } else {
            Duration::ZERO
        };

        match now.checked_add(wait) {
            Some(time_to_act) if n <= state.burst && wait <= max_wait => {
                state.last = now;
                state.tokens = remaining;
                state.last_event = time_to_act;
                Reservation::granted(self, n, time_to_act, state.limit)
            }
            _ => {
                // Keep the fractional accrual earned so far, drop the debit.
                state.last = base;
                Reservation::denied(self, now, state.limit)
            }
        }
    }

    async fn wait_inner(&self, n: usize, deadline: Option<Instant>) -> Result<(), WaitError> {
        let (limit, burst) = {
            let state = self.state();
            (state.limit, state.burst)
        };
        if n > burst && !limit.is_infinite() {
            return Err(WaitError::ExceedsBurst { n, burst });
        }

        let now = self.clock.now();
        let max_wait = match deadline {
            Some(deadline) if deadline <= now => {
                return Err(WaitError::DeadlineExceeded { n });
            }
            Some(deadline) => deadline.duration_since(now),
            None => INF_DURATION,
        };

        let r = self.reserve_internal(now, n, max_wait);
        if !r.ok() {
            return Err(WaitError::DeadlineExceeded { n });
        }
        let delay = r.delay_from(now);
        if delay.is_zero() {
            return Ok(());
        }

        // The reservation is committed; if the caller drops this future
        // before the delay elapses, refund it.
        let mut guard = CancelOnDrop {
            reservation: Some(r),
        };
        tokio::time::sleep(delay).await;
        guard.reservation.take();
        Ok(())
    }
}

struct CancelOnDrop<'a> {
    reservation: Option<Reservation<'a>>,
}

impl Drop for CancelOnDrop<'_> {
    fn drop(&mut self) {
        if let Some(r) = self.reservation.take() {
            r.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use more_asserts::assert_ge;
    use more_asserts::assert_le;

    const D: Duration = Duration::from_millis(100);

    fn mock_limiter(limit: Limit, burst: usize) -> (Limiter, Instant) {
        let (clock, mock) = Clock::mock();
        // Move off the mock epoch so instants have room on both sides.
        mock.increment(Duration::from_secs(60));
        let lim = Limiter::with_clock(limit, burst, clock);
        let t0 = lim.now();
        (lim, t0)
    }

    fn run(lim: &Limiter, t0: Instant, steps: &[(u32, usize, bool)]) {
        for (i, (ticks, n, want)) in steps.iter().enumerate() {
            let at = t0 + D * *ticks;
            assert_eq!(
                lim.allow_n(at, *n),
                *want,
                "step {i}: allow_n(t0+{ticks}d, {n})"
            );
        }
    }

    #[test]
    fn burst_of_one() {
        let (lim, t0) = mock_limiter(Limit::new(10.0), 1);
        run(
            &lim,
            t0,
            &[
                (0, 1, true),
                (0, 1, false),
                (0, 1, false),
                (1, 1, true),
                (1, 1, false),
                (1, 1, false),
                (2, 2, false), // burst is 1, so n=2 can never succeed
                (2, 1, true),
                (2, 1, false),
            ],
        );
    }

    #[test]
    fn burst_of_three() {
        let (lim, t0) = mock_limiter(Limit::new(10.0), 3);
        run(
            &lim,
            t0,
            &[
                (0, 2, true),
                (0, 2, false),
                (0, 2, false),
                (0, 1, true),
                (0, 1, false),
                (1, 4, false),
                (2, 1, true),
                (3, 1, true),
                (4, 1, true),
                (4, 1, true),
                (4, 1, false),
                (4, 1, false),
                (9, 3, true),
                (9, 0, true),
            ],
        );
    }

    #[test]
    fn oversized_requests_always_refused() {
        let (lim, t0) = mock_limiter(Limit::new(10.0), 3);
        for ticks in [0u32, 1, 10, 100] {
            assert!(!lim.allow_n(t0 + D * ticks, 4));
        }
    }

    #[test]
    fn zero_size_requests_always_succeed() {
        let (lim, t0) = mock_limiter(Limit::new(10.0), 1);
        assert!(lim.allow_n(t0, 1));
        // Bucket is empty, and even over-debited by an outstanding
        // reservation; a zero-size request still passes.
        let r = lim.reserve_n(t0, 1);
        assert!(r.ok());
        assert!(lim.allow_n(t0, 0));
    }

    #[test]
    fn zero_rate_burst_is_a_one_time_allowance() {
        let (lim, t0) = mock_limiter(Limit::new(0.0), 3);
        for i in 0..3 {
            assert!(lim.allow_n(t0, 1), "allowance unit {i}");
        }
        assert!(!lim.allow_n(t0, 1));
        // No refill, no matter how long we wait.
        assert!(!lim.allow_n(t0 + D * 10_000, 1));
        assert_eq!(lim.burst(), 0);
    }

    #[test]
    fn zero_rate_refuses_requests_beyond_remaining_allowance() {
        let (lim, t0) = mock_limiter(Limit::new(0.0), 3);
        assert!(lim.allow_n(t0, 2));
        assert!(!lim.allow_n(t0, 2));
        assert!(lim.allow_n(t0, 1));
        assert!(!lim.allow_n(t0, 1));
    }

    #[test]
    fn infinite_rate_admits_everything() {
        let (lim, t0) = mock_limiter(Limit::INF, 0);
        assert!(lim.allow_n(t0, 1_000_000));
        assert!(lim.allow_n(t0, 1_000_000));
        assert!(lim.limit().is_infinite());
    }

    #[test]
    fn negative_rate_never_refills() {
        let (lim, t0) = mock_limiter(Limit::new(-1.0), 2);
        // Starts full, drains, never recovers.
        assert!(lim.allow_n(t0, 2));
        assert!(!lim.allow_n(t0 + D * 1_000, 1));
    }

    #[test]
    fn refill_is_monotonic() {
        let (lim, t0) = mock_limiter(Limit::every(D), 5);
        assert!(lim.allow_n(t0, 5));
        for i in 1u32..=20 {
            assert!(lim.allow_n(t0 + D * i, 1), "interval {i}");
            assert!(!lim.allow_n(t0 + D * i, 1), "interval {i} double spend");
        }
    }

    #[test]
    fn set_limit_settles_accrual_under_old_rate() {
        let (lim, t0) = mock_limiter(Limit::new(10.0), 3);
        assert!(lim.allow_n(t0, 3));
        // 100ms at 10/s earns 1 token, then 100ms at 20/s earns 2 more.
        lim.set_limit_at(t0 + D, Limit::new(20.0));
        assert!(lim.allow_n(t0 + D * 2, 3));
        assert!(!lim.allow_n(t0 + D * 2, 1));
    }

    #[test]
    fn set_burst_raises_capacity_without_minting_tokens() {
        let (lim, t0) = mock_limiter(Limit::new(10.0), 1);
        assert!(!lim.allow_n(t0, 2));
        lim.set_burst_at(t0, 2);
        assert_eq!(lim.burst(), 2);
        // Only 1 token stored; the second accrues over the next interval.
        assert!(!lim.allow_n(t0, 2));
        assert!(lim.allow_n(t0 + D, 2));
    }

    #[test]
    fn clock_regression_is_clamped() {
        let (lim, t0) = mock_limiter(Limit::new(10.0), 1);
        assert!(lim.allow_n(t0 + D * 2, 1));
        // A query in the past neither panics nor finds tokens: the
        // reference time clamps to the earlier instant.
        assert!(!lim.allow_n(t0, 1));
    }

    #[tokio::test]
    async fn wait_returns_immediately_when_tokens_available() {
        let lim = Limiter::new(Limit::new(10.0), 5);
        assert_eq!(lim.wait_n(3).await, Ok(()));
    }

    #[tokio::test]
    async fn wait_exceeding_burst_fails_fast() {
        let lim = Limiter::new(Limit::new(10.0), 3);
        assert_eq!(
            lim.wait_n(10).await,
            Err(WaitError::ExceedsBurst { n: 10, burst: 3 })
        );
    }

    #[tokio::test]
    async fn wait_exceeding_burst_is_fine_at_infinite_rate() {
        let lim = Limiter::new(Limit::INF, 0);
        assert_eq!(lim.wait_n(10).await, Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_sleeps_until_refill() {
        let lim = Limiter::new(Limit::every(D), 1);
        assert_eq!(lim.wait().await, Ok(()));
        // The bucket is empty; these waits ride the refill schedule.
        assert_eq!(lim.wait().await, Ok(()));
        assert_eq!(lim.wait().await, Ok(()));
    }

    #[tokio::test]
    async fn wait_with_short_deadline_fails_without_debiting() {
        let lim = Limiter::new(Limit::every(D), 1);
        assert_eq!(lim.wait().await, Ok(()));

        let deadline = lim.now() + Duration::from_millis(10);
        assert_eq!(
            lim.wait_n_until(1, deadline).await,
            Err(WaitError::DeadlineExceeded { n: 1 })
        );

        // The failed wait must not have consumed anything: the next unit is
        // still only one refill interval away.
        let now = lim.now();
        let r = lim.reserve_n(now, 1);
        assert!(r.ok());
        assert_le!(r.delay_from(now), D + Duration::from_millis(50));
        r.cancel_at(now);
    }

    #[tokio::test]
    async fn wait_with_elapsed_deadline_fails_immediately() {
        let lim = Limiter::new(Limit::every(D), 1);
        let deadline = lim.now();
        assert_eq!(
            lim.wait_n_until(1, deadline).await,
            Err(WaitError::DeadlineExceeded { n: 1 })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_wait_refunds_its_reservation() {
        let lim = Limiter::new(Limit::every(D), 1);
        assert_eq!(lim.wait().await, Ok(()));

        // The timeout fires before the 100ms refill; dropping the wait
        // future must cancel its committed reservation.
        let waited = tokio::time::timeout(Duration::from_millis(50), lim.wait()).await;
        assert!(waited.is_err());

        // With the refund, the next unit is ~one interval away; without it,
        // the stranded debit would push this out to ~two intervals.
        let now = lim.now();
        let r = lim.reserve_n(now, 1);
        assert!(r.ok());
        let delay = r.delay_from(now);
        assert_ge!(delay, Duration::from_millis(40));
        assert_le!(delay, Duration::from_millis(150));
        r.cancel_at(now);
    }
}
