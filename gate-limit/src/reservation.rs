use std::time::Duration;

use quanta::Instant;

use crate::Limit;
use crate::Limiter;
use crate::limit::INF_DURATION;

/// A committed admission decision: whether the request was granted, and if
/// so, when the caller may act.
///
/// A granted reservation that the caller decides not to use can be canceled
/// before its `time_to_act` to refund the reserved units.
#[derive(Debug)]
pub struct Reservation<'a> {
    lim: &'a Limiter,
    ok: bool,
    tokens: usize,
    time_to_act: Instant,
    /// Rate in effect when the reservation was made. Cancellation math uses
    /// this snapshot even if the limiter is reconfigured afterwards.
    limit: Limit,
}

impl<'a> Reservation<'a> {
    pub(crate) fn granted(
        lim: &'a Limiter,
        tokens: usize,
        time_to_act: Instant,
        limit: Limit,
    ) -> Self {
        Reservation {
            lim,
            ok: true,
            tokens,
            time_to_act,
            limit,
        }
    }

    pub(crate) fn denied(lim: &'a Limiter, now: Instant, limit: Limit) -> Self {
        Reservation {
            lim,
            ok: false,
            tokens: 0,
            time_to_act: now,
            limit,
        }
    }

    /// Whether the limiter can ever satisfy this request under its burst
    /// and the caller's wait bound. A `false` reservation is permanent;
    /// waiting longer will not help.
    pub fn ok(&self) -> bool {
        self.ok
    }

    /// The earliest instant at which the caller may act.
    pub fn time_to_act(&self) -> Instant {
        self.time_to_act
    }

    /// How long the caller must wait before acting, measured from the
    /// limiter's clock.
    pub fn delay(&self) -> Duration {
        self.delay_from(self.lim.now())
    }

    /// How long the caller must wait before acting, measured from `now`.
    /// Denied reservations report [`INF_DURATION`](crate::INF_DURATION).
    pub fn delay_from(&self, now: Instant) -> Duration {
        if !self.ok {
            return INF_DURATION;
        }
        self.time_to_act.duration_since(now)
    }

    /// Refunds the reservation's units as of the limiter's current time.
    pub fn cancel(self) {
        let now = self.lim.now();
        self.cancel_at(now);
    }

    /// Refunds the reservation's units, minus any tokens already promised to
    /// reservations granted after this one. A no-op once `time_to_act` has
    /// passed, or when there is nothing left to refund.
    pub fn cancel_at(self, now: Instant) {
        if !self.ok || self.limit.is_infinite() || self.tokens == 0 {
            return;
        }

        let mut state = self.lim.state();
        if self.time_to_act < now {
            // The action window has passed; nothing to refund.
            return;
        }

        // Tokens that accrued between this reservation's time_to_act and the
        // most recent event were already promised to later reservations and
        // must not be handed back twice.
        let promised = tokens_between(self.limit, self.time_to_act, state.last_event);
        let restore = self.tokens as f64 - promised;
        if restore < 0.0 {
            return;
        }

        let (_, tokens) = state.advance(now);
        state.last = now;
        state.tokens = (tokens + restore).min(state.burst as f64);

        if self.time_to_act == state.last_event {
            // This was the most recent event; roll last_event back to just
            // before this reservation so canceling an even earlier one still
            // computes its refund correctly.
            let span = self.limit.duration_from_tokens(self.tokens as f64);
            if let Some(prev_event) = self.time_to_act.checked_sub(span)
                && prev_event >= now
            {
                state.last_event = prev_event;
            }
        }
    }
}

/// Signed token accrual from `from` to `to`; negative when `to` precedes
/// `from`.
fn tokens_between(limit: Limit, from: Instant, to: Instant) -> f64 {
    if to >= from {
        limit.tokens_from_duration(to.duration_since(from))
    } else {
        -limit.tokens_from_duration(from.duration_since(to))
    }
}
