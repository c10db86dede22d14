use std::time::Duration;

/// A duration long enough to mean "wait forever".
pub const INF_DURATION: Duration = Duration::MAX;

/// The maximum frequency of some events, expressed as events per second.
///
/// A zero `Limit` allows no events to be replenished; [`Limit::INF`] allows
/// every event, even when burst is 0.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Limit(f64);

impl Limit {
    /// The infinite rate: no limit is enforced at all.
    pub const INF: Limit = Limit(f64::INFINITY);

    /// A rate of `events_per_second` events per second.
    pub fn new(events_per_second: f64) -> Self {
        Limit(events_per_second)
    }

    /// Converts a minimum interval between events into a `Limit`.
    ///
    /// A zero interval means no minimum spacing and yields [`Limit::INF`].
    pub fn every(interval: Duration) -> Self {
        if interval.is_zero() {
            return Limit::INF;
        }
        Limit(1.0 / interval.as_secs_f64())
    }

    /// Events per second as a plain float.
    pub fn per_second(self) -> f64 {
        self.0
    }

    pub fn is_infinite(self) -> bool {
        self.0 == f64::INFINITY
    }

    pub(crate) fn is_zero(self) -> bool {
        self.0 == 0.0
    }

    /// How long it takes to accumulate `tokens` tokens at this rate.
    pub(crate) fn duration_from_tokens(self, tokens: f64) -> Duration {
        if self.0 <= 0.0 {
            return INF_DURATION;
        }
        Duration::try_from_secs_f64(tokens / self.0).unwrap_or(INF_DURATION)
    }

    /// How many tokens accumulate over `d` at this rate.
    pub(crate) fn tokens_from_duration(self, d: Duration) -> f64 {
        if self.0 <= 0.0 {
            return 0.0;
        }
        if self.0.is_infinite() {
            // 0 * inf is NaN; an infinite rate keeps the bucket full.
            return f64::INFINITY;
        }
        d.as_secs_f64() * self.0
    }
}

impl From<f64> for Limit {
    fn from(events_per_second: f64) -> Self {
        Limit::new(events_per_second)
    }
}
