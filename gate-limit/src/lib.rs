//! # gate-limit
//!
//! `gate-limit` provides admission control for a shared, rate-constrained
//! resource: callers ask to consume N units of capacity, and a continuously
//! refilling token bucket decides to admit immediately, admit after a
//! computed delay, or refuse.
//!
//! ## Key Concepts
//!
//! * **Lazy Refill**: tokens accrue as a function of elapsed time at the
//!   moment of each request; there are no background threads or timers.
//! * **Reservations**: every decision is a [`Reservation`] describing when
//!   the caller may act. Unused reservations can be canceled to hand their
//!   units back.
//! * **One Lock**: all state lives behind a single mutex; blocking waits
//!   sleep outside of it, after their reservation is committed.
//!
//! ## Choosing an operation
//!
//! * [`Limiter::allow`]: admit now or refuse; never blocks. Suits request
//!   guarding where excess traffic should be dropped.
//! * [`Limiter::reserve`]: returns the delay to wait; suits callers that
//!   can schedule work for later.
//! * [`Limiter::wait`]: sleeps until admission; suits throttling outgoing
//!   calls.
//!
//! ## Example
//!
//! ```rust
//! use gate_limit::Limit;
//! use gate_limit::Limiter;
//!
//! // 10 units per second, bursts of up to 5.
//! let lim = Limiter::new(Limit::new(10.0), 5);
//!
//! if lim.allow() {
//!     // admitted
//! }
//!
//! let r = lim.reserve();
//! if r.ok() {
//!     // act after r.delay(), or hand the unit back:
//!     r.cancel();
//! }
//! ```

mod error;
mod limit;
mod limiter;
mod reservation;

pub use error::WaitError;
pub use limit::INF_DURATION;
pub use limit::Limit;
pub use limiter::Limiter;
pub use quanta::Instant;
pub use reservation::Reservation;
