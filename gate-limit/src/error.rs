/// Errors produced by the blocking wait operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WaitError {
    /// The request can never be satisfied: it asks for more units than the
    /// bucket can ever hold under a finite rate.
    ///
    /// This is a permanent rejection. Retrying the same request is pointless;
    /// the caller must either split the request or raise the burst.
    #[error("wait for {n} units exceeds the limiter's burst {burst}")]
    ExceedsBurst { n: usize, burst: usize },

    /// The required delay would exceed the caller's deadline, or the deadline
    /// had already passed when the wait was submitted.
    #[error("wait for {n} units would exceed the deadline")]
    DeadlineExceeded { n: usize },
}
