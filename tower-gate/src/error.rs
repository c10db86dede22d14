/// Errors produced by the gate middleware.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GateError {
    /// The request was rejected because the limiter had no capacity.
    ///
    /// The duration indicates when the client should retry.
    #[error("rate limit exceeded; retry after {retry_after:?}")]
    RateLimited {
        /// The duration to wait before retrying.
        retry_after: std::time::Duration,
    },

    /// The request exceeded the maximum allowed wait, either while queued
    /// for capacity or while executing in the inner service.
    #[error("request timed out waiting for rate limit capacity")]
    Timeout,
}
