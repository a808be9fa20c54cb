use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Registry refresh failed; the last good snapshot stays in service
    #[error("registry unavailable: {0}")]
    RegistryUnavailable(String),

    /// Sink write failed; the event is still counted and dispatched
    #[error("persist failure: {0}")]
    PersistFailure(String),

    /// A subscriber's bounded delivery queue filled up
    #[error("subscriber {subscriber} overflowed its delivery queue at seq {seq}")]
    SubscriberOverflow { subscriber: u64, seq: u64 },

    /// Detection rejected at ingestion, never reaches the matcher
    #[error("malformed detection: {0}")]
    MalformedDetection(String),
}

pub type EngineResult<T> = Result<T, EngineError>;
