use thiserror::Error;

/// Node error types for time synchronization, transport and storage faults.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum NodeError {
    /// A sync value arrived without an outstanding time request.
    #[error("no time request outstanding, sync value {unix_time_us}us discarded")]
    NoPendingRequest {
        /// The rejected UNIX time in microseconds.
        unix_time_us: u64,
    },

    /// The outbound transport buffer is full.
    #[error("outbound buffer full, message dropped")]
    TransportFull,

    /// The persistent store rejected a write.
    #[error("persistent store error: {0}")]
    Store(String),
}

/// Convenience type alias for node operations.
pub type NodeResult<T> = Result<T, NodeError>;
