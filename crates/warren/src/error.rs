// Error types for the dispatcher and its collaborators

use thiserror::Error;

/// Result type alias for warren operations
pub type Result<T> = std::result::Result<T, WarrenError>;

/// Errors that can occur while consuming and dispatching messages
#[derive(Debug, Error)]
pub enum WarrenError {
    /// Broker unreachable or authentication failed at startup
    #[error("connect error: {0}")]
    Connect(String),

    /// Broker connection dropped mid-run; fatal to the running phase
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// Worker creation failed (resource exhaustion)
    #[error("spawn error: {0}")]
    Spawn(String),

    /// User handler reported or crashed during processing of one message
    #[error("handler failure: {0}")]
    Handler(String),

    /// Internal contract breach between dispatcher and worker unit
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Dispatcher is already running
    #[error("dispatcher is already running")]
    AlreadyRunning,

    /// Graceful drain exceeded its hard deadline
    #[error("drain deadline exceeded")]
    DrainDeadline,
}

impl WarrenError {
    /// Create a connect error
    pub fn connect(msg: impl Into<String>) -> Self {
        WarrenError::Connect(msg.into())
    }

    /// Create a connection-lost error
    pub fn connection_lost(msg: impl Into<String>) -> Self {
        WarrenError::ConnectionLost(msg.into())
    }

    /// Create a spawn error
    pub fn spawn(msg: impl Into<String>) -> Self {
        WarrenError::Spawn(msg.into())
    }

    /// Create a handler failure error
    pub fn handler(msg: impl Into<String>) -> Self {
        WarrenError::Handler(msg.into())
    }

    /// Create a protocol violation error
    pub fn protocol(msg: impl Into<String>) -> Self {
        WarrenError::Protocol(msg.into())
    }

    /// Whether this error is fatal to the running phase
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            WarrenError::Connect(_) | WarrenError::ConnectionLost(_)
        )
    }
}
