use thiserror::Error;

/// Error codes used on the JSON-RPC wire.
pub mod rpc_code {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    /// Custom proxy code: the key cannot cover the call cost.
    pub const INSUFFICIENT_CREDITS: i64 = -32402;
    /// Task surface: unknown task or session.
    pub const UNKNOWN_TASK: i64 = -32001;
    /// Task surface: the task is in a state that cannot be cancelled.
    pub const TASK_NOT_CANCELLABLE: i64 = -32002;
    /// Generic server-side rejection (policy, rate limit, maintenance).
    pub const SERVER_ERROR: i64 = -32000;
}

#[derive(Error, Debug, Clone)]
pub enum GateError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Insufficient credits: {0}")]
    InsufficientCredits(String),

    #[error("Policy denied: {0}")]
    PolicyDenied(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Unknown task: {0}")]
    UnknownTask(String),

    #[error("Task not cancellable: {0}")]
    TaskNotCancellable(String),

    #[error("Concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GateError {
    /// JSON-RPC error code for the wire surface.
    pub fn json_rpc_code(&self) -> i64 {
        match self {
            GateError::InvalidRequest(_) => rpc_code::INVALID_REQUEST,
            GateError::MethodNotFound(_) => rpc_code::METHOD_NOT_FOUND,
            GateError::Validation(_) => rpc_code::INVALID_PARAMS,
            GateError::InsufficientCredits(_) => rpc_code::INSUFFICIENT_CREDITS,
            GateError::UnknownTask(_) => rpc_code::UNKNOWN_TASK,
            GateError::TaskNotCancellable(_) => rpc_code::TASK_NOT_CANCELLABLE,
            GateError::PolicyDenied(_)
            | GateError::RateLimited(_)
            | GateError::Unavailable(_)
            | GateError::ConcurrencyConflict(_)
            | GateError::NotFound(_)
            | GateError::AlreadyExists(_)
            | GateError::InvalidState(_)
            | GateError::CapacityExceeded(_)
            | GateError::Unauthorized(_) => rpc_code::SERVER_ERROR,
            GateError::Upstream(_)
            | GateError::Timeout(_)
            | GateError::Io(_)
            | GateError::Serialization(_)
            | GateError::Configuration(_)
            | GateError::Internal(_) => rpc_code::INTERNAL_ERROR,
        }
    }

    /// HTTP status for the admin surface. Mirrors the error class.
    pub fn http_status(&self) -> u16 {
        match self {
            GateError::InvalidRequest(_) | GateError::Validation(_) => 400,
            GateError::Unauthorized(_) => 401,
            GateError::PolicyDenied(_) | GateError::InsufficientCredits(_) => 403,
            GateError::MethodNotFound(_)
            | GateError::NotFound(_)
            | GateError::UnknownTask(_) => 404,
            GateError::ConcurrencyConflict(_)
            | GateError::AlreadyExists(_)
            | GateError::InvalidState(_)
            | GateError::TaskNotCancellable(_) => 409,
            GateError::RateLimited(_) | GateError::CapacityExceeded(_) => 429,
            GateError::Unavailable(_) => 503,
            GateError::Upstream(_) => 502,
            GateError::Timeout(_) => 504,
            GateError::Io(_)
            | GateError::Serialization(_)
            | GateError::Configuration(_)
            | GateError::Internal(_) => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, GateError>;

// Error conversions for common error types

impl From<std::io::Error> for GateError {
    fn from(e: std::io::Error) -> Self {
        GateError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for GateError {
    fn from(e: serde_json::Error) -> Self {
        GateError::Serialization(e.to_string())
    }
}
