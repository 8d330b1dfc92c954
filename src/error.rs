//! Error types for modelwright

use thiserror::Error;

/// Main error type for modelwright operations
#[derive(Error, Debug)]
pub enum Error {
    /// Finetuning was requested without a GPU-capable device
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Caller-supplied inputs violate a precondition (e.g. mismatched list lengths)
    #[error("Precondition violated: {0}")]
    Precondition(String),

    /// The model variant does not support the requested operation
    #[error("Unsupported operation: {message}, try: {}", .supported.join(", "))]
    UnsupportedOperation {
        /// What was attempted
        message: String,
        /// Variants that do support the operation
        supported: Vec<String>,
    },

    /// The remote inference API answered with an error message
    #[error("Failed to make API request: {0}")]
    RemoteApi(String),

    /// The training or inference delegate failed during a finetune phase
    #[error("Delegate error during {phase}: {source}")]
    Delegate {
        /// Lifecycle phase that was running
        phase: String,
        /// Underlying failure
        #[source]
        source: Box<Error>,
    },

    /// Model or tokenizer loader failed
    #[error("Initialization error: {0}")]
    Initialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Tokenizer error
    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource exhausted
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Tensor operation error
    #[error("Tensor operation error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Other errors
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for modelwright operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a device unavailable error
    pub fn device_unavailable(msg: impl Into<String>) -> Self {
        Self::DeviceUnavailable(msg.into())
    }

    /// Create a precondition error
    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::Precondition(msg.into())
    }

    /// Create an unsupported operation error listing the variants that do support it
    pub fn unsupported<S: AsRef<str>>(msg: impl Into<String>, supported: &[S]) -> Self {
        Self::UnsupportedOperation {
            message: msg.into(),
            supported: supported.iter().map(|s| s.as_ref().to_string()).collect(),
        }
    }

    /// Create a remote API error
    pub fn remote_api(msg: impl Into<String>) -> Self {
        Self::RemoteApi(msg.into())
    }

    /// Wrap a failure raised inside a lifecycle phase
    pub fn delegate(phase: impl Into<String>, source: Error) -> Self {
        Self::Delegate {
            phase: phase.into(),
            source: Box::new(source),
        }
    }

    /// Create an initialization error
    pub fn initialization(msg: impl Into<String>) -> Self {
        Self::Initialization(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a tokenizer error
    pub fn tokenizer(msg: impl Into<String>) -> Self {
        Self::Tokenizer(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a resource exhausted error
    pub fn resource_exhausted(msg: impl Into<String>) -> Self {
        Self::ResourceExhausted(msg.into())
    }

    /// Whether this error reports a device allocation failure.
    ///
    /// The batch-size probe treats these as "does not fit" rather than fatal.
    pub fn is_out_of_memory(&self) -> bool {
        match self {
            Self::ResourceExhausted(_) => true,
            Self::Delegate { source, .. } => source.is_out_of_memory(),
            Self::Tensor(e) => {
                let msg = e.to_string().to_lowercase();
                msg.contains("out of memory") || msg.contains("out_of_memory")
            }
            _ => false,
        }
    }
}
