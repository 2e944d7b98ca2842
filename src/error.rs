//! Main Crate Error

#[derive(thiserror::Error, Debug)]
/// Mainline bridge error enum.
pub enum Error {
    /// Malformed sizes or unsupported enumerators, rejected before reaching the engine.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The native engine returned a negative status.
    #[error("Engine fault in {operation} (status {status})")]
    EngineFault {
        /// Name of the native call that failed.
        operation: &'static str,
        /// Raw status returned by the engine.
        status: i32,
    },

    /// The random-byte source could not produce output.
    #[error("Entropy source failure: {0}")]
    EntropyFailure(String),

    /// An engine was entered from inside one of its own callbacks.
    #[error("{operation} called from inside an engine callback")]
    Reentrant {
        /// Operation that was attempted.
        operation: &'static str,
    },

    /// The native library only supports one live engine per process.
    #[error("A native engine instance is already initialized")]
    AlreadyInitialized,

    /// The actor thread is not running anymore.
    #[error("The Dht was shutdown")]
    Shutdown,

    #[error(transparent)]
    /// Transparent [std::io::Error]
    IO(#[from] std::io::Error),
}

impl Clone for Error {
    /// IO errors are cloned by kind and message only.
    fn clone(&self) -> Self {
        match self {
            Error::InvalidArgument(message) => Error::InvalidArgument(message.clone()),
            Error::EngineFault { operation, status } => Error::EngineFault {
                operation: *operation,
                status: *status,
            },
            Error::EntropyFailure(message) => Error::EntropyFailure(message.clone()),
            Error::Reentrant { operation } => Error::Reentrant {
                operation: *operation,
            },
            Error::AlreadyInitialized => Error::AlreadyInitialized,
            Error::Shutdown => Error::Shutdown,
            Error::IO(error) => Error::IO(std::io::Error::new(error.kind(), error.to_string())),
        }
    }
}

/// Alias for results returned by this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
