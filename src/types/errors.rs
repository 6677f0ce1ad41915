//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation. The
//! variants follow the kernel's propagation policy: only transport,
//! configuration and registry exhaustion failures are process-fatal, every
//! other error is turned into a protocol-visible reply or logged and dropped.

use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error enum for the kernel.
#[derive(Error, Debug)]
pub enum Error {
    /// Inbound frames failed HMAC verification or were malformed at the
    /// envelope level. The message is dropped and the loop continues.
    #[error("signature error: {0}")]
    Signature(String),

    /// A JSON frame could not be decoded. The affected channel stops being
    /// serviced because its wire state is no longer trustworthy.
    #[error("decode error: {0}")]
    Decode(String),

    /// The evaluator failed or panicked. Recovered into an `error` broadcast
    /// and an `execute_reply` with `status: error`.
    #[error("{0}")]
    Evaluation(String),

    /// Socket bind/listen/send failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Object registry id space exhausted.
    #[error("object registry exhausted: no ids left")]
    RegistryExhausted,

    /// Invalid connection file or kernel configuration.
    #[error("config error: {0}")]
    Config(String),

    /// Request content is missing a field or has the wrong shape.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// ZeroMQ errors.
    #[error("zmq error: {0}")]
    Zmq(#[from] zeromq::ZmqError),
}

impl Error {
    /// True for the errors that must terminate the process.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Transport(_) | Error::RegistryExhausted | Error::Config(_)
        )
    }

    /// Error name reported to the front-end in `ename`.
    pub fn ename(&self) -> &'static str {
        match self {
            Error::Signature(_) => "SignatureError",
            Error::Decode(_) | Error::Serialization(_) => "DecodeError",
            Error::Evaluation(_) => "ERROR",
            Error::Transport(_) | Error::Zmq(_) => "TransportError",
            Error::RegistryExhausted => "RegistryExhaustion",
            Error::Config(_) => "ConfigError",
            Error::Protocol(_) => "ProtocolError",
            Error::Io(_) => "IOError",
        }
    }
}

// Convenience constructors
impl Error {
    pub fn signature(msg: impl Into<String>) -> Self {
        Self::Signature(msg.into())
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    pub fn evaluation(msg: impl Into<String>) -> Self {
        Self::Evaluation(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }
}
