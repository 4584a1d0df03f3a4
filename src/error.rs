//! Error taxonomy for the call pipeline.

use thiserror::Error;

/// Failures surfaced by the capture, playback, transport and call layers.
///
/// Device- and transport-layer code works with `anyhow::Result` internally and
/// converts into one of these at the component boundary.
#[derive(Debug, Error)]
pub enum CallError {
    /// Microphone access is not granted
    #[error("microphone permission denied")]
    PermissionDenied,

    /// Capture or playback device could not be opened at the requested config
    #[error("audio device init failed: {0}")]
    DeviceInit(String),

    /// Steady-state device error that ends the current call
    #[error("audio device error: {0}")]
    Device(String),

    /// Connect timeout, TLS failure or mid-call disconnect
    #[error("transport failure: {0}")]
    Transport(String),

    /// A text payload from the server could not be parsed
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// No destination address has been configured
    #[error("server URL is not configured")]
    NotConfigured,

    /// The configured destination is not a usable ws:// or wss:// URL
    #[error("invalid server URL '{url}': {reason}")]
    InvalidDestination { url: String, reason: String },

    /// A session is already running on this component
    #[error("{0} is already running")]
    AlreadyActive(&'static str),

    /// Persisted settings could not be read or written
    #[error("settings error: {0}")]
    Settings(String),
}

impl CallError {
    /// Whether this error ends an active call.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        !matches!(self, Self::MalformedMessage(_))
    }
}

pub type Result<T> = std::result::Result<T, CallError>;
