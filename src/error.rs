//! Error taxonomy for the voice-interaction controller.

use std::fmt;

use thiserror::Error;

use crate::controller::InteractionState;

/// Device capability the controller depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Capture,
    Playback,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Capture => write!(f, "Speech recognition"),
            Self::Playback => write!(f, "Speech synthesis"),
        }
    }
}

/// Errors shown to the user until the next successful command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InteractionError {
    #[error("{0} not supported on this system!")]
    CapabilityUnavailable(Capability),

    /// Device-reported error code (e.g. `no-speech`).
    #[error("Speech recognition error: {0}")]
    CaptureFailure(String),
}

/// Completion request failures. Never shown raw; the controller turns
/// both kinds into the same apology message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompletionError {
    #[error("completion endpoint rejected the credential")]
    Unauthorized,

    #[error("completion request failed: {0}")]
    TransientFailure(String),
}

/// Why a command was not accepted. Returned to the caller, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejected {
    #[error("busy ({0})")]
    Busy(InteractionState),

    #[error("not capturing")]
    NotCapturing,

    #[error("empty text")]
    EmptyText,

    #[error("{0} unavailable")]
    CapabilityUnavailable(Capability),

    #[error("capture failed to start")]
    CaptureStartFailed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_facing_messages() {
        assert_eq!(
            InteractionError::CapabilityUnavailable(Capability::Capture).to_string(),
            "Speech recognition not supported on this system!"
        );
        assert_eq!(
            InteractionError::CaptureFailure("no-speech".into()).to_string(),
            "Speech recognition error: no-speech"
        );
    }
}
