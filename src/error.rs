//! Error kinds surfaced by this crate.
//!
//! [`SpielError`] is the single public error type. Low-level transport and
//! IO failures are wrapped via `#[from]` so call sites can propagate with
//! `?`, but user-facing call sites are expected to re-classify a wrapped
//! [`SpielError::Bus`]/[`SpielError::Io`] into one of the named kinds before
//! it reaches an application (e.g. a failed `Synthesize` call is always
//! reported as [`SpielError::ProviderInternalFailure`], never the bare
//! `zbus::Error`).

use thiserror::Error;

/// The unique identifier of a provider, e.g. `org.mock.Speech.Provider`.
pub type ProviderId = String;
/// The identifier of a voice, unique within its provider.
pub type VoiceId = String;

#[derive(Debug, Error)]
pub enum SpielError {
    #[error("no speech providers are available")]
    NoProvidersAvailable,

    #[error("voice {provider}/{voice} has an unusable output format: {reason}")]
    MisconfiguredVoice {
        provider: ProviderId,
        voice: VoiceId,
        reason: String,
    },

    #[error("provider {0} unexpectedly disappeared from the bus")]
    ProviderUnexpectedlyDied(ProviderId),

    #[error("provider {provider} reported a synthesis failure: {message}")]
    ProviderInternalFailure { provider: ProviderId, message: String },

    #[error("could not acquire the session bus")]
    BusUnavailable(#[source] zbus::Error),

    #[error("stream protocol version mismatch: expected \"0.01\"")]
    ProtocolVersionMismatch,

    #[error("the utterance was canceled")]
    Canceled,

    #[error("no voice named {voice} on provider {provider}")]
    UnknownVoice { provider: ProviderId, voice: VoiceId },

    #[error(transparent)]
    Bus(#[from] zbus::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The public error classification for a terminated utterance.
///
/// A subset of [`SpielError`] meaningful to expose on
/// [`crate::speaker::SpeakerEvent::UtteranceError`] without forcing
/// consumers to match on transport-level variants they cannot act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    NoProvidersAvailable,
    MisconfiguredVoice,
    ProviderUnexpectedlyDied,
    ProviderInternalFailure,
    BusUnavailable,
    ProtocolVersionMismatch,
}

impl From<&SpielError> for ErrorKind {
    fn from(err: &SpielError) -> Self {
        match err {
            SpielError::NoProvidersAvailable => ErrorKind::NoProvidersAvailable,
            SpielError::MisconfiguredVoice { .. } => ErrorKind::MisconfiguredVoice,
            SpielError::ProviderUnexpectedlyDied(_) => ErrorKind::ProviderUnexpectedlyDied,
            SpielError::ProviderInternalFailure { .. } => ErrorKind::ProviderInternalFailure,
            SpielError::BusUnavailable(_) => ErrorKind::BusUnavailable,
            SpielError::ProtocolVersionMismatch => ErrorKind::ProtocolVersionMismatch,
            SpielError::Canceled => ErrorKind::ProviderInternalFailure,
            SpielError::UnknownVoice { .. } => ErrorKind::MisconfiguredVoice,
            SpielError::Bus(_) => ErrorKind::ProviderInternalFailure,
            SpielError::Io(_) => ErrorKind::ProviderInternalFailure,
        }
    }
}

pub type Result<T> = std::result::Result<T, SpielError>;
