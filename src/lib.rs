//! Client-side speech-synthesis orchestration: provider discovery over
//! D-Bus, voice resolution, and utterance playback.
//!
//! The dependency order below, leaves first, mirrors how the modules build
//! on one another: [`protocol`] has no dependents' knowledge of it baked
//! in, [`provider_source`] builds on [`protocol`], [`provider`] is a live
//! bus peer exposing its voices, [`registry`] aggregates many `provider`s
//! into one process-wide view, [`resolver`] picks a voice out of that view,
//! and [`speaker`] drives the whole pipeline per utterance. [`config`],
//! [`paths`], and [`audio_sink`] are the ambient concerns `registry` and
//! `speaker` lean on.

pub mod audio_sink;
pub mod config;
pub mod error;
pub mod paths;
pub mod protocol;
pub mod provider;
pub mod provider_source;
pub mod registry;
pub mod resolver;
pub mod speaker;
pub mod voice;

pub use audio_sink::{AudioSink, NullAudioSink};
#[cfg(feature = "rodio-sink")]
pub use audio_sink::RodioAudioSink;
pub use config::{Config, NoVoiceConfig, TomlVoiceConfig, VoiceConfigProvider, VoiceRef};
pub use error::{ErrorKind, ProviderId, Result, SpielError, VoiceId};
pub use protocol::{SpeechEvent, SpeechEventType, StreamReader, StreamWriter};
pub use provider::{Provider, VoicesChange};
pub use provider_source::{Frame, ProviderSource};
pub use registry::ProviderRegistry;
pub use resolver::VoiceResolver;
pub use speaker::{Speaker, SpeakerEvent, Utterance};
pub use voice::{MediaKind, OutputFormat, Voice, VoiceFeatures};
