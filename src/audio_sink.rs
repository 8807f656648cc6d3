//! Ambient `AudioSink` abstraction for §4.5 step 3's `audio/x-raw` path.
//!
//! The core never renders audio to hardware — that is explicitly out of
//! scope (§1) — but a playback pipeline has to hand PCM *somewhere*, so the
//! [`Speaker`](crate::speaker::Speaker) is generic over an [`AudioSink`] the
//! host application supplies. [`RodioAudioSink`] is an optional ambient
//! default (feature `rodio-sink`) generalizing the teacher's
//! `client/audio.rs` rodio playback into a trait implementation, for hosts
//! that don't already have a player of their own.

use crate::error::SpielError;
use crate::voice::OutputFormat;

/// Consumes raw PCM frames at a known `format`/`channels`/`rate` (from a
/// voice's `audio/x-raw` `output_format`, or the decoded-audio payloads of
/// an `audio/x-spiel` stream) at a given linear gain.
pub trait AudioSink: Send + Sync {
    /// Called once per entry before any `write` call, so the sink can
    /// (re)configure itself for the format the about-to-play voice uses.
    fn configure(&self, format: &OutputFormat, volume: f64) -> Result<(), SpielError>;

    /// Renders one chunk of PCM. Sinks that buffer internally may return
    /// before the chunk is audible; back-pressure (§5) comes from the pipe,
    /// not from this call blocking.
    fn write(&self, pcm: &[u8]) -> Result<(), SpielError>;

    /// Called once the entry's stream has ended (including on cancel/error)
    /// so the sink can release per-entry resources.
    fn finish(&self);
}

/// A no-op sink for hosts that consume audio another way (e.g. by
/// inspecting frames themselves rather than letting this crate play them).
#[derive(Debug, Clone, Copy, Default)]
pub struct NullAudioSink;

impl AudioSink for NullAudioSink {
    fn configure(&self, _format: &OutputFormat, _volume: f64) -> Result<(), SpielError> {
        Ok(())
    }

    fn write(&self, _pcm: &[u8]) -> Result<(), SpielError> {
        Ok(())
    }

    fn finish(&self) {}
}

#[cfg(feature = "rodio-sink")]
mod rodio_sink {
    use super::*;
    use std::sync::Mutex;

    /// Plays `audio/x-raw` PCM through the default output device, the way
    /// the teacher's `play_audio_from_memory` does for whole WAV buffers —
    /// here driven per-chunk instead, since a voice stream arrives
    /// incrementally rather than as one in-memory buffer.
    pub struct RodioAudioSink {
        // Held only to keep the output device open for the process's
        // lifetime; `rodio::Sink`s created against `handle` stop producing
        // sound the moment this is dropped.
        _stream: rodio::OutputStream,
        handle: rodio::OutputStreamHandle,
        sink: Mutex<Option<rodio::Sink>>,
        format: Mutex<(u16, u32)>,
    }

    impl RodioAudioSink {
        pub fn new() -> Result<Self, SpielError> {
            let (stream, handle) = rodio::OutputStream::try_default().map_err(|err| {
                SpielError::MisconfiguredVoice {
                    provider: String::new(),
                    voice: String::new(),
                    reason: format!("could not open default audio output: {err}"),
                }
            })?;
            Ok(RodioAudioSink {
                _stream: stream,
                handle,
                sink: Mutex::new(None),
                format: Mutex::new((1, 22050)),
            })
        }
    }

    impl AudioSink for RodioAudioSink {
        fn configure(&self, format: &OutputFormat, volume: f64) -> Result<(), SpielError> {
            let sink = rodio::Sink::try_new(&self.handle).map_err(|err| {
                SpielError::MisconfiguredVoice {
                    provider: String::new(),
                    voice: String::new(),
                    reason: format!("could not build audio sink: {err}"),
                }
            })?;
            sink.set_volume(volume as f32);

            let channels = format.channels.unwrap_or(1).clamp(1, u16::MAX as u32) as u16;
            let rate = format.rate.unwrap_or(22050);
            *self.format.lock().unwrap() = (channels, rate);
            *self.sink.lock().unwrap() = Some(sink);
            Ok(())
        }

        fn write(&self, pcm: &[u8]) -> Result<(), SpielError> {
            let (channels, rate) = *self.format.lock().unwrap();
            if let Some(sink) = self.sink.lock().unwrap().as_ref() {
                use rodio::buffer::SamplesBuffer;
                let samples: Vec<i16> = pcm
                    .chunks_exact(2)
                    .map(|b| i16::from_le_bytes([b[0], b[1]]))
                    .collect();
                sink.append(SamplesBuffer::new(channels, rate, samples));
            }
            Ok(())
        }

        fn finish(&self) {
            self.sink.lock().unwrap().take();
        }
    }
}

#[cfg(feature = "rodio-sink")]
pub use rodio_sink::RodioAudioSink;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_sink_accepts_any_format() {
        let sink = NullAudioSink;
        let format = OutputFormat::parse("audio/x-raw;format=S16LE,channels=1,rate=22050");
        assert!(sink.configure(&format, 1.0).is_ok());
        assert!(sink.write(&[0, 1, 2, 3]).is_ok());
        sink.finish();
    }
}
