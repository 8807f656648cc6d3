//! §4.6 ProviderSource: the playback-pipeline adapter that pulls framed
//! audio and events out of a [`StreamReader`] and re-publishes them as a
//! `futures_util::Stream` of [`Frame`]s.

use bytes::Bytes;
use futures_util::Stream;
use tokio::io::AsyncRead;

use crate::error::SpielError;
use crate::protocol::{SpeechEvent, StreamReader};

/// One item pulled off the stream: either a decoded speech event or a
/// chunk of PCM audio ready to hand to an [`crate::audio_sink::AudioSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Audio(Bytes),
    Event(SpeechEvent),
}

/// Wraps a [`StreamReader`] and exposes it as a pull-based frame source.
pub struct ProviderSource<R> {
    reader: StreamReader<R>,
    header_checked: bool,
}

impl<R: AsyncRead + Unpin> ProviderSource<R> {
    pub fn new(reader: StreamReader<R>) -> Self {
        ProviderSource {
            reader,
            header_checked: false,
        }
    }

    /// Produces the next frame, or `None` at end-of-stream.
    ///
    /// A zero-length AUDIO chunk is treated as a keepalive no-op, not as
    /// end-of-stream or as an emitted frame (§9 open question).
    pub async fn next_frame(&mut self) -> Result<Option<Frame>, SpielError> {
        if !self.header_checked {
            self.header_checked = true;
            if !self.reader.read_header().await? {
                return Err(SpielError::ProtocolVersionMismatch);
            }
        }

        loop {
            if let Some(event) = self.reader.next_event().await? {
                return Ok(Some(Frame::Event(event)));
            }
            if let Some(audio) = self.reader.next_audio().await? {
                if audio.is_empty() {
                    continue;
                }
                return Ok(Some(Frame::Audio(audio)));
            }
            return Ok(None);
        }
    }

    /// Adapts this source into a `Stream`, ending after the first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<Frame, SpielError>>
    where
        R: Send,
    {
        futures_util::stream::unfold(Some(self), |state| async move {
            let mut source = state?;
            match source.next_frame().await {
                Ok(Some(frame)) => Some((Ok(frame), Some(source))),
                Ok(None) => None,
                Err(err) => Some((Err(err), None)),
            }
        })
    }
}
