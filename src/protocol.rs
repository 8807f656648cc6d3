//! Binary framing for the audio/event pipe (§4.1, §6.2).
//!
//! The wire format is little-endian, tightly packed, one direction
//! (writer → reader) over a unidirectional pipe:
//!
//! ```text
//! StreamHeader  := version:[u8; 4]       // exactly "0.01"
//! Chunk         := AudioChunk | EventChunk
//! AudioChunk    := tag:u8 = 1, len:u32, payload:[u8; len]
//! EventChunk    := tag:u8 = 2, event:EventData, mark:[u8; event.mark_name_length]
//! EventData     := event_type:u8, range_start:u32, range_end:u32, mark_name_length:u32
//! ```

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const STREAM_VERSION: [u8; 4] = *b"0.01";
const TAG_AUDIO: u8 = 1;
const TAG_EVENT: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeechEventType {
    None = 0,
    Word = 1,
    Sentence = 2,
    Range = 3,
    Mark = 4,
}

impl SpeechEventType {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::Word),
            2 => Some(Self::Sentence),
            3 => Some(Self::Range),
            4 => Some(Self::Mark),
            _ => None,
        }
    }
}

/// A speech-progress event as carried by an EVENT chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeechEvent {
    pub event_type: SpeechEventType,
    pub range_start: u32,
    pub range_end: u32,
    /// Always a materialized, owned, valid-UTF-8 string — the wire's
    /// "no trailing NUL" rule is purely a wire-layout detail; Rust's
    /// `String` is never NUL-terminated either way.
    pub mark_name: String,
}

/// Writer half of the stream protocol (§4.1 writer contract).
///
/// Exactly one [`StreamWriter::write_header`] call at start, then any
/// interleaving of [`StreamWriter::send_audio`] / [`StreamWriter::send_event`].
/// Dropping the writer without calling [`StreamWriter::close`] still closes
/// the underlying descriptor, because dropping `W` (typically a
/// `tokio::net::unix::pipe::Sender`) does that already.
pub struct StreamWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> StreamWriter<W> {
    pub fn new(inner: W) -> Self {
        StreamWriter { inner }
    }

    pub async fn write_header(&mut self) -> std::io::Result<()> {
        self.inner.write_all(&STREAM_VERSION).await
    }

    pub async fn send_audio(&mut self, payload: &[u8]) -> std::io::Result<()> {
        self.inner.write_all(&[TAG_AUDIO]).await?;
        self.inner
            .write_all(&(payload.len() as u32).to_le_bytes())
            .await?;
        self.inner.write_all(payload).await
    }

    pub async fn send_event(
        &mut self,
        event_type: SpeechEventType,
        range_start: u32,
        range_end: u32,
        mark_name: &str,
    ) -> std::io::Result<()> {
        let mark_bytes = mark_name.as_bytes();
        self.inner.write_all(&[TAG_EVENT]).await?;
        self.inner.write_all(&[event_type as u8]).await?;
        self.inner.write_all(&range_start.to_le_bytes()).await?;
        self.inner.write_all(&range_end.to_le_bytes()).await?;
        self.inner
            .write_all(&(mark_bytes.len() as u32).to_le_bytes())
            .await?;
        self.inner.write_all(mark_bytes).await
    }

    /// Flushes and drops the inner writer, releasing the descriptor.
    pub async fn close(mut self) -> std::io::Result<()> {
        self.inner.flush().await
    }
}

/// Reader half of the stream protocol (§4.1 reader contract).
///
/// Retains a one-byte lookahead so that interleaved `next_audio` /
/// `next_event` calls can each ask "is the next chunk mine?" without
/// consuming a chunk of the other kind.
pub struct StreamReader<R> {
    inner: R,
    pending_tag: Option<u8>,
}

impl<R: AsyncRead + Unpin> StreamReader<R> {
    pub fn new(inner: R) -> Self {
        StreamReader {
            inner,
            pending_tag: None,
        }
    }

    /// Must be called exactly once, before any `next_audio`/`next_event`
    /// call. Returns `false` if the header's version does not match.
    pub async fn read_header(&mut self) -> std::io::Result<bool> {
        let mut buf = [0u8; 4];
        match self.try_read_exact(&mut buf).await? {
            true => Ok(buf == STREAM_VERSION),
            false => Ok(false),
        }
    }

    /// Returns `Some(payload)` if the next chunk is an AUDIO chunk,
    /// otherwise `None` — either because the next chunk is an EVENT
    /// (the tag is retained for a later `next_event` call) or because the
    /// stream has ended.
    pub async fn next_audio(&mut self) -> std::io::Result<Option<Bytes>> {
        let tag = match self.peek_tag().await? {
            Some(tag) => tag,
            None => return Ok(None),
        };

        if tag != TAG_AUDIO {
            self.pending_tag = Some(tag);
            return Ok(None);
        }

        let mut len_buf = [0u8; 4];
        if !self.try_read_exact(&mut len_buf).await? {
            return Ok(None);
        }
        let len = u32::from_le_bytes(len_buf) as usize;

        let mut payload = vec![0u8; len];
        if !self.try_read_exact(&mut payload).await? {
            return Ok(None);
        }

        Ok(Some(Bytes::from(payload)))
    }

    /// Symmetric to [`Self::next_audio`] for EVENT chunks.
    pub async fn next_event(&mut self) -> std::io::Result<Option<SpeechEvent>> {
        let tag = match self.peek_tag().await? {
            Some(tag) => tag,
            None => return Ok(None),
        };

        if tag != TAG_EVENT {
            self.pending_tag = Some(tag);
            return Ok(None);
        }

        let mut header = [0u8; 1 + 4 + 4 + 4];
        if !self.try_read_exact(&mut header).await? {
            return Ok(None);
        }

        let event_type = match SpeechEventType::from_u8(header[0]) {
            Some(t) => t,
            None => SpeechEventType::None,
        };
        let range_start = u32::from_le_bytes(header[1..5].try_into().unwrap());
        let range_end = u32::from_le_bytes(header[5..9].try_into().unwrap());
        let mark_len = u32::from_le_bytes(header[9..13].try_into().unwrap()) as usize;

        let mut mark_buf = vec![0u8; mark_len];
        if !self.try_read_exact(&mut mark_buf).await? {
            return Ok(None);
        }
        let mark_name = String::from_utf8_lossy(&mark_buf).into_owned();

        Ok(Some(SpeechEvent {
            event_type,
            range_start,
            range_end,
            mark_name,
        }))
    }

    async fn peek_tag(&mut self) -> std::io::Result<Option<u8>> {
        if let Some(tag) = self.pending_tag.take() {
            return Ok(Some(tag));
        }
        let mut buf = [0u8; 1];
        if self.try_read_exact(&mut buf).await? {
            Ok(Some(buf[0]))
        } else {
            Ok(None)
        }
    }

    /// Fills `buf` fully, or reports `false` on any short read. A short
    /// read (including a clean EOF before any byte arrives) is not an
    /// error here — per the reader contract it propagates as end-of-stream.
    async fn try_read_exact(&mut self, buf: &mut [u8]) -> std::io::Result<bool> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.inner.read(&mut buf[filled..]).await?;
            if n == 0 {
                return Ok(false);
            }
            filled += n;
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn header_roundtrip() {
        let mut buf = Vec::new();
        {
            let mut writer = StreamWriter::new(&mut buf);
            writer.write_header().await.unwrap();
        }
        let mut reader = StreamReader::new(Cursor::new(buf));
        assert!(reader.read_header().await.unwrap());
    }

    #[tokio::test]
    async fn mismatched_header_version_fails() {
        let mut reader = StreamReader::new(Cursor::new(b"9.99".to_vec()));
        assert!(!reader.read_header().await.unwrap());
    }

    #[tokio::test]
    async fn interleaved_audio_and_events_roundtrip() {
        let mut buf = Vec::new();
        {
            let mut writer = StreamWriter::new(&mut buf);
            writer.write_header().await.unwrap();
            writer
                .send_event(SpeechEventType::Word, 0, 5, "")
                .await
                .unwrap();
            writer.send_audio(&[1, 2, 3, 4]).await.unwrap();
            writer
                .send_event(SpeechEventType::Sentence, 0, 20, "")
                .await
                .unwrap();
            writer.send_audio(&[5, 6, 7, 8]).await.unwrap();
        }

        let mut reader = StreamReader::new(Cursor::new(buf));
        assert!(reader.read_header().await.unwrap());

        let event1 = reader.next_event().await.unwrap().unwrap();
        assert_eq!(event1.event_type, SpeechEventType::Word);
        assert_eq!((event1.range_start, event1.range_end), (0, 5));

        let audio1 = reader.next_audio().await.unwrap().unwrap();
        assert_eq!(&audio1[..], &[1, 2, 3, 4]);

        let event2 = reader.next_event().await.unwrap().unwrap();
        assert_eq!(event2.event_type, SpeechEventType::Sentence);

        let audio2 = reader.next_audio().await.unwrap().unwrap();
        assert_eq!(&audio2[..], &[5, 6, 7, 8]);

        assert!(reader.next_audio().await.unwrap().is_none());
        assert!(reader.next_event().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lookahead_retains_wrong_kind_chunk() {
        let mut buf = Vec::new();
        {
            let mut writer = StreamWriter::new(&mut buf);
            writer.write_header().await.unwrap();
            writer.send_audio(b"hi").await.unwrap();
        }
        let mut reader = StreamReader::new(Cursor::new(buf));
        reader.read_header().await.unwrap();

        // Asking for an event first should not consume the audio chunk.
        assert!(reader.next_event().await.unwrap().is_none());
        let audio = reader.next_audio().await.unwrap().unwrap();
        assert_eq!(&audio[..], b"hi");
    }

    #[tokio::test]
    async fn events_only_stream_reaches_end_of_stream() {
        let mut buf = Vec::new();
        {
            let mut writer = StreamWriter::new(&mut buf);
            writer.write_header().await.unwrap();
            writer
                .send_event(SpeechEventType::Mark, 0, 0, "bookmark")
                .await
                .unwrap();
        }
        let mut reader = StreamReader::new(Cursor::new(buf));
        reader.read_header().await.unwrap();

        let event = reader.next_event().await.unwrap().unwrap();
        assert_eq!(event.mark_name, "bookmark");
        assert!(reader.next_audio().await.unwrap().is_none());
        assert!(reader.next_event().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn truncated_stream_is_end_of_stream_not_error() {
        let mut buf = Vec::new();
        {
            let mut writer = StreamWriter::new(&mut buf);
            writer.write_header().await.unwrap();
            writer.send_audio(&[0u8; 100]).await.unwrap();
        }
        buf.truncate(buf.len() - 10); // chop off the tail of the payload
        let mut reader = StreamReader::new(Cursor::new(buf));
        reader.read_header().await.unwrap();
        assert!(reader.next_audio().await.unwrap().is_none());
    }
}
