//! §4.5 Speaker: the public façade, its utterance queue, and the playback
//! pipeline state machine described there.

use std::collections::VecDeque;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::audio_sink::AudioSink;
use crate::error::{ErrorKind, ProviderId, SpielError};
use crate::protocol::{SpeechEvent, SpeechEventType, StreamReader};
use crate::provider_source::{Frame, ProviderSource};
use crate::registry::ProviderRegistry;
use crate::resolver::VoiceResolver;
use crate::voice::{MediaKind, Voice};

static NEXT_UTTERANCE_ID: AtomicU64 = AtomicU64::new(1);

/// §3 Utterance value object. Constructed with text; every other field has
/// a spec-mandated default and is set with a builder-style `with_*` method.
/// Carries an internal id (never exposed) used to recognize late, stale
/// synthesize-completion callbacks after the entry has already been
/// removed from the queue (§5 "Cooperative cancellation").
#[derive(Debug, Clone, PartialEq)]
pub struct Utterance {
    pub(crate) id: u64,
    pub text: String,
    pub pitch: f64,
    pub rate: f64,
    pub volume: f64,
    pub voice: Option<String>,
    pub language: Option<String>,
    pub is_ssml: bool,
}

impl Utterance {
    pub fn new(text: impl Into<String>) -> Self {
        Utterance {
            id: NEXT_UTTERANCE_ID.fetch_add(1, Ordering::Relaxed),
            text: text.into(),
            pitch: 1.0,
            rate: 1.0,
            volume: 1.0,
            voice: None,
            language: None,
            is_ssml: false,
        }
    }

    pub fn with_pitch(mut self, pitch: f64) -> Self {
        self.pitch = pitch.clamp(0.0, 2.0);
        self
    }

    pub fn with_rate(mut self, rate: f64) -> Self {
        self.rate = rate.clamp(0.1, 10.0);
        self
    }

    pub fn with_volume(mut self, volume: f64) -> Self {
        self.volume = volume.clamp(0.0, 1.0);
        self
    }

    pub fn with_voice(mut self, voice_id: impl Into<String>) -> Self {
        self.voice = Some(voice_id.into());
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn with_ssml(mut self, is_ssml: bool) -> Self {
        self.is_ssml = is_ssml;
        self
    }
}

/// Lifecycle and progress events emitted by a [`Speaker`], in the order
/// guarantees of §5: `UtteranceStarted` → any number of
/// `Word/Sentence/Range/Mark` → exactly one of
/// `Finished | Canceled | Error`, per utterance; terminal events respect
/// queue order across utterances.
#[derive(Debug, Clone, PartialEq)]
pub enum SpeakerEvent {
    UtteranceStarted(Utterance),
    UtteranceFinished(Utterance),
    UtteranceCanceled(Utterance),
    UtteranceError(Utterance, ErrorKind),
    WordStarted(Utterance, u32, u32),
    SentenceStarted(Utterance, u32, u32),
    RangeStarted(Utterance, u32, u32),
    MarkReached(Utterance, String),
    SpeakingChanged(bool),
    PausedChanged(bool),
}

struct QueueEntry {
    id: u64,
    utterance: Utterance,
}

struct SpeakerInner {
    queue: VecDeque<QueueEntry>,
    paused: bool,
    speaking: bool,
    current_task: Option<JoinHandle<()>>,
}

struct SpeakerCore {
    registry: Arc<ProviderRegistry>,
    audio_sink: Arc<dyn AudioSink>,
    inner: Mutex<SpeakerInner>,
    events: broadcast::Sender<SpeakerEvent>,
    paused_tx: watch::Sender<bool>,
    paused_rx: watch::Receiver<bool>,
}

/// Per-instance client object: owns a [`ProviderRegistry`] handle, a FIFO
/// queue of utterances, and the playback pipeline driving them one at a
/// time. Cheaply `Clone` (an `Arc` around shared state), so observers can
/// hold their own handle without fighting over `&mut`.
#[derive(Clone)]
pub struct Speaker {
    core: Arc<SpeakerCore>,
}

impl Speaker {
    /// Acquires the process-wide [`ProviderRegistry`] and starts its
    /// background watchers (idempotent across multiple `Speaker`s).
    pub async fn new(audio_sink: Arc<dyn AudioSink>) -> Result<Self, SpielError> {
        let registry = ProviderRegistry::get().await?;
        registry.ensure_watchers().await;
        Self::with_registry(registry, audio_sink)
    }

    /// Builds a `Speaker` against an already-constructed registry, bypassing
    /// the process-wide singleton. Used by tests that need an isolated
    /// registry wired to an in-process mock provider bus.
    pub fn with_registry(
        registry: Arc<ProviderRegistry>,
        audio_sink: Arc<dyn AudioSink>,
    ) -> Result<Self, SpielError> {
        let (paused_tx, paused_rx) = watch::channel(false);
        let (events, _) = broadcast::channel(256);
        let core = Arc::new(SpeakerCore {
            registry,
            audio_sink,
            inner: Mutex::new(SpeakerInner {
                queue: VecDeque::new(),
                paused: false,
                speaking: false,
                current_task: None,
            }),
            events,
            paused_tx,
            paused_rx,
        });
        Ok(Speaker { core })
    }

    /// Blocking counterpart for callers outside a tokio runtime (§5). Must
    /// not be called from a task already running on a tokio runtime.
    pub fn new_blocking(audio_sink: Arc<dyn AudioSink>) -> Result<Self, SpielError> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("failed to build a private event loop");
        rt.block_on(Self::new(audio_sink))
    }

    /// Appends `utterance` to the queue. If the queue was empty, `speaking`
    /// flips to `true` and the new entry immediately begins building
    /// (resolving its voice and issuing the synthesize RPC); whether it
    /// reaches `PLAYING` still depends on `paused`.
    pub async fn speak(&self, utterance: Utterance) {
        let was_empty;
        {
            let mut inner = self.core.inner.lock().await;
            was_empty = inner.queue.is_empty();
            inner.queue.push_back(QueueEntry {
                id: utterance.id,
                utterance,
            });
            if was_empty {
                inner.speaking = true;
            }
            self.core.start_head_if_needed(&mut inner);
        }
        if was_empty {
            self.core.emit(SpeakerEvent::SpeakingChanged(true));
        }
    }

    /// Toggles the pipeline state without touching queue contents. Updates
    /// `paused` even with an empty queue, for observers tracking it.
    pub async fn pause(&self) {
        let mut inner = self.core.inner.lock().await;
        if inner.paused {
            return;
        }
        inner.paused = true;
        drop(inner);
        let _ = self.core.paused_tx.send(true);
        self.core.emit(SpeakerEvent::PausedChanged(true));
    }

    pub async fn resume(&self) {
        let mut inner = self.core.inner.lock().await;
        if !inner.paused {
            return;
        }
        inner.paused = false;
        drop(inner);
        let _ = self.core.paused_tx.send(false);
        self.core.emit(SpeakerEvent::PausedChanged(false));
    }

    /// Drops every queued entry except the current one, then terminates
    /// the current entry (if any) as canceled. A no-op, emitting nothing,
    /// on an empty queue.
    pub async fn cancel(&self) {
        let canceled;
        let now_empty;
        {
            let mut inner = self.core.inner.lock().await;
            if inner.queue.is_empty() {
                return;
            }
            inner.queue.truncate(1);
            let entry = inner.queue.pop_front().expect("just checked non-empty");
            if let Some(handle) = inner.current_task.take() {
                handle.abort();
            }
            now_empty = inner.queue.is_empty();
            if now_empty {
                inner.speaking = false;
            }
            canceled = entry.utterance;
        }
        self.core.emit(SpeakerEvent::UtteranceCanceled(canceled));
        if now_empty {
            self.core.emit(SpeakerEvent::SpeakingChanged(false));
        } else {
            let mut inner = self.core.inner.lock().await;
            self.core.start_head_if_needed(&mut inner);
        }
    }

    pub async fn speaking(&self) -> bool {
        self.core.inner.lock().await.speaking
    }

    pub async fn paused(&self) -> bool {
        self.core.inner.lock().await.paused
    }

    pub async fn voices(&self) -> Vec<Voice> {
        self.core.registry.voices().await
    }

    pub async fn providers(&self) -> Vec<crate::provider::Provider> {
        self.core.registry.providers().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SpeakerEvent> {
        self.core.events.subscribe()
    }
}

impl SpeakerCore {
    fn emit(&self, event: SpeakerEvent) {
        let _ = self.events.send(event);
    }

    fn emit_speech_event(&self, utterance: &Utterance, event: &SpeechEvent) {
        let mapped = match event.event_type {
            SpeechEventType::Word => {
                SpeakerEvent::WordStarted(utterance.clone(), event.range_start, event.range_end)
            }
            SpeechEventType::Sentence => SpeakerEvent::SentenceStarted(
                utterance.clone(),
                event.range_start,
                event.range_end,
            ),
            SpeechEventType::Range => {
                SpeakerEvent::RangeStarted(utterance.clone(), event.range_start, event.range_end)
            }
            SpeechEventType::Mark => {
                SpeakerEvent::MarkReached(utterance.clone(), event.mark_name.clone())
            }
            SpeechEventType::None => return,
        };
        self.emit(mapped);
    }

    /// Spawns the head-of-queue entry's build-and-play task, unless one is
    /// already running. Must be called with `inner`'s lock held.
    fn start_head_if_needed(self: &Arc<Self>, inner: &mut SpeakerInner) {
        if inner.current_task.is_some() {
            return;
        }
        let Some(entry) = inner.queue.front() else {
            return;
        };
        let id = entry.id;
        let utterance = entry.utterance.clone();
        let core = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let outcome = run_entry(&core, &utterance).await;
            core.complete_entry(id, utterance, outcome).await;
        });
        inner.current_task = Some(handle);
    }

    /// Finalizes the entry identified by `id`. A completion whose id no
    /// longer matches the queue head is stale (the entry was already
    /// canceled) and is silently discarded, per §5's cooperative
    /// cancellation contract.
    async fn complete_entry(
        self: &Arc<Self>,
        id: u64,
        utterance: Utterance,
        outcome: Result<(), ErrorKind>,
    ) {
        let now_empty;
        {
            let mut inner = self.inner.lock().await;
            if inner.queue.front().map(|e| e.id) != Some(id) {
                return;
            }
            inner.queue.pop_front();
            inner.current_task = None;
            now_empty = inner.queue.is_empty();
            if now_empty {
                inner.speaking = false;
            }
        }

        match outcome {
            Ok(()) => self.emit(SpeakerEvent::UtteranceFinished(utterance)),
            Err(kind) => self.emit(SpeakerEvent::UtteranceError(utterance, kind)),
        }

        if now_empty {
            self.emit(SpeakerEvent::SpeakingChanged(false));
        } else {
            let mut inner = self.inner.lock().await;
            self.start_head_if_needed(&mut inner);
        }
    }
}

/// Runs one entry end to end: resolve → synthesize → pump frames into the
/// audio sink, emitting `UtteranceStarted`/progress events along the way.
/// Returns `Ok(())` for a clean end-of-stream, or the [`ErrorKind`] the
/// entry should terminate with.
async fn run_entry(core: &Arc<SpeakerCore>, utterance: &Utterance) -> Result<(), ErrorKind> {
    let aggregate = core.registry.voices().await;
    let config = core.registry.config().await;
    let voice = VoiceResolver::resolve(
        &aggregate,
        &*config,
        utterance.voice.as_deref(),
        utterance.language.as_deref(),
    )
    .map_err(|err| ErrorKind::from(&err))?;

    if !voice.output_format.is_usable() {
        return Err(ErrorKind::MisconfiguredVoice);
    }

    let providers = core.registry.providers().await;
    let provider = providers
        .into_iter()
        .find(|p| p.identifier() == voice.provider)
        .ok_or(ErrorKind::ProviderUnexpectedlyDied)?;

    let (read_fd, write_fd) = nix::unistd::pipe().map_err(|err| {
        warn!(error = %err, "failed to create pipe for synthesis stream");
        ErrorKind::ProviderInternalFailure
    })?;
    set_nonblocking(&read_fd).map_err(|err| {
        warn!(error = %err, "failed to set pipe non-blocking");
        ErrorKind::ProviderInternalFailure
    })?;

    // Subscribed before the RPC is even issued, so a vanish that lands
    // while the RPC is in flight or mid-stream is never missed (§7, §8
    // scenario 5): the owning provider disappearing must terminate this
    // entry as ProviderUnexpectedlyDied rather than let the resulting pipe
    // EOF read as a clean finish.
    let vanished_rx = core.registry.subscribe_vanished();

    let synthesis = async {
        provider
            .synthesize(
                &utterance.text,
                &voice.identifier,
                utterance.pitch,
                utterance.rate,
                utterance.is_ssml,
                utterance.language.as_deref().unwrap_or(""),
                write_fd,
            )
            .await
            .map_err(|err| ErrorKind::from(&err))?;

        let reader = tokio::net::unix::pipe::Receiver::from_file(std::fs::File::from(read_fd))
            .map_err(|_| ErrorKind::ProviderInternalFailure)?;

        core.audio_sink
            .configure(&voice.output_format, utterance.volume)
            .map_err(|err| ErrorKind::from(&err))?;

        let mut paused_rx = core.paused_rx.clone();
        wait_until_unpaused(&mut paused_rx).await;
        core.emit(SpeakerEvent::UtteranceStarted(utterance.clone()));

        let result = match voice.output_format.kind {
            MediaKind::Raw => pump_raw(core, reader).await,
            MediaKind::Spiel => pump_spiel(core, utterance, reader).await,
            MediaKind::Other(_) => unreachable!("checked is_usable above"),
        };

        core.audio_sink.finish();
        result
    };
    tokio::pin!(synthesis);
    let vanished = watch_for_vanish(vanished_rx, voice.provider.clone());
    tokio::pin!(vanished);

    tokio::select! {
        result = &mut synthesis => result,
        kind = &mut vanished => {
            core.audio_sink.finish();
            Err(kind)
        }
    }
}

/// Resolves once the registry reports that `provider_id` vanished from the
/// bus (and was not activatable). Never resolves otherwise — a lagged or
/// closed channel is not itself a sign this entry's provider died, so those
/// cases just keep waiting rather than spuriously failing the entry.
async fn watch_for_vanish(mut rx: broadcast::Receiver<ProviderId>, provider_id: ProviderId) -> ErrorKind {
    loop {
        match rx.recv().await {
            Ok(id) if id == provider_id => return ErrorKind::ProviderUnexpectedlyDied,
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => {
                std::future::pending::<()>().await;
                unreachable!("pending future never resolves")
            }
        }
    }
}

async fn wait_until_unpaused(paused_rx: &mut watch::Receiver<bool>) {
    while *paused_rx.borrow() {
        if paused_rx.changed().await.is_err() {
            return;
        }
    }
}

async fn pump_raw(
    core: &Arc<SpeakerCore>,
    mut reader: tokio::net::unix::pipe::Receiver,
) -> Result<(), ErrorKind> {
    let mut buf = vec![0u8; 8192];
    loop {
        let n = reader
            .read(&mut buf)
            .await
            .map_err(|_| ErrorKind::ProviderInternalFailure)?;
        if n == 0 {
            return Ok(());
        }
        core.audio_sink
            .write(&buf[..n])
            .map_err(|err| ErrorKind::from(&err))?;
    }
}

async fn pump_spiel(
    core: &Arc<SpeakerCore>,
    utterance: &Utterance,
    reader: tokio::net::unix::pipe::Receiver,
) -> Result<(), ErrorKind> {
    let mut source = ProviderSource::new(StreamReader::new(reader));
    loop {
        let frame = source.next_frame().await.map_err(|err| ErrorKind::from(&err))?;
        match frame {
            None => return Ok(()),
            Some(Frame::Event(event)) => core.emit_speech_event(utterance, &event),
            Some(Frame::Audio(bytes)) => core
                .audio_sink
                .write(&bytes)
                .map_err(|err| ErrorKind::from(&err))?,
        }
    }
}

fn set_nonblocking(fd: &OwnedFd) -> std::io::Result<()> {
    use nix::fcntl::{fcntl, FcntlArg, OFlag};
    use std::os::fd::AsRawFd;

    let raw = fd.as_raw_fd();
    let flags = fcntl(raw, FcntlArg::F_GETFL).map_err(std::io::Error::from)?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(raw, FcntlArg::F_SETFL(flags)).map_err(std::io::Error::from)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utterance_defaults_match_spec() {
        let u = Utterance::new("hello");
        assert_eq!(u.pitch, 1.0);
        assert_eq!(u.rate, 1.0);
        assert_eq!(u.volume, 1.0);
        assert!(u.voice.is_none());
        assert!(u.language.is_none());
        assert!(!u.is_ssml);
    }

    #[test]
    fn utterance_ids_are_unique() {
        let a = Utterance::new("a");
        let b = Utterance::new("b");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn builder_methods_clamp_to_spec_ranges() {
        let u = Utterance::new("hi")
            .with_pitch(5.0)
            .with_rate(0.0)
            .with_volume(2.0);
        assert_eq!(u.pitch, 2.0);
        assert_eq!(u.rate, 0.1);
        assert_eq!(u.volume, 1.0);
    }

    #[tokio::test]
    async fn wait_until_unpaused_returns_immediately_when_not_paused() {
        let (_tx, mut rx) = watch::channel(false);
        wait_until_unpaused(&mut rx).await;
    }

    #[tokio::test]
    async fn wait_until_unpaused_blocks_until_resume() {
        let (tx, mut rx) = watch::channel(true);
        let waited = tokio::spawn(async move {
            wait_until_unpaused(&mut rx).await;
        });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(!waited.is_finished());
        tx.send(false).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(1), waited)
            .await
            .expect("did not unblock after resume")
            .unwrap();
    }

    #[tokio::test]
    async fn watch_for_vanish_ignores_other_providers() {
        let (tx, rx) = broadcast::channel(4);
        let waiting = tokio::spawn(watch_for_vanish(
            rx,
            "org.target.Speech.Provider".to_string(),
        ));

        tx.send("org.other.Speech.Provider".to_string()).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(!waiting.is_finished());

        tx.send("org.target.Speech.Provider".to_string()).unwrap();
        let kind = tokio::time::timeout(std::time::Duration::from_secs(1), waiting)
            .await
            .expect("did not resolve after matching vanish")
            .unwrap();
        assert_eq!(kind, ErrorKind::ProviderUnexpectedlyDied);
    }
}
