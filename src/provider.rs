//! §4.2 Provider: a live handle to one bus peer.

use std::collections::{HashMap, HashSet};
use std::os::fd::OwnedFd;
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};
use tracing::warn;
use zbus::zvariant::Fd;
use zbus::Connection;

use crate::error::{ProviderId, SpielError, VoiceId};
use crate::voice::Voice;

/// Service names must end in this suffix (§3, §6.1).
pub const PROVIDER_NAME_SUFFIX: &str = ".Speech.Provider";

#[zbus::proxy(interface = "org.freedesktop.Speech.Provider")]
trait SpeechProvider {
    #[zbus(property)]
    fn name(&self) -> zbus::Result<String>;

    /// `(name, identifier, output_format, features, languages)` per voice.
    #[zbus(property)]
    fn voices(&self) -> zbus::Result<Vec<(String, String, String, u64, Vec<String>)>>;

    #[allow(clippy::too_many_arguments)]
    fn synthesize(
        &self,
        fd: Fd<'_>,
        text: &str,
        voice_id: &str,
        pitch: f64,
        rate: f64,
        is_ssml: bool,
        language: &str,
        options: HashMap<&str, zbus::zvariant::Value<'_>>,
    ) -> zbus::Result<()>;
}

/// A `(position, removed, added)` delta from the Provider's voice list,
/// mirroring the GListModel-style change notification of §4.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoicesChange {
    pub position: usize,
    pub removed: usize,
    pub added: usize,
}

struct ProviderState {
    name: String,
    voices: Vec<Voice>,
    voice_set: HashSet<Voice>,
    is_activatable: bool,
    warned_voice_ids: HashSet<VoiceId>,
}

/// One discovered `*.Speech.Provider` bus peer.
///
/// Cheaply `Clone`: the mutable voice list lives behind an `Arc<Mutex<_>>`
/// shared by every clone, matching the "one Provider, many observers"
/// shape of §3.
#[derive(Clone)]
pub struct Provider {
    identifier: ProviderId,
    proxy: SpeechProviderProxy<'static>,
    state: Arc<Mutex<ProviderState>>,
    changes: broadcast::Sender<VoicesChange>,
}

fn object_path_for(identifier: &str) -> String {
    format!("/{}", identifier.replace('.', "/"))
}

fn build_voice(
    identifier: &ProviderId,
    name: String,
    voice_id: String,
    output_format: String,
    features: u64,
    languages: Vec<String>,
    warned: &mut HashSet<VoiceId>,
) -> Voice {
    let (voice, lost_bits) =
        Voice::new(name, voice_id.clone(), languages, features, &output_format, identifier.clone());
    if lost_bits && warned.insert(voice_id.clone()) {
        warn!(
            provider = %identifier,
            voice = %voice_id,
            "voice advertises features outside the low 32 bits; high bits dropped"
        );
    }
    voice
}

impl Provider {
    /// Connects to `identifier` and fetches its initial voice list.
    pub async fn connect(
        connection: &Connection,
        identifier: ProviderId,
        is_activatable: bool,
    ) -> Result<Self, SpielError> {
        if !identifier.ends_with(PROVIDER_NAME_SUFFIX) {
            return Err(SpielError::UnknownVoice {
                provider: identifier.clone(),
                voice: String::new(),
            });
        }

        let proxy = SpeechProviderProxy::builder(connection)
            .destination(identifier.clone())?
            .path(object_path_for(&identifier))?
            .build()
            .await?;

        let name = proxy.name().await.unwrap_or_else(|_| identifier.clone());
        let advertised = proxy.voices().await?;

        let mut warned_voice_ids = HashSet::new();
        let voices: Vec<Voice> = advertised
            .into_iter()
            .map(|(n, id, fmt, features, langs)| {
                build_voice(&identifier, n, id, fmt, features, langs, &mut warned_voice_ids)
            })
            .collect();
        let mut voices = voices;
        voices.sort();
        let voice_set: HashSet<Voice> = voices.iter().cloned().collect();

        let state = ProviderState {
            name,
            voices,
            voice_set,
            is_activatable,
            warned_voice_ids,
        };

        let (changes, _rx) = broadcast::channel(32);

        let provider = Provider {
            identifier,
            proxy,
            state: Arc::new(Mutex::new(state)),
            changes,
        };
        provider.spawn_voice_watcher();
        Ok(provider)
    }

    /// Watches `org.freedesktop.DBus.Properties.PropertiesChanged` for the
    /// `Voices` property and applies the diff algorithm of §4.2.
    fn spawn_voice_watcher(&self) {
        let provider = self.clone();
        tokio::spawn(async move {
            let Ok(mut stream) = provider.proxy.receive_voices_changed().await else {
                return;
            };
            use futures_util::StreamExt;
            while let Some(change) = stream.next().await {
                if let Ok(advertised) = change.get().await {
                    provider.apply_voice_update(advertised).await;
                }
            }
        });
    }

    /// Applies an incoming voice list, preserving sort order and emitting a
    /// minimal delta. Callers that know the notification arrived only
    /// because an activatable provider's owner vanished must not call this
    /// at all (§4.2 step 4) — that check lives in the registry, which is
    /// the component that observes `NameOwnerChanged`.
    pub async fn apply_voice_update(
        &self,
        advertised: Vec<(String, String, String, u64, Vec<String>)>,
    ) -> VoicesChange {
        let mut state = self.state.lock().await;

        let new_voices: Vec<Voice> = advertised
            .into_iter()
            .map(|(n, id, fmt, features, langs)| {
                build_voice(&self.identifier, n, id, fmt, features, langs, &mut state.warned_voice_ids)
            })
            .collect();
        let new_set: HashSet<Voice> = new_voices.iter().cloned().collect();

        let removed_positions: Vec<usize> = state
            .voices
            .iter()
            .enumerate()
            .filter(|(_, v)| !new_set.contains(v))
            .map(|(i, _)| i)
            .collect();
        let removed = removed_positions.len();
        let first_removed = removed_positions.first().copied();

        state.voices.retain(|v| new_set.contains(v));

        let mut added = 0usize;
        let mut first_added = None;
        for voice in new_voices {
            if !state.voice_set.contains(&voice) {
                let pos = state.voices.binary_search(&voice).unwrap_or_else(|e| e);
                first_added.get_or_insert(pos);
                state.voices.insert(pos, voice);
                added += 1;
            }
        }

        state.voice_set = state.voices.iter().cloned().collect();

        let position = match (first_removed, first_added) {
            (Some(r), Some(a)) => r.min(a),
            (Some(r), None) => r,
            (None, Some(a)) => a,
            (None, None) => 0,
        };

        let delta = VoicesChange {
            position,
            removed,
            added,
        };
        let _ = self.changes.send(delta);
        delta
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub async fn name(&self) -> String {
        self.state.lock().await.name.clone()
    }

    pub async fn is_activatable(&self) -> bool {
        self.state.lock().await.is_activatable
    }

    pub fn set_activatable(&self, value: bool) -> impl std::future::Future<Output = ()> + '_ {
        async move {
            self.state.lock().await.is_activatable = value;
        }
    }

    /// Ordered, deduplicated snapshot of the current voice list.
    pub async fn voices(&self) -> Vec<Voice> {
        self.state.lock().await.voices.clone()
    }

    pub async fn get_voice_by_id(&self, id: &str) -> Option<Voice> {
        self.state
            .lock()
            .await
            .voices
            .iter()
            .find(|v| v.identifier == id)
            .cloned()
    }

    /// Subscribes to `(position, removed, added)` deltas; restartable by
    /// calling this again.
    pub fn observe_voices(&self) -> broadcast::Receiver<VoicesChange> {
        self.changes.subscribe()
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn synthesize(
        &self,
        text: &str,
        voice_id: &str,
        pitch: f64,
        rate: f64,
        is_ssml: bool,
        language: &str,
        write_fd: OwnedFd,
    ) -> Result<(), SpielError> {
        let fd = Fd::from(&write_fd);
        self.proxy
            .synthesize(fd, text, voice_id, pitch, rate, is_ssml, language, HashMap::new())
            .await
            .map_err(|e| SpielError::ProviderInternalFailure {
                provider: self.identifier.clone(),
                message: e.to_string(),
            })
    }
}
