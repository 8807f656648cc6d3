//! §4.3 ProviderRegistry and the §2 VoicesListModel it carries.
//!
//! The registry is the process-wide, lazily-initialized root of provider
//! discovery: it owns the bus connection, the ordered `Provider` list, and
//! the background watchers that keep both current as the bus changes.

use std::collections::HashSet;
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::{broadcast, Mutex, OnceCell};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use zbus::Connection;

use crate::config::{NoVoiceConfig, TomlVoiceConfig, VoiceConfigProvider};
use crate::error::{ProviderId, SpielError};
use crate::provider::{Provider, PROVIDER_NAME_SUFFIX};
use crate::voice::Voice;

/// A `(position, removed, added)` delta over the flattened aggregate voice
/// list, mirroring [`crate::provider::VoicesChange`] one level up.
pub type VoicesChange = crate::provider::VoicesChange;

static REGISTRY: OnceCell<Arc<ProviderRegistry>> = OnceCell::const_new();
static WATCHERS_STARTED: OnceCell<()> = OnceCell::const_new();

pub struct ProviderRegistry {
    #[allow(dead_code)]
    connection: Connection,
    providers: Mutex<Vec<Provider>>,
    last_voices: Mutex<Vec<Voice>>,
    config: Mutex<Arc<dyn VoiceConfigProvider>>,
    voices_changes: broadcast::Sender<VoicesChange>,
    providers_changed: broadcast::Sender<()>,
    provider_vanished: broadcast::Sender<ProviderId>,
}

impl ProviderRegistry {
    /// Returns the process-wide registry, initializing it on first call.
    /// Concurrent first-callers coalesce onto the same `init` future via
    /// `OnceCell::get_or_try_init`.
    pub async fn get() -> Result<Arc<ProviderRegistry>, SpielError> {
        REGISTRY
            .get_or_try_init(|| async { Self::init().await.map(Arc::new) })
            .await
            .cloned()
    }

    /// Blocking counterpart for callers outside a tokio runtime, matching
    /// §5's "blocking sync variants" requirement. Panics if called from a
    /// task already running on a tokio runtime, per §5.
    pub fn get_blocking() -> Result<Arc<ProviderRegistry>, SpielError> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("failed to build a private event loop");
        rt.block_on(Self::get())
    }

    /// Builds a registry directly from an already-open connection, skipping
    /// the process-wide singleton. Tests use this to point a registry at an
    /// in-process mock provider bus instead of the real session bus.
    pub async fn for_connection(connection: Connection) -> Result<Arc<ProviderRegistry>, SpielError> {
        Self::init_with(connection).await.map(Arc::new)
    }

    async fn init() -> Result<Self, SpielError> {
        let connection = Connection::session()
            .await
            .map_err(SpielError::BusUnavailable)?;
        Self::init_with(connection).await
    }

    async fn init_with(connection: Connection) -> Result<Self, SpielError> {
        let dbus = zbus::fdo::DBusProxy::new(&connection)
            .await
            .map_err(SpielError::Bus)?;

        let (activatable, running) = enumerate_provider_names(&dbus).await?;

        let mut join_set = JoinSet::new();
        for (identifier, is_activatable) in activatable.into_iter().chain(running.into_iter()) {
            let connection = connection.clone();
            join_set.spawn(async move {
                (
                    identifier.clone(),
                    Provider::connect(&connection, identifier, is_activatable).await,
                )
            });
        }

        let mut by_identifier: std::collections::BTreeMap<ProviderId, Provider> =
            std::collections::BTreeMap::new();
        while let Some(joined) = join_set.join_next().await {
            let Ok((identifier, result)) = joined else {
                continue; // task panicked or was aborted; not registry-fatal
            };
            match result {
                Ok(provider) => {
                    // `enumerate_provider_names` already excludes a running
                    // name from the running set once it is activatable, so
                    // a name can never resolve twice here; `or_insert` is
                    // enough to keep the map duplicate-free.
                    by_identifier.entry(identifier).or_insert(provider);
                }
                Err(err) => {
                    warn!(error = %err, "skipping provider that failed to connect during enumeration");
                }
            }
        }
        let providers: Vec<Provider> = by_identifier.into_values().collect();

        let mut last_voices = Vec::new();
        for provider in &providers {
            last_voices.extend(provider.voices().await);
        }

        let (voices_changes, _) = broadcast::channel(64);
        let (providers_changed, _) = broadcast::channel(16);
        let (provider_vanished, _) = broadcast::channel(16);

        let registry = ProviderRegistry {
            connection,
            providers: Mutex::new(providers),
            last_voices: Mutex::new(last_voices),
            config: Mutex::new(Arc::new(TomlVoiceConfig::load()) as Arc<dyn VoiceConfigProvider>),
            voices_changes,
            providers_changed,
            provider_vanished,
        };

        Ok(registry)
    }

    /// Installs a host-supplied [`VoiceConfigProvider`], replacing the
    /// default `TomlVoiceConfig`. Intended to be called once, right after
    /// `get()`, before any `speak` calls resolve a voice.
    pub async fn set_config(&self, config: Arc<dyn VoiceConfigProvider>) {
        *self.config.lock().await = config;
    }

    pub async fn config(&self) -> Arc<dyn VoiceConfigProvider> {
        self.config.lock().await.clone()
    }

    /// Starts the background watchers the first time it is called for the
    /// process; subsequent calls (e.g. a second `Speaker` against the same
    /// registry) are no-ops, so watchers are never double-spawned.
    pub async fn ensure_watchers(self: &Arc<Self>) {
        let registry = self;
        WATCHERS_STARTED
            .get_or_init(|| async { registry.spawn_watchers().await })
            .await;
    }

    /// Spawns the background watchers for `ActivatableServicesChanged` and
    /// `NameOwnerChanged`. Must be called once, after the registry is
    /// published (so `Arc::clone` inside the watcher tasks refers to the
    /// same shared instance callers observe).
    pub async fn spawn_watchers(self: &Arc<Self>) {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = registry.watch_activatable_services().await {
                warn!(error = %err, "activatable-services watcher exited");
            }
        });

        let registry = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = registry.watch_name_owner_changes().await {
                warn!(error = %err, "name-owner watcher exited");
            }
        });

        let providers = self.providers.lock().await.clone();
        for provider in &providers {
            self.spawn_voice_forwarder(provider);
        }
    }

    /// Forwards one provider's `(position, removed, added)` deltas into a
    /// recomputed aggregate diff, so `VoicesListModel` subscribers see a
    /// coherent change each time any tracked provider's own voices change
    /// (§5 "the aggregate offset reflects the state after the underlying
    /// provider's change is applied").
    fn spawn_voice_forwarder(self: &Arc<Self>, provider: &Provider) {
        let registry = Arc::clone(self);
        let mut changes = provider.observe_voices();
        tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(_) => registry.refresh_aggregate().await,
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        registry.refresh_aggregate().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    async fn watch_activatable_services(self: Arc<Self>) -> Result<(), SpielError> {
        let activation = DBusActivationProxy::new(&self.connection)
            .await
            .map_err(SpielError::Bus)?;
        let mut stream = activation
            .receive_activatable_services_changed()
            .await
            .map_err(SpielError::Bus)?;

        // Debounce bursts of the signal: drain anything else already queued
        // before re-enumerating, per §4.3 "debounced if multiple arrive in
        // quick succession".
        while stream.next().await.is_some() {
            while tokio::time::timeout(std::time::Duration::from_millis(50), stream.next())
                .await
                .is_ok()
            {
                // keep draining
            }
            self.reconcile_provider_names().await;
        }
        Ok(())
    }

    async fn watch_name_owner_changes(self: Arc<Self>) -> Result<(), SpielError> {
        let dbus = zbus::fdo::DBusProxy::new(&self.connection)
            .await
            .map_err(SpielError::Bus)?;
        let mut stream = dbus.receive_name_owner_changed().await.map_err(SpielError::Bus)?;

        while let Some(signal) = stream.next().await {
            let Ok(args) = signal.args() else { continue };
            let name = args.name().to_string();
            if !name.ends_with(PROVIDER_NAME_SUFFIX) {
                continue;
            }
            let new_owner = args.new_owner().clone();

            if new_owner.is_none() {
                self.handle_provider_vanished(&name).await;
            } else {
                self.handle_provider_appeared(&name).await;
            }
        }
        Ok(())
    }

    async fn handle_provider_vanished(&self, name: &str) {
        let mut providers = self.providers.lock().await;
        if let Some(pos) = providers.iter().position(|p| p.identifier() == name) {
            if providers[pos].is_activatable().await {
                debug!(provider = name, "activatable provider lost its owner; keeping it");
                return;
            }
            info!(provider = name, "provider vanished from the bus; removing");
            providers.remove(pos);
            drop(providers);
            self.refresh_aggregate().await;
            let _ = self.providers_changed.send(());
            // Tells any in-flight Speaker entry synthesizing against this
            // provider to terminate as ProviderUnexpectedlyDied (§7, §8
            // scenario 5) instead of treating the resulting pipe EOF as a
            // clean end-of-stream.
            let _ = self.provider_vanished.send(name.to_string());
        }
    }

    async fn handle_provider_appeared(self: &Arc<Self>, name: &str) {
        let already_tracked = {
            let providers = self.providers.lock().await;
            providers.iter().any(|p| p.identifier() == name)
        };
        if already_tracked {
            return;
        }
        match Provider::connect(&self.connection, name.to_string(), false).await {
            Ok(provider) => {
                {
                    let mut providers = self.providers.lock().await;
                    providers.push(provider.clone());
                    providers.sort_by(|a, b| a.identifier().cmp(b.identifier()));
                }
                self.spawn_voice_forwarder(&provider);
                self.refresh_aggregate().await;
                let _ = self.providers_changed.send(());
            }
            Err(err) => {
                warn!(provider = name, error = %err, "new provider appeared but could not be connected");
            }
        }
    }

    async fn reconcile_provider_names(self: &Arc<Self>) {
        let dbus = match zbus::fdo::DBusProxy::new(&self.connection).await {
            Ok(dbus) => dbus,
            Err(err) => {
                warn!(error = %err, "could not reach the bus to reconcile provider names");
                return;
            }
        };
        let (activatable, running) = match enumerate_provider_names(&dbus).await {
            Ok(names) => names,
            Err(err) => {
                warn!(error = %err, "failed to enumerate provider names");
                return;
            }
        };
        let eligible: std::collections::HashMap<ProviderId, bool> = activatable
            .into_iter()
            .chain(running)
            .fold(std::collections::HashMap::new(), |mut acc, (id, act)| {
                let entry = acc.entry(id).or_insert(false);
                *entry = *entry || act;
                acc
            });

        let mut changed = false;
        let mut newly_connected = Vec::new();
        let mut newly_vanished = Vec::new();
        {
            let mut providers = self.providers.lock().await;
            let before = providers.len();
            newly_vanished.extend(
                providers
                    .iter()
                    .filter(|p| !eligible.contains_key(p.identifier()))
                    .map(|p| p.identifier().to_string()),
            );
            providers.retain(|p| eligible.contains_key(p.identifier()));
            changed |= providers.len() != before;

            for (identifier, is_activatable) in &eligible {
                if let Some(existing) = providers.iter().find(|p| p.identifier() == identifier) {
                    existing.set_activatable(*is_activatable).await;
                    continue;
                }
                match Provider::connect(&self.connection, identifier.clone(), *is_activatable).await {
                    Ok(provider) => {
                        providers.push(provider.clone());
                        newly_connected.push(provider);
                        changed = true;
                    }
                    Err(err) => {
                        warn!(provider = %identifier, error = %err, "skipping provider during reconciliation");
                    }
                }
            }
            providers.sort_by(|a, b| a.identifier().cmp(b.identifier()));
        }

        for provider in &newly_connected {
            self.spawn_voice_forwarder(provider);
        }
        for identifier in &newly_vanished {
            let _ = self.provider_vanished.send(identifier.clone());
        }

        if changed {
            self.refresh_aggregate().await;
            let _ = self.providers_changed.send(());
        }
    }

    async fn refresh_aggregate(&self) {
        let fresh = self.snapshot_aggregate().await;
        let mut last = self.last_voices.lock().await;
        let delta = diff_voice_lists(&last, &fresh);
        *last = fresh;
        let _ = self.voices_changes.send(delta);
    }

    async fn snapshot_aggregate(&self) -> Vec<Voice> {
        let providers = self.providers.lock().await;
        let mut aggregate = Vec::new();
        for provider in providers.iter() {
            aggregate.extend(provider.voices().await);
        }
        aggregate
    }

    /// The flattened, ordered concatenation of every provider's voices
    /// (§4.3 ordering and tie-breaks).
    pub async fn voices(&self) -> Vec<Voice> {
        self.snapshot_aggregate().await
    }

    /// Ordered, duplicate-free snapshot of the tracked providers.
    pub async fn providers(&self) -> Vec<Provider> {
        self.providers.lock().await.clone()
    }

    pub fn subscribe_voices(&self) -> broadcast::Receiver<VoicesChange> {
        self.voices_changes.subscribe()
    }

    pub fn subscribe_providers(&self) -> broadcast::Receiver<()> {
        self.providers_changed.subscribe()
    }

    /// Notifies of a provider identifier removed by `NameOwnerChanged`
    /// because it vanished from the bus and was not activatable (§4.3).
    /// `Speaker` uses this to abort an in-flight entry's pump loop with
    /// [`SpielError::ProviderUnexpectedlyDied`](crate::error::SpielError::ProviderUnexpectedlyDied)
    /// instead of reading the resulting pipe EOF as a normal finish.
    pub fn subscribe_vanished(&self) -> broadcast::Receiver<ProviderId> {
        self.provider_vanished.subscribe()
    }

    /// Process-exit cleanup hook (§9): drops the bus connection early
    /// rather than relying on drop order, and clears the singleton so a
    /// subsequent `get()` reinitializes from scratch (mainly useful in
    /// tests that need a fresh registry per case).
    pub fn shutdown() {
        // `OnceCell` has no reset API; in production the registry lives for
        // the process lifetime and this is a documented no-op placeholder
        // for hosts that want an explicit symmetrical call to pair with
        // `get()`. Tests build their own `ProviderRegistry` directly via
        // `ProviderRegistry::for_connection` instead of going through the
        // process-wide singleton.
    }
}

async fn enumerate_provider_names(
    dbus: &zbus::fdo::DBusProxy<'_>,
) -> Result<(Vec<(ProviderId, bool)>, Vec<(ProviderId, bool)>), SpielError> {
    let activatable_names = dbus.list_activatable_names().await.map_err(SpielError::Bus)?;
    let running_names = dbus.list_names().await.map_err(SpielError::Bus)?;

    let activatable_set: HashSet<String> = activatable_names
        .iter()
        .map(|n| n.to_string())
        .filter(|n| n.ends_with(PROVIDER_NAME_SUFFIX))
        .collect();

    let activatable = activatable_set
        .iter()
        .cloned()
        .map(|n| (n, true))
        .collect();

    let running = running_names
        .iter()
        .map(|n| n.to_string())
        .filter(|n| n.ends_with(PROVIDER_NAME_SUFFIX) && !activatable_set.contains(n))
        .map(|n| (n, false))
        .collect();

    Ok((activatable, running))
}

fn diff_voice_lists(old: &[Voice], new: &[Voice]) -> VoicesChange {
    let new_set: HashSet<&Voice> = new.iter().collect();
    let old_set: HashSet<&Voice> = old.iter().collect();

    let removed_positions: Vec<usize> = old
        .iter()
        .enumerate()
        .filter(|(_, v)| !new_set.contains(v))
        .map(|(i, _)| i)
        .collect();
    let added_positions: Vec<usize> = new
        .iter()
        .enumerate()
        .filter(|(_, v)| !old_set.contains(v))
        .map(|(i, _)| i)
        .collect();

    let position = match (removed_positions.first(), added_positions.first()) {
        (Some(r), Some(a)) => (*r).min(*a),
        (Some(r), None) => *r,
        (None, Some(a)) => *a,
        (None, None) => 0,
    };

    VoicesChange {
        position,
        removed: removed_positions.len(),
        added: added_positions.len(),
    }
}

#[zbus::proxy(
    interface = "org.freedesktop.DBus",
    default_service = "org.freedesktop.DBus",
    default_path = "/org/freedesktop/DBus"
)]
trait DBusActivation {
    #[zbus(signal)]
    fn activatable_services_changed(&self) -> zbus::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn voice(provider: &str, id: &str) -> Voice {
        Voice::new(
            id,
            id,
            vec!["en".to_string()],
            0,
            "audio/x-raw;format=S16LE,channels=1,rate=22050",
            provider,
        )
        .0
    }

    #[test]
    fn diff_reports_additions_and_removals() {
        let old = vec![voice("p", "a"), voice("p", "b")];
        let new = vec![voice("p", "b"), voice("p", "c")];
        let delta = diff_voice_lists(&old, &new);
        assert_eq!(delta.removed, 1);
        assert_eq!(delta.added, 1);
    }

    #[test]
    fn diff_of_identical_lists_is_empty() {
        let list = vec![voice("p", "a")];
        let delta = diff_voice_lists(&list, &list);
        assert_eq!(delta.removed, 0);
        assert_eq!(delta.added, 0);
    }
}
