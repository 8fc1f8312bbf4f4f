use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use super::cache::CachedProvider;
use super::cancel::CancelToken;
use super::cloud::CloudProvider;
use super::config::{clamp_rate, ProviderConfig, SpeechSystemConfig};
use super::events::{event_channel, EventReceiver, HaltReason};
use super::host::{HostSpeech, HostSpeechProvider};
use super::interface::{BufferedProvider, ProviderKind, SpeechError, StreamingProvider, VoiceProfile};
use super::local_server::LocalServerProvider;
use super::playback::{AudioOutput, AudioSlot};
use super::scheduler::{run_buffered, run_streaming, SessionPlan};
use super::session::SessionFence;

// ── Session Bookkeeping ────────────────────────────────

struct RunningSession {
    words: Arc<[String]>,
    from_index: usize,
    streaming: bool,
    task: JoinHandle<()>,
    cancel: CancelToken,
}

struct PendingRestart {
    id: u64,
    words: Arc<[String]>,
    resume_from: usize,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Control {
    session: Option<RunningSession>,
    pending_restart: Option<PendingRestart>,
}

struct EngineInner {
    runtime: Handle,
    fence: Arc<SessionFence>,
    slot: Arc<AudioSlot>,
    host: Arc<dyn StreamingProvider>,
    buffered: RwLock<HashMap<ProviderKind, Arc<dyn BufferedProvider>>>,
    settings: RwLock<SpeechSystemConfig>,
    control: Mutex<Control>,
    restart_ids: AtomicU64,
}

// ── SpeechEngine ───────────────────────────────────────

/// Engine facade: the only surface the embedding application talks to.
///
/// All methods are synchronous and return immediately; sessions run on the
/// tokio runtime the engine was created in and report through the
/// [`EventReceiver`] returned by [`SpeechEngine::new`].
#[derive(Clone)]
pub struct SpeechEngine {
    inner: Arc<EngineInner>,
}

impl SpeechEngine {
    /// Build an engine from `config`. Must be called inside a tokio runtime.
    pub fn new(
        config: SpeechSystemConfig,
        output: Arc<dyn AudioOutput>,
        host: Arc<dyn HostSpeech>,
    ) -> Result<(Self, EventReceiver), SpeechError> {
        let runtime = Handle::try_current()
            .map_err(|_| SpeechError::Config("speech engine must be created inside a tokio runtime".into()))?;
        let config = config.normalized();
        let (events_tx, events_rx) = event_channel();

        let mut buffered = HashMap::new();
        if let Some(provider) = build_provider(&config) {
            buffered.insert(provider.kind(), provider);
        }

        let engine = Self {
            inner: Arc::new(EngineInner {
                runtime,
                fence: Arc::new(SessionFence::new(events_tx)),
                slot: Arc::new(AudioSlot::new(output)),
                host: Arc::new(HostSpeechProvider::new(host)),
                buffered: RwLock::new(buffered),
                settings: RwLock::new(config),
                control: Mutex::new(Control::default()),
                restart_ids: AtomicU64::new(1),
            }),
        };
        tracing::info!(
            provider = %engine.active_provider(),
            rate = engine.rate(),
            "speech engine ready"
        );
        Ok((engine, events_rx))
    }

    fn control(&self) -> MutexGuard<'_, Control> {
        self.inner.control.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn settings(&self) -> SpeechSystemConfig {
        match self.inner.settings.read() {
            Ok(settings) => settings.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn update_settings(&self, f: impl FnOnce(&mut SpeechSystemConfig)) {
        let mut settings = self.inner.settings.write().unwrap_or_else(|e| e.into_inner());
        f(&mut settings);
    }

    /// Register (or replace) the buffered provider used for `kind`.
    pub fn register_provider(&self, kind: ProviderKind, provider: Arc<dyn BufferedProvider>) {
        let mut buffered = self.inner.buffered.write().unwrap_or_else(|e| e.into_inner());
        buffered.insert(kind, provider);
    }

    fn buffered_provider(&self, kind: ProviderKind) -> Option<Arc<dyn BufferedProvider>> {
        let buffered = self.inner.buffered.read().unwrap_or_else(|e| e.into_inner());
        buffered.get(&kind).cloned()
    }

    // ── Sessions ───────────────────────────────────────

    /// Start speaking `words` from `from_index`, replacing any current
    /// session. Ignored while the engine is disabled.
    pub fn speak(&self, words: impl Into<Arc<[String]>>, from_index: usize) {
        let words = words.into();
        if !self.is_enabled() {
            tracing::debug!("speech disabled, ignoring speak");
            return;
        }
        let mut control = self.control();
        if let Some(pending) = control.pending_restart.take() {
            pending.task.abort();
        }
        self.start_session(&mut control, words, from_index);
    }

    fn start_session(&self, control: &mut Control, words: Arc<[String]>, from_index: usize) {
        self.halt_session(control);

        let settings = self.settings();
        let kind = settings.provider.kind();
        let ticket = self.inner.fence.begin();
        let cancel = ticket.cancel_token().clone();
        let plan = SessionPlan {
            words: Arc::clone(&words),
            from_index,
            voice: settings.provider.voice().map(str::to_string),
            rate: settings.rate,
            chunking: settings.chunking,
            poll_interval: settings.poll_interval(),
        };

        let (task, streaming) = match kind {
            ProviderKind::Offline => {
                let host = Arc::clone(&self.inner.host);
                (self.inner.runtime.spawn(run_streaming(host, ticket, plan)), true)
            }
            kind => match self.buffered_provider(kind) {
                Some(provider) => {
                    let slot = Arc::clone(&self.inner.slot);
                    (self.inner.runtime.spawn(run_buffered(provider, slot, ticket, plan)), false)
                }
                None => {
                    tracing::warn!(%kind, "no provider configured, halting session");
                    ticket.finish_halted(HaltReason::SynthesisFailed);
                    return;
                }
            },
        };

        control.session = Some(RunningSession {
            words,
            from_index,
            streaming,
            task,
            cancel,
        });
    }

    /// Invalidate the running session and silence every output, synchronously.
    fn halt_session(&self, control: &mut Control) {
        self.inner.fence.halt();
        if let Some(session) = control.session.take() {
            session.cancel.cancel();
            if session.streaming {
                self.inner.host.stop();
            }
            session.task.abort();
        }
        self.inner.slot.release_all();
    }

    /// Stop speaking. No event of the stopped session is delivered after
    /// this returns.
    pub fn stop(&self) {
        let mut control = self.control();
        if let Some(pending) = control.pending_restart.take() {
            pending.task.abort();
        }
        self.halt_session(&mut control);
        tracing::debug!("speech stopped");
    }

    /// Restart the current session from the last reported word after a
    /// short settle delay, so a burst of changes costs one restart.
    fn restart_if_speaking(&self) {
        let mut control = self.control();
        let resume = match control.pending_restart.take() {
            Some(pending) => {
                pending.task.abort();
                Some((pending.words, pending.resume_from))
            }
            None if self.inner.fence.is_speaking() => control.session.as_ref().map(|s| {
                let resume_from = self.inner.fence.last_reported().unwrap_or(s.from_index);
                (Arc::clone(&s.words), resume_from)
            }),
            None => None,
        };
        let Some((words, resume_from)) = resume else {
            return;
        };

        self.halt_session(&mut control);
        let id = self.inner.restart_ids.fetch_add(1, Ordering::Relaxed);
        let settle = self.settings().restart_settle();
        let engine = self.clone();
        let task = self.inner.runtime.spawn(async move {
            tokio::time::sleep(settle).await;
            engine.fire_restart(id);
        });
        tracing::debug!(resume_from, ?settle, "restart scheduled");
        control.pending_restart = Some(PendingRestart {
            id,
            words,
            resume_from,
            task,
        });
    }

    fn fire_restart(&self, id: u64) {
        let mut control = self.control();
        let pending = match control.pending_restart.take() {
            Some(pending) if pending.id == id => pending,
            other => {
                control.pending_restart = other;
                return;
            }
        };
        if !self.is_enabled() {
            return;
        }
        tracing::debug!(resume_from = pending.resume_from, "restarting session");
        self.start_session(&mut control, pending.words, pending.resume_from);
    }

    // ── Settings ───────────────────────────────────────

    /// Set the speaking rate (clamped to `[0.5, 4.0]`). A running session
    /// restarts from the current word at the new rate.
    pub fn set_rate(&self, rate: f32) {
        let rate = clamp_rate(rate);
        self.update_settings(|s| s.rate = rate);
        self.restart_if_speaking();
    }

    /// Derive the new rate from the current one, e.g. `|r| r + 0.25`.
    pub fn update_rate(&self, f: impl FnOnce(f32) -> f32) {
        self.set_rate(f(self.rate()));
    }

    pub fn set_voice(&self, voice: Option<String>) {
        self.update_settings(|s| s.provider.set_voice(voice));
        self.restart_if_speaking();
    }

    /// Switch to another provider configuration, rebuilding its adapter.
    pub fn switch_provider(&self, provider: ProviderConfig) {
        let mut candidate = self.settings();
        candidate.provider = provider.clone();
        if let Some(adapter) = build_provider(&candidate) {
            self.register_provider(adapter.kind(), adapter);
        }
        tracing::info!(provider = %provider.kind(), "switching speech provider");
        self.update_settings(|s| s.provider = provider);
        self.restart_if_speaking();
    }

    /// Flip the enabled flag; disabling stops any session. Returns the new state.
    pub fn toggle_enabled(&self) -> bool {
        let mut enabled = false;
        self.update_settings(|s| {
            s.enabled = !s.enabled;
            enabled = s.enabled;
        });
        if !enabled {
            self.stop();
        }
        enabled
    }

    // ── Queries ────────────────────────────────────────

    pub fn is_enabled(&self) -> bool {
        self.settings().enabled
    }

    pub fn rate(&self) -> f32 {
        self.settings().rate
    }

    pub fn active_provider(&self) -> ProviderKind {
        self.settings().provider.kind()
    }

    pub fn config(&self) -> SpeechSystemConfig {
        self.settings()
    }

    /// True while a session runs or a restart is pending.
    pub fn is_speaking(&self) -> bool {
        self.inner.fence.is_speaking() || self.control().pending_restart.is_some()
    }

    pub fn last_reported_word(&self) -> Option<usize> {
        self.inner.fence.last_reported()
    }

    pub async fn list_voices(&self) -> Vec<VoiceProfile> {
        match self.active_provider() {
            ProviderKind::Offline => self.inner.host.voices(),
            kind => match self.buffered_provider(kind) {
                Some(provider) => provider.voices().await,
                None => Vec::new(),
            },
        }
    }

    pub async fn is_provider_available(&self) -> bool {
        match self.active_provider() {
            ProviderKind::Offline => self.inner.host.is_available(),
            kind => match self.buffered_provider(kind) {
                Some(provider) => provider.is_available().await,
                None => false,
            },
        }
    }
}

/// Build the buffered adapter for `config.provider`, wrapped in the
/// synthesis cache when enabled. `None` for the offline provider.
fn build_provider(config: &SpeechSystemConfig) -> Option<Arc<dyn BufferedProvider>> {
    let provider: Arc<dyn BufferedProvider> = match &config.provider {
        ProviderConfig::Offline(_) => return None,
        ProviderConfig::Cloud(cloud) => {
            if cloud.resolve_api_key().is_none() {
                tracing::warn!("cloud provider has no api key; synthesis will fail");
            }
            Arc::new(CloudProvider::from_config(cloud, config.request))
        }
        ProviderConfig::LocalServer(local) => {
            Arc::new(LocalServerProvider::from_config(local, config.request))
        }
    };
    if config.cache.enabled {
        Some(Arc::new(CachedProvider::new(provider, &config.cache)))
    } else {
        Some(provider)
    }
}
