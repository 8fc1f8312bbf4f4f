use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::cancel::CancelToken;
use super::interface::{
    ChunkOutcome, Gender, ProviderKind, SpeechError, StreamingProvider, SynthesisRequest,
    VoiceProfile,
};
use super::offsets::OffsetTable;
use super::session::BoundaryReporter;

/// Progress of one host utterance, as reported by the host platform.
#[derive(Debug, Clone, PartialEq)]
pub enum HostSpeechEvent {
    /// The host reached the character at `char_offset` of the utterance text.
    Boundary { char_offset: usize },
    End,
    Error(String),
}

#[derive(Debug, Clone)]
pub struct HostUtterance {
    pub text: String,
    pub voice: Option<String>,
    pub rate: f32,
}

/// The platform's own speech capability: synthesizes and plays in one step.
pub trait HostSpeech: Send + Sync {
    /// Start speaking. Progress arrives on the returned channel; dropping the
    /// receiver abandons the utterance.
    fn speak(&self, utterance: HostUtterance) -> Result<mpsc::UnboundedReceiver<HostSpeechEvent>, SpeechError>;

    /// Silence the host immediately.
    fn cancel(&self);

    fn voices(&self) -> Vec<VoiceProfile>;

    fn is_available(&self) -> bool;
}

// ── Delegated Host ─────────────────────────────────────

/// Requests forwarded to the embedding application, which owns the actual
/// platform speech API.
#[derive(Debug)]
pub enum HostRequest {
    Speak {
        utterance_id: u64,
        utterance: HostUtterance,
        events: mpsc::UnboundedSender<HostSpeechEvent>,
    },
    Cancel,
}

/// Host speech delegated over a channel. The Rust side cannot reach most
/// platform speech APIs directly, so the embedder drains
/// [`HostRequest`]s and answers each `Speak` on its event sender.
pub struct DelegatedHost {
    requests: mpsc::UnboundedSender<HostRequest>,
    voices: RwLock<Vec<VoiceProfile>>,
    next_id: AtomicU64,
}

impl DelegatedHost {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<HostRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                requests: tx,
                voices: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(1),
            },
            rx,
        )
    }

    /// Voices the host platform offers; the embedder announces them.
    pub fn set_voices(&self, voices: Vec<VoiceProfile>) {
        if let Ok(mut current) = self.voices.write() {
            *current = voices;
        }
    }
}

impl HostSpeech for DelegatedHost {
    fn speak(&self, utterance: HostUtterance) -> Result<mpsc::UnboundedReceiver<HostSpeechEvent>, SpeechError> {
        let (events, rx) = mpsc::unbounded_channel();
        let utterance_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.requests
            .send(HostRequest::Speak {
                utterance_id,
                utterance,
                events,
            })
            .map_err(|_| SpeechError::Unavailable("host speech delegate is gone".into()))?;
        Ok(rx)
    }

    fn cancel(&self) {
        let _ = self.requests.send(HostRequest::Cancel);
    }

    fn voices(&self) -> Vec<VoiceProfile> {
        let announced = self.voices.read().map(|v| v.clone()).unwrap_or_default();
        if !announced.is_empty() {
            return announced;
        }
        // Host voices are enumerated by the embedder.
        // Expose a generic entry so the system knows this provider exists.
        vec![VoiceProfile {
            voice_id: "host_default".to_string(),
            name: "System Default".to_string(),
            gender: Gender::Neutral,
            language: "en".to_string(),
            provider: ProviderKind::Offline,
        }]
    }

    fn is_available(&self) -> bool {
        !self.requests.is_closed()
    }
}

// ── Streaming Provider ─────────────────────────────────

/// Offline provider: hands whole chunks to the host and relays its
/// character-offset boundaries as global word indices.
pub struct HostSpeechProvider {
    host: Arc<dyn HostSpeech>,
}

impl HostSpeechProvider {
    pub fn new(host: Arc<dyn HostSpeech>) -> Self {
        Self { host }
    }
}

#[async_trait]
impl StreamingProvider for HostSpeechProvider {
    fn id(&self) -> String {
        "offline".to_string()
    }

    fn voices(&self) -> Vec<VoiceProfile> {
        self.host.voices()
    }

    fn is_available(&self) -> bool {
        self.host.is_available()
    }

    async fn speak_chunk(
        &self,
        request: &SynthesisRequest,
        reporter: &BoundaryReporter,
        cancel: &CancelToken,
    ) -> Result<ChunkOutcome, SpeechError> {
        let (text, table) = OffsetTable::plain(request.chunk_words(), request.start_index);
        let mut events = self.host.speak(HostUtterance {
            text,
            voice: request.voice.clone(),
            rate: request.rate,
        })?;

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.host.cancel();
                    return Ok(ChunkOutcome::Cancelled);
                }
                event = events.recv() => event,
            };
            match event {
                Some(HostSpeechEvent::Boundary { char_offset }) => {
                    if let Some(word) = table.word_at(char_offset) {
                        reporter.report(word);
                    }
                }
                Some(HostSpeechEvent::End) => return Ok(ChunkOutcome::Completed),
                Some(HostSpeechEvent::Error(message)) => {
                    return Err(SpeechError::SynthesisFailed(message))
                }
                None => {
                    return Err(SpeechError::Unavailable(
                        "host dropped the utterance without ending it".into(),
                    ))
                }
            }
        }
    }

    fn stop(&self) {
        self.host.cancel();
    }
}
