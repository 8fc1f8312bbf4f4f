use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::speech::cancel::CancelToken;
use crate::speech::config::{CacheConfig, LocalServerConfig, ProviderConfig, SpeechSystemConfig};
use crate::speech::engine::SpeechEngine;
use crate::speech::events::{EventReceiver, SpeechEvent};
use crate::speech::host::{DelegatedHost, HostRequest, HostSpeechEvent};
use crate::speech::interface::{
    BufferedProvider, ProviderKind, SpeechError, SynthesisRequest, SynthesisResult, TimingEntry,
    VoiceProfile,
};
use crate::speech::playback::{pcm16_to_wav, ActivePlayback, AudioClip, AudioOutput, PlaybackState};
use crate::speech::segmenter::ChunkPolicy;

/// Every mock word lasts this long in synthesized audio.
pub const WORD_MS: u64 = 100;
/// Mock audio runs at 1 kHz so one sample is one millisecond.
const MOCK_SAMPLE_RATE: u32 = 1000;

pub fn words(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("w{}", i)).collect()
}

// ── Fake audio output ───────────────────────────────────────

#[derive(Default)]
struct OutputStats {
    active: AtomicUsize,
    max_active: AtomicUsize,
    started: Mutex<Vec<Instant>>,
}

/// Audio output driven by the (paused) tokio clock.
#[derive(Default)]
pub struct FakeOutput {
    stats: Arc<OutputStats>,
    pub fail_on_start: AtomicBool,
}

impl FakeOutput {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn active(&self) -> usize {
        self.stats.active.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.stats.max_active.load(Ordering::SeqCst)
    }

    pub fn start_times(&self) -> Vec<Instant> {
        self.stats.started.lock().unwrap().clone()
    }
}

struct FakePlayback {
    stats: Arc<OutputStats>,
    started: Instant,
    duration_ms: u64,
    stopped: bool,
}

impl ActivePlayback for FakePlayback {
    fn position_ms(&self) -> u64 {
        (self.started.elapsed().as_millis() as u64).min(self.duration_ms)
    }

    fn state(&self) -> PlaybackState {
        if self.stopped || self.started.elapsed().as_millis() as u64 >= self.duration_ms {
            PlaybackState::Finished
        } else {
            PlaybackState::Playing
        }
    }

    fn stop(&mut self) {
        if !self.stopped {
            self.stopped = true;
            self.stats.active.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for FakePlayback {
    fn drop(&mut self) {
        self.stop();
    }
}

impl AudioOutput for FakeOutput {
    fn start(&self, clip: AudioClip) -> Result<Box<dyn ActivePlayback>, SpeechError> {
        if self.fail_on_start.load(Ordering::SeqCst) {
            return Err(SpeechError::Playback("device unplugged".into()));
        }
        let now = self.stats.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.max_active.fetch_max(now, Ordering::SeqCst);
        self.stats.started.lock().unwrap().push(Instant::now());
        Ok(Box::new(FakePlayback {
            stats: Arc::clone(&self.stats),
            started: Instant::now(),
            duration_ms: clip.duration_ms(),
            stopped: false,
        }))
    }
}

// ── Mock buffered provider ──────────────────────────────────

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub start_index: usize,
    pub length: usize,
    pub rate: f32,
    pub at: Instant,
}

/// Buffered provider with a fixed latency and `WORD_MS` of audio per word.
pub struct MockProvider {
    latency: Duration,
    /// Chunks starting at or after this index fail.
    pub fail_from: Mutex<Option<usize>>,
    /// Truncate every chunk's audio to this length; timings are left alone.
    audio_cap_ms: Option<u64>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl MockProvider {
    pub fn new(latency_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            latency: Duration::from_millis(latency_ms),
            fail_from: Mutex::new(None),
            audio_cap_ms: None,
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Audio shorter than the timing table, so the last words start after
    /// the clip has already finished.
    pub fn with_short_audio(latency_ms: u64, audio_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            latency: Duration::from_millis(latency_ms),
            fail_from: Mutex::new(None),
            audio_cap_ms: Some(audio_ms),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn failing_from(latency_ms: u64, index: usize) -> Arc<Self> {
        let provider = Self::new(latency_ms);
        *provider.fail_from.lock().unwrap() = Some(index);
        provider
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn starts(&self) -> Vec<usize> {
        self.requests().iter().map(|r| r.start_index).collect()
    }
}

#[async_trait]
impl BufferedProvider for MockProvider {
    fn id(&self) -> String {
        "mock".into()
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::LocalServer
    }

    async fn voices(&self) -> Vec<VoiceProfile> {
        Vec::new()
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn synthesize(&self, request: &SynthesisRequest, cancel: &CancelToken) -> Option<SynthesisResult> {
        self.requests.lock().unwrap().push(RecordedRequest {
            start_index: request.start_index,
            length: request.length,
            rate: request.rate,
            at: Instant::now(),
        });
        cancel
            .run_until_cancelled(tokio::time::sleep(self.latency))
            .await?;

        let fail_from = *self.fail_from.lock().unwrap();
        if matches!(fail_from, Some(index) if request.start_index >= index) {
            return None;
        }

        let full_ms = request.length as u64 * WORD_MS;
        let ms = self.audio_cap_ms.map_or(full_ms, |cap| cap.min(full_ms));
        let pcm = vec![0u8; ms as usize * 2];
        Some(SynthesisResult {
            audio: Arc::new(pcm16_to_wav(&pcm, MOCK_SAMPLE_RATE).ok()?),
            timings: (0..request.length)
                .map(|i| TimingEntry {
                    word_index: request.start_index + i,
                    audio_offset_ms: i as u64 * WORD_MS,
                })
                .collect(),
            start_index: request.start_index,
            length: request.length,
        })
    }
}

// ── Engine setup ────────────────────────────────────────────

/// Small chunks so short texts span several of them: 10 words → 4, 4, 2.
pub fn test_config(provider: ProviderConfig) -> SpeechSystemConfig {
    SpeechSystemConfig {
        provider,
        chunking: ChunkPolicy {
            min_words: 2,
            max_words: 4,
        },
        cache: CacheConfig {
            enabled: false,
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn buffered_engine(
    provider: Arc<MockProvider>,
    output: Arc<FakeOutput>,
) -> (SpeechEngine, EventReceiver) {
    let (host, _requests) = DelegatedHost::new();
    let config = test_config(ProviderConfig::LocalServer(LocalServerConfig::default()));
    let (engine, events) = SpeechEngine::new(config, output, Arc::new(host)).unwrap();
    engine.register_provider(ProviderKind::LocalServer, provider);
    (engine, events)
}

/// Engine on the offline provider, with a scripted host that voices each
/// word for `WORD_MS` and reports its character offset.
pub fn host_engine(output: Arc<FakeOutput>) -> (SpeechEngine, EventReceiver, Arc<Mutex<Vec<String>>>) {
    let (host, requests) = DelegatedHost::new();
    let spoken = Arc::new(Mutex::new(Vec::new()));
    tokio::spawn(scripted_host(requests, Arc::clone(&spoken)));
    let config = test_config(ProviderConfig::default());
    let (engine, events) = SpeechEngine::new(config, output, Arc::new(host)).unwrap();
    (engine, events, spoken)
}

async fn scripted_host(mut requests: mpsc::UnboundedReceiver<HostRequest>, spoken: Arc<Mutex<Vec<String>>>) {
    let mut current: Option<tokio::task::JoinHandle<()>> = None;
    while let Some(request) = requests.recv().await {
        match request {
            HostRequest::Speak { utterance, events, .. } => {
                if let Some(task) = current.take() {
                    task.abort();
                }
                spoken.lock().unwrap().push(utterance.text.clone());
                current = Some(tokio::spawn(async move {
                    let mut offset = 0;
                    for word in utterance.text.split(' ') {
                        if events.send(HostSpeechEvent::Boundary { char_offset: offset }).is_err() {
                            return;
                        }
                        offset += word.chars().count() + 1;
                        tokio::time::sleep(Duration::from_millis(WORD_MS)).await;
                    }
                    let _ = events.send(HostSpeechEvent::End);
                }));
            }
            HostRequest::Cancel => {
                if let Some(task) = current.take() {
                    task.abort();
                }
                spoken.lock().unwrap().push("<cancel>".into());
            }
        }
    }
}

// ── Event helpers ───────────────────────────────────────────

pub fn drain(rx: &mut EventReceiver) -> Vec<SpeechEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

/// Collect events until the session ends or halts.
pub async fn until_finished(rx: &mut EventReceiver) -> Vec<SpeechEvent> {
    let mut out = Vec::new();
    let collect = async {
        while let Some(event) = rx.recv().await {
            let done = matches!(event, SpeechEvent::Ended | SpeechEvent::Halted { .. });
            out.push(event);
            if done {
                break;
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(120), collect)
        .await
        .expect("session did not finish");
    out
}

pub fn boundaries(events: &[SpeechEvent]) -> Vec<usize> {
    events
        .iter()
        .filter_map(|e| match e {
            SpeechEvent::WordBoundary { index } => Some(*index),
            _ => None,
        })
        .collect()
}
