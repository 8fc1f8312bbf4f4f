use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use super::cancel::CancelToken;
use super::session::BoundaryReporter;

// ── Error Types ────────────────────────────────────────

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SpeechError {
    #[error("speech provider not found: {0}")]
    ProviderNotFound(String),
    #[error("synthesis failed: {0}")]
    SynthesisFailed(String),
    #[error("speech request timed out: {0}")]
    Timeout(String),
    #[error("speech config error: {0}")]
    Config(String),
    #[error("speech provider unavailable: {0}")]
    Unavailable(String),
    /// Network-level failure. `status` is set for non-success HTTP replies.
    #[error("transport error: {message}")]
    Transport {
        message: String,
        status: Option<u16>,
    },
    #[error("malformed provider response: {0}")]
    MalformedResponse(String),
    #[error("playback error: {0}")]
    Playback(String),
    #[error("audio decode error: {0}")]
    Decode(String),
    #[error("cancelled")]
    Cancelled,
}

impl SpeechError {
    pub fn transport(message: impl Into<String>) -> Self {
        SpeechError::Transport {
            message: message.into(),
            status: None,
        }
    }

    /// Worth retrying under a retry policy: network errors, 429 and 5xx.
    pub fn is_transient(&self) -> bool {
        match self {
            SpeechError::Transport { status: None, .. } => true,
            SpeechError::Transport {
                status: Some(code), ..
            } => *code == 429 || (500..600).contains(code),
            SpeechError::Timeout(_) => true,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for SpeechError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            return SpeechError::Timeout(e.to_string());
        }
        if e.is_decode() {
            return SpeechError::MalformedResponse(e.to_string());
        }
        SpeechError::Transport {
            message: e.to_string(),
            status: e.status().map(|s| s.as_u16()),
        }
    }
}

// ── Provider Kinds & Voices ────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Host speech capability; synthesizes and plays atomically.
    Offline,
    /// Cloud speech service reached over a websocket.
    Cloud,
    /// Self-hosted inference server reached over HTTP.
    LocalServer,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::Offline => write!(f, "offline"),
            ProviderKind::Cloud => write!(f, "cloud"),
            ProviderKind::LocalServer => write!(f, "local_server"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
    Neutral,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VoiceProfile {
    pub voice_id: String,
    pub name: String,
    pub gender: Gender,
    pub language: String,
    pub provider: ProviderKind,
}

// ── Synthesis Data ─────────────────────────────────────

/// One row of a chunk's timing table: the global word index that starts
/// being spoken at `audio_offset_ms` into the chunk's audio.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimingEntry {
    pub word_index: usize,
    pub audio_offset_ms: u64,
}

/// A request to voice one chunk of the word stream.
#[derive(Debug, Clone)]
pub struct SynthesisRequest {
    pub words: Arc<[String]>,
    pub start_index: usize,
    pub length: usize,
    pub voice: Option<String>,
    pub rate: f32,
}

impl SynthesisRequest {
    /// The words of this chunk only.
    pub fn chunk_words(&self) -> &[String] {
        let end = (self.start_index + self.length).min(self.words.len());
        &self.words[self.start_index.min(end)..end]
    }

    pub fn end_index(&self) -> usize {
        self.start_index + self.length
    }
}

/// Synthesized audio for one chunk plus its timing table. Owned by the
/// scheduler that requested it until played or discarded.
#[derive(Debug, Clone)]
pub struct SynthesisResult {
    /// Encoded audio (WAV).
    pub audio: Arc<Vec<u8>>,
    pub timings: Vec<TimingEntry>,
    pub start_index: usize,
    pub length: usize,
}

impl SynthesisResult {
    pub fn end_index(&self) -> usize {
        self.start_index + self.length
    }
}

/// How playback of one chunk finished.
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkOutcome {
    Completed,
    Cancelled,
    DeviceError(String),
}

// ── Provider Traits ────────────────────────────────────

/// A backend that returns a complete audio payload plus timing table per
/// request, so the next chunk can be synthesized while the current one plays.
#[async_trait]
pub trait BufferedProvider: Send + Sync {
    /// Stable identifier, also used as a cache key component.
    fn id(&self) -> String;

    fn kind(&self) -> ProviderKind;

    /// Voices this backend can speak with.
    async fn voices(&self) -> Vec<VoiceProfile>;

    /// Check if the backend is currently reachable / configured.
    async fn is_available(&self) -> bool;

    /// Synthesize one chunk. Transport failures, malformed responses and
    /// cancellation all yield `None`; errors never cross this boundary.
    async fn synthesize(
        &self,
        request: &SynthesisRequest,
        cancel: &CancelToken,
    ) -> Option<SynthesisResult>;
}

/// A backend that owns both synthesis and playback (the host platform) and
/// reports word boundaries natively.
#[async_trait]
pub trait StreamingProvider: Send + Sync {
    fn id(&self) -> String;

    fn voices(&self) -> Vec<VoiceProfile>;

    fn is_available(&self) -> bool;

    /// Speak one chunk, relaying boundary notifications to `reporter` until
    /// the utterance ends, fails, or `cancel` fires.
    async fn speak_chunk(
        &self,
        request: &SynthesisRequest,
        reporter: &BoundaryReporter,
        cancel: &CancelToken,
    ) -> Result<ChunkOutcome, SpeechError>;

    /// Silence the host immediately.
    fn stop(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(SpeechError::transport("reset").is_transient());
        assert!(SpeechError::Transport {
            message: "busy".into(),
            status: Some(503)
        }
        .is_transient());
        assert!(SpeechError::Transport {
            message: "slow down".into(),
            status: Some(429)
        }
        .is_transient());
        assert!(!SpeechError::Transport {
            message: "bad key".into(),
            status: Some(401)
        }
        .is_transient());
        assert!(!SpeechError::MalformedResponse("x".into()).is_transient());
    }

    #[test]
    fn chunk_words_slices_the_stream() {
        let words: Arc<[String]> = ["a", "b", "c", "d"].iter().map(|s| s.to_string()).collect();
        let req = SynthesisRequest {
            words,
            start_index: 1,
            length: 2,
            voice: None,
            rate: 1.0,
        };
        assert_eq!(req.chunk_words(), &["b".to_string(), "c".to_string()]);
        assert_eq!(req.end_index(), 3);
    }
}
