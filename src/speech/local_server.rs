use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::cancel::CancelToken;
use super::config::{LocalServerConfig, RequestPolicy, DEFAULT_LOCAL_VOICE};
use super::interface::{
    Gender, ProviderKind, SpeechError, SynthesisRequest, SynthesisResult, TimingEntry,
    BufferedProvider, VoiceProfile,
};
use super::offsets::{evenly_spaced, OffsetTable, TimingBuilder};
use super::playback::AudioClip;
use crate::utils::http::{error_for_status, run_with_policy};

/// Local inference server provider: sends HTTP requests to a self-hosted
/// speech server that returns audio plus per-word timestamps.
///
/// The server must expose:
///   POST /synthesize  `{text, voice, speed}` → `{audio (base64 WAV), timestamps, sample_rate}`
///   GET  /voices      `{voices: [{id, label, lang}]}`
pub struct LocalServerProvider {
    client: Client,
    base_url: String,
    default_voice: String,
    policy: RequestPolicy,
}

#[derive(Serialize)]
struct SynthesizeBody<'a> {
    text: &'a str,
    voice: &'a str,
    speed: f32,
}

#[derive(Deserialize)]
struct SynthesizeReply {
    audio: String,
    #[serde(default)]
    timestamps: Vec<WordStamp>,
    #[serde(default)]
    sample_rate: Option<u32>,
}

/// One word as the server reports it; times are seconds into the audio.
#[derive(Debug, Deserialize)]
struct WordStamp {
    word: String,
    start: f64,
    #[allow(dead_code)]
    #[serde(default)]
    end: f64,
}

#[derive(Deserialize)]
struct VoicesReply {
    #[serde(default)]
    voices: Vec<ServerVoice>,
}

#[derive(Deserialize)]
struct ServerVoice {
    id: String,
    #[serde(default)]
    label: String,
    #[serde(default)]
    lang: String,
}

impl LocalServerProvider {
    pub fn new(base_url: impl Into<String>, default_voice: Option<String>, policy: RequestPolicy) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            default_voice: default_voice.unwrap_or_else(|| DEFAULT_LOCAL_VOICE.to_string()),
            policy,
        }
    }

    pub fn from_config(config: &LocalServerConfig, policy: RequestPolicy) -> Self {
        Self::new(config.base_url.clone(), config.voice.clone(), policy)
    }

    async fn request_chunk(&self, request: &SynthesisRequest) -> Result<SynthesisResult, SpeechError> {
        let (text, table) = OffsetTable::plain(request.chunk_words(), request.start_index);
        let url = format!("{}/synthesize", self.base_url);
        let voice = request.voice.as_deref().unwrap_or(&self.default_voice);
        let body = SynthesizeBody {
            text: &text,
            voice,
            speed: request.rate,
        };

        let (url, body) = (&url, &body);
        let reply: SynthesizeReply = run_with_policy(&self.policy, "local synthesize", || async move {
            let response = self.client.post(url).json(body).send().await?;
            let response = error_for_status(response).await?;
            response
                .json::<SynthesizeReply>()
                .await
                .map_err(|e| SpeechError::MalformedResponse(format!("synthesize reply: {}", e)))
        })
        .await?;

        let audio = STANDARD
            .decode(reply.audio.trim())
            .map_err(|e| SpeechError::MalformedResponse(format!("audio is not base64: {}", e)))?;
        if audio.is_empty() {
            return Err(SpeechError::MalformedResponse("empty audio".into()));
        }
        let clip = AudioClip::from_wav_bytes(&audio)
            .map_err(|e| SpeechError::MalformedResponse(e.to_string()))?;
        if let Some(rate) = reply.sample_rate {
            if rate != clip.sample_rate {
                tracing::debug!(reported = rate, actual = clip.sample_rate, "sample rate mismatch, trusting WAV header");
            }
        }

        let mut timings = map_timestamps(request.chunk_words(), &table, &reply.timestamps);
        if timings.is_empty() {
            tracing::debug!(start = request.start_index, "no usable timestamps, spreading words evenly");
            timings = evenly_spaced(request.start_index, request.length, clip.duration_ms());
        }

        Ok(SynthesisResult {
            audio: std::sync::Arc::new(audio),
            timings,
            start_index: request.start_index,
            length: request.length,
        })
    }
}

/// Match each stamped token against the chunk's words, scanning forward,
/// and map it to a global word index. A token only matches a whole word
/// (ignoring surrounding punctuation), so a token the server never spoke as
/// its own word is skipped rather than credited to a later word.
fn map_timestamps(words: &[String], table: &OffsetTable, stamps: &[WordStamp]) -> Vec<TimingEntry> {
    let mut builder = TimingBuilder::new(table);
    let mut next_word = 0;
    for stamp in stamps {
        let token = stamp.word.trim();
        if token.is_empty() || !stamp.start.is_finite() {
            continue;
        }
        let found = words
            .iter()
            .enumerate()
            .skip(next_word)
            .find(|(_, word)| is_word_token(word, token))
            .map(|(local, _)| local);
        let Some(local) = found else {
            tracing::trace!(token, "timestamp token matches no word in the chunk");
            continue;
        };
        next_word = local + 1;
        let offset_ms = (stamp.start.max(0.0) * 1000.0).round() as u64;
        if let Some(start) = table.start_of(table.base_index() + local) {
            builder.push_char_offset(start, offset_ms);
        }
    }
    builder.finish()
}

/// `word` is `token`, give or take leading/trailing punctuation and case.
fn is_word_token(word: &str, token: &str) -> bool {
    let core = word.trim_start_matches(|c: char| !c.is_alphanumeric());
    let core = if core.is_empty() { word } else { core };
    let (core, token) = (core.to_lowercase(), token.to_lowercase());
    match core.strip_prefix(token.as_str()) {
        Some(rest) => rest.chars().next().map_or(true, |c| !c.is_alphanumeric()),
        None => false,
    }
}

fn gender_from_label(label: &str) -> Gender {
    let lower = label.to_lowercase();
    if lower.contains("female") {
        Gender::Female
    } else if lower.contains("male") {
        Gender::Male
    } else {
        Gender::Neutral
    }
}

#[async_trait]
impl BufferedProvider for LocalServerProvider {
    fn id(&self) -> String {
        format!("local_server:{}", self.base_url)
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::LocalServer
    }

    async fn voices(&self) -> Vec<VoiceProfile> {
        let url = format!("{}/voices", self.base_url);
        let reply = match self.client.get(&url).timeout(Duration::from_secs(5)).send().await {
            Ok(resp) if resp.status().is_success() => resp.json::<VoicesReply>().await,
            Ok(resp) => {
                tracing::warn!(status = %resp.status(), "local server voice listing failed");
                return Vec::new();
            }
            Err(e) => {
                tracing::warn!(error = %e, "local server unreachable");
                return Vec::new();
            }
        };
        match reply {
            Ok(reply) => reply
                .voices
                .into_iter()
                .map(|v| VoiceProfile {
                    gender: gender_from_label(&v.label),
                    name: if v.label.is_empty() { v.id.clone() } else { v.label },
                    voice_id: v.id,
                    language: v.lang,
                    provider: ProviderKind::LocalServer,
                })
                .collect(),
            Err(e) => {
                tracing::warn!(error = %e, "malformed voice listing");
                Vec::new()
            }
        }
    }

    async fn is_available(&self) -> bool {
        let url = format!("{}/voices", self.base_url);
        match self.client.get(&url).timeout(Duration::from_secs(3)).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    async fn synthesize(&self, request: &SynthesisRequest, cancel: &CancelToken) -> Option<SynthesisResult> {
        match cancel.run_until_cancelled(self.request_chunk(request)).await? {
            Ok(result) => Some(result),
            Err(e) => {
                tracing::warn!(start = request.start_index, error = %e, "local server synthesis failed");
                None
            }
        }
    }
}
