//! Cloud speech provider over the service's websocket protocol.
//!
//! One connection per chunk: a `speech.config` frame enabling word boundary
//! metadata, then the chunk as SSML. The service answers with
//! `audio.metadata` text frames (word boundaries), binary `audio` frames
//! (raw 24 kHz 16-bit mono PCM) and finally `turn.end`.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::borrow::Cow;
use std::sync::Arc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message};

use super::cancel::CancelToken;
use super::config::{CloudConfig, RequestPolicy, DEFAULT_CLOUD_VOICE};
use super::interface::{
    BufferedProvider, Gender, ProviderKind, SpeechError, SynthesisRequest, SynthesisResult,
    TimingEntry, VoiceProfile,
};
use super::offsets::{evenly_spaced, find_chars, OffsetTable, TimingBuilder};
use super::playback::pcm16_to_wav;
use crate::utils::http::run_with_policy;

const OUTPUT_SAMPLE_RATE: u32 = 24_000;
const SPEECH_CONFIG: &str = r#"{"context":{"synthesis":{"audio":{"metadataoptions":{"sentenceBoundaryEnabled":"false","wordBoundaryEnabled":"true"},"outputFormat":"raw-24khz-16bit-mono-pcm"}}}}"#;
const SSML_SUFFIX: &str = "</prosody></voice></speak>";
/// Boundary offsets arrive in 100 ns ticks.
const TICKS_PER_MS: u64 = 10_000;

// ── SSML ───────────────────────────────────────────────

pub fn escape_xml(text: &str) -> Cow<'_, str> {
    if !text.contains(['&', '<', '>', '"', '\'']) {
        return Cow::Borrowed(text);
    }
    let mut out = String::with_capacity(text.len() + 8);
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    Cow::Owned(out)
}

/// Relative prosody rate, e.g. `1.5` → `+50%`.
pub fn prosody_rate(rate: f32) -> String {
    format!("{:+}%", ((rate - 1.0) * 100.0).round() as i32)
}

/// A chunk rendered as SSML plus the offsets of its words inside the markup.
pub struct SsmlChunk {
    pub markup: String,
    pub table: OffsetTable,
    /// Char offset where the first word starts.
    pub body_start: usize,
}

impl SsmlChunk {
    pub fn build(words: &[String], start_index: usize, voice: &str, language: &str, rate: f32) -> Self {
        let prefix = format!(
            "<speak version='1.0' xmlns='http://www.w3.org/2001/10/synthesis' xml:lang='{}'><voice name='{}'><prosody rate='{}'>",
            escape_xml(language),
            escape_xml(voice),
            prosody_rate(rate)
        );
        let body_start = prefix.chars().count();
        let (body, table) = OffsetTable::build(words, start_index, body_start, escape_xml);
        let mut markup = prefix;
        markup.push_str(&body);
        markup.push_str(SSML_SUFFIX);
        Self {
            markup,
            table,
            body_start,
        }
    }

    /// Map boundary reports to timing entries. Reports without a text offset
    /// are located by searching the markup forward from the previous match.
    fn timings(&self, boundaries: &[WordBoundary]) -> Vec<TimingEntry> {
        let mut builder = TimingBuilder::new(&self.table);
        let mut cursor = self.body_start;
        for boundary in boundaries {
            let needle = escape_xml(&boundary.text);
            let position = boundary
                .text_offset
                .or_else(|| find_chars(&self.markup, &needle, cursor));
            match position {
                Some(pos) => {
                    cursor = pos + needle.chars().count().max(1);
                    builder.push_char_offset(pos, boundary.offset_ms);
                }
                None => tracing::trace!(text = %boundary.text, "boundary text not found in markup"),
            }
        }
        builder.finish()
    }
}

// ── Wire Frames ────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
struct WordBoundary {
    offset_ms: u64,
    text: String,
    text_offset: Option<usize>,
}

#[derive(Deserialize)]
struct MetadataFrame {
    #[serde(rename = "Metadata", default)]
    metadata: Vec<MetadataItem>,
}

#[derive(Deserialize)]
struct MetadataItem {
    #[serde(rename = "Type")]
    kind: String,
    #[serde(rename = "Data")]
    data: Option<BoundaryData>,
}

#[derive(Deserialize)]
struct BoundaryData {
    #[serde(rename = "Offset", default)]
    offset: u64,
    #[serde(default)]
    text: Option<BoundaryText>,
    #[serde(rename = "TextOffset", alias = "textOffset", default)]
    text_offset: Option<usize>,
}

#[derive(Deserialize)]
struct BoundaryText {
    #[serde(rename = "Text", default)]
    text: String,
}

fn text_frame(path: &str, content_type: &str, request_id: &str, body: &str) -> String {
    format!(
        "X-RequestId:{}\r\nX-Timestamp:{}\r\nContent-Type:{}\r\nPath:{}\r\n\r\n{}",
        request_id,
        chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        content_type,
        path,
        body
    )
}

fn header_path(headers: &str) -> Option<&str> {
    headers.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        name.trim()
            .eq_ignore_ascii_case("path")
            .then(|| value.trim())
    })
}

/// Split a text frame into `(headers, body)`.
fn split_text_frame(frame: &str) -> (&str, &str) {
    frame.split_once("\r\n\r\n").unwrap_or((frame, ""))
}

/// PCM payload of a binary frame if its header path is `audio`.
fn audio_payload(frame: &[u8]) -> Result<Option<&[u8]>, SpeechError> {
    if frame.len() < 2 {
        return Ok(None);
    }
    let header_len = u16::from_be_bytes([frame[0], frame[1]]) as usize;
    let body_start = 2 + header_len;
    if body_start > frame.len() {
        return Err(SpeechError::MalformedResponse(
            "binary frame header exceeds frame".into(),
        ));
    }
    let headers = String::from_utf8_lossy(&frame[2..body_start]);
    if header_path(&headers) == Some("audio") {
        Ok(Some(&frame[body_start..]))
    } else {
        Ok(None)
    }
}

fn parse_metadata(body: &str) -> Result<Vec<WordBoundary>, SpeechError> {
    let frame: MetadataFrame = serde_json::from_str(body)
        .map_err(|e| SpeechError::MalformedResponse(format!("audio.metadata: {}", e)))?;
    Ok(frame
        .metadata
        .into_iter()
        .filter(|item| item.kind == "WordBoundary")
        .filter_map(|item| item.data)
        .map(|data| WordBoundary {
            offset_ms: data.offset / TICKS_PER_MS,
            text: data.text.map(|t| t.text).unwrap_or_default(),
            text_offset: data.text_offset,
        })
        .collect())
}

fn ws_error(e: tungstenite::Error) -> SpeechError {
    match e {
        tungstenite::Error::Http(response) => SpeechError::Transport {
            message: format!("websocket handshake rejected: {}", response.status()),
            status: Some(response.status().as_u16()),
        },
        other => SpeechError::transport(other.to_string()),
    }
}

#[derive(Debug, Default)]
struct SpeechStream {
    pcm: Vec<u8>,
    boundaries: Vec<WordBoundary>,
}

// ── Provider ───────────────────────────────────────────

pub struct CloudProvider {
    api_key: Option<String>,
    url: String,
    default_voice: String,
    language: String,
    policy: RequestPolicy,
}

impl CloudProvider {
    pub fn new(
        url: impl Into<String>,
        api_key: Option<String>,
        default_voice: Option<String>,
        language: impl Into<String>,
        policy: RequestPolicy,
    ) -> Self {
        Self {
            api_key,
            url: url.into(),
            default_voice: default_voice.unwrap_or_else(|| DEFAULT_CLOUD_VOICE.to_string()),
            language: language.into(),
            policy,
        }
    }

    pub fn from_config(config: &CloudConfig, policy: RequestPolicy) -> Self {
        Self::new(
            config.websocket_url(),
            config.resolve_api_key(),
            config.voice.clone(),
            config.language.clone(),
            policy,
        )
    }

    async fn exchange(&self, api_key: &str, markup: &str) -> Result<SpeechStream, SpeechError> {
        let mut handshake = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| SpeechError::Config(format!("invalid cloud endpoint: {}", e)))?;
        let key = HeaderValue::from_str(api_key)
            .map_err(|_| SpeechError::Config("api key contains invalid characters".into()))?;
        handshake
            .headers_mut()
            .insert("Ocp-Apim-Subscription-Key", key);

        let request_id = uuid::Uuid::new_v4().simple().to_string();
        let (mut socket, _) = tokio_tungstenite::connect_async(handshake)
            .await
            .map_err(ws_error)?;

        socket
            .send(Message::Text(text_frame(
                "speech.config",
                "application/json; charset=utf-8",
                &request_id,
                SPEECH_CONFIG,
            )))
            .await
            .map_err(ws_error)?;
        socket
            .send(Message::Text(text_frame(
                "ssml",
                "application/ssml+xml",
                &request_id,
                markup,
            )))
            .await
            .map_err(ws_error)?;

        let mut stream = SpeechStream::default();
        while let Some(message) = socket.next().await {
            match message.map_err(ws_error)? {
                Message::Text(text) => {
                    let (headers, body) = split_text_frame(&text);
                    match header_path(headers) {
                        Some("audio.metadata") => stream.boundaries.extend(parse_metadata(body)?),
                        Some("turn.end") => {
                            let _ = socket.close(None).await;
                            return Ok(stream);
                        }
                        _ => {}
                    }
                }
                Message::Binary(data) => {
                    if let Some(pcm) = audio_payload(&data)? {
                        stream.pcm.extend_from_slice(pcm);
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
        Err(SpeechError::transport("cloud stream closed before turn end"))
    }

    async fn request_chunk(&self, request: &SynthesisRequest) -> Result<SynthesisResult, SpeechError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| SpeechError::Config("cloud api key is not configured".into()))?;
        let voice = request.voice.as_deref().unwrap_or(&self.default_voice);
        let chunk = SsmlChunk::build(
            request.chunk_words(),
            request.start_index,
            voice,
            &self.language,
            request.rate,
        );

        let markup = chunk.markup.as_str();
        let stream = run_with_policy(&self.policy, "cloud synthesize", || async move {
            self.exchange(api_key, markup).await
        })
        .await?;

        if stream.pcm.is_empty() {
            return Err(SpeechError::MalformedResponse("no audio received".into()));
        }
        let mut timings = chunk.timings(&stream.boundaries);
        if timings.is_empty() {
            let duration_ms = (stream.pcm.len() / 2) as u64 * 1000 / OUTPUT_SAMPLE_RATE as u64;
            timings = evenly_spaced(request.start_index, request.length, duration_ms);
        }

        Ok(SynthesisResult {
            audio: Arc::new(pcm16_to_wav(&stream.pcm, OUTPUT_SAMPLE_RATE)?),
            timings,
            start_index: request.start_index,
            length: request.length,
        })
    }
}

fn voice(id: &str, name: &str, gender: Gender, language: &str) -> VoiceProfile {
    VoiceProfile {
        voice_id: id.to_string(),
        name: name.to_string(),
        gender,
        language: language.to_string(),
        provider: ProviderKind::Cloud,
    }
}

#[async_trait]
impl BufferedProvider for CloudProvider {
    fn id(&self) -> String {
        format!("cloud:{}", self.url)
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Cloud
    }

    async fn voices(&self) -> Vec<VoiceProfile> {
        vec![
            voice("en-US-JennyNeural", "Jenny", Gender::Female, "en-US"),
            voice("en-US-AriaNeural", "Aria", Gender::Female, "en-US"),
            voice("en-US-GuyNeural", "Guy", Gender::Male, "en-US"),
            voice("en-GB-SoniaNeural", "Sonia", Gender::Female, "en-GB"),
            voice("en-GB-RyanNeural", "Ryan", Gender::Male, "en-GB"),
            voice("de-DE-KatjaNeural", "Katja", Gender::Female, "de-DE"),
            voice("fr-FR-DeniseNeural", "Denise", Gender::Female, "fr-FR"),
            voice("es-ES-AlvaroNeural", "Alvaro", Gender::Male, "es-ES"),
            voice("ja-JP-NanamiNeural", "Nanami", Gender::Female, "ja-JP"),
        ]
    }

    async fn is_available(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.is_empty())
    }

    async fn synthesize(&self, request: &SynthesisRequest, cancel: &CancelToken) -> Option<SynthesisResult> {
        match cancel.run_until_cancelled(self.request_chunk(request)).await? {
            Ok(result) => Some(result),
            Err(e) => {
                tracing::warn!(start = request.start_index, error = %e, "cloud synthesis failed");
                None
            }
        }
    }
}
