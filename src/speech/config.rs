use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::interface::ProviderKind;
use super::segmenter::ChunkPolicy;
pub use crate::utils::http::RequestPolicy;

pub const MIN_RATE: f32 = 0.5;
pub const MAX_RATE: f32 = 4.0;
pub const DEFAULT_RATE: f32 = 1.0;

pub const DEFAULT_LOCAL_SERVER_URL: &str = "http://localhost:8321";
pub const DEFAULT_LOCAL_VOICE: &str = "af_heart";
pub const DEFAULT_CLOUD_VOICE: &str = "en-US-JennyNeural";
pub const DEFAULT_CLOUD_REGION: &str = "eastus";

/// Clamp a requested rate into `[MIN_RATE, MAX_RATE]`; NaN becomes the default.
pub fn clamp_rate(rate: f32) -> f32 {
    if rate.is_nan() {
        DEFAULT_RATE
    } else {
        rate.clamp(MIN_RATE, MAX_RATE)
    }
}

// ── Provider Config ────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OfflineConfig {
    /// Host voice name; `None` lets the host pick.
    #[serde(default)]
    pub voice: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CloudConfig {
    pub api_key: Option<String>,
    pub api_key_env: Option<String>,
    #[serde(default = "default_region")]
    pub region: String,
    /// Full websocket URL; overrides the one derived from `region`.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub voice: Option<String>,
    #[serde(default = "default_language")]
    pub language: String,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_key_env: None,
            region: default_region(),
            endpoint: None,
            voice: None,
            language: default_language(),
        }
    }
}

impl CloudConfig {
    /// Resolve the API key: check `api_key` field first, then `api_key_env` environment variable.
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(key) = self.api_key.as_ref().filter(|k| !k.is_empty()) {
            return Some(key.clone());
        }
        let env_var = self.api_key_env.as_ref()?;
        std::env::var(env_var).ok().filter(|k| !k.is_empty())
    }

    pub fn websocket_url(&self) -> String {
        self.endpoint.clone().unwrap_or_else(|| {
            format!(
                "wss://{}.tts.speech.microsoft.com/cognitiveservices/websocket/v1",
                self.region
            )
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LocalServerConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub voice: Option<String>,
}

impl Default for LocalServerConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            voice: None,
        }
    }
}

/// Which backend speaks, plus its backend-specific settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProviderConfig {
    Offline(OfflineConfig),
    Cloud(CloudConfig),
    LocalServer(LocalServerConfig),
}

impl Default for ProviderConfig {
    fn default() -> Self {
        ProviderConfig::Offline(OfflineConfig::default())
    }
}

impl ProviderConfig {
    pub fn kind(&self) -> ProviderKind {
        match self {
            ProviderConfig::Offline(_) => ProviderKind::Offline,
            ProviderConfig::Cloud(_) => ProviderKind::Cloud,
            ProviderConfig::LocalServer(_) => ProviderKind::LocalServer,
        }
    }

    pub fn voice(&self) -> Option<&str> {
        match self {
            ProviderConfig::Offline(c) => c.voice.as_deref(),
            ProviderConfig::Cloud(c) => c.voice.as_deref(),
            ProviderConfig::LocalServer(c) => c.voice.as_deref(),
        }
    }

    pub fn set_voice(&mut self, voice: Option<String>) {
        match self {
            ProviderConfig::Offline(c) => c.voice = voice,
            ProviderConfig::Cloud(c) => c.voice = voice,
            ProviderConfig::LocalServer(c) => c.voice = voice,
        }
    }
}

fn default_region() -> String {
    DEFAULT_CLOUD_REGION.to_string()
}
fn default_language() -> String {
    "en-US".to_string()
}
fn default_base_url() -> String {
    DEFAULT_LOCAL_SERVER_URL.to_string()
}

// ── Cache Config ───────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: default_max_entries(),
            ttl_secs: default_ttl_secs(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_max_entries() -> usize {
    200
}
fn default_ttl_secs() -> u64 {
    3600
}

// ── Top-level Speech Config ────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpeechSystemConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_rate")]
    pub rate: f32,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub chunking: ChunkPolicy,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_restart_settle_ms")]
    pub restart_settle_ms: u64,
    #[serde(default)]
    pub request: RequestPolicy,
    #[serde(default)]
    pub cache: CacheConfig,
}

impl Default for SpeechSystemConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rate: DEFAULT_RATE,
            provider: ProviderConfig::default(),
            chunking: ChunkPolicy::default(),
            poll_interval_ms: default_poll_interval_ms(),
            restart_settle_ms: default_restart_settle_ms(),
            request: RequestPolicy::default(),
            cache: CacheConfig::default(),
        }
    }
}

impl SpeechSystemConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn restart_settle(&self) -> Duration {
        Duration::from_millis(self.restart_settle_ms)
    }

    /// Clamp out-of-range values loaded from disk.
    pub fn normalized(mut self) -> Self {
        self.rate = clamp_rate(self.rate);
        self.chunking = self.chunking.normalized();
        self
    }
}

fn default_rate() -> f32 {
    DEFAULT_RATE
}
fn default_poll_interval_ms() -> u64 {
    16
}
fn default_restart_settle_ms() -> u64 {
    150
}

/// `<data dir>/readaloud/speech_config.json`
pub fn default_config_path() -> PathBuf {
    dirs_next::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("readaloud")
        .join("speech_config.json")
}

/// Load config from a JSON file. A missing or unreadable file yields the
/// defaults; out-of-range values are clamped.
pub fn load_config(path: &Path) -> SpeechSystemConfig {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(path = %path.display(), "no speech config, using defaults");
            return SpeechSystemConfig::default();
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to read speech config, using defaults");
            return SpeechSystemConfig::default();
        }
    };
    match serde_json::from_str::<SpeechSystemConfig>(&content) {
        Ok(raw) => {
            let config = raw.clone().normalized();
            if config != raw {
                tracing::warn!(path = %path.display(), "speech config had out-of-range values, clamped");
            }
            tracing::info!(path = %path.display(), provider = %config.provider.kind(), "loaded speech config");
            config
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to parse speech config, using defaults");
            SpeechSystemConfig::default()
        }
    }
}

/// Save config (normalized) to a JSON file, creating parent directories.
pub fn save_config(path: &Path, config: &SpeechSystemConfig) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
    }
    let json = serde_json::to_string_pretty(&config.clone().normalized())
        .map_err(|e| format!("Failed to serialize config: {}", e))?;
    std::fs::write(path, json).map_err(|e| format!("Failed to write config file: {}", e))?;
    tracing::info!(path = %path.display(), "saved speech config");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_is_clamped() {
        assert_eq!(clamp_rate(0.1), MIN_RATE);
        assert_eq!(clamp_rate(9.0), MAX_RATE);
        assert_eq!(clamp_rate(1.5), 1.5);
        assert_eq!(clamp_rate(f32::NAN), DEFAULT_RATE);
    }

    #[test]
    fn empty_json_yields_defaults() {
        let config: SpeechSystemConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, SpeechSystemConfig::default());
        assert_eq!(config.provider.kind(), ProviderKind::Offline);
        assert_eq!(config.request.timeout(), None);
        assert_eq!(config.request.max_retries, 0);
    }

    #[test]
    fn provider_is_tagged_by_kind() {
        let json = r#"{
            "rate": 7.5,
            "provider": { "kind": "local_server", "voice": "am_adam" }
        }"#;
        let config: SpeechSystemConfig = serde_json::from_str(json).unwrap();
        let config = config.normalized();
        assert_eq!(config.rate, MAX_RATE);
        match &config.provider {
            ProviderConfig::LocalServer(local) => {
                assert_eq!(local.base_url, DEFAULT_LOCAL_SERVER_URL);
                assert_eq!(local.voice.as_deref(), Some("am_adam"));
            }
            other => panic!("unexpected provider {:?}", other),
        }
    }

    #[test]
    fn cloud_url_defaults_to_region() {
        let cloud = CloudConfig {
            region: "westeurope".into(),
            ..Default::default()
        };
        assert_eq!(
            cloud.websocket_url(),
            "wss://westeurope.tts.speech.microsoft.com/cognitiveservices/websocket/v1"
        );
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("speech_config.json");
        let mut config = SpeechSystemConfig::default();
        config.provider = ProviderConfig::Cloud(CloudConfig {
            api_key_env: Some("SPEECH_KEY".into()),
            ..Default::default()
        });
        config.provider.set_voice(Some("en-GB-SoniaNeural".into()));
        config.restart_settle_ms = 300;

        save_config(&path, &config).unwrap();
        let loaded = load_config(&path);
        assert_eq!(loaded, config);
        assert_eq!(loaded.provider.voice(), Some("en-GB-SoniaNeural"));
    }

    #[test]
    fn out_of_range_file_values_are_clamped_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("speech_config.json");
        std::fs::write(&path, r#"{ "rate": 0.05, "enabled": false }"#).unwrap();
        let loaded = load_config(&path);
        assert_eq!(loaded.rate, MIN_RATE);
        assert!(!loaded.enabled);
    }

    #[test]
    fn corrupt_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("speech_config.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert_eq!(load_config(&path), SpeechSystemConfig::default());
    }

    #[test]
    fn direct_key_wins_over_env() {
        std::env::set_var("READALOUD_TEST_KEY_A", "from-env");
        let cloud = CloudConfig {
            api_key: Some("direct".into()),
            api_key_env: Some("READALOUD_TEST_KEY_A".into()),
            ..Default::default()
        };
        assert_eq!(cloud.resolve_api_key().as_deref(), Some("direct"));
    }

    #[test]
    fn empty_direct_key_falls_back_to_env() {
        std::env::set_var("READALOUD_TEST_KEY_B", "from-env");
        let mut cloud = CloudConfig {
            api_key: Some(String::new()),
            api_key_env: Some("READALOUD_TEST_KEY_B".into()),
            ..Default::default()
        };
        assert_eq!(cloud.resolve_api_key().as_deref(), Some("from-env"));
        cloud.api_key_env = Some("READALOUD_TEST_MISSING".into());
        assert_eq!(cloud.resolve_api_key(), None);
    }

    #[test]
    fn missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = load_config(&dir.path().join("absent.json"));
        assert_eq!(loaded, SpeechSystemConfig::default());
    }
}
