pub mod cache;
pub mod cancel;
pub mod cloud;
pub mod config;
pub mod device;
pub mod engine;
pub mod events;
pub mod host;
pub mod interface;
pub mod local_server;
pub mod offsets;
pub mod playback;
pub mod scheduler;
pub mod segmenter;
pub mod session;
pub mod tracker;

#[cfg(test)]
mod tests;

pub use config::{load_config, save_config, ProviderConfig, SpeechSystemConfig};
pub use device::CpalOutput;
pub use engine::SpeechEngine;
pub use events::{EventReceiver, HaltReason, SpeechEvent};
pub use host::{DelegatedHost, HostRequest, HostSpeech, HostSpeechEvent, HostUtterance};
pub use interface::{
    BufferedProvider, Gender, ProviderKind, SpeechError, StreamingProvider, SynthesisRequest,
    SynthesisResult, TimingEntry, VoiceProfile,
};
pub use segmenter::{next_chunk_length, ChunkPolicy, MAX_CHUNK_WORDS, MIN_CHUNK_WORDS};
