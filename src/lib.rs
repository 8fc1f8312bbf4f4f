pub mod speech;
pub mod utils;

pub use speech::{
    load_config, save_config, CpalOutput, DelegatedHost, EventReceiver, HaltReason, HostRequest,
    HostSpeechEvent, ProviderConfig, ProviderKind, SpeechEngine, SpeechError, SpeechEvent,
    SpeechSystemConfig,
};
