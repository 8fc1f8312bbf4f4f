use serde::Serialize;
use tokio::sync::mpsc;

/// Why a session stopped on its own before reaching the end of the text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HaltReason {
    /// The provider returned no audio for a chunk (network, status, payload).
    SynthesisFailed,
    /// The audio could not be decoded or the output device failed.
    PlaybackFailed,
}

/// Events delivered to the embedding application.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SpeechEvent {
    /// The word at `index` (global position in the word stream) is being spoken.
    WordBoundary { index: usize },
    /// The session reached the end of the text. Never sent after `stop()`.
    Ended,
    /// The session stopped because of a failure. Never sent after `stop()`.
    Halted { reason: HaltReason },
}

pub type EventSender = mpsc::UnboundedSender<SpeechEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<SpeechEvent>;

pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}
