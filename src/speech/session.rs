//! Playback sessions and the generation fence.
//!
//! Every `speak()` opens a new session by bumping the engine-wide generation.
//! Anything a session does that is visible outside of it (emitting events,
//! acquiring the audio output) goes through [`SessionFence`] and is refused
//! once the session's generation is no longer current, so a stray completion
//! from a cancelled session is always a no-op.

use std::sync::{Arc, Mutex, MutexGuard};

use super::cancel::CancelToken;
use super::events::{EventSender, HaltReason, SpeechEvent};
use super::interface::SynthesisResult;

#[derive(Debug, Default)]
struct FenceState {
    generation: u64,
    stopped: bool,
    speaking: bool,
    last_reported: Option<usize>,
}

/// Engine-wide session state shared with every running session.
pub struct SessionFence {
    state: Mutex<FenceState>,
    events: EventSender,
}

impl SessionFence {
    pub fn new(events: EventSender) -> Self {
        Self {
            state: Mutex::new(FenceState {
                stopped: true,
                ..Default::default()
            }),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, FenceState> {
        // A poisoned fence only means a panic elsewhere; the state itself is plain data.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Invalidate the current session and open a new one.
    pub fn begin(self: &Arc<Self>) -> SessionTicket {
        let mut state = self.lock();
        state.generation += 1;
        state.stopped = false;
        state.speaking = true;
        state.last_reported = None;
        SessionTicket {
            generation: state.generation,
            fence: Arc::clone(self),
            cancel: CancelToken::new(),
        }
    }

    /// Invalidate the current session without opening a new one.
    pub fn halt(&self) {
        let mut state = self.lock();
        state.generation += 1;
        state.stopped = true;
        state.speaking = false;
    }

    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    pub fn is_current(&self, generation: u64) -> bool {
        let state = self.lock();
        !state.stopped && state.generation == generation
    }

    pub fn is_speaking(&self) -> bool {
        self.lock().speaking
    }

    /// Last word reported by the most recent session, kept after it stops so
    /// a restart can resume from it.
    pub fn last_reported(&self) -> Option<usize> {
        self.lock().last_reported
    }

    /// Emit a boundary for `word_index` if the session is current and the word
    /// is past the last one reported. Returns whether an event was sent.
    fn report_word(&self, generation: u64, word_index: usize) -> bool {
        let mut state = self.lock();
        if state.stopped || state.generation != generation {
            return false;
        }
        if matches!(state.last_reported, Some(last) if word_index <= last) {
            return false;
        }
        state.last_reported = Some(word_index);
        // Sent under the lock so no boundary can slip out after a halt().
        let _ = self.events.send(SpeechEvent::WordBoundary { index: word_index });
        true
    }

    /// Close the session on its own terms. Ignored for stale sessions.
    fn finish(&self, generation: u64, event: SpeechEvent) -> bool {
        let mut state = self.lock();
        if state.stopped || state.generation != generation {
            return false;
        }
        state.stopped = true;
        state.speaking = false;
        let _ = self.events.send(event);
        true
    }
}

/// A session's claim on the fence: its generation plus the cancellation
/// token every async operation of the session listens to.
#[derive(Clone)]
pub struct SessionTicket {
    generation: u64,
    fence: Arc<SessionFence>,
    cancel: CancelToken,
}

impl SessionTicket {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Checkpoint: false once the session was stopped or superseded.
    pub fn is_current(&self) -> bool {
        !self.cancel.is_cancelled() && self.fence.is_current(self.generation)
    }

    pub fn reporter(&self) -> BoundaryReporter {
        BoundaryReporter {
            ticket: self.clone(),
        }
    }

    pub fn finish_ended(&self) -> bool {
        self.fence.finish(self.generation, SpeechEvent::Ended)
    }

    pub fn finish_halted(&self, reason: HaltReason) -> bool {
        self.fence
            .finish(self.generation, SpeechEvent::Halted { reason })
    }
}

/// Change-only word boundary sink for one session.
#[derive(Clone)]
pub struct BoundaryReporter {
    ticket: SessionTicket,
}

impl BoundaryReporter {
    pub fn report(&self, word_index: usize) -> bool {
        if self.ticket.cancel.is_cancelled() {
            return false;
        }
        self.ticket.fence.report_word(self.ticket.generation, word_index)
    }

    /// Last word reported by this session, if it is still current.
    pub fn last_reported(&self) -> Option<usize> {
        let state = self.ticket.fence.lock();
        if state.generation == self.ticket.generation {
            state.last_reported
        } else {
            None
        }
    }
}

/// Scheduler-owned state of one buffered playback session.
pub struct PlaybackSession {
    pub ticket: SessionTicket,
    /// Range of the chunk currently playing, `(start, length)`.
    pub active_chunk: Option<(usize, usize)>,
    prefetched: Option<SynthesisResult>,
}

impl PlaybackSession {
    pub fn new(ticket: SessionTicket) -> Self {
        Self {
            ticket,
            active_chunk: None,
            prefetched: None,
        }
    }

    /// Keep `result` as the next chunk if it starts right after the active one.
    pub fn store_prefetch(&mut self, result: SynthesisResult) -> bool {
        let expected = self.active_chunk.map(|(start, len)| start + len);
        if expected == Some(result.start_index) && self.ticket.is_current() {
            self.prefetched = Some(result);
            true
        } else {
            self.prefetched = None;
            false
        }
    }

    /// Take the prefetched chunk if it starts at `from`; otherwise discard it.
    pub fn take_prefetch(&mut self, from: usize) -> Option<SynthesisResult> {
        match self.prefetched.take() {
            Some(result) if result.start_index == from => Some(result),
            _ => None,
        }
    }
}
