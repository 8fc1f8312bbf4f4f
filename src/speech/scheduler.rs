//! Playback Scheduler: drives one session from its start word to the end
//! of the text, one chunk at a time.
//!
//! Buffered providers get one chunk of lookahead: while chunk *n* plays,
//! chunk *n+1* is synthesized. Streaming providers own playback, so their
//! chunks simply run back to back.
//!
//! Every await point is followed by a checkpoint; a session that lost its
//! generation returns without touching the audio slot or emitting anything.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use super::events::HaltReason;
use super::interface::{
    BufferedProvider, ChunkOutcome, SpeechError, StreamingProvider, SynthesisRequest,
    SynthesisResult,
};
use super::playback::{AudioClip, AudioSlot};
use super::segmenter::ChunkPolicy;
use super::session::{PlaybackSession, SessionTicket};
use super::tracker;

/// Everything a session needs to know about what to speak and how.
#[derive(Debug, Clone)]
pub struct SessionPlan {
    pub words: Arc<[String]>,
    pub from_index: usize,
    pub voice: Option<String>,
    pub rate: f32,
    pub chunking: ChunkPolicy,
    pub poll_interval: Duration,
}

impl SessionPlan {
    fn request_at(&self, start_index: usize) -> SynthesisRequest {
        SynthesisRequest {
            words: Arc::clone(&self.words),
            start_index,
            length: self.chunking.next_chunk_length(&self.words, start_index),
            voice: self.voice.clone(),
            rate: self.rate,
        }
    }
}

/// Background synthesis of the next chunk. Aborted when dropped, so an
/// abandoned session never leaves a request running.
struct Prefetch {
    handle: JoinHandle<Option<SynthesisResult>>,
}

impl Prefetch {
    fn spawn(provider: Arc<dyn BufferedProvider>, request: SynthesisRequest, ticket: &SessionTicket) -> Self {
        let cancel = ticket.cancel_token().clone();
        let handle = tokio::spawn(async move { provider.synthesize(&request, &cancel).await });
        Self { handle }
    }

    async fn join(mut self) -> Option<SynthesisResult> {
        (&mut self.handle).await.ok().flatten()
    }
}

impl Drop for Prefetch {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

// ── Buffered ───────────────────────────────────────────

pub async fn run_buffered(
    provider: Arc<dyn BufferedProvider>,
    slot: Arc<AudioSlot>,
    ticket: SessionTicket,
    plan: SessionPlan,
) {
    let total = plan.words.len();
    let mut session = PlaybackSession::new(ticket);
    let mut from = plan.from_index;
    tracing::info!(provider = %provider.id(), from, total, "buffered session started");

    loop {
        if !session.ticket.is_current() {
            return;
        }
        if from >= total {
            if session.ticket.finish_ended() {
                tracing::info!("session reached end of text");
            }
            return;
        }

        let result = match session.take_prefetch(from) {
            Some(result) => Some(result),
            None => {
                let request = plan.request_at(from);
                tracing::debug!(start = from, length = request.length, "synthesizing chunk");
                provider.synthesize(&request, session.ticket.cancel_token()).await
            }
        };
        if !session.ticket.is_current() {
            return;
        }
        let Some(result) = result else {
            tracing::warn!(start = from, "no audio for chunk, halting session");
            session.ticket.finish_halted(HaltReason::SynthesisFailed);
            return;
        };

        session.active_chunk = Some((result.start_index, result.length));
        let next = result.end_index();
        let prefetch = (next < total)
            .then(|| Prefetch::spawn(Arc::clone(&provider), plan.request_at(next), &session.ticket));

        let outcome = play_chunk(&slot, &session.ticket, &result, plan.poll_interval).await;
        if !session.ticket.is_current() {
            return;
        }
        match outcome {
            ChunkOutcome::Completed => {}
            ChunkOutcome::Cancelled => return,
            ChunkOutcome::DeviceError(message) => {
                tracing::warn!(start = result.start_index, error = %message, "playback failed, halting session");
                session.ticket.finish_halted(HaltReason::PlaybackFailed);
                return;
            }
        }

        if let Some(prefetch) = prefetch {
            let prefetched = prefetch.join().await;
            if !session.ticket.is_current() {
                return;
            }
            if let Some(prefetched) = prefetched {
                session.store_prefetch(prefetched);
            }
        }
        from = next;
    }
}

async fn play_chunk(
    slot: &Arc<AudioSlot>,
    ticket: &SessionTicket,
    result: &SynthesisResult,
    poll_interval: Duration,
) -> ChunkOutcome {
    let clip = match AudioClip::from_wav_bytes(&result.audio) {
        Ok(clip) => clip,
        Err(e) => return ChunkOutcome::DeviceError(e.to_string()),
    };
    let lease = match slot.acquire(ticket, clip) {
        Ok(lease) => lease,
        Err(SpeechError::Cancelled) => return ChunkOutcome::Cancelled,
        Err(e) => return ChunkOutcome::DeviceError(e.to_string()),
    };
    let reporter = ticket.reporter();
    tracker::track(
        &lease,
        &result.timings,
        &reporter,
        ticket.cancel_token(),
        poll_interval,
    )
    .await
}

// ── Streaming ──────────────────────────────────────────

pub async fn run_streaming(provider: Arc<dyn StreamingProvider>, ticket: SessionTicket, plan: SessionPlan) {
    let total = plan.words.len();
    let reporter = ticket.reporter();
    let mut from = plan.from_index;
    tracing::info!(provider = %provider.id(), from, total, "streaming session started");

    loop {
        if !ticket.is_current() {
            return;
        }
        if from >= total {
            if ticket.finish_ended() {
                tracing::info!("session reached end of text");
            }
            return;
        }

        let request = plan.request_at(from);
        tracing::debug!(start = from, length = request.length, "speaking chunk on host");
        let outcome = provider
            .speak_chunk(&request, &reporter, ticket.cancel_token())
            .await;
        if !ticket.is_current() {
            return;
        }
        match outcome {
            Ok(ChunkOutcome::Completed) => from = request.end_index(),
            Ok(ChunkOutcome::Cancelled) => return,
            Ok(ChunkOutcome::DeviceError(message)) => {
                tracing::warn!(start = from, error = %message, "host playback failed, halting session");
                ticket.finish_halted(HaltReason::PlaybackFailed);
                return;
            }
            Err(e) => {
                tracing::warn!(start = from, error = %e, "host speech failed, halting session");
                ticket.finish_halted(HaltReason::SynthesisFailed);
                return;
            }
        }
    }
}
