//! Position tracker: turns a buffered chunk's playback clock into word
//! boundary events.

use std::time::Duration;

use tokio::time::MissedTickBehavior;

use super::cancel::CancelToken;
use super::interface::{ChunkOutcome, TimingEntry};
use super::playback::{PlaybackState, SlotLease};
use super::session::BoundaryReporter;

/// Word being spoken at `clock_ms`: the last timing entry whose offset is
/// `<= clock_ms`. `None` before the first entry.
pub fn word_at(timings: &[TimingEntry], clock_ms: u64) -> Option<usize> {
    timings
        .iter()
        .rev()
        .find(|entry| entry.audio_offset_ms <= clock_ms)
        .map(|entry| entry.word_index)
}

/// Poll `lease` until its clip finishes, reporting every word change.
///
/// When playback finishes the last word of the chunk is reported if the
/// poll never landed on it, so short final words are not skipped.
pub async fn track(
    lease: &SlotLease,
    timings: &[TimingEntry],
    reporter: &BoundaryReporter,
    cancel: &CancelToken,
    poll_interval: Duration,
) -> ChunkOutcome {
    let mut ticker = tokio::time::interval(poll_interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return ChunkOutcome::Cancelled,
            _ = ticker.tick() => {}
        }

        // Losing the slot means someone else (stop, a newer session) took it.
        let Some(state) = lease.state() else {
            return ChunkOutcome::Cancelled;
        };

        if let Some(clock) = lease.position_ms() {
            if let Some(word) = word_at(timings, clock) {
                reporter.report(word);
            }
        }

        match state {
            PlaybackState::Playing => {}
            PlaybackState::Finished => {
                if let Some(last) = timings.last() {
                    if reporter.last_reported() != Some(last.word_index) {
                        reporter.report(last.word_index);
                    }
                }
                return ChunkOutcome::Completed;
            }
            PlaybackState::Failed(message) => return ChunkOutcome::DeviceError(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timings() -> Vec<TimingEntry> {
        [(0, 0), (1, 120), (2, 300), (3, 540), (4, 700)]
            .iter()
            .map(|&(w, ms)| TimingEntry {
                word_index: 2 + w,
                audio_offset_ms: ms,
            })
            .collect()
    }

    #[test]
    fn picks_latest_started_word() {
        let t = timings();
        assert_eq!(word_at(&t, 650), Some(5));
        assert_eq!(word_at(&t, 560), Some(5));
        assert_eq!(word_at(&t, 539), Some(4));
        assert_eq!(word_at(&t, 0), Some(2));
        assert_eq!(word_at(&t, 10_000), Some(6));
    }

    #[test]
    fn clock_between_entries_reports_earlier_word() {
        let t: Vec<TimingEntry> = [(5, 0), (6, 400), (7, 900)]
            .iter()
            .map(|&(w, ms)| TimingEntry {
                word_index: w,
                audio_offset_ms: ms,
            })
            .collect();
        assert_eq!(word_at(&t, 650), Some(6));

        let t: Vec<TimingEntry> = [(0, 0), (1, 150), (2, 310), (3, 500), (4, 640), (5, 800)]
            .iter()
            .map(|&(w, ms)| TimingEntry {
                word_index: w,
                audio_offset_ms: ms,
            })
            .collect();
        assert_eq!(word_at(&t, 560), Some(3));
    }

    #[test]
    fn nothing_before_first_entry() {
        let t = vec![TimingEntry {
            word_index: 3,
            audio_offset_ms: 90,
        }];
        assert_eq!(word_at(&t, 40), None);
        assert_eq!(word_at(&[], 40), None);
    }
}
