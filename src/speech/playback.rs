//! Audio output seam and the single active output slot.

use std::io::Cursor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use super::interface::SpeechError;
use super::session::SessionTicket;

// ── Decoded Audio ──────────────────────────────────────

/// Decoded mono audio ready for an output device.
#[derive(Debug, Clone)]
pub struct AudioClip {
    /// Normalized samples (-1.0 to 1.0)
    pub samples: Arc<Vec<f32>>,
    pub sample_rate: u32,
}

impl AudioClip {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples: Arc::new(samples),
            sample_rate,
        }
    }

    /// Decode a WAV payload, downmixing to mono.
    pub fn from_wav_bytes(bytes: &[u8]) -> Result<Self, SpeechError> {
        let mut reader = hound::WavReader::new(Cursor::new(bytes))
            .map_err(|e| SpeechError::Decode(format!("invalid WAV: {}", e)))?;
        let spec = reader.spec();
        if spec.sample_rate == 0 || spec.channels == 0 {
            return Err(SpeechError::Decode("WAV header has zero rate or channels".into()));
        }

        let interleaved: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Float => reader
                .samples::<f32>()
                .collect::<Result<_, _>>()
                .map_err(|e| SpeechError::Decode(e.to_string()))?,
            hound::SampleFormat::Int => {
                let scale = (1i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / scale))
                    .collect::<Result<_, _>>()
                    .map_err(|e| SpeechError::Decode(e.to_string()))?
            }
        };

        let channels = spec.channels as usize;
        let samples = if channels == 1 {
            interleaved
        } else {
            interleaved
                .chunks_exact(channels)
                .map(|frame| frame.iter().sum::<f32>() / channels as f32)
                .collect()
        };

        Ok(Self::new(samples, spec.sample_rate))
    }

    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            0
        } else {
            self.samples.len() as u64 * 1000 / self.sample_rate as u64
        }
    }
}

/// Wrap raw little-endian 16-bit mono PCM into a WAV container.
pub fn pcm16_to_wav(pcm: &[u8], sample_rate: u32) -> Result<Vec<u8>, SpeechError> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut out = Cursor::new(Vec::with_capacity(pcm.len() + 44));
    {
        let mut writer = hound::WavWriter::new(&mut out, spec)
            .map_err(|e| SpeechError::Decode(e.to_string()))?;
        for pair in pcm.chunks_exact(2) {
            writer
                .write_sample(i16::from_le_bytes([pair[0], pair[1]]))
                .map_err(|e| SpeechError::Decode(e.to_string()))?;
        }
        writer
            .finalize()
            .map_err(|e| SpeechError::Decode(e.to_string()))?;
    }
    Ok(out.into_inner())
}

// ── Output Seam ────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackState {
    Playing,
    Finished,
    Failed(String),
}

/// A clip that is currently audible on some output.
pub trait ActivePlayback: Send {
    /// Playback clock: milliseconds of the clip rendered so far.
    fn position_ms(&self) -> u64;

    fn state(&self) -> PlaybackState;

    /// Silence the output and free its resources. Idempotent.
    fn stop(&mut self);
}

/// Something that can make a clip audible (a sound device, a test double).
pub trait AudioOutput: Send + Sync {
    fn start(&self, clip: AudioClip) -> Result<Box<dyn ActivePlayback>, SpeechError>;
}

// ── Active Output Slot ─────────────────────────────────

struct ActiveEntry {
    id: u64,
    playback: Box<dyn ActivePlayback>,
}

/// Holds at most one active playback for the whole engine. Starting a new
/// one always stops and drops the previous one first.
pub struct AudioSlot {
    output: Arc<dyn AudioOutput>,
    active: Mutex<Option<ActiveEntry>>,
    next_id: AtomicU64,
}

impl AudioSlot {
    pub fn new(output: Arc<dyn AudioOutput>) -> Self {
        Self {
            output,
            active: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<ActiveEntry>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start `clip` for the session holding `ticket`. Refused with
    /// `SpeechError::Cancelled` if the session is no longer current.
    pub fn acquire(
        self: &Arc<Self>,
        ticket: &SessionTicket,
        clip: AudioClip,
    ) -> Result<SlotLease, SpeechError> {
        if !ticket.is_current() {
            return Err(SpeechError::Cancelled);
        }
        self.release_all();

        // Opening a device can block; the slot stays unlocked meanwhile so
        // stop() is never held up by it.
        let mut playback = self.output.start(clip)?;

        let mut active = self.lock();
        if !ticket.is_current() {
            drop(active);
            playback.stop();
            return Err(SpeechError::Cancelled);
        }
        if let Some(mut previous) = active.take() {
            previous.playback.stop();
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        *active = Some(ActiveEntry { id, playback });
        Ok(SlotLease {
            slot: Arc::clone(self),
            id,
        })
    }

    /// Stop whatever is playing, synchronously.
    pub fn release_all(&self) {
        if let Some(mut entry) = self.lock().take() {
            entry.playback.stop();
        }
    }

    pub fn is_active(&self) -> bool {
        self.lock().is_some()
    }
}

/// A session's handle on the slot. Dropping it releases the output if it is
/// still the active one.
pub struct SlotLease {
    slot: Arc<AudioSlot>,
    id: u64,
}

impl SlotLease {
    fn with_entry<T>(&self, f: impl FnOnce(&ActiveEntry) -> T) -> Option<T> {
        let active = self.slot.lock();
        match active.as_ref() {
            Some(entry) if entry.id == self.id => Some(f(entry)),
            _ => None,
        }
    }

    /// `None` once the lease lost the slot (released by stop or a newer lease).
    pub fn position_ms(&self) -> Option<u64> {
        self.with_entry(|e| e.playback.position_ms())
    }

    pub fn state(&self) -> Option<PlaybackState> {
        self.with_entry(|e| e.playback.state())
    }

    pub fn release(self) {}
}

impl Drop for SlotLease {
    fn drop(&mut self) {
        let mut active = self.slot.lock();
        if matches!(active.as_ref(), Some(entry) if entry.id == self.id) {
            if let Some(mut entry) = active.take() {
                entry.playback.stop();
            }
        }
    }
}
