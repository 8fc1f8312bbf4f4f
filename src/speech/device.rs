//! Sound-device output via cpal.
//!
//! cpal streams are not `Send`, so each clip gets a short-lived audio thread
//! that owns the stream until the clip drains or the playback is stopped.
//! The callback publishes how many frames it has rendered; that counter is
//! the playback clock the position tracker reads.
//!
//! A clip counts as finished only after the device buffer has drained, not
//! when its last frame is handed to the device. Releasing a finished clip
//! therefore never cuts off audio that is still queued.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Sample, SampleFormat};
use rubato::{FftFixedIn, Resampler};

use super::interface::SpeechError;
use super::playback::{ActivePlayback, AudioClip, AudioOutput, PlaybackState};

const RESAMPLE_CHUNK: usize = 1024;
/// Keep the stream open briefly after the last frame so the device buffer drains.
const DRAIN_TAIL: Duration = Duration::from_millis(60);

/// Plays clips on the default (or a named) output device.
#[derive(Debug, Clone, Default)]
pub struct CpalOutput {
    device_name: Option<String>,
}

impl CpalOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_device(name: impl Into<String>) -> Self {
        Self {
            device_name: Some(name.into()),
        }
    }
}

#[derive(Default)]
struct PlaybackShared {
    frames_played: AtomicU64,
    /// Every frame has been handed to the device.
    queued: AtomicBool,
    /// The device buffer has played out after `queued`.
    drained: AtomicBool,
    failure: Mutex<Option<String>>,
}

impl PlaybackShared {
    fn state(&self) -> PlaybackState {
        if let Some(message) = self.failure() {
            PlaybackState::Failed(message)
        } else if self.drained.load(Ordering::Acquire) {
            PlaybackState::Finished
        } else {
            PlaybackState::Playing
        }
    }

    fn fail(&self, message: String) {
        if let Ok(mut failure) = self.failure.lock() {
            failure.get_or_insert(message);
        }
    }

    fn failure(&self) -> Option<String> {
        self.failure.lock().ok().and_then(|f| f.clone())
    }
}

struct CpalPlayback {
    shared: Arc<PlaybackShared>,
    device_rate: u32,
    stop_tx: Option<mpsc::Sender<()>>,
}

impl ActivePlayback for CpalPlayback {
    fn position_ms(&self) -> u64 {
        self.shared.frames_played.load(Ordering::Relaxed) * 1000 / self.device_rate.max(1) as u64
    }

    fn state(&self) -> PlaybackState {
        self.shared.state()
    }

    fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for CpalPlayback {
    fn drop(&mut self) {
        self.stop();
    }
}

impl AudioOutput for CpalOutput {
    fn start(&self, clip: AudioClip) -> Result<Box<dyn ActivePlayback>, SpeechError> {
        let shared = Arc::new(PlaybackShared::default());
        let (ready_tx, ready_rx) = mpsc::channel::<Result<u32, String>>();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let thread_shared = Arc::clone(&shared);
        let device_name = self.device_name.clone();
        std::thread::Builder::new()
            .name("readaloud-audio".into())
            .spawn(move || {
                let stream = match open_stream(device_name.as_deref(), clip, &thread_shared) {
                    Ok((stream, rate)) => {
                        let _ = ready_tx.send(Ok(rate));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                supervise(&stop_rx, &thread_shared, DRAIN_TAIL);
                drop(stream);
            })
            .map_err(|e| SpeechError::Playback(format!("failed to spawn audio thread: {}", e)))?;

        let device_rate = ready_rx
            .recv()
            .map_err(|_| SpeechError::Playback("audio thread exited before start".into()))?
            .map_err(SpeechError::Playback)?;

        Ok(Box::new(CpalPlayback {
            shared,
            device_rate,
            stop_tx: Some(stop_tx),
        }))
    }
}

/// Keep the stream alive until it is stopped, fails, or has drained.
fn supervise(stop_rx: &mpsc::Receiver<()>, shared: &PlaybackShared, tail: Duration) {
    loop {
        match stop_rx.recv_timeout(Duration::from_millis(20)) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
            Err(RecvTimeoutError::Timeout) => {
                if shared.failure().is_some() {
                    return;
                }
                if shared.queued.load(Ordering::Relaxed) {
                    // An explicit stop during the tail still silences at once.
                    if let Err(RecvTimeoutError::Timeout) = stop_rx.recv_timeout(tail) {
                        shared.drained.store(true, Ordering::Release);
                    }
                    return;
                }
            }
        }
    }
}

fn open_stream(
    device_name: Option<&str>,
    clip: AudioClip,
    shared: &Arc<PlaybackShared>,
) -> Result<(cpal::Stream, u32), String> {
    let host = cpal::default_host();
    let device = match device_name {
        Some(name) => host
            .output_devices()
            .map_err(|e| format!("Failed to enumerate output devices: {}", e))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| format!("Output device not found: {}", name))?,
        None => host
            .default_output_device()
            .ok_or_else(|| "No audio output device available".to_string())?,
    };

    let supported = device
        .default_output_config()
        .map_err(|e| format!("Failed to get default output config: {}", e))?;
    let sample_format = supported.sample_format();
    let config: cpal::StreamConfig = supported.into();
    let device_rate = config.sample_rate.0;
    let channels = config.channels as usize;

    let samples = if clip.sample_rate == device_rate {
        clip.samples
    } else {
        Arc::new(resample(&clip.samples, clip.sample_rate, device_rate)?)
    };

    let stream = match sample_format {
        SampleFormat::F32 => build_stream::<f32>(&device, &config, channels, samples, shared),
        SampleFormat::I16 => build_stream::<i16>(&device, &config, channels, samples, shared),
        SampleFormat::U16 => build_stream::<u16>(&device, &config, channels, samples, shared),
        other => Err(format!("Unsupported output sample format: {:?}", other)),
    }?;

    stream
        .play()
        .map_err(|e| format!("Failed to play audio stream: {}", e))?;
    Ok((stream, device_rate))
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    channels: usize,
    samples: Arc<Vec<f32>>,
    shared: &Arc<PlaybackShared>,
) -> Result<cpal::Stream, String>
where
    T: cpal::SizedSample + cpal::FromSample<f32>,
{
    let data_shared = Arc::clone(shared);
    let err_shared = Arc::clone(shared);
    let mut cursor = 0usize;

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                for frame in data.chunks_mut(channels.max(1)) {
                    let value = match samples.get(cursor) {
                        Some(&s) => {
                            cursor += 1;
                            s
                        }
                        None => 0.0,
                    };
                    let out = T::from_sample(value);
                    for slot in frame.iter_mut() {
                        *slot = out;
                    }
                }
                data_shared
                    .frames_played
                    .store(cursor as u64, Ordering::Relaxed);
                if cursor >= samples.len() {
                    data_shared.queued.store(true, Ordering::Relaxed);
                }
            },
            move |err| {
                tracing::warn!(error = %err, "audio output stream error");
                err_shared.fail(err.to_string());
            },
            None,
        )
        .map_err(|e| format!("Failed to build output stream: {}", e))
}

/// Resample mono audio between rates.
fn resample(samples: &[f32], from: u32, to: u32) -> Result<Vec<f32>, String> {
    if samples.is_empty() {
        return Ok(Vec::new());
    }
    let mut resampler = FftFixedIn::<f32>::new(from as usize, to as usize, RESAMPLE_CHUNK, 2, 1)
        .map_err(|e| format!("Failed to create resampler: {}", e))?;

    let mut out = Vec::with_capacity(samples.len() * to as usize / from.max(1) as usize + RESAMPLE_CHUNK);
    let mut pos = 0;
    while pos + RESAMPLE_CHUNK <= samples.len() {
        let frames = resampler
            .process(&[&samples[pos..pos + RESAMPLE_CHUNK]], None)
            .map_err(|e| format!("Resampling failed: {}", e))?;
        out.extend_from_slice(&frames[0]);
        pos += RESAMPLE_CHUNK;
    }
    if pos < samples.len() {
        let frames = resampler
            .process_partial(Some(&[&samples[pos..]][..]), None)
            .map_err(|e| format!("Resampling failed: {}", e))?;
        out.extend_from_slice(&frames[0]);
    }
    let tail = resampler
        .process_partial::<&[f32]>(None, None)
        .map_err(|e| format!("Resampling failed: {}", e))?;
    out.extend_from_slice(&tail[0]);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resample_scales_length() {
        let input = vec![0.25f32; 24_000];
        let out = resample(&input, 24_000, 48_000).unwrap();
        // FFT resampling adds a short delay line; length is roughly doubled.
        assert!(out.len() >= 47_000 && out.len() <= 50_000, "len = {}", out.len());
    }

    #[test]
    fn queued_clip_keeps_playing_until_drained() {
        let shared = PlaybackShared::default();
        shared.queued.store(true, Ordering::Relaxed);
        assert_eq!(shared.state(), PlaybackState::Playing);

        let (_stop_tx, stop_rx) = mpsc::channel();
        supervise(&stop_rx, &shared, Duration::from_millis(5));
        assert_eq!(shared.state(), PlaybackState::Finished);
    }

    #[test]
    fn stop_during_tail_skips_drain() {
        let shared = Arc::new(PlaybackShared::default());
        shared.queued.store(true, Ordering::Relaxed);
        let (stop_tx, stop_rx) = mpsc::channel();
        let stopper = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(60));
            let _ = stop_tx.send(());
        });
        supervise(&stop_rx, &shared, Duration::from_secs(10));
        stopper.join().unwrap();
        assert_eq!(shared.state(), PlaybackState::Playing);
    }

    #[test]
    fn stopped_clip_is_never_reported_finished() {
        let shared = PlaybackShared::default();
        let (stop_tx, stop_rx) = mpsc::channel();
        stop_tx.send(()).unwrap();
        supervise(&stop_rx, &shared, Duration::from_millis(5));
        assert_eq!(shared.state(), PlaybackState::Playing);
    }

    #[test]
    fn stream_error_wins_over_drain() {
        let shared = PlaybackShared::default();
        shared.queued.store(true, Ordering::Relaxed);
        shared.fail("device lost".into());
        assert_eq!(shared.state(), PlaybackState::Failed("device lost".into()));
    }

    #[test]
    fn resample_empty_is_empty() {
        assert!(resample(&[], 22_050, 44_100).unwrap().is_empty());
    }
}
