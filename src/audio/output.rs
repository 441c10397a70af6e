//! Audio output device built on cpal.
//!
//! Scheduled chunks become "voices" on a sample-frame timeline. Each chunk is
//! resampled to the device rate when it is started, so the device callback
//! only copies frames: it mixes every voice overlapping the buffer it is asked
//! to fill and reports voices that played to the end. The frame counter is the
//! device clock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SampleRate, SizedSample};
use tokio::sync::mpsc;

use super::processing::resample;
use super::scheduler::{HandleId, OutputDevice};
use super::{wait_blocking, AudioChunk, AudioError, PLAYBACK_SAMPLE_RATE};

struct Voice {
    id: HandleId,
    start_frame: u64,
    end_frame: u64,
    /// Samples at the device rate.
    chunk: AudioChunk,
}

struct MixerState {
    frames_rendered: u64,
    voices: Vec<Voice>,
}

/// Sample-accurate voice mixer shared between the scheduler and the device callback.
#[derive(Clone)]
pub struct Mixer {
    state: Arc<Mutex<MixerState>>,
    /// Set by the stream error callback, cleared once rendering resumes.
    failed: Arc<AtomicBool>,
    sample_rate: u32,
    finished_tx: mpsc::UnboundedSender<HandleId>,
}

impl Mixer {
    pub fn new(sample_rate: u32, finished_tx: mpsc::UnboundedSender<HandleId>) -> Self {
        Self {
            state: Arc::new(Mutex::new(MixerState {
                frames_rendered: 0,
                voices: Vec::new(),
            })),
            failed: Arc::new(AtomicBool::new(false)),
            sample_rate: sample_rate.max(1),
            finished_tx,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn to_frames(&self, seconds: f64) -> u64 {
        (seconds.max(0.0) * self.sample_rate as f64).round() as u64
    }

    fn to_device_rate(&self, chunk: &AudioChunk) -> Result<AudioChunk, AudioError> {
        if chunk.sample_rate() == self.sample_rate {
            return Ok(chunk.clone());
        }
        let channels = (0..chunk.channel_count())
            .map(|c| resample(chunk.channel(c), chunk.sample_rate(), self.sample_rate))
            .collect::<Result<Vec<_>>>()
            .map_err(|e| AudioError::Device(format!("{:#}", e)))?;
        Ok(AudioChunk::new(channels, self.sample_rate))
    }

    /// Fill an interleaved output buffer and advance the clock by its length.
    pub fn render(&self, out: &mut [f32], channels: usize) {
        out.fill(0.0);
        let channels = channels.max(1);
        let frames = (out.len() / channels) as u64;

        if self.failed.swap(false, Ordering::SeqCst) {
            tracing::info!("Audio output recovered");
        }

        let Ok(mut state) = self.state.lock() else {
            return;
        };

        let window_start = state.frames_rendered;
        let window_end = window_start + frames;

        for voice in &state.voices {
            if voice.chunk.channel_count() == 0 {
                continue;
            }
            let from = voice.start_frame.max(window_start);
            let to = voice.end_frame.min(window_end);
            for frame in from..to {
                let index = (frame - voice.start_frame) as usize;
                let base = (frame - window_start) as usize * channels;
                for c in 0..channels {
                    let source = voice.chunk.channel(c % voice.chunk.channel_count());
                    // Spans are rounded on the timeline and may run one frame past the samples.
                    out[base + c] += source.get(index).or(source.last()).copied().unwrap_or(0.0);
                }
            }
        }

        state.frames_rendered = window_end;

        let finished_tx = &self.finished_tx;
        state.voices.retain(|voice| {
            if voice.end_frame <= window_end {
                let _ = finished_tx.send(voice.id);
                false
            } else {
                true
            }
        });
    }

    /// The stream reported an error. Playing voices are released as finished
    /// so nothing waits on a stream that may not come back, and new voices are
    /// refused until the device renders again.
    pub fn fail(&self) {
        self.failed.store(true, Ordering::SeqCst);
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        for voice in state.voices.drain(..) {
            let _ = self.finished_tx.send(voice.id);
        }
    }
}

impl OutputDevice for Mixer {
    fn current_time(&self) -> f64 {
        let frames = self.state.lock().map(|s| s.frames_rendered).unwrap_or(0);
        frames as f64 / self.sample_rate as f64
    }

    fn start(&mut self, id: HandleId, chunk: &AudioChunk, at: f64) -> Result<(), AudioError> {
        if self.failed.load(Ordering::SeqCst) {
            return Err(AudioError::Device("output stream reported an error".into()));
        }
        let voice_chunk = self.to_device_rate(chunk)?;
        let mut state = self
            .state
            .lock()
            .map_err(|_| AudioError::Device("mixer state poisoned".into()))?;

        // Never start in the past: the callback has already rendered those frames.
        let requested = self.to_frames(at);
        let start_frame = requested.max(state.frames_rendered);
        // Both ends are rounded from timeline seconds, so back-to-back chunks
        // share their boundary frame at any device rate.
        let end_frame = self.to_frames(at + chunk.duration()) + (start_frame - requested);
        state.voices.push(Voice {
            id,
            start_frame,
            end_frame,
            chunk: voice_chunk,
        });
        Ok(())
    }

    fn stop(&mut self, id: HandleId) -> Result<(), AudioError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| AudioError::Device("mixer state poisoned".into()))?;
        let before = state.voices.len();
        state.voices.retain(|v| v.id != id);
        if state.voices.len() == before {
            return Err(AudioError::Device(format!("handle {:?} is not playing", id)));
        }
        Ok(())
    }
}

/// Default output device driving a [`Mixer`].
///
/// `cpal::Stream` is not `Send`, so the stream lives on its own thread and is
/// dropped when this value is dropped.
pub struct CpalOutput {
    mixer: Mixer,
    stop_tx: std_mpsc::Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl CpalOutput {
    pub fn open(finished_tx: mpsc::UnboundedSender<HandleId>) -> Result<Self, AudioError> {
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<Mixer>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let thread = std::thread::spawn(move || {
            let stream = match build_output_stream(finished_tx) {
                Ok((stream, mixer)) => {
                    let _ = ready_tx.send(Ok(mixer));
                    stream
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };

            // Park until the owner goes away.
            let _ = stop_rx.recv();
            drop(stream);
            tracing::debug!("Audio output thread exiting");
        });

        let mixer = wait_blocking(|| ready_rx.recv())
            .map_err(|_| AudioError::Device("output thread exited during setup".into()))?
            .map_err(|e| AudioError::Device(format!("{:#}", e)))?;

        tracing::info!("Audio output started ({}Hz)", mixer.sample_rate());

        Ok(Self {
            mixer,
            stop_tx,
            thread: Some(thread),
        })
    }
}

impl OutputDevice for CpalOutput {
    fn current_time(&self) -> f64 {
        self.mixer.current_time()
    }

    fn start(&mut self, id: HandleId, chunk: &AudioChunk, at: f64) -> Result<(), AudioError> {
        self.mixer.start(id, chunk, at)
    }

    fn stop(&mut self, id: HandleId) -> Result<(), AudioError> {
        self.mixer.stop(id)
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.thread.take() {
            let _ = wait_blocking(|| handle.join());
        }
    }
}

fn build_output_stream(finished_tx: mpsc::UnboundedSender<HandleId>) -> Result<(cpal::Stream, Mixer)> {
    let host = cpal::default_host();
    let device = host.default_output_device().context("No output device available")?;

    // Prefer the service's native 24kHz so chunks need no rate conversion.
    let native = device
        .supported_output_configs()
        .context("Failed to query output configs")?
        .find(|range| {
            range.sample_format() == SampleFormat::F32
                && range.min_sample_rate() <= SampleRate(PLAYBACK_SAMPLE_RATE)
                && SampleRate(PLAYBACK_SAMPLE_RATE) <= range.max_sample_rate()
        })
        .map(|range| range.with_sample_rate(SampleRate(PLAYBACK_SAMPLE_RATE)));

    let supported = match native {
        Some(config) => config,
        None => device
            .default_output_config()
            .context("Failed to get default output config")?,
    };

    let sample_format = supported.sample_format();
    let config: cpal::StreamConfig = supported.into();
    let mixer = Mixer::new(config.sample_rate.0, finished_tx);

    let stream = match sample_format {
        SampleFormat::F32 => run_stream::<f32>(&device, &config, mixer.clone()),
        SampleFormat::I16 => run_stream::<i16>(&device, &config, mixer.clone()),
        SampleFormat::U16 => run_stream::<u16>(&device, &config, mixer.clone()),
        other => Err(anyhow::anyhow!("Unsupported output sample format: {:?}", other)),
    }?;

    Ok((stream, mixer))
}

fn run_stream<T>(device: &cpal::Device, config: &cpal::StreamConfig, mixer: Mixer) -> Result<cpal::Stream>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = config.channels as usize;
    let mut scratch: Vec<f32> = Vec::new();
    let error_mixer = mixer.clone();

    let stream = device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                scratch.resize(data.len(), 0.0);
                mixer.render(&mut scratch, channels);
                for (out, &sample) in data.iter_mut().zip(scratch.iter()) {
                    *out = T::from_sample(sample);
                }
            },
            move |err| {
                tracing::error!("Audio output error: {}", err);
                error_mixer.fail();
            },
            None,
        )
        .context("Failed to build output stream")?;

    stream.play().context("Failed to start output stream")?;
    Ok(stream)
}
