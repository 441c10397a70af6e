use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample};
use tokio::sync::mpsc;

use super::processing::rms_level;
use super::{wait_blocking, AudioError};

/// Raw mono sample blocks at the microphone's native rate.
pub type RawSamples = mpsc::UnboundedReceiver<Vec<f32>>;

/// A microphone that can be acquired, gated and released.
pub trait Microphone: Send {
    /// Acquire the input device. Blocks flow only while forwarding is on.
    fn open(&mut self) -> Result<RawSamples, AudioError>;

    /// Native sample rate of the opened device.
    fn sample_rate(&self) -> u32;

    fn set_forwarding(&self, forwarding: bool);

    /// Release the device. Safe to call when not open.
    fn close(&mut self);

    fn is_open(&self) -> bool;

    fn current_level(&self) -> f32 {
        0.0
    }
}

pub struct CpalMicrophone {
    is_forwarding: Arc<AtomicBool>,
    level_bits: Arc<AtomicU32>,
    device_sample_rate: u32,
    stop_tx: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl CpalMicrophone {
    pub fn new() -> Self {
        Self {
            is_forwarding: Arc::new(AtomicBool::new(false)),
            level_bits: Arc::new(AtomicU32::new(0)),
            device_sample_rate: super::CAPTURE_SAMPLE_RATE,
            stop_tx: None,
            thread: None,
        }
    }
}

impl Default for CpalMicrophone {
    fn default() -> Self {
        Self::new()
    }
}

impl Microphone for CpalMicrophone {
    fn open(&mut self) -> Result<RawSamples, AudioError> {
        self.close();

        let (samples_tx, samples_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<u32>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let is_forwarding = Arc::clone(&self.is_forwarding);
        let level_bits = Arc::clone(&self.level_bits);

        is_forwarding.store(false, Ordering::SeqCst);

        // cpal::Stream is !Send; it is built and dropped on this thread.
        let thread = std::thread::spawn(move || {
            let stream = match build_input_stream(samples_tx, is_forwarding, level_bits) {
                Ok((stream, rate)) => {
                    let _ = ready_tx.send(Ok(rate));
                    stream
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            let _ = stop_rx.recv();
            drop(stream);
            tracing::debug!("Microphone thread exiting");
        });

        let rate = wait_blocking(|| ready_rx.recv())
            .map_err(|_| AudioError::Microphone("capture thread exited during setup".into()))?
            .map_err(|e| microphone_error(&e))?;

        self.device_sample_rate = rate;
        self.stop_tx = Some(stop_tx);
        self.thread = Some(thread);

        tracing::info!("Microphone opened (device sample rate: {}Hz)", rate);
        Ok(samples_rx)
    }

    fn sample_rate(&self) -> u32 {
        self.device_sample_rate
    }

    fn set_forwarding(&self, forwarding: bool) {
        self.is_forwarding.store(forwarding, Ordering::SeqCst);
    }

    fn close(&mut self) {
        self.is_forwarding.store(false, Ordering::SeqCst);
        self.level_bits.store(0, Ordering::SeqCst);

        let Some(stop_tx) = self.stop_tx.take() else {
            return;
        };
        let _ = stop_tx.send(());
        if let Some(handle) = self.thread.take() {
            let _ = wait_blocking(|| handle.join());
        }
        tracing::info!("Microphone released");
    }

    fn is_open(&self) -> bool {
        self.stop_tx.is_some()
    }

    fn current_level(&self) -> f32 {
        f32::from_bits(self.level_bits.load(Ordering::Relaxed))
    }
}

impl Drop for CpalMicrophone {
    fn drop(&mut self) {
        self.close();
    }
}

/// Keep the whole context chain so the user sees why the device refused.
fn microphone_error(e: &anyhow::Error) -> AudioError {
    AudioError::Microphone(format!("{:#}", e))
}

fn build_input_stream(
    samples_tx: mpsc::UnboundedSender<Vec<f32>>,
    is_forwarding: Arc<AtomicBool>,
    level_bits: Arc<AtomicU32>,
) -> Result<(cpal::Stream, u32)> {
    let host = cpal::default_host();
    let device = host.default_input_device().context("No input device available")?;

    let config = device
        .default_input_config()
        .context("Failed to get default input config")?;

    let sample_rate = config.sample_rate().0;
    let sample_format = config.sample_format();
    let stream_config: cpal::StreamConfig = config.into();

    let stream = match sample_format {
        SampleFormat::F32 => run_stream::<f32>(&device, &stream_config, samples_tx, is_forwarding, level_bits),
        SampleFormat::I16 => run_stream::<i16>(&device, &stream_config, samples_tx, is_forwarding, level_bits),
        SampleFormat::U16 => run_stream::<u16>(&device, &stream_config, samples_tx, is_forwarding, level_bits),
        other => Err(anyhow::anyhow!("Unsupported input sample format: {:?}", other)),
    }?;

    Ok((stream, sample_rate))
}

fn run_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    samples_tx: mpsc::UnboundedSender<Vec<f32>>,
    is_forwarding: Arc<AtomicBool>,
    level_bits: Arc<AtomicU32>,
) -> Result<cpal::Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = config.channels.max(1) as usize;

    let stream = device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                if !is_forwarding.load(Ordering::SeqCst) {
                    return;
                }
                let mono: Vec<f32> = data
                    .iter()
                    .step_by(channels)
                    .map(|&s| f32::from_sample(s))
                    .collect();
                level_bits.store(rms_level(&mono).to_bits(), Ordering::Relaxed);
                // Never block the device thread; the pipe task does the heavy lifting.
                let _ = samples_tx.send(mono);
            },
            |err| {
                tracing::error!("Audio capture error: {}", err);
            },
            None,
        )
        .context("Failed to build input stream")?;

    stream.play().context("Failed to start audio stream")?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_failure_keeps_its_context() {
        let err = anyhow::anyhow!("access denied").context("Failed to build input stream");
        assert_eq!(
            microphone_error(&err).to_string(),
            "Microphone unavailable: Failed to build input stream: access denied"
        );
    }

    #[test]
    fn closed_microphone_is_idle() {
        let mut mic = CpalMicrophone::new();
        assert!(!mic.is_open());
        mic.close();
        assert_eq!(mic.current_level(), 0.0);
        assert_eq!(mic.sample_rate(), crate::audio::CAPTURE_SAMPLE_RATE);
    }
}
