use std::path::Path;

use anyhow::{Context, Result};
use base64::Engine;
use rubato::{Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction};

use super::{AudioChunk, AudioError, WireFrame, CAPTURE_MIME_TYPE};

const BASE64: base64::engine::general_purpose::GeneralPurpose = base64::engine::general_purpose::STANDARD;

const PCM16_SCALE: f64 = 32768.0;

/// Input frames fed to the sinc resampler per call.
const RESAMPLER_CHUNK: usize = 1024;

/// Half the sinc length: how far the filter reaches past a buffer edge.
const EDGE_PADDING: usize = 128;

/// Scale a float sample into the 16-bit range.
///
/// Truncates toward zero and wraps into 16 bits instead of clamping, so `1.0`
/// becomes `0x8000` and out-of-range input wraps around. NaN maps to zero.
pub fn f32_to_pcm16(sample: f32) -> i16 {
    let scaled = (sample as f64 * PCM16_SCALE).trunc();
    if !scaled.is_finite() {
        return 0;
    }
    scaled.rem_euclid(65536.0) as u32 as u16 as i16
}

pub fn pcm16_to_f32(sample: i16) -> f32 {
    (sample as f64 / PCM16_SCALE) as f32
}

/// Pack float samples as 16-bit little-endian PCM.
pub fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        bytes.extend_from_slice(&f32_to_pcm16(sample).to_le_bytes());
    }
    bytes
}

/// Convert one capture frame into the outbound wire format.
pub fn encode_wire_frame(samples: &[f32]) -> WireFrame {
    WireFrame {
        data: BASE64.encode(encode_pcm16(samples)),
        mime_type: CAPTURE_MIME_TYPE,
    }
}

/// Decode a base64 payload of interleaved 16-bit little-endian PCM.
pub fn decode_pcm16(payload: &str, sample_rate: u32, channels: usize) -> Result<AudioChunk, AudioError> {
    if channels == 0 {
        return Err(AudioError::Decode("channel count must be positive".into()));
    }

    let bytes = BASE64
        .decode(payload.trim())
        .map_err(|e| AudioError::Decode(format!("invalid base64: {}", e)))?;

    if bytes.is_empty() {
        return Err(AudioError::Decode("empty payload".into()));
    }
    if bytes.len() % 2 != 0 {
        return Err(AudioError::Decode(format!(
            "odd byte length {} for 16-bit samples",
            bytes.len()
        )));
    }

    let samples: Vec<i16> = bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect();

    let frame_count = samples.len() / channels;
    if frame_count == 0 {
        return Err(AudioError::Decode("payload shorter than one frame".into()));
    }

    let buffers = (0..channels)
        .map(|channel| {
            (0..frame_count)
                .map(|i| pcm16_to_f32(samples[i * channels + channel]))
                .collect()
        })
        .collect();

    Ok(AudioChunk::new(buffers, sample_rate))
}

/// Root-mean-square level of a block, capped at 1.0.
pub fn rms_level(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let rms: f32 = samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32;
    rms.sqrt().min(1.0)
}

/// Write a chunk to a 16-bit WAV file.
pub fn save_wav(path: &Path, chunk: &AudioChunk) -> Result<()> {
    let spec = hound::WavSpec {
        channels: chunk.channel_count().max(1) as u16,
        sample_rate: chunk.sample_rate(),
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).context("Failed to create output directory")?;
        }
    }

    let mut writer = hound::WavWriter::create(path, spec).context("Failed to create WAV file")?;
    for i in 0..chunk.frames() {
        for channel in 0..chunk.channel_count() {
            writer.write_sample(f32_to_pcm16(chunk.channel(channel)[i].clamp(-1.0, 32767.0 / 32768.0)))?;
        }
    }
    writer.finalize().context("Failed to finalize WAV file")?;
    Ok(())
}

fn sinc_parameters() -> SincInterpolationParameters {
    SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    }
}

/// Resample one complete mono buffer.
///
/// Both edges are extended with their own value so the filter does not ring
/// against implied silence, which keeps back-to-back buffers click free. The
/// filter delay and the padding are trimmed, so the result is aligned with the
/// input and holds `round(len * to / from)` samples.
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    let (Some(&first), Some(&last)) = (samples.first(), samples.last()) else {
        return Ok(Vec::new());
    };
    if from_rate == to_rate {
        return Ok(samples.to_vec());
    }

    let mut padded = Vec::with_capacity(samples.len() + 2 * EDGE_PADDING);
    padded.resize(EDGE_PADDING, first);
    padded.extend_from_slice(samples);
    padded.resize(samples.len() + 2 * EDGE_PADDING, last);

    let ratio = to_rate as f64 / from_rate as f64;
    let mut resampler = SincFixedIn::<f32>::new(
        ratio,
        2.0,
        sinc_parameters(),
        padded.len(),
        1, // mono
    )
    .context("Failed to build playback resampler")?;

    let expected = (samples.len() as f64 * ratio).round() as usize;
    let lead = resampler.output_delay() + (EDGE_PADDING as f64 * ratio).round() as usize;

    let mut output = resampler
        .process(&[padded], None)?
        .into_iter()
        .next()
        .unwrap_or_default();
    while output.len() < lead + expected {
        let tail = resampler
            .process_partial(None::<&[Vec<f32>]>, None)?
            .into_iter()
            .next()
            .unwrap_or_default();
        if tail.is_empty() {
            break;
        }
        output.extend(tail);
    }

    output.drain(..lead.min(output.len()));
    output.resize(expected, 0.0);
    Ok(output)
}

/// Sample-rate converter for a continuous mono stream.
///
/// Keeps the sinc filter state between calls so block boundaries of the
/// incoming stream do not produce clicks. Passes samples through untouched
/// when both rates match.
pub struct StreamResampler {
    resampler: Option<SincFixedIn<f32>>,
    pending: Vec<f32>,
}

impl StreamResampler {
    pub fn new(from_rate: u32, to_rate: u32) -> Result<Self> {
        if from_rate == to_rate {
            return Ok(Self { resampler: None, pending: Vec::new() });
        }

        let ratio = to_rate as f64 / from_rate as f64;
        let resampler = SincFixedIn::<f32>::new(
            ratio,
            2.0,
            sinc_parameters(),
            RESAMPLER_CHUNK,
            1, // mono
        )
        .context("Failed to build capture resampler")?;

        Ok(Self {
            resampler: Some(resampler),
            pending: Vec::new(),
        })
    }

    /// Feed device-rate samples, returning whatever target-rate output is ready.
    pub fn process(&mut self, samples: &[f32]) -> Result<Vec<f32>> {
        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(samples.to_vec());
        };

        self.pending.extend_from_slice(samples);
        let mut output = Vec::new();

        loop {
            let needed = resampler.input_frames_next();
            if self.pending.len() < needed {
                break;
            }
            let input = vec![self.pending.drain(..needed).collect::<Vec<f32>>()];
            let processed = resampler.process(&input, None)?;
            if let Some(channel) = processed.into_iter().next() {
                output.extend(channel);
            }
        }

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_wire(frame: &WireFrame) -> Vec<i16> {
        let bytes = BASE64.decode(&frame.data).unwrap();
        bytes
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect()
    }

    #[test]
    fn silence_encodes_to_zero_samples() {
        let frame = encode_wire_frame(&[0.0; 4096]);
        assert_eq!(frame.mime_type, "audio/pcm;rate=16000");
        let samples = decode_wire(&frame);
        assert_eq!(samples.len(), 4096);
        assert!(samples.iter().all(|&s| s == 0));
    }

    #[test]
    fn full_scale_sample_hits_the_scaling_bound() {
        // 1.0 * 32768 is one past i16::MAX and wraps to the 0x8000 bit pattern.
        assert_eq!(f32_to_pcm16(1.0) as u16, 32768);
        assert_eq!(f32_to_pcm16(1.0), i16::MIN);
        assert_eq!(f32_to_pcm16(-1.0), -32768);
    }

    #[test]
    fn scaling_truncates_toward_zero() {
        assert_eq!(f32_to_pcm16(0.5), 16384);
        assert_eq!(f32_to_pcm16(-0.5), -16384);
        // 0.00002 * 32768 = 0.655... truncates to zero.
        assert_eq!(f32_to_pcm16(0.00002), 0);
        assert_eq!(f32_to_pcm16(-0.00002), 0);
    }

    #[test]
    fn out_of_range_samples_wrap_instead_of_clipping() {
        // 1.5 * 32768 = 49152, which wraps to 49152 - 65536.
        assert_eq!(f32_to_pcm16(1.5), -16384);
        assert_eq!(f32_to_pcm16(-1.5), 16384);
        assert_eq!(f32_to_pcm16(f32::NAN), 0);
        assert_eq!(f32_to_pcm16(f32::INFINITY), 0);
    }

    #[test]
    fn pcm_is_little_endian() {
        assert_eq!(encode_pcm16(&[0.5]), vec![0x00, 0x40]);
    }

    #[test]
    fn decode_deinterleaves_channels() {
        let mut bytes = Vec::new();
        for s in [16384i16, -16384, 8192, -8192] {
            bytes.extend_from_slice(&s.to_le_bytes());
        }
        let chunk = decode_pcm16(&BASE64.encode(&bytes), 24000, 2).unwrap();
        assert_eq!(chunk.channel_count(), 2);
        assert_eq!(chunk.frames(), 2);
        assert_eq!(chunk.channel(0), &[0.5, 0.25]);
        assert_eq!(chunk.channel(1), &[-0.5, -0.25]);
        assert_eq!(chunk.sample_rate(), 24000);
    }

    #[test]
    fn decode_rejects_malformed_payloads() {
        assert!(matches!(decode_pcm16("", 24000, 1), Err(AudioError::Decode(_))));
        assert!(matches!(decode_pcm16("not base64!!", 24000, 1), Err(AudioError::Decode(_))));
        let odd = BASE64.encode([1u8, 2, 3]);
        assert!(matches!(decode_pcm16(&odd, 24000, 1), Err(AudioError::Decode(_))));
        let one = BASE64.encode([0u8, 0]);
        assert!(matches!(decode_pcm16(&one, 24000, 0), Err(AudioError::Decode(_))));
    }

    #[test]
    fn rms_of_constant_signal() {
        assert_eq!(rms_level(&[]), 0.0);
        assert!((rms_level(&[0.5; 100]) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn passthrough_resampler_returns_input() {
        let mut resampler = StreamResampler::new(16000, 16000).unwrap();
        assert_eq!(resampler.process(&[0.1, 0.2]).unwrap(), vec![0.1, 0.2]);
    }

    #[test]
    fn downsampling_keeps_remainder_between_calls() {
        let mut resampler = StreamResampler::new(48000, 16000).unwrap();
        let mut produced = 0;
        for _ in 0..10 {
            produced += resampler.process(&[0.0; 1024]).unwrap().len();
        }
        // 10240 input samples at a 1/3 ratio.
        assert!(produced > 3000 && produced < 3700, "produced {}", produced);

        // Less than one resampler chunk stays buffered.
        let mut fresh = StreamResampler::new(48000, 16000).unwrap();
        assert!(fresh.process(&[0.0; 100]).unwrap().is_empty());
    }

    #[test]
    fn resampled_buffer_keeps_length_and_level() {
        let upsampled = resample(&[0.5; 2400], 24000, 44100).unwrap();
        assert_eq!(upsampled.len(), 4410);
        assert!((upsampled[2205] - 0.5).abs() < 0.01, "got {}", upsampled[2205]);

        assert_eq!(resample(&[0.5; 1001], 24000, 44100).unwrap().len(), 1839);
        assert_eq!(resample(&[0.1, 0.2], 24000, 24000).unwrap(), vec![0.1, 0.2]);
    }

    #[test]
    fn resampling_does_not_shift_the_signal() {
        let mut impulse = vec![0.0; 480];
        impulse[240] = 1.0;
        let up = resample(&impulse, 24000, 48000).unwrap();
        let peak = up
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap();
        assert!((479..=481).contains(&peak), "peak at {}", peak);
    }

    #[test]
    fn wav_export_round_trips_through_hound() {
        let dir = std::env::temp_dir().join(format!("classroom-tutor-wav-{}", std::process::id()));
        let path = dir.join("speech.wav");
        let chunk = AudioChunk::mono(vec![0.0, 0.5, -0.5], 24000);
        save_wav(&path, &chunk).unwrap();

        let reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().sample_rate, 24000);
        let samples: Vec<i16> = reader.into_samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(samples, vec![0, 16384, -16384]);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
