use base64::Engine;
use rubato::{FastFixedIn, PolynomialDegree, Resampler};

/// Sample rate the OpenAI realtime API expects for PCM16 input.
pub const OPENAI_REALTIME_API_PCM16_SAMPLE_RATE: f64 = 24000.0;

/// Frames fed to the resampler per call.
pub const RESAMPLER_CHUNK_SIZE: usize = 1024;

/// Creates a resampler to convert between audio sample rates.
pub fn create_resampler(
    in_sampling_rate: f64,
    out_sampling_rate: f64,
    chunk_size: usize,
) -> anyhow::Result<FastFixedIn<f32>> {
    let resampler = FastFixedIn::<f32>::new(
        out_sampling_rate / in_sampling_rate,
        1.0,
        PolynomialDegree::Cubic,
        chunk_size,
        1,
    )?;
    Ok(resampler)
}

/// Interprets little-endian byte pairs as i16 samples. A trailing odd byte is ignored.
pub fn pcm16_from_le_bytes(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect()
}

/// Converts a slice of f32 samples to a vector of i16 samples.
pub fn convert_f32_to_i16(pcm32: &[f32]) -> Vec<i16> {
    pcm32
        .iter()
        .map(|&sample| (sample * i16::MAX as f32).clamp(i16::MIN as f32, i16::MAX as f32) as i16)
        .collect()
}

/// Converts a slice of i16 samples to a vector of f32 samples.
pub fn convert_i16_to_f32(pcm16: &[i16]) -> Vec<f32> {
    pcm16
        .iter()
        .map(|&sample| sample as f32 / 32768.0)
        .collect()
}

/// Base64 of the little-endian bytes of `pcm16`.
pub fn encode_i16(pcm16: &[i16]) -> String {
    let pcm16_bytes: Vec<u8> = pcm16
        .iter()
        .flat_map(|&sample| sample.to_le_bytes())
        .collect();
    base64::engine::general_purpose::STANDARD.encode(&pcm16_bytes)
}

/// Resamples a continuous PCM16 mono stream arriving in arbitrarily sized pieces.
///
/// The fixed-input resampler needs whole chunks, so samples are buffered until a
/// chunk is complete. Equal rates pass audio through untouched.
pub struct StreamResampler {
    resampler: Option<FastFixedIn<f32>>,
    pending: Vec<f32>,
}

impl StreamResampler {
    pub fn new(in_rate: f64, out_rate: f64) -> anyhow::Result<Self> {
        let resampler = if (in_rate - out_rate).abs() < f64::EPSILON {
            None
        } else {
            Some(create_resampler(in_rate, out_rate, RESAMPLER_CHUNK_SIZE)?)
        };
        Ok(Self {
            resampler,
            pending: Vec::new(),
        })
    }

    /// Samples buffered and waiting for a complete chunk.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn process(&mut self, pcm16_bytes: &[u8]) -> anyhow::Result<Vec<i16>> {
        let samples = pcm16_from_le_bytes(pcm16_bytes);
        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(samples);
        };

        self.pending.extend(convert_i16_to_f32(&samples));
        let mut out = Vec::new();
        loop {
            let needed = resampler.input_frames_next();
            if self.pending.len() < needed {
                break;
            }
            let chunk: Vec<f32> = self.pending.drain(..needed).collect();
            let mut resampled = resampler.process(&[chunk], None)?;
            if let Some(channel) = resampled.pop() {
                out.extend(channel);
            }
        }
        Ok(convert_f32_to_i16(&out))
    }
}
