//! Pull-based PCM sources for the device mix graph and the engine ringback.

use std::f32::consts::TAU;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};

use super::format::AudioFormat;

/// A PCM source pulled by an audio path one buffer at a time.
///
/// Implementations fill `out` in the interleaved layout of `format` and
/// return the number of frames written; fewer than requested means the
/// source is exhausted. Rate and channel conversion happen inside the
/// source, the consumer only ever sees its own format.
pub trait SampleSource: Send {
    fn next_frames(&mut self, out: &mut [i16], format: AudioFormat) -> usize;
}

// ======================== WAV files ========================

/// Decoded 16-bit PCM WAV, converted to the consumer's format on the fly.
pub struct WavSource {
    samples: Vec<i16>,
    src_rate: u32,
    src_channels: u32,
    cursor: f64,
}

impl WavSource {
    /// Read and parse a RIFF/WAVE file. Uncompressed 16-bit PCM only.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&bytes).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn from_samples(samples: Vec<i16>, sample_rate: u32, channels: u32) -> Self {
        Self {
            samples,
            src_rate: sample_rate.max(1),
            src_channels: channels.max(1),
            cursor: 0.0,
        }
    }

    fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 12 || &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"WAVE" {
            bail!("not a RIFF/WAVE file");
        }

        let mut fmt: Option<(u32, u32)> = None;
        let mut data: Option<&[u8]> = None;
        let mut off = 12;
        while off + 8 <= bytes.len() {
            let id = &bytes[off..off + 4];
            let size =
                u32::from_le_bytes([bytes[off + 4], bytes[off + 5], bytes[off + 6], bytes[off + 7]])
                    as usize;
            let body_end = off + 8 + size;
            if body_end > bytes.len() {
                bail!("chunk runs past end of file");
            }
            let body = &bytes[off + 8..body_end];
            match id {
                b"fmt " => {
                    if body.len() < 16 {
                        bail!("fmt chunk too short");
                    }
                    let audio_format = u16::from_le_bytes([body[0], body[1]]);
                    let channels = u16::from_le_bytes([body[2], body[3]]);
                    let rate = u32::from_le_bytes([body[4], body[5], body[6], body[7]]);
                    let bits = u16::from_le_bytes([body[14], body[15]]);
                    if audio_format != 1 {
                        bail!("unsupported WAVE format {} (PCM only)", audio_format);
                    }
                    if bits != 16 {
                        bail!("unsupported sample width {} (16-bit only)", bits);
                    }
                    if channels == 0 || rate == 0 {
                        bail!("invalid fmt chunk: {} channels, {} Hz", channels, rate);
                    }
                    fmt = Some((channels as u32, rate));
                }
                b"data" => data = Some(body),
                _ => {}
            }
            // Chunks are word aligned.
            off = body_end + (size & 1);
        }

        let (channels, rate) = fmt.ok_or_else(|| anyhow!("missing fmt chunk"))?;
        let data = data.ok_or_else(|| anyhow!("missing data chunk"))?;
        let mut samples = Vec::with_capacity(data.len() / 2);
        for pair in data.chunks_exact(2) {
            samples.push(i16::from_le_bytes([pair[0], pair[1]]));
        }

        Ok(Self {
            samples,
            src_rate: rate,
            src_channels: channels,
            cursor: 0.0,
        })
    }

    pub fn duration(&self) -> Duration {
        let frames = self.samples.len() as u64 / self.src_channels as u64;
        Duration::from_micros(frames * 1_000_000 / self.src_rate as u64)
    }
}

impl SampleSource for WavSource {
    fn next_frames(&mut self, out: &mut [i16], format: AudioFormat) -> usize {
        let dst_ch = format.channels.max(1) as usize;
        let src_ch = self.src_channels as usize;
        let src_frames = self.samples.len() / src_ch;
        // Nearest-neighbor resample; good enough for notification audio.
        let step = self.src_rate as f64 / format.sample_rate.max(1) as f64;
        let mut written = 0;
        for frame in out.chunks_mut(dst_ch) {
            let src_index = self.cursor as usize;
            if src_index >= src_frames {
                break;
            }
            let base = src_index * src_ch;
            for (c, slot) in frame.iter_mut().enumerate() {
                *slot = if src_ch == 1 {
                    self.samples[base]
                } else if dst_ch == 1 {
                    let sum: i32 = self.samples[base..base + src_ch]
                        .iter()
                        .map(|&s| s as i32)
                        .sum();
                    (sum / src_ch as i32) as i16
                } else {
                    self.samples[base + c.min(src_ch - 1)]
                };
            }
            self.cursor += step;
            written += 1;
        }
        written
    }
}

// ======================== Synthesized tones ========================

/// Finite mix of sine tones. The built-in stand-in when no music asset is on
/// disk.
pub struct ToneSource {
    freqs: Vec<f32>,
    phases: Vec<f32>,
    amplitude: f32,
    duration: Duration,
    produced: u64,
}

impl ToneSource {
    pub fn new(freqs: &[f32], amplitude: f32, duration: Duration) -> Self {
        Self {
            freqs: freqs.to_vec(),
            phases: vec![0.0; freqs.len()],
            amplitude,
            duration,
            produced: 0,
        }
    }

    /// A mellow C major chord, eight seconds.
    pub fn chord() -> Self {
        Self::new(&[262.0, 330.0, 392.0, 523.0], 2500.0, Duration::from_secs(8))
    }
}

impl SampleSource for ToneSource {
    fn next_frames(&mut self, out: &mut [i16], format: AudioFormat) -> usize {
        let ch = format.channels.max(1) as usize;
        let rate = format.sample_rate.max(1);
        let limit = (self.duration.as_secs_f64() * rate as f64) as u64;
        let mut written = 0;
        for frame in out.chunks_mut(ch) {
            if self.produced >= limit {
                break;
            }
            let mut s = 0.0f32;
            for (phase, freq) in self.phases.iter_mut().zip(&self.freqs) {
                s += phase.sin();
                *phase += freq * TAU / rate as f32;
                if *phase > TAU {
                    *phase -= TAU;
                }
            }
            frame.fill((s * self.amplitude) as i16);
            self.produced += 1;
            written += 1;
        }
        written
    }
}

/// North American ringback: 440 Hz + 480 Hz, two seconds on, four off,
/// repeating until dropped.
pub struct RingbackTone {
    phase_a: f32,
    phase_b: f32,
    position: u64,
}

impl RingbackTone {
    const TONE_A: f32 = 440.0;
    const TONE_B: f32 = 480.0;
    const AMPLITUDE: f32 = 4000.0;
    const ON_SECS: u64 = 2;
    const CADENCE_SECS: u64 = 6;

    pub fn new() -> Self {
        Self {
            phase_a: 0.0,
            phase_b: 0.0,
            position: 0,
        }
    }
}

impl Default for RingbackTone {
    fn default() -> Self {
        Self::new()
    }
}

impl SampleSource for RingbackTone {
    fn next_frames(&mut self, out: &mut [i16], format: AudioFormat) -> usize {
        let ch = format.channels.max(1) as usize;
        let rate = format.sample_rate.max(1);
        let on_frames = Self::ON_SECS * rate as u64;
        let cadence_frames = Self::CADENCE_SECS * rate as u64;
        for frame in out.chunks_mut(ch) {
            let sample = if self.position % cadence_frames < on_frames {
                ((self.phase_a.sin() + self.phase_b.sin()) * Self::AMPLITUDE) as i16
            } else {
                0
            };
            frame.fill(sample);
            self.phase_a += Self::TONE_A * TAU / rate as f32;
            if self.phase_a > TAU {
                self.phase_a -= TAU;
            }
            self.phase_b += Self::TONE_B * TAU / rate as f32;
            if self.phase_b > TAU {
                self.phase_b -= TAU;
            }
            self.position += 1;
        }
        out.len() / ch
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wav_bytes(rate: u32, channels: u16, samples: &[i16]) -> Vec<u8> {
        let data_len = samples.len() * 2;
        let mut b = Vec::new();
        b.extend_from_slice(b"RIFF");
        b.extend_from_slice(&((36 + data_len) as u32).to_le_bytes());
        b.extend_from_slice(b"WAVE");
        b.extend_from_slice(b"fmt ");
        b.extend_from_slice(&16u32.to_le_bytes());
        b.extend_from_slice(&1u16.to_le_bytes());
        b.extend_from_slice(&channels.to_le_bytes());
        b.extend_from_slice(&rate.to_le_bytes());
        b.extend_from_slice(&(rate * channels as u32 * 2).to_le_bytes());
        b.extend_from_slice(&(channels * 2).to_le_bytes());
        b.extend_from_slice(&16u16.to_le_bytes());
        b.extend_from_slice(b"data");
        b.extend_from_slice(&(data_len as u32).to_le_bytes());
        for s in samples {
            b.extend_from_slice(&s.to_le_bytes());
        }
        b
    }

    #[test]
    fn parses_minimal_pcm_wav() {
        let bytes = wav_bytes(8000, 1, &[1, 2, 3, 4]);
        let wav = WavSource::parse(&bytes).unwrap();
        assert_eq!(wav.src_rate, 8000);
        assert_eq!(wav.src_channels, 1);
        assert_eq!(wav.samples, vec![1, 2, 3, 4]);
        assert_eq!(wav.duration(), Duration::from_micros(500));
    }

    #[test]
    fn rejects_non_wav_and_non_pcm() {
        assert!(WavSource::parse(b"OggS....").is_err());

        let mut bytes = wav_bytes(8000, 1, &[0; 4]);
        bytes[20] = 3; // format tag: IEEE float
        assert!(WavSource::parse(&bytes).is_err());

        let mut bytes = wav_bytes(8000, 1, &[0; 4]);
        bytes[34] = 8; // bits per sample
        assert!(WavSource::parse(&bytes).is_err());
    }

    #[test]
    fn upsamples_and_exhausts() {
        let mut wav = WavSource::from_samples(vec![100i16; 100], 8000, 1);
        let fmt = AudioFormat::new(16000, 1, 80);
        let mut out = vec![0i16; 80];
        let mut total = 0;
        loop {
            let n = wav.next_frames(&mut out, fmt);
            total += n;
            if n < 80 {
                break;
            }
        }
        // 100 source frames at half the output rate: 200 output frames.
        assert_eq!(total, 200);
        assert_eq!(out[0], 100);
    }

    #[test]
    fn downmixes_stereo_to_mono() {
        let mut wav = WavSource::from_samples(vec![100, 300, 100, 300], 8000, 2);
        let fmt = AudioFormat::new(8000, 1, 2);
        let mut out = vec![0i16; 2];
        assert_eq!(wav.next_frames(&mut out, fmt), 2);
        assert_eq!(out, vec![200, 200]);
    }

    #[test]
    fn tone_source_is_finite() {
        let mut tone = ToneSource::new(&[100.0], 1000.0, Duration::from_millis(100));
        let fmt = AudioFormat::new(8000, 1, 400);
        let mut out = vec![0i16; 400];
        assert_eq!(tone.next_frames(&mut out, fmt), 400);
        assert_eq!(tone.next_frames(&mut out, fmt), 400);
        assert_eq!(tone.next_frames(&mut out, fmt), 0);
        assert!(out.iter().any(|&s| s != 0));
    }

    #[test]
    fn ringback_follows_on_off_cadence() {
        let mut tone = RingbackTone::new();
        let fmt = AudioFormat::new(8000, 1, 800);
        let mut out = vec![0i16; 800];

        // Two seconds of tone.
        let mut heard = false;
        for _ in 0..20 {
            assert_eq!(tone.next_frames(&mut out, fmt), 800);
            heard |= out.iter().any(|&s| s != 0);
        }
        assert!(heard);

        // Four seconds of silence.
        for _ in 0..40 {
            tone.next_frames(&mut out, fmt);
            assert!(out.iter().all(|&s| s == 0));
        }

        // Cadence wraps back to tone.
        tone.next_frames(&mut out, fmt);
        assert!(out.iter().any(|&s| s != 0));
    }
}
