//! Core PCM value types shared by the device bridge and the voice engine.

use std::fmt;
use std::time::Duration;

/// Stream format for 16-bit signed interleaved PCM.
///
/// The host audio stack owns the format of a running session; callers query
/// the current one through [`crate::audio::active_format`] instead of caching
/// their own copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Interleaved channel count
    pub channels: u32,
    /// Frames delivered per processing cycle
    pub frames_per_buffer: usize,
}

impl AudioFormat {
    /// Sample width is fixed, the bridge trades in i16 PCM only.
    pub const BITS_PER_SAMPLE: u16 = 16;

    pub fn new(sample_rate: u32, channels: u32, frames_per_buffer: usize) -> Self {
        Self {
            sample_rate,
            channels,
            frames_per_buffer,
        }
    }

    /// Interleaved sample count for one buffer.
    pub fn samples_per_buffer(&self) -> usize {
        self.frames_per_buffer * self.channels as usize
    }

    pub fn bytes_per_buffer(&self) -> usize {
        self.samples_per_buffer() * (Self::BITS_PER_SAMPLE as usize / 8)
    }

    /// Wall-clock duration of one buffer at this rate.
    pub fn buffer_duration(&self) -> Duration {
        Duration::from_micros(self.frames_per_buffer as u64 * 1_000_000 / self.sample_rate as u64)
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} Hz, {} ch, {} frames/buffer",
            self.sample_rate, self.channels, self.frames_per_buffer
        )
    }
}

/// One plane of PCM samples, interleaved.
#[derive(Debug, Clone)]
pub struct AudioBuffer {
    pub channels: u32,
    pub data: Vec<i16>,
}

impl AudioBuffer {
    pub fn new(channels: u32, data: Vec<i16>) -> Self {
        Self { channels, data }
    }

    pub fn frame_count(&self) -> usize {
        if self.channels == 0 {
            return 0;
        }
        self.data.len() / self.channels as usize
    }
}

/// The set of buffers delivered in one capture cycle.
///
/// Mirrors the lower-level host capture API, which may hand several planes
/// per cycle; an interleaved capturer delivers exactly one. The capturer
/// reuses the allocation across cycles, so the input processing callback only
/// borrows it.
#[derive(Debug, Clone, Default)]
pub struct AudioBufferList {
    pub buffers: Vec<AudioBuffer>,
}

impl AudioBufferList {
    pub fn frame_count(&self) -> usize {
        self.buffers.first().map(AudioBuffer::frame_count).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.frame_count() == 0
    }
}
