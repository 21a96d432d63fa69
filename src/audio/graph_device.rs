//! The engine-graph device: the passthrough contract plus an internal mix
//! graph, so app audio can play into the render path alongside call audio.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use super::device::{
    AudioDevice, AudioStats, CaptureContext, DeviceError, InputProcessingCallback, RenderContext,
    RenderProcessingCallback,
};
use super::driver::{self, lock, HostDriver, MixStage};
use super::format::AudioFormat;
use super::source::{SampleSource, ToneSource, WavSource};

/// Audio device with a mix graph on the render path.
///
/// Call audio from the engine enters first; whatever source was queued with
/// [`GraphAudioDevice::play_music`] is mixed on top, then the render tap runs.
/// Clones are handles onto one shared device.
#[derive(Clone)]
pub struct GraphAudioDevice {
    driver: Arc<HostDriver>,
    music: Arc<Mutex<Option<Box<dyn SampleSource>>>>,
    music_path: PathBuf,
}

impl GraphAudioDevice {
    pub fn new(preferred: AudioFormat, music_path: impl Into<PathBuf>) -> Self {
        Self {
            driver: Arc::new(HostDriver::new("graph", preferred)),
            music: Arc::new(Mutex::new(None)),
            music_path: music_path.into(),
        }
    }

    /// Format of the most recent host negotiation, if any.
    pub fn active_format() -> Option<AudioFormat> {
        driver::active_format()
    }

    /// Install or clear the render tap. Takes effect when rendering next
    /// starts.
    pub fn set_render_processing_callback(&self, callback: Option<RenderProcessingCallback>) {
        self.driver.set_render_callback(callback);
    }

    /// Install or clear the capture tap. Takes effect when capturing next
    /// starts.
    pub fn set_input_processing_callback(&self, callback: Option<InputProcessingCallback>) {
        self.driver.set_input_callback(callback);
    }

    /// Queue the bundled music asset into the render mix.
    ///
    /// Fire and forget: nothing is reported back. A missing or malformed
    /// asset falls back to a built-in chord and is only logged. When the
    /// renderer is idle the source plays once rendering starts.
    pub fn play_music(&self) {
        let source: Box<dyn SampleSource> = match WavSource::load(&self.music_path) {
            Ok(wav) => {
                log::info!(
                    "Music: {} ({} ms)",
                    self.music_path.display(),
                    wav.duration().as_millis(),
                );
                Box::new(wav)
            }
            Err(e) => {
                log::warn!("Failed to load music ({:#}), playing built-in chord", e);
                Box::new(ToneSource::chord())
            }
        };
        *lock(&self.music) = Some(source);
        if !self.driver.is_rendering() {
            log::debug!("Music queued while renderer idle");
        }
    }

    pub fn stats(&self) -> AudioStats {
        self.driver.stats()
    }

    fn mix_stage(&self) -> MixStage {
        let music = self.music.clone();
        let mut current: Option<Box<dyn SampleSource>> = None;
        // Scratch sized to the negotiated period; the render thread must not
        // allocate.
        let format = driver::negotiate(self.driver.preferred_format()).format();
        let mut scratch = vec![0i16; format.samples_per_buffer()];
        Box::new(move |buf, fmt| {
            // Pick up a newly queued source without ever blocking the path.
            if let Ok(mut slot) = music.try_lock() {
                if slot.is_some() {
                    current = slot.take();
                }
            }
            let Some(src) = current.as_mut() else {
                return;
            };
            let frames = src.next_frames(&mut scratch[..buf.len()], fmt);
            let samples = frames * fmt.channels as usize;
            for (dst, &s) in buf[..samples].iter_mut().zip(scratch[..samples].iter()) {
                *dst = dst.saturating_add(s);
            }
            if samples < buf.len() {
                log::info!("Music finished");
                current = None;
            }
        })
    }
}

impl AudioDevice for GraphAudioDevice {
    fn render_format(&self) -> Option<AudioFormat> {
        Some(self.driver.preferred_format())
    }

    fn initialize_renderer(&self) -> Result<(), DeviceError> {
        self.driver.initialize_renderer()
    }

    fn start_rendering(&self, ctx: RenderContext) -> Result<(), DeviceError> {
        self.driver.start_rendering(ctx, Some(self.mix_stage()))
    }

    fn stop_rendering(&self) -> Result<(), DeviceError> {
        self.driver.stop_rendering()
    }

    fn capture_format(&self) -> Option<AudioFormat> {
        Some(self.driver.preferred_format())
    }

    fn initialize_capturer(&self) -> Result<(), DeviceError> {
        self.driver.initialize_capturer()
    }

    fn start_capturing(&self, ctx: CaptureContext) -> Result<(), DeviceError> {
        self.driver.start_capturing(ctx)
    }

    fn stop_capturing(&self) -> Result<(), DeviceError> {
        self.driver.stop_capturing()
    }

    fn is_enabled(&self) -> bool {
        self.driver.is_enabled()
    }

    fn set_enabled(&self, enabled: bool) {
        self.driver.set_enabled(enabled);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::format::AudioBufferList;
    use serial_test::serial;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

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

    fn peak_tap(device: &GraphAudioDevice) -> Arc<AtomicI64> {
        let peak = Arc::new(AtomicI64::new(0));
        let p = peak.clone();
        device.set_render_processing_callback(Some(Box::new(move |buf, _| {
            let max = buf.iter().map(|&s| s.unsigned_abs() as i64).max().unwrap_or(0);
            p.fetch_max(max, Ordering::Relaxed);
        })));
        peak
    }

    #[test]
    #[serial]
    fn play_music_falls_back_to_chord_when_asset_missing() {
        let device = GraphAudioDevice::new(AudioFormat::new(48000, 1, 128), "/nonexistent.wav");
        let peak = peak_tap(&device);

        device.initialize_renderer().unwrap();
        let (_tx, rx) = mpsc::channel(4);
        device.start_rendering(RenderContext::new(rx)).unwrap();
        device.play_music();

        std::thread::sleep(Duration::from_millis(80));
        device.stop_rendering().unwrap();

        // Nothing on the call path, so everything heard came from the mix.
        assert!(peak.load(Ordering::Relaxed) > 0);
        assert!(device.stats().periods_rendered > 0);
    }

    #[test]
    #[serial]
    fn play_music_decodes_wav_asset() {
        let path = std::env::temp_dir().join(format!("graph_music_{}.wav", std::process::id()));
        std::fs::write(&path, wav_bytes(48000, 1, &vec![5000i16; 48000])).unwrap();

        let device = GraphAudioDevice::new(AudioFormat::new(48000, 1, 128), &path);
        let peak = peak_tap(&device);

        device.initialize_renderer().unwrap();
        let (_tx, rx) = mpsc::channel(4);
        device.start_rendering(RenderContext::new(rx)).unwrap();
        device.play_music();

        std::thread::sleep(Duration::from_millis(80));
        device.stop_rendering().unwrap();
        let _ = std::fs::remove_file(&path);

        assert_eq!(peak.load(Ordering::Relaxed), 5000);
    }

    #[test]
    #[serial]
    fn music_queued_while_idle_plays_on_start() {
        let device = GraphAudioDevice::new(AudioFormat::new(48000, 1, 128), "/nonexistent.wav");
        let peak = peak_tap(&device);

        device.play_music();
        device.initialize_renderer().unwrap();
        let (_tx, rx) = mpsc::channel(4);
        device.start_rendering(RenderContext::new(rx)).unwrap();
        assert_eq!(
            GraphAudioDevice::active_format(),
            Some(AudioFormat::new(48000, 1, 128))
        );

        std::thread::sleep(Duration::from_millis(80));
        device.stop_rendering().unwrap();

        assert!(peak.load(Ordering::Relaxed) > 0);
    }

    #[test]
    #[serial]
    fn capture_path_matches_the_passthrough_device() {
        let device = GraphAudioDevice::new(AudioFormat::new(16000, 1, 320), "/nonexistent.wav");
        let (meta_tx, meta_rx) = std::sync::mpsc::channel();
        device.set_input_processing_callback(Some(Box::new(move |list: &AudioBufferList| {
            let _ = meta_tx.send(list.frame_count());
        })));

        device.initialize_capturer().unwrap();
        let (tx, _rx) = mpsc::channel(8);
        device.start_capturing(CaptureContext::new(tx)).unwrap();

        let frames = meta_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        device.stop_capturing().unwrap();

        assert_eq!(frames, 320);
        assert!(device.stats().periods_captured > 0);
    }
}
