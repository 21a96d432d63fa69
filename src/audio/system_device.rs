//! The passthrough device: the stock renderer and capturer pair with the two
//! processing callback taps. "Just the basics" next to the graph device.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::device::{
    AudioDevice, AudioStats, CaptureContext, DeviceError, InputProcessingCallback, RenderContext,
    RenderProcessingCallback,
};
use super::driver::{self, HostDriver};
use super::format::AudioFormat;

/// Where the render path is routed. The host has no physical routes; the
/// value is stored and logged so call UIs can mirror a speaker toggle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputRoute {
    Earpiece,
    Speaker,
}

/// Passthrough audio device.
///
/// Clones are handles onto one shared device, so an app can keep one for the
/// callback taps while the engine holds another for the capability contract.
#[derive(Clone)]
pub struct SystemAudioDevice {
    driver: Arc<HostDriver>,
    speaker: Arc<AtomicBool>,
}

impl SystemAudioDevice {
    pub const DEFAULT_FORMAT: AudioFormat = AudioFormat {
        sample_rate: 48000,
        channels: 1,
        frames_per_buffer: 960,
    };

    pub fn new(preferred: AudioFormat) -> Self {
        Self {
            driver: Arc::new(HostDriver::new("system", preferred)),
            speaker: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Format of the most recent host negotiation, if any. `None` only
    /// before the first device start in this process.
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

    pub fn set_output_route(&self, route: OutputRoute) {
        self.speaker
            .store(route == OutputRoute::Speaker, Ordering::SeqCst);
        log::info!("Audio route: {:?}", route);
    }

    pub fn output_route(&self) -> OutputRoute {
        if self.speaker.load(Ordering::SeqCst) {
            OutputRoute::Speaker
        } else {
            OutputRoute::Earpiece
        }
    }

    pub fn stats(&self) -> AudioStats {
        self.driver.stats()
    }
}

impl Default for SystemAudioDevice {
    fn default() -> Self {
        Self::new(Self::DEFAULT_FORMAT)
    }
}

impl AudioDevice for SystemAudioDevice {
    fn render_format(&self) -> Option<AudioFormat> {
        Some(self.driver.preferred_format())
    }

    fn initialize_renderer(&self) -> Result<(), DeviceError> {
        self.driver.initialize_renderer()
    }

    fn start_rendering(&self, ctx: RenderContext) -> Result<(), DeviceError> {
        self.driver.start_rendering(ctx, None)
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
