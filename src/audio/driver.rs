//! Host-thread audio driver shared by the device implementations.
//!
//! Stands in for the platform audio server: each active path (render,
//! capture) runs on a dedicated OS thread paced at the negotiated buffer
//! cadence. Uses std::thread (NOT tokio tasks) so the audio clock never
//! contends with async network tasks.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use super::device::{
    AudioStats, CaptureContext, DeviceError, InputProcessingCallback, RenderContext,
    RenderProcessingCallback,
};
use super::format::{AudioBuffer, AudioBufferList, AudioFormat};

/// Sample rates the host clock can run at.
pub const SUPPORTED_SAMPLE_RATES: [u32; 5] = [8000, 16000, 24000, 44100, 48000];

const MIN_PERIOD_FRAMES: usize = 64;
const MAX_PERIOD_FRAMES: usize = 4096;

/// Behind-schedule threshold, in periods, past which the clock resets.
const OVERRUN_RESET_PERIODS: u32 = 8;
/// Consecutive clock resets after which a path gives up.
const MAX_CONSECUTIVE_RESETS: u32 = 5;

/// Lock that shrugs off poisoning; the guarded values stay usable after a
/// panicking holder.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ======================== Active format ========================

static ACTIVE_FORMAT: Mutex<Option<AudioFormat>> = Mutex::new(None);

/// Format of the most recent host negotiation, if any.
///
/// `None` only before the first device start in this process. The last
/// negotiated format is retained across stops, so the accessor stays
/// consistent for the lifetime of a host session.
pub fn active_format() -> Option<AudioFormat> {
    *lock(&ACTIVE_FORMAT)
}

pub(crate) fn publish_active_format(format: AudioFormat) {
    *lock(&ACTIVE_FORMAT) = Some(format);
}

#[cfg(test)]
pub(crate) fn clear_active_format() {
    *lock(&ACTIVE_FORMAT) = None;
}

// ======================== Negotiation ========================

/// Parameters negotiated with the host clock.
#[derive(Debug, Clone, Copy)]
pub(crate) struct HostParams {
    pub sample_rate: u32,
    pub channels: u32,
    pub period_size: usize,
}

impl HostParams {
    pub fn format(&self) -> AudioFormat {
        AudioFormat::new(self.sample_rate, self.channels, self.period_size)
    }
}

/// Negotiate the nearest host-supported parameters for a requested format.
pub(crate) fn negotiate(requested: AudioFormat) -> HostParams {
    let sample_rate = SUPPORTED_SAMPLE_RATES
        .iter()
        .copied()
        .min_by_key(|r| r.abs_diff(requested.sample_rate))
        .unwrap_or(48000);
    let channels = requested.channels.clamp(1, 2);
    let period_size = requested
        .frames_per_buffer
        .clamp(MIN_PERIOD_FRAMES, MAX_PERIOD_FRAMES);
    HostParams {
        sample_rate,
        channels,
        period_size,
    }
}

// ======================== Shared state ========================

/// State shared between the control plane and the audio threads. Everything
/// here is atomic; the threads never take a lock on the steady-state path.
pub(crate) struct DriverShared {
    enabled: AtomicBool,
    render_active: AtomicBool,
    capture_active: AtomicBool,
    periods_rendered: AtomicU64,
    periods_captured: AtomicU64,
    periods_dropped: AtomicU64,
    clock_resets: AtomicU64,
}

impl DriverShared {
    fn new() -> Self {
        Self {
            // Devices come up enabled, like the stock device they replace.
            enabled: AtomicBool::new(true),
            render_active: AtomicBool::new(false),
            capture_active: AtomicBool::new(false),
            periods_rendered: AtomicU64::new(0),
            periods_captured: AtomicU64::new(0),
            periods_dropped: AtomicU64::new(0),
            clock_resets: AtomicU64::new(0),
        }
    }
}

/// Device-internal stage run between the render context read and the render
/// processing callback. The graph device mixes its sources here.
pub(crate) type MixStage = Box<dyn FnMut(&mut [i16], AudioFormat) + Send>;

type RenderSlot = Arc<Mutex<Option<RenderProcessingCallback>>>;
type InputSlot = Arc<Mutex<Option<InputProcessingCallback>>>;

// ======================== Driver ========================

/// The paced render/capture host both device implementations embed.
///
/// Callback slots are read once when a path starts and handed back when the
/// thread exits, so assigning a callback while a path runs takes effect at
/// its next start.
pub(crate) struct HostDriver {
    label: &'static str,
    preferred: AudioFormat,
    shared: Arc<DriverShared>,
    render_slot: RenderSlot,
    input_slot: InputSlot,
    state: Mutex<DriverState>,
}

#[derive(Default)]
struct DriverState {
    render_params: Option<HostParams>,
    capture_params: Option<HostParams>,
    render_handle: Option<JoinHandle<()>>,
    capture_handle: Option<JoinHandle<()>>,
}

impl HostDriver {
    pub fn new(label: &'static str, preferred: AudioFormat) -> Self {
        Self {
            label,
            preferred,
            shared: Arc::new(DriverShared::new()),
            render_slot: Arc::new(Mutex::new(None)),
            input_slot: Arc::new(Mutex::new(None)),
            state: Mutex::new(DriverState::default()),
        }
    }

    pub fn preferred_format(&self) -> AudioFormat {
        self.preferred
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.enabled.load(Ordering::SeqCst)
    }

    /// Last write wins; flow on both paths follows the flag from their next
    /// period on.
    pub fn set_enabled(&self, enabled: bool) {
        self.shared.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_rendering(&self) -> bool {
        self.shared.render_active.load(Ordering::SeqCst)
    }

    pub fn set_render_callback(&self, callback: Option<RenderProcessingCallback>) {
        *lock(&self.render_slot) = callback;
    }

    pub fn set_input_callback(&self, callback: Option<InputProcessingCallback>) {
        *lock(&self.input_slot) = callback;
    }

    pub fn stats(&self) -> AudioStats {
        AudioStats {
            periods_rendered: self.shared.periods_rendered.load(Ordering::Relaxed),
            periods_captured: self.shared.periods_captured.load(Ordering::Relaxed),
            periods_dropped: self.shared.periods_dropped.load(Ordering::Relaxed),
            clock_resets: self.shared.clock_resets.load(Ordering::Relaxed),
        }
    }

    pub fn initialize_renderer(&self) -> Result<(), DeviceError> {
        let params = negotiate(self.preferred);
        log::info!(
            "Host renderer ({}): rate={}, channels={}, period_size={}",
            self.label,
            params.sample_rate,
            params.channels,
            params.period_size,
        );
        lock(&self.state).render_params = Some(params);
        Ok(())
    }

    pub fn initialize_capturer(&self) -> Result<(), DeviceError> {
        let params = negotiate(self.preferred);
        log::info!(
            "Host capturer ({}): rate={}, channels={}, period_size={}",
            self.label,
            params.sample_rate,
            params.channels,
            params.period_size,
        );
        lock(&self.state).capture_params = Some(params);
        Ok(())
    }

    pub fn start_rendering(
        &self,
        ctx: RenderContext,
        mix: Option<MixStage>,
    ) -> Result<(), DeviceError> {
        let mut state = lock(&self.state);
        if let Some(handle) = state.render_handle.take() {
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                state.render_handle = Some(handle);
                return Err(DeviceError::RendererAlreadyStarted);
            }
        }
        let params = state.render_params.ok_or(DeviceError::RendererNotInitialized)?;

        let mut callback = lock(&self.render_slot).take();
        let shared = self.shared.clone();
        let slot = self.render_slot.clone();
        shared.render_active.store(true, Ordering::SeqCst);

        let spawned = thread::Builder::new().name("audio-render".into()).spawn(move || {
            let mut mix = mix;
            render_loop(params, &shared, ctx, &mut callback, &mut mix);
            if let Some(cb) = callback.take() {
                let mut slot = lock(&slot);
                // A callback assigned while we ran wins over the one we used.
                if slot.is_none() {
                    *slot = Some(cb);
                }
            }
        });
        match spawned {
            Ok(handle) => {
                publish_active_format(params.format());
                state.render_handle = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.shared.render_active.store(false, Ordering::SeqCst);
                Err(DeviceError::ThreadSpawn(e))
            }
        }
    }

    /// Signal the render thread to stop and wait for it. No-op when the
    /// renderer is not running.
    pub fn stop_rendering(&self) -> Result<(), DeviceError> {
        self.shared.render_active.store(false, Ordering::SeqCst);
        let handle = lock(&self.state).render_handle.take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        Ok(())
    }

    pub fn start_capturing(&self, ctx: CaptureContext) -> Result<(), DeviceError> {
        let mut state = lock(&self.state);
        if let Some(handle) = state.capture_handle.take() {
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                state.capture_handle = Some(handle);
                return Err(DeviceError::CapturerAlreadyStarted);
            }
        }
        let params = state.capture_params.ok_or(DeviceError::CapturerNotInitialized)?;

        let mut callback = lock(&self.input_slot).take();
        let shared = self.shared.clone();
        let slot = self.input_slot.clone();
        shared.capture_active.store(true, Ordering::SeqCst);

        let spawned = thread::Builder::new().name("audio-capture".into()).spawn(move || {
            capture_loop(params, &shared, ctx, &mut callback);
            if let Some(cb) = callback.take() {
                let mut slot = lock(&slot);
                if slot.is_none() {
                    *slot = Some(cb);
                }
            }
        });
        match spawned {
            Ok(handle) => {
                publish_active_format(params.format());
                state.capture_handle = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.shared.capture_active.store(false, Ordering::SeqCst);
                Err(DeviceError::ThreadSpawn(e))
            }
        }
    }

    /// Signal the capture thread to stop and wait for it. No-op when the
    /// capturer is not running.
    pub fn stop_capturing(&self) -> Result<(), DeviceError> {
        self.shared.capture_active.store(false, Ordering::SeqCst);
        let handle = lock(&self.state).capture_handle.take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        Ok(())
    }
}

impl Drop for HostDriver {
    fn drop(&mut self) {
        let _ = self.stop_rendering();
        let _ = self.stop_capturing();
    }
}

// ======================== Render thread ========================

fn render_loop(
    params: HostParams,
    shared: &DriverShared,
    mut ctx: RenderContext,
    callback: &mut Option<RenderProcessingCallback>,
    mix: &mut Option<MixStage>,
) {
    let format = params.format();
    let period = format.buffer_duration();
    let mut buf = vec![0i16; format.samples_per_buffer()];
    let mut resets_in_a_row = 0u32;
    let mut deadline = Instant::now() + period;

    log::info!("Rendering started: {}", format);

    while shared.render_active.load(Ordering::Relaxed) {
        if shared.enabled.load(Ordering::Relaxed) {
            ctx.read_render_data(&mut buf);
            if let Some(stage) = mix.as_mut() {
                stage(&mut buf, format);
            }
            if let Some(cb) = callback.as_mut() {
                cb(&mut buf, format);
            }
            shared.periods_rendered.fetch_add(1, Ordering::Relaxed);
        } else {
            // Disabled: the clock keeps running but the period is silent and
            // neither the context nor the callbacks are touched.
            buf.fill(0);
        }

        // The finished period would be handed to the platform mixer here;
        // this host ends the path at the taps.

        let now = Instant::now();
        if now < deadline {
            thread::sleep(deadline - now);
            resets_in_a_row = 0;
        } else if now > deadline + period * OVERRUN_RESET_PERIODS {
            // Badly behind schedule; reset the clock rather than render a
            // burst of catch-up periods.
            log::warn!("Render clock fell behind, resetting");
            shared.clock_resets.fetch_add(1, Ordering::Relaxed);
            resets_in_a_row += 1;
            if resets_in_a_row > MAX_CONSECUTIVE_RESETS {
                log::error!("Render clock cannot keep up, stopping renderer");
                break;
            }
            deadline = now;
        }
        deadline += period;
    }

    shared.render_active.store(false, Ordering::SeqCst);
    log::info!("Rendering stopped");
}

// ======================== Capture thread ========================

fn capture_loop(
    params: HostParams,
    shared: &DriverShared,
    ctx: CaptureContext,
    callback: &mut Option<InputProcessingCallback>,
) {
    let format = params.format();
    let period = format.buffer_duration();
    let mut mic = MicTone::new(format.sample_rate);
    // One interleaved plane, reused across cycles.
    let mut list = AudioBufferList {
        buffers: vec![AudioBuffer::new(
            format.channels,
            vec![0i16; format.samples_per_buffer()],
        )],
    };
    let mut resets_in_a_row = 0u32;
    let mut deadline = Instant::now() + period;

    log::info!("Capturing started: {}", format);

    while shared.capture_active.load(Ordering::Relaxed) {
        if shared.enabled.load(Ordering::Relaxed) {
            mic.fill(&mut list.buffers[0].data, format.channels);
            if let Some(cb) = callback.as_mut() {
                cb(&list);
            }
            if ctx.write_capture_data(&list.buffers[0].data) {
                shared.periods_captured.fetch_add(1, Ordering::Relaxed);
            } else {
                shared.periods_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }

        let now = Instant::now();
        if now < deadline {
            thread::sleep(deadline - now);
            resets_in_a_row = 0;
        } else if now > deadline + period * OVERRUN_RESET_PERIODS {
            log::warn!("Capture clock fell behind, resetting");
            shared.clock_resets.fetch_add(1, Ordering::Relaxed);
            resets_in_a_row += 1;
            if resets_in_a_row > MAX_CONSECUTIVE_RESETS {
                log::error!("Capture clock cannot keep up, stopping capturer");
                break;
            }
            deadline = now;
        }
        deadline += period;
    }

    shared.capture_active.store(false, Ordering::SeqCst);
    log::info!("Capturing stopped");
}

/// Simulated microphone: a quiet 440 Hz tone, so loopback paths carry a
/// verifiable nonzero signal instead of silence.
struct MicTone {
    phase: f32,
    step: f32,
}

impl MicTone {
    const AMPLITUDE: f32 = 1600.0;

    fn new(sample_rate: u32) -> Self {
        Self {
            phase: 0.0,
            step: 440.0 * std::f32::consts::TAU / sample_rate as f32,
        }
    }

    fn fill(&mut self, out: &mut [i16], channels: u32) {
        let ch = channels.max(1) as usize;
        for frame in out.chunks_mut(ch) {
            let s = (self.phase.sin() * Self::AMPLITUDE) as i16;
            frame.fill(s);
            self.phase += self.step;
            if self.phase > std::f32::consts::TAU {
                self.phase -= std::f32::consts::TAU;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[test]
    fn negotiate_snaps_to_supported_rate() {
        let p = negotiate(AudioFormat::new(44000, 1, 960));
        assert_eq!(p.sample_rate, 44100);
        let p = negotiate(AudioFormat::new(50000, 1, 960));
        assert_eq!(p.sample_rate, 48000);
        let p = negotiate(AudioFormat::new(16000, 1, 320));
        assert_eq!(p.sample_rate, 16000);
    }

    #[test]
    fn negotiate_clamps_channels_and_period() {
        let p = negotiate(AudioFormat::new(48000, 6, 16));
        assert_eq!(p.channels, 2);
        assert_eq!(p.period_size, MIN_PERIOD_FRAMES);
        let p = negotiate(AudioFormat::new(48000, 0, 1 << 20));
        assert_eq!(p.channels, 1);
        assert_eq!(p.period_size, MAX_PERIOD_FRAMES);
    }

    #[test]
    #[serial]
    fn start_requires_initialize() {
        clear_active_format();
        let driver = HostDriver::new("test", AudioFormat::new(48000, 1, 128));
        let (_tx, rx) = mpsc::channel(4);
        let err = driver.start_rendering(RenderContext::new(rx), None).unwrap_err();
        assert!(matches!(err, DeviceError::RendererNotInitialized));
        assert!(active_format().is_none());
    }

    #[test]
    #[serial]
    fn render_path_runs_and_double_start_fails() {
        clear_active_format();
        let driver = HostDriver::new("test", AudioFormat::new(48000, 1, 128));
        driver.initialize_renderer().unwrap();

        let (_tx, rx) = mpsc::channel(4);
        driver.start_rendering(RenderContext::new(rx), None).unwrap();

        let (_tx2, rx2) = mpsc::channel(4);
        let err = driver.start_rendering(RenderContext::new(rx2), None).unwrap_err();
        assert!(matches!(err, DeviceError::RendererAlreadyStarted));

        std::thread::sleep(Duration::from_millis(50));
        driver.stop_rendering().unwrap();
        assert!(driver.stats().periods_rendered > 0);
        assert_eq!(active_format(), Some(AudioFormat::new(48000, 1, 128)));

        // Stopping again is a no-op.
        driver.stop_rendering().unwrap();
    }

    #[test]
    #[serial]
    fn capture_path_counts_drops_when_sink_is_full() {
        clear_active_format();
        let driver = HostDriver::new("test", AudioFormat::new(48000, 1, 128));
        driver.initialize_capturer().unwrap();

        // Capacity 1 and nobody draining: everything past the first cycle drops.
        let (tx, _rx) = mpsc::channel(1);
        driver.start_capturing(CaptureContext::new(tx)).unwrap();
        std::thread::sleep(Duration::from_millis(60));
        driver.stop_capturing().unwrap();

        let stats = driver.stats();
        assert_eq!(stats.periods_captured, 1);
        assert!(stats.periods_dropped > 0);
    }

    #[test]
    fn mic_tone_is_periodic_and_quiet() {
        let mut mic = MicTone::new(48000);
        let mut buf = vec![0i16; 480];
        mic.fill(&mut buf, 1);
        assert!(buf.iter().any(|&s| s != 0));
        assert!(buf.iter().all(|&s| s.unsigned_abs() <= 1601));
    }
}
