//! The audio device capability contract consumed by the voice engine.
//!
//! A device that implements [`AudioDevice`] can be installed on the engine in
//! place of the stock audio path. The engine drives the contract from its
//! control plane; the device runs rendering and capturing on threads it owns
//! and must honor the real-time rules documented on the contexts below.

use thiserror::Error;
use tokio::sync::mpsc;

use super::format::{AudioBufferList, AudioFormat};

/// Errors surfaced by device control operations.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("renderer is already started")]
    RendererAlreadyStarted,
    #[error("capturer is already started")]
    CapturerAlreadyStarted,
    #[error("renderer is not initialized")]
    RendererNotInitialized,
    #[error("capturer is not initialized")]
    CapturerNotInitialized,
    #[error("failed to spawn audio thread: {0}")]
    ThreadSpawn(#[from] std::io::Error),
}

/// Counters for a running device, sampled without stopping anything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AudioStats {
    pub periods_rendered: u64,
    pub periods_captured: u64,
    pub periods_dropped: u64,
    pub clock_resets: u64,
}

/// Tap invoked on the render thread after each output buffer is produced.
///
/// Runs at the negotiated buffer cadence with the buffer about to be played
/// and its format. Must not block: no allocation, locking, or I/O.
pub type RenderProcessingCallback = Box<dyn FnMut(&mut [i16], AudioFormat) + Send>;

/// Tap invoked on the capture thread with the buffer list for each captured
/// cycle. Same real-time rules as [`RenderProcessingCallback`].
pub type InputProcessingCallback = Box<dyn FnMut(&AudioBufferList) + Send>;

/// Engine-side source of far-end audio for the renderer.
///
/// Reads never block; a cycle with no queued audio is filled with silence.
pub struct RenderContext {
    rx: mpsc::Receiver<Vec<i16>>,
    pending: Vec<i16>,
    pending_pos: usize,
}

impl RenderContext {
    pub fn new(rx: mpsc::Receiver<Vec<i16>>) -> Self {
        Self {
            rx,
            pending: Vec::new(),
            pending_pos: 0,
        }
    }

    /// Fill `out` with queued samples, zero-filling any shortfall.
    ///
    /// Returns the number of samples that came from the stream. Packets from
    /// the engine keep their own allocation; nothing is allocated here.
    pub fn read_render_data(&mut self, out: &mut [i16]) -> usize {
        let mut copied = 0;
        while copied < out.len() {
            if self.pending_pos >= self.pending.len() {
                match self.rx.try_recv() {
                    Ok(packet) => {
                        self.pending = packet;
                        self.pending_pos = 0;
                    }
                    Err(_) => break,
                }
            }
            let avail = self.pending.len() - self.pending_pos;
            let n = avail.min(out.len() - copied);
            out[copied..copied + n]
                .copy_from_slice(&self.pending[self.pending_pos..self.pending_pos + n]);
            self.pending_pos += n;
            copied += n;
        }
        out[copied..].fill(0);
        copied
    }
}

/// Engine-side sink for captured microphone audio.
pub struct CaptureContext {
    tx: mpsc::Sender<Vec<i16>>,
}

impl CaptureContext {
    pub fn new(tx: mpsc::Sender<Vec<i16>>) -> Self {
        Self { tx }
    }

    /// Forward one cycle of captured samples without blocking.
    ///
    /// Returns `false` when the engine is not keeping up and the cycle was
    /// dropped.
    pub fn write_capture_data(&self, samples: &[i16]) -> bool {
        self.tx.try_send(samples.to_vec()).is_ok()
    }
}

/// Capability contract for a pluggable audio device.
///
/// `initialize_*` runs the device's format negotiation; `start_*` begins the
/// paced delivery of buffers through the supplied context; `stop_*` halts it
/// and is a no-op when the path is already stopped. The enabled flag gates
/// audio flow only, never thread lifecycle, and is safe to flip from any
/// thread.
pub trait AudioDevice: Send + Sync {
    /// Preferred render format, before any negotiation.
    fn render_format(&self) -> Option<AudioFormat>;
    fn initialize_renderer(&self) -> Result<(), DeviceError>;
    fn start_rendering(&self, ctx: RenderContext) -> Result<(), DeviceError>;
    fn stop_rendering(&self) -> Result<(), DeviceError>;

    /// Preferred capture format, before any negotiation.
    fn capture_format(&self) -> Option<AudioFormat>;
    fn initialize_capturer(&self) -> Result<(), DeviceError>;
    fn start_capturing(&self, ctx: CaptureContext) -> Result<(), DeviceError>;
    fn stop_capturing(&self) -> Result<(), DeviceError>;

    fn is_enabled(&self) -> bool;
    fn set_enabled(&self, enabled: bool);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_context_zero_fills_when_starved() {
        let (_tx, rx) = mpsc::channel(4);
        let mut ctx = RenderContext::new(rx);
        let mut out = vec![7i16; 8];
        assert_eq!(ctx.read_render_data(&mut out), 0);
        assert!(out.iter().all(|&s| s == 0));
    }

    #[test]
    fn render_context_spans_packet_boundaries() {
        let (tx, rx) = mpsc::channel(4);
        tx.try_send(vec![1i16; 6]).unwrap();
        tx.try_send(vec![2i16; 6]).unwrap();
        let mut ctx = RenderContext::new(rx);

        let mut out = vec![0i16; 8];
        assert_eq!(ctx.read_render_data(&mut out), 8);
        assert_eq!(&out[..6], &[1i16; 6]);
        assert_eq!(&out[6..], &[2i16; 2]);

        // Remainder of the second packet, then silence.
        let mut out = vec![9i16; 8];
        assert_eq!(ctx.read_render_data(&mut out), 4);
        assert_eq!(&out[..4], &[2i16; 4]);
        assert_eq!(&out[4..], &[0i16; 4]);
    }

    #[test]
    fn capture_context_reports_backpressure() {
        let (tx, mut rx) = mpsc::channel(1);
        let ctx = CaptureContext::new(tx);
        assert!(ctx.write_capture_data(&[1, 2, 3]));
        assert!(!ctx.write_capture_data(&[4, 5, 6]));
        assert_eq!(rx.try_recv().unwrap(), vec![1, 2, 3]);
        assert!(ctx.write_capture_data(&[4, 5, 6]));
    }
}
