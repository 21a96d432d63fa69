//! The voice engine façade: owns the installed audio device and drives one
//! session task per call.
//!
//! Signaling and media transport stay behind the scenes on this host; a
//! session brings the audio path up, walks the call through its states, and
//! loops captured audio back as the far end.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::audio::{
    active_format, AudioDevice, AudioFormat, CaptureContext, DeviceError, RenderContext,
    RingbackTone, SampleSource,
};
use crate::call::{
    AcceptOptions, Call, CallControl, CallDelegate, CallError, CallInvite, CallState,
    ConnectOptions,
};

const FALLBACK_FORMAT: AudioFormat = AudioFormat {
    sample_rate: 48000,
    channels: 1,
    frames_per_buffer: 960,
};

/// Capture silence gap after which a connected call reports reconnecting.
const STALL_TIMEOUT: Duration = Duration::from_millis(500);

/// Engine entry point. One per process; cheap handles are not needed since
/// the engine itself is shared behind an `Arc` by its callers.
pub struct VoiceEngine {
    device: Mutex<Option<Arc<dyn AudioDevice>>>,
    sessions: Arc<AtomicUsize>,
    ringback: AtomicBool,
    answer_delay_ms: AtomicU64,
}

impl VoiceEngine {
    pub fn new() -> Self {
        Self {
            device: Mutex::new(None),
            sessions: Arc::new(AtomicUsize::new(0)),
            ringback: AtomicBool::new(true),
            answer_delay_ms: AtomicU64::new(2000),
        }
    }

    /// Install the audio device every call session will drive. Must happen
    /// before the first connect or accept.
    pub fn set_audio_device(&self, device: Arc<dyn AudioDevice>) {
        *self.lock_device() = Some(device);
    }

    pub fn audio_device(&self) -> Option<Arc<dyn AudioDevice>> {
        self.lock_device().clone()
    }

    /// Whether outgoing calls play ringback tone while ringing.
    pub fn set_ringback(&self, on: bool) {
        self.ringback.store(on, Ordering::SeqCst);
    }

    /// How long the simulated far end rings before answering.
    pub fn set_answer_delay(&self, delay: Duration) {
        self.answer_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Place an outgoing call. Must be invoked on a tokio runtime; the
    /// session runs as its own task and reports through `delegate`.
    pub fn connect(
        &self,
        options: ConnectOptions,
        delegate: Arc<dyn CallDelegate>,
    ) -> Result<Call, CallError> {
        if options.access_token.is_empty() {
            return Err(CallError::EmptyAccessToken);
        }
        let device = self.lock_device().clone().ok_or(CallError::NoAudioDevice)?;

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let sid = format!("CA{}", Uuid::new_v4().simple());
        // The far-end identity of an outgoing call is only known once
        // signaling answers; it stays empty on this host.
        let call = Call::new(
            options.uuid,
            sid,
            String::new(),
            options.to().to_string(),
            control_tx,
        );

        self.spawn_session(Session {
            device,
            call: call.clone(),
            delegate,
            control_rx,
            direction: Direction::Outgoing,
            ringback: self.ringback.load(Ordering::SeqCst),
            answer_delay: Duration::from_millis(self.answer_delay_ms.load(Ordering::SeqCst)),
            sessions: self.sessions.clone(),
            started_render: false,
            started_capture: false,
        });
        Ok(call)
    }

    /// Accept an incoming invite. The call connects as soon as its audio
    /// path is up; accepted calls do not ring.
    pub fn accept(
        &self,
        invite: CallInvite,
        options: AcceptOptions,
        delegate: Arc<dyn CallDelegate>,
    ) -> Result<Call, CallError> {
        let device = self.lock_device().clone().ok_or(CallError::NoAudioDevice)?;

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let call = Call::new(
            options.uuid.unwrap_or(invite.uuid),
            invite.call_sid,
            invite.from,
            invite.to,
            control_tx,
        );

        self.spawn_session(Session {
            device,
            call: call.clone(),
            delegate,
            control_rx,
            direction: Direction::Incoming,
            ringback: false,
            answer_delay: Duration::ZERO,
            sessions: self.sessions.clone(),
            started_render: false,
            started_capture: false,
        });
        Ok(call)
    }

    fn spawn_session(&self, session: Session) {
        self.sessions.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(session.run());
    }

    fn lock_device(&self) -> std::sync::MutexGuard<'_, Option<Arc<dyn AudioDevice>>> {
        self.device.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for VoiceEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Outgoing,
    Incoming,
}

enum Outcome {
    FailedToConnect(String),
    Disconnected(Option<String>),
}

struct Session {
    device: Arc<dyn AudioDevice>,
    call: Call,
    delegate: Arc<dyn CallDelegate>,
    control_rx: mpsc::UnboundedReceiver<CallControl>,
    direction: Direction,
    ringback: bool,
    answer_delay: Duration,
    sessions: Arc<AtomicUsize>,
    started_render: bool,
    started_capture: bool,
}

impl Session {
    async fn run(mut self) {
        log::info!(
            "Call {} starting ({})",
            self.call.sid(),
            match self.direction {
                Direction::Outgoing => "outgoing",
                Direction::Incoming => "incoming",
            },
        );

        let outcome = self.drive().await;

        // Stop only the paths this session started; a session that lost the
        // device to an earlier call must not tear that call's audio down.
        if self.started_capture {
            let _ = self.device.stop_capturing();
        }
        if self.started_render {
            let _ = self.device.stop_rendering();
        }
        if self.sessions.fetch_sub(1, Ordering::SeqCst) == 1 {
            // Last session out releases the audio session.
            self.device.set_enabled(false);
            log::info!("Audio session released");
        }

        self.call.set_state(CallState::Disconnected);
        match outcome {
            Outcome::FailedToConnect(e) => {
                log::error!("Call {} failed to connect: {}", self.call.sid(), e);
                self.delegate.did_fail_to_connect(&self.call, &e);
            }
            Outcome::Disconnected(cause) => {
                match &cause {
                    Some(c) => log::warn!("Call {} disconnected: {}", self.call.sid(), c),
                    None => log::info!("Call {} disconnected", self.call.sid()),
                }
                self.delegate.did_disconnect(&self.call, cause.as_deref());
            }
        }
    }

    async fn drive(&mut self) -> Outcome {
        let (render_tx, render_rx) = mpsc::channel::<Vec<i16>>(32);
        let (capture_tx, capture_rx) = mpsc::channel::<Vec<i16>>(32);

        if let Err(e) = self.bring_up(render_rx, capture_tx) {
            return Outcome::FailedToConnect(e.to_string());
        }
        let format = active_format().unwrap_or(FALLBACK_FORMAT);

        if self.direction == Direction::Outgoing {
            self.call.set_state(CallState::Ringing);
            self.delegate.did_start_ringing(&self.call);
            log::info!("Call {} ringing", self.call.sid());
            if let Some(early) = self.ring_phase(&render_tx, format).await {
                return early;
            }
        }

        self.call.set_state(CallState::Connected);
        self.delegate.did_connect(&self.call);
        log::info!("Call {} connected", self.call.sid());

        self.connected_phase(render_tx, capture_rx).await
    }

    /// Activate the session and start both paths on the installed device.
    fn bring_up(
        &mut self,
        render_rx: mpsc::Receiver<Vec<i16>>,
        capture_tx: mpsc::Sender<Vec<i16>>,
    ) -> Result<(), DeviceError> {
        log::debug!(
            "Bringing up audio: render {:?}, capture {:?}",
            self.device.render_format(),
            self.device.capture_format(),
        );
        self.device.set_enabled(true);
        self.device.initialize_renderer()?;
        self.device.initialize_capturer()?;
        self.device.start_rendering(RenderContext::new(render_rx))?;
        self.started_render = true;
        self.device.start_capturing(CaptureContext::new(capture_tx))?;
        self.started_capture = true;
        Ok(())
    }

    /// Ring until the simulated far end answers. `Some` means the session
    /// ended early (local hangup).
    async fn ring_phase(
        &mut self,
        render_tx: &mpsc::Sender<Vec<i16>>,
        format: AudioFormat,
    ) -> Option<Outcome> {
        let mut tone = if self.ringback {
            Some(RingbackTone::new())
        } else {
            None
        };
        let mut tone_buf = vec![0i16; format.samples_per_buffer()];
        let mut ticker = tokio::time::interval(format.buffer_duration());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let answered = tokio::time::sleep(self.answer_delay);
        tokio::pin!(answered);

        loop {
            tokio::select! {
                _ = &mut answered => return None,
                _ = ticker.tick() => {
                    if let Some(tone) = tone.as_mut() {
                        tone.next_frames(&mut tone_buf, format);
                        let _ = render_tx.try_send(tone_buf.clone());
                    }
                }
                cmd = self.control_rx.recv() => match cmd {
                    Some(CallControl::Disconnect) | None => {
                        return Some(Outcome::Disconnected(None));
                    }
                    Some(CallControl::SendDigits(digits)) => {
                        log::info!(
                            "Call {}: DTMF '{}' queued before connect",
                            self.call.sid(),
                            digits,
                        );
                    }
                },
            }
        }
    }

    async fn connected_phase(
        &mut self,
        render_tx: mpsc::Sender<Vec<i16>>,
        mut capture_rx: mpsc::Receiver<Vec<i16>>,
    ) -> Outcome {
        let mut stalled = false;

        loop {
            tokio::select! {
                packet = capture_rx.recv() => match packet {
                    Some(samples) => {
                        if stalled {
                            stalled = false;
                            self.call.set_state(CallState::Connected);
                            self.delegate.did_reconnect(&self.call);
                            log::info!("Call {} media resumed", self.call.sid());
                        }
                        // Loopback far end: what the microphone hears comes
                        // back on the render path unless muted or held.
                        if !self.call.is_muted() && !self.call.is_on_hold() {
                            let _ = render_tx.try_send(samples);
                        }
                    }
                    None => {
                        return Outcome::Disconnected(Some("capture path closed".to_string()));
                    }
                },
                cmd = self.control_rx.recv() => match cmd {
                    Some(CallControl::Disconnect) | None => {
                        return Outcome::Disconnected(None);
                    }
                    Some(CallControl::SendDigits(digits)) => {
                        log::info!("Call {}: sending DTMF '{}'", self.call.sid(), digits);
                    }
                },
                _ = tokio::time::sleep(STALL_TIMEOUT), if !stalled => {
                    stalled = true;
                    self.call.set_state(CallState::Reconnecting);
                    self.delegate.is_reconnecting(&self.call, "audio path stalled");
                    log::warn!("Call {} media stalled, reconnecting", self.call.sid());
                }
            }
        }
    }
}
