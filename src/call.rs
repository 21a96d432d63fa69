//! Call-side types: invites, live call handles, connect/accept options, and
//! the delegate surface the engine reports through.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Well-known connect parameter naming the callee.
pub const PARAM_TO: &str = "to";

#[derive(Debug, Error)]
pub enum CallError {
    #[error("no audio device installed")]
    NoAudioDevice,
    #[error("access token is empty")]
    EmptyAccessToken,
    #[error("invalid DTMF digit '{0}' (allowed: 0-9, *, #, w)")]
    InvalidDigit(char),
    #[error("call is not active")]
    NotActive,
    #[error("audio device: {0}")]
    Device(#[from] crate::audio::DeviceError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Connecting,
    Ringing,
    Connected,
    Reconnecting,
    Disconnected,
}

impl CallState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => CallState::Connecting,
            1 => CallState::Ringing,
            2 => CallState::Connected,
            3 => CallState::Reconnecting,
            _ => CallState::Disconnected,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            CallState::Connecting => 0,
            CallState::Ringing => 1,
            CallState::Connected => 2,
            CallState::Reconnecting => 3,
            CallState::Disconnected => 4,
        }
    }
}

/// An incoming call offer, parsed from a push payload. Lives in the app's
/// pending set until accepted, rejected, or cancelled by sid.
#[derive(Debug, Clone)]
pub struct CallInvite {
    pub uuid: Uuid,
    pub call_sid: String,
    pub from: String,
    pub to: String,
}

/// Observer for one call's lifecycle.
///
/// Invoked from the engine's session task; implementations must not block.
pub trait CallDelegate: Send + Sync {
    fn did_start_ringing(&self, call: &Call);
    fn did_connect(&self, call: &Call);
    fn is_reconnecting(&self, call: &Call, reason: &str);
    fn did_reconnect(&self, call: &Call);
    fn did_fail_to_connect(&self, call: &Call, error: &str);
    fn did_disconnect(&self, call: &Call, error: Option<&str>);
}

/// Control messages a call handle sends into its session task.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum CallControl {
    Disconnect,
    SendDigits(String),
}

struct CallCore {
    uuid: Uuid,
    sid: String,
    from: String,
    to: String,
    state: AtomicU8,
    muted: AtomicBool,
    on_hold: AtomicBool,
    control_tx: mpsc::UnboundedSender<CallControl>,
}

/// Handle onto a live call. Cheap to clone; every clone observes and controls
/// the same call.
#[derive(Clone)]
pub struct Call {
    core: Arc<CallCore>,
}

impl Call {
    pub(crate) fn new(
        uuid: Uuid,
        sid: String,
        from: String,
        to: String,
        control_tx: mpsc::UnboundedSender<CallControl>,
    ) -> Self {
        Self {
            core: Arc::new(CallCore {
                uuid,
                sid,
                from,
                to,
                state: AtomicU8::new(CallState::Connecting.as_u8()),
                muted: AtomicBool::new(false),
                on_hold: AtomicBool::new(false),
                control_tx,
            }),
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.core.uuid
    }

    pub fn sid(&self) -> &str {
        &self.core.sid
    }

    pub fn from(&self) -> &str {
        &self.core.from
    }

    pub fn to(&self) -> &str {
        &self.core.to
    }

    pub fn state(&self) -> CallState {
        CallState::from_u8(self.core.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_state(&self, state: CallState) {
        self.core.state.store(state.as_u8(), Ordering::SeqCst);
    }

    pub fn is_muted(&self) -> bool {
        self.core.muted.load(Ordering::SeqCst)
    }

    /// Mute stops the microphone path from leaving the engine; the far end
    /// keeps playing.
    pub fn set_muted(&self, muted: bool) {
        self.core.muted.store(muted, Ordering::SeqCst);
    }

    pub fn is_on_hold(&self) -> bool {
        self.core.on_hold.load(Ordering::SeqCst)
    }

    /// Hold pauses audio in both directions until released.
    pub fn set_on_hold(&self, on_hold: bool) {
        self.core.on_hold.store(on_hold, Ordering::SeqCst);
    }

    /// End the call. Safe to invoke more than once; the session reports a
    /// single terminal delegate callback.
    pub fn disconnect(&self) {
        let _ = self.core.control_tx.send(CallControl::Disconnect);
    }

    /// Queue DTMF digits. `w` inserts a half-second pause.
    pub fn send_digits(&self, digits: &str) -> Result<(), CallError> {
        validate_digits(digits)?;
        if self.state() == CallState::Disconnected {
            return Err(CallError::NotActive);
        }
        self.core
            .control_tx
            .send(CallControl::SendDigits(digits.to_string()))
            .map_err(|_| CallError::NotActive)
    }
}

impl fmt::Debug for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Call")
            .field("sid", &self.core.sid)
            .field("state", &self.state())
            .finish()
    }
}

pub(crate) fn validate_digits(digits: &str) -> Result<(), CallError> {
    for c in digits.chars() {
        if !matches!(c, '0'..='9' | '*' | '#' | 'w') {
            return Err(CallError::InvalidDigit(c));
        }
    }
    Ok(())
}

/// Options for placing an outgoing call.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub access_token: String,
    pub params: HashMap<String, String>,
    pub uuid: Uuid,
}

impl ConnectOptions {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            params: HashMap::new(),
            uuid: Uuid::new_v4(),
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn uuid(mut self, uuid: Uuid) -> Self {
        self.uuid = uuid;
        self
    }

    /// The callee identity, when one was set through [`PARAM_TO`].
    pub fn to(&self) -> &str {
        self.params.get(PARAM_TO).map(String::as_str).unwrap_or("")
    }
}

/// Options for accepting an incoming invite.
#[derive(Debug, Clone, Default)]
pub struct AcceptOptions {
    /// Override for the call UUID; defaults to the invite's.
    pub uuid: Option<Uuid>,
}

impl AcceptOptions {
    pub fn uuid(mut self, uuid: Uuid) -> Self {
        self.uuid = Some(uuid);
        self
    }
}
