use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::audio::{AudioDevice, AudioFormat, GraphAudioDevice, OutputRoute, SystemAudioDevice};
use crate::call::{
    AcceptOptions, Call, CallDelegate, CallInvite, CallState, ConnectOptions, PARAM_TO,
};
use crate::config::Config;
use crate::engine::VoiceEngine;
use crate::protocol::{classify_push, BridgeCommand, BridgeEvent, PushPayload};
use crate::push::{PushCompletion, PushCredentials, PushEventDelegate, PushGateway};
use crate::registration::RegistrationClient;

/// Everything the controller reacts to besides control socket commands.
pub enum ControllerEvent {
    Call(CallEvent),
    Push(PushEvent),
}

pub enum CallEvent {
    Ringing(Call),
    Connected(Call),
    Reconnecting(Call, String),
    Reconnected(Call),
    FailedToConnect(Call, String),
    Disconnected(Call, Option<String>),
}

pub enum PushEvent {
    CredentialsUpdated(PushCredentials),
    CredentialsInvalidated,
    Incoming(Value, PushCompletion),
}

/// Forwards engine callbacks into the controller's event loop. Runs on the
/// session task, so it only does an unbounded send.
struct ChannelCallDelegate {
    tx: mpsc::UnboundedSender<ControllerEvent>,
}

impl CallDelegate for ChannelCallDelegate {
    fn did_start_ringing(&self, call: &Call) {
        let _ = self
            .tx
            .send(ControllerEvent::Call(CallEvent::Ringing(call.clone())));
    }

    fn did_connect(&self, call: &Call) {
        let _ = self
            .tx
            .send(ControllerEvent::Call(CallEvent::Connected(call.clone())));
    }

    fn is_reconnecting(&self, call: &Call, reason: &str) {
        let _ = self.tx.send(ControllerEvent::Call(CallEvent::Reconnecting(
            call.clone(),
            reason.to_string(),
        )));
    }

    fn did_reconnect(&self, call: &Call) {
        let _ = self
            .tx
            .send(ControllerEvent::Call(CallEvent::Reconnected(call.clone())));
    }

    fn did_fail_to_connect(&self, call: &Call, error: &str) {
        let _ = self.tx.send(ControllerEvent::Call(CallEvent::FailedToConnect(
            call.clone(),
            error.to_string(),
        )));
    }

    fn did_disconnect(&self, call: &Call, error: Option<&str>) {
        let _ = self.tx.send(ControllerEvent::Call(CallEvent::Disconnected(
            call.clone(),
            error.map(str::to_string),
        )));
    }
}

struct ChannelPushDelegate {
    tx: mpsc::UnboundedSender<ControllerEvent>,
}

#[async_trait]
impl PushEventDelegate for ChannelPushDelegate {
    async fn credentials_updated(&self, credentials: PushCredentials) {
        let _ = self
            .tx
            .send(ControllerEvent::Push(PushEvent::CredentialsUpdated(
                credentials,
            )));
    }

    async fn credentials_invalidated(&self) {
        let _ = self
            .tx
            .send(ControllerEvent::Push(PushEvent::CredentialsInvalidated));
    }

    async fn incoming_push_received(&self, payload: Value, completion: PushCompletion) {
        // 控制循环退出后发送失败，completion 被丢弃并计入 abandoned
        let _ = self.tx.send(ControllerEvent::Push(PushEvent::Incoming(
            payload, completion,
        )));
    }
}

/// Build the delegate the push gateway dispatches into.
pub fn push_delegate(tx: mpsc::UnboundedSender<ControllerEvent>) -> Arc<dyn PushEventDelegate> {
    Arc::new(ChannelPushDelegate { tx })
}

/// The audio device variant wired into the engine at startup. A configured
/// music path selects the graph device; otherwise the plain system device
/// with its output route control.
pub enum InstalledDevice {
    System(SystemAudioDevice),
    Graph(GraphAudioDevice),
}

impl InstalledDevice {
    pub fn from_config(config: &Config) -> Self {
        let format = AudioFormat::new(
            config.audio_sample_rate,
            config.audio_channels,
            config.audio_frames_per_buffer,
        );
        if config.audio_music_path.is_empty() {
            Self::System(SystemAudioDevice::new(format))
        } else {
            Self::Graph(GraphAudioDevice::new(format, config.audio_music_path))
        }
    }

    pub fn install(&self, engine: &VoiceEngine) {
        let shared: Arc<dyn AudioDevice> = match self {
            Self::System(device) => Arc::new(device.clone()),
            Self::Graph(device) => Arc::new(device.clone()),
        };
        engine.set_audio_device(shared);
    }
}

pub struct CoreController {
    config: Config,
    engine: Arc<VoiceEngine>,
    device: InstalledDevice,
    gateway: Arc<PushGateway>,
    registration: RegistrationClient,
    access_token: String,
    device_token: String,
    active_call: Option<Call>,
    pending_invites: Vec<CallInvite>,
    events_tx: mpsc::UnboundedSender<ControllerEvent>,
    outbound_tx: mpsc::Sender<BridgeEvent>,
}

impl CoreController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        engine: Arc<VoiceEngine>,
        device: InstalledDevice,
        gateway: Arc<PushGateway>,
        registration: RegistrationClient,
        access_token: String,
        events_tx: mpsc::UnboundedSender<ControllerEvent>,
        outbound_tx: mpsc::Sender<BridgeEvent>,
    ) -> Self {
        Self {
            config,
            engine,
            device,
            gateway,
            registration,
            access_token,
            device_token: String::new(),
            active_call: None,
            pending_invites: Vec::new(),
            events_tx,
            outbound_tx,
        }
    }

    pub async fn handle_command(&mut self, cmd: BridgeCommand) {
        match cmd.cmd_type.as_str() {
            "call" => self.place_call(cmd.to).await,
            "accept" => self.accept_invite(cmd.call_sid).await,
            "reject" => self.reject_invite(cmd.call_sid).await,
            "hangup" => match &self.active_call {
                Some(call) => call.disconnect(),
                None => self.send_error("no active call").await,
            },
            "mute" => match &self.active_call {
                Some(call) => {
                    let muted = cmd.value.unwrap_or(true);
                    call.set_muted(muted);
                    let sid = call.sid().to_string();
                    self.send_flag("muted", muted, &sid).await;
                }
                None => self.send_error("no active call").await,
            },
            "hold" => match &self.active_call {
                Some(call) => {
                    let on_hold = cmd.value.unwrap_or(true);
                    call.set_on_hold(on_hold);
                    let sid = call.sid().to_string();
                    self.send_flag("on_hold", on_hold, &sid).await;
                }
                None => self.send_error("no active call").await,
            },
            "digits" => match (&self.active_call, cmd.digits) {
                (Some(call), Some(digits)) => {
                    if let Err(e) = call.send_digits(&digits) {
                        self.send_error(&e.to_string()).await;
                    }
                }
                (None, _) => self.send_error("no active call").await,
                (_, None) => self.send_error("digits command without digits").await,
            },
            "music" => match &self.device {
                InstalledDevice::Graph(device) => device.play_music(),
                InstalledDevice::System(_) => {
                    log::warn!("Music playback needs the graph audio device");
                    self.send_error("music needs the graph audio device").await;
                }
            },
            "route" => match &self.device {
                InstalledDevice::System(device) => {
                    let route = if cmd.speaker.unwrap_or(true) {
                        OutputRoute::Speaker
                    } else {
                        OutputRoute::Earpiece
                    };
                    device.set_output_route(route);
                }
                InstalledDevice::Graph(_) => {
                    log::warn!("The graph audio device has a fixed output route");
                    self.send_error("route needs the system audio device").await;
                }
            },
            "status" => self.send_status().await,
            "push" => match cmd.payload {
                // 模拟推送通道：本机没有真正的推送传输
                Some(payload) => self.gateway.incoming_push(payload).await,
                None => self.send_error("push command without payload").await,
            },
            "credentials" => match cmd.token {
                Some(token) => {
                    self.gateway
                        .credentials_updated(PushCredentials::new(token.into_bytes()))
                        .await;
                }
                None => self.gateway.credentials_invalidated().await,
            },
            other => log::warn!("Unknown control command: {}", other),
        }
    }

    pub async fn handle_event(&mut self, event: ControllerEvent) {
        match event {
            ControllerEvent::Call(event) => self.handle_call_event(event).await,
            ControllerEvent::Push(event) => self.handle_push_event(event).await,
        }
    }

    async fn handle_call_event(&mut self, event: CallEvent) {
        match event {
            CallEvent::Ringing(call) => self.send_call_state(&call, "ringing", None).await,
            CallEvent::Connected(call) => self.send_call_state(&call, "connected", None).await,
            CallEvent::Reconnecting(call, reason) => {
                self.send_call_state(&call, "reconnecting", Some(reason))
                    .await;
            }
            CallEvent::Reconnected(call) => self.send_call_state(&call, "connected", None).await,
            CallEvent::FailedToConnect(call, error) => {
                self.clear_active(&call);
                self.send_call_state(&call, "failed", Some(error)).await;
            }
            CallEvent::Disconnected(call, error) => {
                self.clear_active(&call);
                self.send_call_state(&call, "disconnected", error).await;
            }
        }
    }

    async fn handle_push_event(&mut self, event: PushEvent) {
        match event {
            PushEvent::CredentialsUpdated(credentials) => {
                self.device_token = credentials.token_hex();
                log::info!("Push credentials updated, re-registering");
                match self
                    .registration
                    .register(&self.access_token, &self.device_token)
                    .await
                {
                    Ok(()) => {
                        log::info!(
                            "Registered {} for incoming calls",
                            self.registration.identity()
                        );
                        self.send_event(BridgeEvent {
                            event_type: "registered".to_string(),
                            from: Some(self.registration.identity().to_string()),
                            ..Default::default()
                        })
                        .await;
                    }
                    Err(e) => log::warn!("Registration failed: {:#}", e),
                }
            }
            PushEvent::CredentialsInvalidated => {
                if self.device_token.is_empty() {
                    return;
                }
                log::info!("Push credentials invalidated, unregistering");
                if let Err(e) = self
                    .registration
                    .unregister(&self.access_token, &self.device_token)
                    .await
                {
                    log::warn!("Unregister failed: {:#}", e);
                }
                self.device_token.clear();
            }
            PushEvent::Incoming(payload, completion) => {
                match classify_push(payload) {
                    PushPayload::Invite(invite) => {
                        log::info!("Incoming call {} from {}", invite.call_sid, invite.from);
                        self.send_event(BridgeEvent {
                            event_type: "incoming".to_string(),
                            call_sid: Some(invite.call_sid.clone()),
                            from: Some(invite.from.clone()),
                            ..Default::default()
                        })
                        .await;
                        self.pending_invites.push(invite);
                    }
                    PushPayload::Cancel { call_sid } => {
                        match self
                            .pending_invites
                            .iter()
                            .position(|i| i.call_sid == call_sid)
                        {
                            Some(index) => {
                                let invite = self.pending_invites.remove(index);
                                log::info!("Call {} cancelled by the caller", invite.call_sid);
                                self.send_event(BridgeEvent {
                                    event_type: "cancelled".to_string(),
                                    call_sid: Some(invite.call_sid),
                                    ..Default::default()
                                })
                                .await;
                            }
                            // 已接听或从未见过的呼叫，取消直接忽略
                            None => log::debug!("Cancel for unknown call {}", call_sid),
                        }
                    }
                    PushPayload::Unknown(msg_type) => {
                        log::warn!("Ignoring push of type {}", msg_type);
                    }
                }
                completion.complete();
            }
        }
    }

    async fn place_call(&mut self, to: Option<String>) {
        if self.active_call.is_some() {
            self.send_error("busy").await;
            return;
        }
        let to = to.unwrap_or_else(|| self.config.call_default_to.to_string());
        let options = ConnectOptions::new(self.access_token.clone()).param(PARAM_TO, to.as_str());
        match self.engine.connect(options, self.call_delegate()) {
            Ok(call) => {
                log::info!("Placing call {} to {}", call.sid(), to);
                self.active_call = Some(call);
            }
            Err(e) => {
                log::error!("Connect failed: {}", e);
                self.send_error(&e.to_string()).await;
            }
        }
    }

    async fn accept_invite(&mut self, call_sid: Option<String>) {
        if self.active_call.is_some() {
            self.send_error("busy").await;
            return;
        }
        match self.take_invite(call_sid) {
            Some(invite) => {
                log::info!("Accepting call {} from {}", invite.call_sid, invite.from);
                match self
                    .engine
                    .accept(invite, AcceptOptions::default(), self.call_delegate())
                {
                    Ok(call) => self.active_call = Some(call),
                    Err(e) => {
                        log::error!("Accept failed: {}", e);
                        self.send_error(&e.to_string()).await;
                    }
                }
            }
            None => self.send_error("no matching invite").await,
        }
    }

    async fn reject_invite(&mut self, call_sid: Option<String>) {
        match self.take_invite(call_sid) {
            Some(invite) => {
                log::info!("Rejected call {} from {}", invite.call_sid, invite.from);
                self.send_event(BridgeEvent {
                    event_type: "rejected".to_string(),
                    call_sid: Some(invite.call_sid),
                    ..Default::default()
                })
                .await;
            }
            None => self.send_error("no matching invite").await,
        }
    }

    /// Pop a pending invite, by SID when given, otherwise the oldest.
    fn take_invite(&mut self, call_sid: Option<String>) -> Option<CallInvite> {
        let index = match call_sid {
            Some(sid) => self.pending_invites.iter().position(|i| i.call_sid == sid)?,
            None => {
                if self.pending_invites.is_empty() {
                    return None;
                }
                0
            }
        };
        Some(self.pending_invites.remove(index))
    }

    fn clear_active(&mut self, call: &Call) {
        if self
            .active_call
            .as_ref()
            .is_some_and(|active| active.sid() == call.sid())
        {
            self.active_call = None;
        }
    }

    fn call_delegate(&self) -> Arc<dyn CallDelegate> {
        Arc::new(ChannelCallDelegate {
            tx: self.events_tx.clone(),
        })
    }

    async fn send_status(&self) {
        let (state, call_sid) = match &self.active_call {
            Some(call) => (state_name(call.state()), Some(call.sid().to_string())),
            None => ("idle", None),
        };
        self.send_event(BridgeEvent {
            event_type: "status".to_string(),
            call_sid,
            from: Some(self.registration.identity().to_string()),
            state: Some(state.to_string()),
            ..Default::default()
        })
        .await;
    }

    async fn send_call_state(&self, call: &Call, state: &str, error: Option<String>) {
        self.send_event(BridgeEvent {
            event_type: "call_state".to_string(),
            call_sid: Some(call.sid().to_string()),
            state: Some(state.to_string()),
            error,
            ..Default::default()
        })
        .await;
    }

    async fn send_flag(&self, event_type: &str, value: bool, call_sid: &str) {
        self.send_event(BridgeEvent {
            event_type: event_type.to_string(),
            call_sid: Some(call_sid.to_string()),
            value: Some(value),
            ..Default::default()
        })
        .await;
    }

    async fn send_error(&self, error: &str) {
        self.send_event(BridgeEvent {
            event_type: "error".to_string(),
            error: Some(error.to_string()),
            ..Default::default()
        })
        .await;
    }

    async fn send_event(&self, event: BridgeEvent) {
        if let Err(e) = self.outbound_tx.send(event).await {
            eprintln!("Failed to queue bridge event: {}", e);
        }
    }
}

fn state_name(state: CallState) -> &'static str {
    match state {
        CallState::Connecting => "connecting",
        CallState::Ringing => "ringing",
        CallState::Connected => "connected",
        CallState::Reconnecting => "reconnecting",
        CallState::Disconnected => "disconnected",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use serial_test::serial;
    use std::time::Duration;

    struct Harness {
        controller: CoreController,
        events_rx: mpsc::UnboundedReceiver<ControllerEvent>,
        outbound_rx: mpsc::Receiver<BridgeEvent>,
        gateway: Arc<PushGateway>,
        device: SystemAudioDevice,
    }

    fn harness() -> Harness {
        let config = Config::default();
        let engine = Arc::new(VoiceEngine::new());
        engine.set_ringback(false);
        engine.set_answer_delay(Duration::from_millis(20));
        let device = SystemAudioDevice::new(AudioFormat::new(48000, 1, 128));
        let installed = InstalledDevice::System(device.clone());
        installed.install(&engine);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        let gateway = Arc::new(PushGateway::new(push_delegate(events_tx.clone())));
        let registration = RegistrationClient::new(&config).unwrap();
        let controller = CoreController::new(
            config,
            engine,
            installed,
            gateway.clone(),
            registration,
            "token".to_string(),
            events_tx,
            outbound_tx,
        );
        Harness {
            controller,
            events_rx,
            outbound_rx,
            gateway,
            device,
        }
    }

    fn cmd(value: serde_json::Value) -> BridgeCommand {
        serde_json::from_value(value).unwrap()
    }

    /// Pump controller events the way the main loop does until the next
    /// outbound bridge event shows up.
    async fn next_outbound(
        controller: &mut CoreController,
        events_rx: &mut mpsc::UnboundedReceiver<ControllerEvent>,
        outbound_rx: &mut mpsc::Receiver<BridgeEvent>,
    ) -> BridgeEvent {
        for _ in 0..200 {
            tokio::select! {
                Some(event) = events_rx.recv() => controller.handle_event(event).await,
                Some(event) = outbound_rx.recv() => return event,
                _ = tokio::time::sleep(Duration::from_secs(5)) => break,
            }
        }
        panic!("no bridge event arrived");
    }

    #[tokio::test]
    #[serial]
    async fn invite_accept_and_hangup_roundtrip() {
        let mut h = harness();

        h.gateway
            .incoming_push(json!({
                "type": "call_invite",
                "call_sid": "CA1",
                "from": "client:carol",
                "to": "client:alice",
            }))
            .await;

        let event = next_outbound(&mut h.controller, &mut h.events_rx, &mut h.outbound_rx).await;
        assert_eq!(event.event_type, "incoming");
        assert_eq!(event.call_sid.as_deref(), Some("CA1"));
        assert_eq!(event.from.as_deref(), Some("client:carol"));
        assert_eq!(h.gateway.outstanding_completions(), 0);
        assert_eq!(h.gateway.abandoned_completions(), 0);

        h.controller
            .handle_command(cmd(json!({"type": "accept"})))
            .await;
        let event = next_outbound(&mut h.controller, &mut h.events_rx, &mut h.outbound_rx).await;
        assert_eq!(event.event_type, "call_state");
        assert_eq!(event.state.as_deref(), Some("connected"));
        assert_eq!(event.call_sid.as_deref(), Some("CA1"));

        h.controller
            .handle_command(cmd(json!({"type": "hangup"})))
            .await;
        let event = next_outbound(&mut h.controller, &mut h.events_rx, &mut h.outbound_rx).await;
        assert_eq!(event.state.as_deref(), Some("disconnected"));
        assert!(h.controller.active_call.is_none());
        assert!(!h.device.is_enabled());
    }

    #[tokio::test]
    #[serial]
    async fn cancel_clears_pending_invite() {
        let mut h = harness();

        h.gateway
            .incoming_push(
                json!({"type": "call_invite", "call_sid": "CA2", "from": "client:carol"}),
            )
            .await;
        let event = next_outbound(&mut h.controller, &mut h.events_rx, &mut h.outbound_rx).await;
        assert_eq!(event.event_type, "incoming");

        h.gateway
            .incoming_push(json!({"type": "call_cancel", "call_sid": "CA2"}))
            .await;
        let event = next_outbound(&mut h.controller, &mut h.events_rx, &mut h.outbound_rx).await;
        assert_eq!(event.event_type, "cancelled");
        assert_eq!(event.call_sid.as_deref(), Some("CA2"));

        // The cancelled invite is no longer acceptable.
        h.controller
            .handle_command(cmd(json!({"type": "accept"})))
            .await;
        let event = next_outbound(&mut h.controller, &mut h.events_rx, &mut h.outbound_rx).await;
        assert_eq!(event.event_type, "error");
        assert_eq!(h.gateway.outstanding_completions(), 0);
    }

    #[tokio::test]
    #[serial]
    async fn cancel_removes_only_the_matching_invite() {
        let mut h = harness();

        h.gateway
            .incoming_push(
                json!({"type": "call_invite", "call_sid": "CA10", "from": "client:carol"}),
            )
            .await;
        let event = next_outbound(&mut h.controller, &mut h.events_rx, &mut h.outbound_rx).await;
        assert_eq!(event.event_type, "incoming");

        h.gateway
            .incoming_push(
                json!({"type": "call_invite", "call_sid": "CA11", "from": "client:dave"}),
            )
            .await;
        let event = next_outbound(&mut h.controller, &mut h.events_rx, &mut h.outbound_rx).await;
        assert_eq!(event.event_type, "incoming");

        h.gateway
            .incoming_push(json!({"type": "call_cancel", "call_sid": "CA10"}))
            .await;
        let event = next_outbound(&mut h.controller, &mut h.events_rx, &mut h.outbound_rx).await;
        assert_eq!(event.event_type, "cancelled");
        assert_eq!(event.call_sid.as_deref(), Some("CA10"));

        // The other invite survives and can still be answered.
        h.controller
            .handle_command(cmd(json!({"type": "accept"})))
            .await;
        let event = next_outbound(&mut h.controller, &mut h.events_rx, &mut h.outbound_rx).await;
        assert_eq!(event.event_type, "call_state");
        assert_eq!(event.state.as_deref(), Some("connected"));
        assert_eq!(event.call_sid.as_deref(), Some("CA11"));

        h.controller
            .handle_command(cmd(json!({"type": "hangup"})))
            .await;
        let event = next_outbound(&mut h.controller, &mut h.events_rx, &mut h.outbound_rx).await;
        assert_eq!(event.state.as_deref(), Some("disconnected"));
    }

    #[tokio::test]
    #[serial]
    async fn reject_drops_invite() {
        let mut h = harness();

        h.gateway
            .incoming_push(
                json!({"type": "call_invite", "call_sid": "CA3", "from": "client:carol"}),
            )
            .await;
        let event = next_outbound(&mut h.controller, &mut h.events_rx, &mut h.outbound_rx).await;
        assert_eq!(event.event_type, "incoming");

        h.controller
            .handle_command(cmd(json!({"type": "reject", "call_sid": "CA3"})))
            .await;
        let event = next_outbound(&mut h.controller, &mut h.events_rx, &mut h.outbound_rx).await;
        assert_eq!(event.event_type, "rejected");

        h.controller
            .handle_command(cmd(json!({"type": "accept"})))
            .await;
        let event = next_outbound(&mut h.controller, &mut h.events_rx, &mut h.outbound_rx).await;
        assert_eq!(event.event_type, "error");
    }

    #[tokio::test]
    #[serial]
    async fn outgoing_call_rings_and_second_call_is_busy() {
        let mut h = harness();

        h.controller
            .handle_command(cmd(json!({"type": "call", "to": "bob"})))
            .await;
        let event = next_outbound(&mut h.controller, &mut h.events_rx, &mut h.outbound_rx).await;
        assert_eq!(event.state.as_deref(), Some("ringing"));
        let event = next_outbound(&mut h.controller, &mut h.events_rx, &mut h.outbound_rx).await;
        assert_eq!(event.state.as_deref(), Some("connected"));

        h.controller
            .handle_command(cmd(json!({"type": "call", "to": "carol"})))
            .await;
        let event = next_outbound(&mut h.controller, &mut h.events_rx, &mut h.outbound_rx).await;
        assert_eq!(event.event_type, "error");
        assert_eq!(event.error.as_deref(), Some("busy"));

        h.controller
            .handle_command(cmd(json!({"type": "mute", "value": true})))
            .await;
        let event = next_outbound(&mut h.controller, &mut h.events_rx, &mut h.outbound_rx).await;
        assert_eq!(event.event_type, "muted");
        assert_eq!(event.value, Some(true));
        assert!(h.controller.active_call.as_ref().unwrap().is_muted());

        h.controller
            .handle_command(cmd(json!({"type": "hangup"})))
            .await;
        loop {
            let event =
                next_outbound(&mut h.controller, &mut h.events_rx, &mut h.outbound_rx).await;
            if event.state.as_deref() == Some("disconnected") {
                break;
            }
        }
    }

    #[tokio::test]
    #[serial]
    async fn commands_without_a_call_report_errors() {
        let mut h = harness();

        for command in [
            json!({"type": "hangup"}),
            json!({"type": "mute"}),
            json!({"type": "digits", "digits": "12#"}),
        ] {
            h.controller.handle_command(cmd(command)).await;
            let event =
                next_outbound(&mut h.controller, &mut h.events_rx, &mut h.outbound_rx).await;
            assert_eq!(event.event_type, "error");
            assert_eq!(event.error.as_deref(), Some("no active call"));
        }
    }

    #[tokio::test]
    #[serial]
    async fn music_needs_the_graph_device() {
        let mut h = harness();

        h.controller
            .handle_command(cmd(json!({"type": "music"})))
            .await;
        let event = next_outbound(&mut h.controller, &mut h.events_rx, &mut h.outbound_rx).await;
        assert_eq!(event.event_type, "error");
        assert!(event.error.unwrap().contains("graph"));
    }

    #[tokio::test]
    #[serial]
    async fn credentials_update_sets_device_token() {
        let mut h = harness();

        h.controller
            .handle_event(ControllerEvent::Push(PushEvent::CredentialsUpdated(
                PushCredentials::new(b"tok".as_slice()),
            )))
            .await;
        // "tok" in hex; registration itself needs a live server and only
        // logs a warning here.
        assert_eq!(h.controller.device_token, "746f6b");
    }
}
