use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::call::CallInvite;

// ==========================================
// 1. Push notification payloads
// ==========================================

/// Loose shape of a push notification payload. Unknown fields are ignored so
/// the server can grow the schema without breaking older clients.
#[derive(Deserialize, Debug, Clone)]
pub struct PushMessage {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub call_sid: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
}

/// A push payload after classification.
#[derive(Debug, Clone)]
pub enum PushPayload {
    Invite(CallInvite),
    Cancel { call_sid: String },
    Unknown(String),
}

/// Classify a raw push payload. Invites get a fresh UUID here; it identifies
/// the invite for the rest of its life on this client.
pub fn classify_push(payload: Value) -> PushPayload {
    let msg: PushMessage = match serde_json::from_value(payload) {
        Ok(m) => m,
        // 不是已知的推送格式，留给调用方记录日志
        Err(_) => return PushPayload::Unknown("unparseable".to_string()),
    };

    match msg.msg_type.as_str() {
        "call_invite" => match msg.call_sid {
            Some(call_sid) => PushPayload::Invite(CallInvite {
                uuid: Uuid::new_v4(),
                call_sid,
                from: msg.from.unwrap_or_default(),
                to: msg.to.unwrap_or_default(),
            }),
            None => PushPayload::Unknown(msg.msg_type),
        },
        "call_cancel" => match msg.call_sid {
            Some(call_sid) => PushPayload::Cancel { call_sid },
            None => PushPayload::Unknown(msg.msg_type),
        },
        _ => PushPayload::Unknown(msg.msg_type),
    }
}

// ==========================================
// 2. Control socket commands
// ==========================================

/// One datagram received on the local control socket.
///
/// Examples of commands the CLI sends:
///   {"type":"call","to":"bob"}
///   {"type":"accept"}            // oldest pending invite
///   {"type":"reject","call_sid":"CA.."}
///   {"type":"hangup"}
///   {"type":"mute","value":true}
///   {"type":"hold","value":false}
///   {"type":"digits","digits":"12#"}
///   {"type":"music"}
///   {"type":"route","speaker":true}
///   {"type":"status"}
///
/// Two more stand in for the push transport, which has no other way onto
/// this host:
///   {"type":"push","payload":{"type":"call_invite",...}}
///   {"type":"credentials","token":"..."}      // omit token to invalidate
#[derive(Deserialize, Debug, Clone)]
pub struct BridgeCommand {
    #[serde(rename = "type")]
    pub cmd_type: String,
    pub to: Option<String>,
    pub call_sid: Option<String>,
    pub digits: Option<String>,
    pub value: Option<bool>,
    pub speaker: Option<bool>,
    pub payload: Option<Value>,
    pub token: Option<String>,
}

// ==========================================
// 3. Control socket events
// ==========================================

/// One datagram sent back on the local control socket.
#[derive(Serialize, Debug, Clone, Default)]
pub struct BridgeEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_sid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BridgeEvent {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}
