use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ident::Id;

/// Error codes carried by `{"type":"error"}` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    RateLimit,
    BadJson,
    BadMessage,
    NoName,
    BadChat,
    PmNotFound,
    PmSelf,
    UnknownType,
}

/// Everything a client may send.
///
/// Field payloads that a dedicated validator inspects (`setName`, `chatSend`)
/// stay as raw JSON values so that a wrong-typed field produces the
/// validator's failure code rather than `BAD_MESSAGE`.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum InboundFrame {
    SetName {
        name: Value,
    },
    CallStart {
        to: Id,
    },
    CallAccept {
        from: Id,
        room_id: Id,
    },
    CallReject {
        from: Id,
        #[serde(default)]
        room_id: Option<Id>,
    },
    CallHangup,
    Signal {
        to: Id,
        payload: Value,
    },
    ChatSend {
        text: Value,
    },
    PushSubscribe {
        subscription: Value,
    },
    PushUnsubscribe,
}

const INBOUND_TYPES: &[&str] = &[
    "setName",
    "callStart",
    "callAccept",
    "callReject",
    "callHangup",
    "signal",
    "chatSend",
    "pushSubscribe",
    "pushUnsubscribe",
];

/// Decode one inbound text frame.
///
/// Failures are graded: not JSON at all, JSON but not an object carrying a
/// string `type`, a `type` outside the protocol, or a recognized `type`
/// whose remaining fields do not check out.
pub fn decode(text: &str) -> Result<InboundFrame, ErrorCode> {
    let value: Value = serde_json::from_str(text).map_err(|_| ErrorCode::BadJson)?;

    let Some(ty) = value.as_object().and_then(|object| object.get("type")).and_then(Value::as_str) else {
        return Err(ErrorCode::BadMessage);
    };

    if !INBOUND_TYPES.contains(&ty) {
        return Err(ErrorCode::UnknownType);
    }

    serde_json::from_value(value).map_err(|_| ErrorCode::BadMessage)
}

/// One row of a presence snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct PresenceEntry {
    pub id: Id,
    pub name: String,
    pub busy: bool,
}

/// A room member as seen by another member.
#[derive(Debug, Clone, Serialize)]
pub struct PeerEntry {
    pub id: Id,
    pub name: String,
}

/// ICE configuration handed to a client in its hello frame and over the
/// `/turn` endpoint. The shape matches what `RTCPeerConnection` accepts.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IceConfig {
    pub ice_servers: Vec<IceServer>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Derived voice capacity snapshot, recomputed on demand from the room table
/// and the configured relay port range.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceStats {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relay_ports_total: Option<u32>,
    pub active_calls: usize,
    pub peer_links_estimate: u32,
    pub relay_ports_used_estimate: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capacity_calls_estimate: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_conference_users_estimate: Option<u32>,
}

impl VoiceStats {
    /// Largest `k` such that `k·(k-1)/2` peer links fit in `capacity` calls,
    /// from the positive root of `k·(k-1)/2 = capacity`.
    pub fn max_conference_users(capacity_calls: u32) -> u32 {
        ((1.0 + (1.0 + 8.0 * capacity_calls as f64).sqrt()) / 2.0).floor() as u32
    }
}

/// Everything the hub may send.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum OutboundFrame {
    Hello {
        id: Id,
        turn: IceConfig,
        https: bool,
        client_ip: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        turn_warning: Option<&'static str>,
        voice: VoiceStats,
    },
    NameResult {
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<&'static str>,
    },
    Presence {
        users: Vec<PresenceEntry>,
        voice: VoiceStats,
    },
    Chat {
        at_iso: String,
        from: Option<Id>,
        from_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        to: Option<Id>,
        #[serde(skip_serializing_if = "Option::is_none")]
        to_name: Option<String>,
        text: String,
        private: bool,
    },
    IncomingCall {
        from: Id,
        from_name: String,
        room_id: Id,
    },
    CallStartResult {
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<&'static str>,
    },
    CallRejected {
        reason: &'static str,
    },
    CallEnded {
        reason: &'static str,
    },
    RoomPeers {
        room_id: Id,
        peers: Vec<PeerEntry>,
    },
    RoomPeerJoined {
        room_id: Id,
        peer: PeerEntry,
    },
    RoomPeerLeft {
        room_id: Id,
        peer_id: Id,
    },
    Signal {
        from: Id,
        from_name: String,
        payload: Value,
    },
    Error {
        code: ErrorCode,
    },
}

impl OutboundFrame {
    /// A broadcast chat line spoken by the hub itself.
    pub fn system(text: impl Into<String>) -> Self {
        Self::Chat {
            at_iso: now_iso(),
            from: None,
            from_name: "System".to_string(),
            to: None,
            to_name: None,
            text: text.into(),
            private: false,
        }
    }
}

pub(crate) fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn decode_grades_failures() {
        assert_eq!(decode("{not json").unwrap_err(), ErrorCode::BadJson);
        assert_eq!(decode("[1,2,3]").unwrap_err(), ErrorCode::BadMessage);
        assert_eq!(decode("{\"type\":5}").unwrap_err(), ErrorCode::BadMessage);
        assert_eq!(decode("{\"notype\":true}").unwrap_err(), ErrorCode::BadMessage);
        assert_eq!(decode("{\"type\":\"frobnicate\"}").unwrap_err(), ErrorCode::UnknownType);
        assert_eq!(decode("{\"type\":\"callStart\"}").unwrap_err(), ErrorCode::BadMessage);
        assert_eq!(decode("{\"type\":\"signal\",\"to\":\"ab\"}").unwrap_err(), ErrorCode::BadMessage);
    }

    #[test]
    fn decode_accepts_the_wire_shapes() {
        assert!(matches!(
            decode("{\"type\":\"setName\",\"name\":\"Alice\"}").unwrap(),
            InboundFrame::SetName { .. }
        ));
        assert!(matches!(decode("{\"type\":\"callHangup\"}").unwrap(), InboundFrame::CallHangup));
        assert!(matches!(
            decode("{\"type\":\"callReject\",\"from\":\"00112233445566778899aabb\"}").unwrap(),
            InboundFrame::CallReject { .. }
        ));
        assert!(matches!(
            decode("{\"type\":\"signal\",\"to\":\"00112233445566778899aabb\",\"payload\":{}}").unwrap(),
            InboundFrame::Signal { .. }
        ));
    }

    #[test]
    fn error_codes_serialize_screaming() {
        let frame = serde_json::to_value(OutboundFrame::Error { code: ErrorCode::PmNotFound }).unwrap();
        assert_eq!(frame, json!({"type": "error", "code": "PM_NOT_FOUND"}));
    }

    #[test]
    fn chat_frames_omit_absent_recipients() {
        let frame = serde_json::to_value(OutboundFrame::system("Alice joined.")).unwrap();
        assert_eq!(frame["type"], "chat");
        assert_eq!(frame["from"], json!(null));
        assert_eq!(frame["fromName"], "System");
        assert_eq!(frame["private"], false);
        assert!(frame.get("to").is_none());
        assert!(frame.get("toName").is_none());
    }

    #[test]
    fn conference_bound_from_capacity() {
        assert_eq!(VoiceStats::max_conference_users(0), 1);
        assert_eq!(VoiceStats::max_conference_users(1), 2);
        assert_eq!(VoiceStats::max_conference_users(3), 3);
        assert_eq!(VoiceStats::max_conference_users(50), 10);
    }
}
