//! Message Types für das Raum-Signaling
//!
//! Wire-Format (JSON) eines Signaling-Events:
//!
//! ```text
//! { type: "camera-on" | "camera-off" | "webrtc-offer" | "webrtc-answer" | "webrtc-ice",
//!   userId, timestamp, offer?, answer?, candidate?, isObserver? }
//! ```

use chrono::Utc;
use serde::{Deserialize, Serialize};

// ============================================================================
// SESSION DESCRIPTION / ICE
// ============================================================================

/// Offer oder Answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// SDP Blob inkl. Typ (entspricht `RTCSessionDescriptionInit`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Einzelner ICE Candidate (entspricht `RTCIceCandidateInit`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "IceCandidateRepr")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
    #[serde(rename = "usernameFragment", skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
            username_fragment: None,
        }
    }
}

#[derive(Deserialize)]
struct FlatCandidate {
    candidate: String,
    #[serde(rename = "sdpMid", default)]
    sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    sdp_m_line_index: Option<u16>,
    #[serde(rename = "usernameFragment", default)]
    username_fragment: Option<String>,
}

/// Ältere Clients verschicken `{ type: "candidate", candidate: {...} }`
#[derive(Deserialize)]
#[serde(untagged)]
enum IceCandidateRepr {
    Flat(FlatCandidate),
    Wrapped { candidate: FlatCandidate },
}

impl From<IceCandidateRepr> for IceCandidate {
    fn from(repr: IceCandidateRepr) -> Self {
        let flat = match repr {
            IceCandidateRepr::Flat(flat) => flat,
            IceCandidateRepr::Wrapped { candidate } => candidate,
        };
        Self {
            candidate: flat.candidate,
            sdp_mid: flat.sdp_mid,
            sdp_m_line_index: flat.sdp_m_line_index,
            username_fragment: flat.username_fragment,
        }
    }
}

/// Verhandlungsdaten zwischen Transport und Signaling, unterschieden nach Form
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SignalData {
    Description(SessionDescription),
    Candidate(IceCandidate),
}

// ============================================================================
// SIGNALING MESSAGE
// ============================================================================

/// Typ-abhängiger Inhalt eines Signaling-Events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SignalingPayload {
    /// Teilnehmer hat die Kamera eingeschaltet
    #[serde(rename = "camera-on")]
    CameraOn {
        #[serde(rename = "isObserver", default)]
        is_observer: bool,
    },

    /// Teilnehmer hat die Kamera ausgeschaltet
    #[serde(rename = "camera-off")]
    CameraOff,

    #[serde(rename = "webrtc-offer")]
    Offer { offer: SessionDescription },

    #[serde(rename = "webrtc-answer")]
    Answer { answer: SessionDescription },

    #[serde(rename = "webrtc-ice", alias = "webrtc-signal")]
    IceCandidate {
        #[serde(alias = "signal")]
        candidate: IceCandidate,
    },
}

impl SignalingPayload {
    /// Event-Name auf dem Broadcast-Kanal
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::CameraOn { .. } => "camera-on",
            Self::CameraOff => "camera-off",
            Self::Offer { .. } => "webrtc-offer",
            Self::Answer { .. } => "webrtc-answer",
            Self::IceCandidate { .. } => "webrtc-ice",
        }
    }

    /// Ordnet Transport-Daten dem passenden Nachrichtentyp zu
    pub fn from_signal(data: SignalData) -> Self {
        match data {
            SignalData::Description(desc) => match desc.sdp_type {
                SdpType::Offer => Self::Offer { offer: desc },
                SdpType::Answer => Self::Answer { answer: desc },
            },
            SignalData::Candidate(candidate) => Self::IceCandidate { candidate },
        }
    }
}

/// Ein Signaling-Event im Raum
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalingMessage {
    #[serde(flatten)]
    pub payload: SignalingPayload,
    #[serde(rename = "userId")]
    pub sender_id: String,
    #[serde(default)]
    pub timestamp: i64,
}

impl SignalingMessage {
    /// Neue Nachricht mit aktuellem Timestamp (ms)
    pub fn new(sender_id: impl Into<String>, payload: SignalingPayload) -> Self {
        Self {
            payload,
            sender_id: sender_id.into(),
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn event_name(&self) -> &'static str {
        self.payload.event_name()
    }
}

// ============================================================================
// BROADCAST ENVELOPE
// ============================================================================

/// Generische Pub/Sub-Nachricht: Event-Name plus JSON-Payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Broadcast {
    pub event: String,
    pub payload: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_camera_on_wire_format() {
        let msg = SignalingMessage {
            payload: SignalingPayload::CameraOn { is_observer: true },
            sender_id: "alice".to_string(),
            timestamp: 42,
        };

        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({"type": "camera-on", "userId": "alice", "timestamp": 42, "isObserver": true})
        );
    }

    #[test]
    fn test_offer_wire_format() {
        let msg = SignalingMessage {
            payload: SignalingPayload::Offer {
                offer: SessionDescription::offer("v=0"),
            },
            sender_id: "bob".to_string(),
            timestamp: 1,
        };

        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "webrtc-offer");
        assert_eq!(value["offer"], json!({"type": "offer", "sdp": "v=0"}));

        let parsed: SignalingMessage = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_camera_off_without_timestamp() {
        let parsed: SignalingMessage =
            serde_json::from_value(json!({"type": "camera-off", "userId": "carol"})).unwrap();
        assert_eq!(parsed.payload, SignalingPayload::CameraOff);
        assert_eq!(parsed.timestamp, 0);
    }

    #[test]
    fn test_legacy_signal_event_is_ice() {
        let parsed: SignalingMessage = serde_json::from_value(json!({
            "type": "webrtc-signal",
            "userId": "dave",
            "signal": {
                "type": "candidate",
                "candidate": {"candidate": "candidate:1 1 udp 1 10.0.0.1 5000 typ host", "sdpMid": "0", "sdpMLineIndex": 0}
            }
        }))
        .unwrap();

        match &parsed.payload {
            SignalingPayload::IceCandidate { candidate } => {
                assert!(candidate.candidate.starts_with("candidate:1"));
                assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
                assert_eq!(candidate.sdp_m_line_index, Some(0));
            }
            other => panic!("unexpected payload: {:?}", other),
        }
        assert_eq!(parsed.event_name(), "webrtc-ice");
    }

    #[test]
    fn test_signal_data_dispatch_by_shape() {
        let answer: SignalData =
            serde_json::from_value(json!({"type": "answer", "sdp": "v=0"})).unwrap();
        assert!(matches!(
            SignalingPayload::from_signal(answer),
            SignalingPayload::Answer { .. }
        ));

        let candidate: SignalData =
            serde_json::from_value(json!({"candidate": "candidate:2", "sdpMid": "1"})).unwrap();
        assert!(matches!(
            SignalingPayload::from_signal(candidate),
            SignalingPayload::IceCandidate { .. }
        ));
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let result = serde_json::from_value::<SignalingMessage>(
            json!({"type": "debate-message", "userId": "x"}),
        );
        assert!(result.is_err());
    }
}
