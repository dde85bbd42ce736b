//! Control message types and their JSON wire form
//!
//! One UTF-8 JSON object per frame:
//!
//! ```text
//! { "type": "offer" | "answer" | "ice-candidate",
//!   "to":   "<identifier>",
//!   "from": "<identifier>",        // omitted on send, stamped by the server
//!   "data": <session description | ice candidate> }
//! ```

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

/// Opaque party name used as rendezvous address and routing field
pub type Identifier = String;

/// Kind of a session description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    /// Proposed session
    Offer,
    /// Accepted session
    Answer,
}

/// Session description as exchanged by browsers (`{"type", "sdp"}`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer
    #[serde(rename = "type")]
    pub kind: SdpKind,

    /// Raw SDP text
    pub sdp: String,
}

impl SessionDescription {
    /// Build an offer description
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    /// Build an answer description
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }

    /// Convert into the peer-connection library's description type
    pub fn to_rtc(&self) -> Result<RTCSessionDescription> {
        let parsed = match self.kind {
            SdpKind::Offer => RTCSessionDescription::offer(self.sdp.clone()),
            SdpKind::Answer => RTCSessionDescription::answer(self.sdp.clone()),
        };
        parsed.map_err(|e| Error::SdpError(format!("Failed to parse {:?}: {}", self.kind, e)))
    }

    /// Convert from the peer-connection library's description type
    pub fn from_rtc(desc: &RTCSessionDescription) -> Result<Self> {
        let kind = match desc.sdp_type {
            RTCSdpType::Offer => SdpKind::Offer,
            RTCSdpType::Answer => SdpKind::Answer,
            other => {
                return Err(Error::SdpError(format!(
                    "Unsupported session description type: {}",
                    other
                )))
            }
        };
        Ok(Self {
            kind,
            sdp: desc.sdp.clone(),
        })
    }
}

/// ICE candidate in its browser JSON form
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidateInfo {
    /// Candidate attribute line
    pub candidate: String,

    /// Media stream identification tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,

    /// Index of the media description
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,

    /// ICE username fragment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl From<RTCIceCandidateInit> for IceCandidateInfo {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<IceCandidateInfo> for RTCIceCandidateInit {
    fn from(info: IceCandidateInfo) -> Self {
        RTCIceCandidateInit {
            candidate: info.candidate,
            sdp_mid: info.sdp_mid,
            sdp_mline_index: info.sdp_mline_index,
            username_fragment: info.username_fragment,
        }
    }
}

/// Message kind, matching the wire `type` field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// `"offer"`
    Offer,
    /// `"answer"`
    Answer,
    /// `"ice-candidate"`
    IceCandidate,
}

impl MessageKind {
    /// Wire name of this kind
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Offer => "offer",
            MessageKind::Answer => "answer",
            MessageKind::IceCandidate => "ice-candidate",
        }
    }

    fn parse(name: &str) -> Option<Self> {
        match name {
            "offer" => Some(MessageKind::Offer),
            "answer" => Some(MessageKind::Answer),
            "ice-candidate" => Some(MessageKind::IceCandidate),
            _ => None,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload carried by a control message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessagePayload {
    /// SDP offer
    Offer(SessionDescription),
    /// SDP answer
    Answer(SessionDescription),
    /// Trickled ICE candidate
    IceCandidate(IceCandidateInfo),
}

/// Routed negotiation message
///
/// Immutable once built; `from` is the sender and `to` the recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlMessage {
    from: Identifier,
    to: Identifier,
    payload: MessagePayload,
}

/// Raw frame layout, shared with the relay which only touches `from`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct WireFrame {
    #[serde(rename = "type")]
    pub kind: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    pub data: serde_json::Value,
}

impl ControlMessage {
    /// Build an offer message
    pub fn offer(from: impl Into<Identifier>, to: impl Into<Identifier>, sdp: SessionDescription) -> Self {
        Self::new(from, to, MessagePayload::Offer(sdp))
    }

    /// Build an answer message
    pub fn answer(from: impl Into<Identifier>, to: impl Into<Identifier>, sdp: SessionDescription) -> Self {
        Self::new(from, to, MessagePayload::Answer(sdp))
    }

    /// Build an ICE candidate message
    pub fn ice_candidate(
        from: impl Into<Identifier>,
        to: impl Into<Identifier>,
        candidate: IceCandidateInfo,
    ) -> Self {
        Self::new(from, to, MessagePayload::IceCandidate(candidate))
    }

    fn new(from: impl Into<Identifier>, to: impl Into<Identifier>, payload: MessagePayload) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            payload,
        }
    }

    /// Sender identifier
    pub fn from(&self) -> &str {
        &self.from
    }

    /// Recipient identifier
    pub fn to(&self) -> &str {
        &self.to
    }

    /// Message payload
    pub fn payload(&self) -> &MessagePayload {
        &self.payload
    }

    /// Message kind
    pub fn kind(&self) -> MessageKind {
        match self.payload {
            MessagePayload::Offer(_) => MessageKind::Offer,
            MessagePayload::Answer(_) => MessageKind::Answer,
            MessagePayload::IceCandidate(_) => MessageKind::IceCandidate,
        }
    }

    /// Serialize for sending; the server stamps `from`, so it is omitted
    pub fn encode(&self) -> Result<String> {
        let data = match &self.payload {
            MessagePayload::Offer(desc) | MessagePayload::Answer(desc) => serde_json::to_value(desc),
            MessagePayload::IceCandidate(candidate) => serde_json::to_value(candidate),
        }
        .map_err(|e| Error::MalformedMessage(format!("Failed to encode {}: {}", self.kind(), e)))?;

        let frame = WireFrame {
            kind: self.kind().as_str().to_string(),
            to: self.to.clone(),
            from: None,
            data,
        };

        serde_json::to_string(&frame)
            .map_err(|e| Error::MalformedMessage(format!("Failed to encode {}: {}", self.kind(), e)))
    }

    /// Parse a received frame; `from` must be present
    pub fn decode(text: &str) -> Result<Self> {
        let frame: WireFrame = serde_json::from_str(text)
            .map_err(|e| Error::MalformedMessage(format!("Undecodable frame: {}", e)))?;

        let kind = MessageKind::parse(&frame.kind)
            .ok_or_else(|| Error::MalformedMessage(format!("Unknown message type: {}", frame.kind)))?;

        let from = frame
            .from
            .ok_or_else(|| Error::MalformedMessage(format!("{} frame without sender", kind)))?;

        let payload = match kind {
            MessageKind::Offer | MessageKind::Answer => {
                let desc: SessionDescription = serde_json::from_value(frame.data).map_err(|e| {
                    Error::MalformedMessage(format!("Invalid {} description: {}", kind, e))
                })?;
                match (kind, desc.kind) {
                    (MessageKind::Offer, SdpKind::Offer) => MessagePayload::Offer(desc),
                    (MessageKind::Answer, SdpKind::Answer) => MessagePayload::Answer(desc),
                    _ => {
                        return Err(Error::MalformedMessage(format!(
                            "{} frame carries a {:?} description",
                            kind, desc.kind
                        )))
                    }
                }
            }
            MessageKind::IceCandidate => {
                let candidate: IceCandidateInfo = serde_json::from_value(frame.data).map_err(|e| {
                    Error::MalformedMessage(format!("Invalid ice candidate: {}", e))
                })?;
                MessagePayload::IceCandidate(candidate)
            }
        };

        Ok(Self {
            from,
            to: frame.to,
            payload,
        })
    }
}
