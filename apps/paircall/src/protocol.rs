//! Wire protocol spoken over the relay's websocket.
//!
//! Every message is a JSON object with a `type` discriminator. The relay
//! forwards `rtc.*` payloads verbatim between the two matched peers and
//! owns everything queue-related.

use serde::{Deserialize, Serialize};

/// SDP description half of an offer/answer exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A discovered network path option, as exchanged through the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidateBlob {
    pub candidate: String,
    #[serde(
        rename = "sdpMid",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
}

/// Messages the relay delivers to us.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "hello", rename_all = "camelCase")]
    Hello { user_id: String },
    #[serde(rename = "enqueued", rename_all = "camelCase")]
    Enqueued {
        #[serde(default)]
        queue_size: Option<u32>,
    },
    #[serde(rename = "queueUpdate", rename_all = "camelCase")]
    QueueUpdate {
        #[serde(default)]
        queue_size: Option<u32>,
    },
    #[serde(rename = "dequeued")]
    Dequeued {},
    #[serde(rename = "matched", rename_all = "camelCase")]
    Matched {
        room_id: String,
        peer_id: String,
        #[serde(default)]
        partner_username: Option<String>,
    },
    #[serde(rename = "rtc.offer")]
    RtcOffer { data: SessionDescription },
    #[serde(rename = "rtc.answer")]
    RtcAnswer { data: SessionDescription },
    #[serde(rename = "rtc.ice")]
    RtcIce { data: IceCandidateBlob },
    #[serde(rename = "callEnded")]
    CallEnded {},
}

/// Messages we send to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "registerUsername")]
    RegisterUsername { username: String },
    #[serde(rename = "joinQueue")]
    JoinQueue {},
    #[serde(rename = "leaveQueue")]
    LeaveQueue {},
    #[serde(rename = "endCall", rename_all = "camelCase")]
    EndCall { room_id: String },
    #[serde(rename = "rtc.offer", rename_all = "camelCase")]
    RtcOffer {
        room_id: String,
        data: SessionDescription,
    },
    #[serde(rename = "rtc.answer", rename_all = "camelCase")]
    RtcAnswer {
        room_id: String,
        data: SessionDescription,
    },
    #[serde(rename = "rtc.ice", rename_all = "camelCase")]
    RtcIce {
        room_id: String,
        data: IceCandidateBlob,
    },
    #[serde(rename = "submitRating", rename_all = "camelCase")]
    SubmitRating {
        partner_username: String,
        rating: u8,
        service_type: String,
    },
}
