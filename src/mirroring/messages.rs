//! Cast WebRTC-namespace message bodies: outbound OFFER / GET_CAPABILITIES and
//! inbound ANSWER / CAPABILITIES_RESPONSE.

use serde::{Deserialize, Serialize};

use super::error::MessageError;

/// Namespace for all session negotiation traffic.
pub const WEBRTC_NAMESPACE: &str = "urn:x-cast:com.google.cast.webrtc";

/// One message on the cast message channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CastMessage {
    pub namespace: String,
    /// JSON body.
    pub data: String,
}

impl CastMessage {
    pub fn webrtc(body: &serde_json::Value) -> Self {
        Self {
            namespace: WEBRTC_NAMESPACE.to_string(),
            data: body.to_string(),
        }
    }
}

/// Build `{type: "OFFER", seqNum, offer}`.
pub fn offer_message(sequence_number: i32, offer: serde_json::Value) -> CastMessage {
    CastMessage::webrtc(&serde_json::json!({
        "type": "OFFER",
        "seqNum": sequence_number,
        "offer": offer,
    }))
}

/// Build `{type: "GET_CAPABILITIES", seqNum}`.
pub fn get_capabilities_message(sequence_number: i32) -> CastMessage {
    CastMessage::webrtc(&serde_json::json!({
        "type": "GET_CAPABILITIES",
        "seqNum": sequence_number,
    }))
}

/// Reply types the sender waits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseType {
    /// Unrecognized type, or the synthetic response for a timed-out request.
    Unknown,
    Answer,
    CapabilitiesResponse,
    Rpc,
}

impl ResponseType {
    fn from_wire(s: &str) -> Self {
        match s {
            "ANSWER" => Self::Answer,
            "CAPABILITIES_RESPONSE" => Self::CapabilitiesResponse,
            "RPC" => Self::Rpc,
            _ => Self::Unknown,
        }
    }
}

/// Frame rate as sent by receivers: either a number or `"num/den"`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum FrameRate {
    Number(f64),
    Text(String),
}

impl FrameRate {
    pub fn value(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Text(s) => match s.split_once('/') {
                Some((num, den)) => {
                    let num: f64 = num.trim().parse().ok()?;
                    let den: f64 = den.trim().parse().ok()?;
                    (den > 0.0).then(|| num / den)
                }
                None => s.trim().parse().ok(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub frame_rate: Option<FrameRate>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioConstraints {
    pub max_sample_rate: Option<u32>,
    pub max_channels: Option<u32>,
    pub min_bit_rate: Option<u32>,
    pub max_bit_rate: Option<u32>,
    /// Milliseconds.
    pub max_delay: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoConstraints {
    pub max_pixels_per_second: Option<f64>,
    pub min_resolution: Option<Dimensions>,
    pub max_dimensions: Option<Dimensions>,
    pub min_bit_rate: Option<u32>,
    pub max_bit_rate: Option<u32>,
    /// Milliseconds.
    pub max_delay: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Constraints {
    pub audio: Option<AudioConstraints>,
    pub video: Option<VideoConstraints>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayDescription {
    pub dimensions: Option<Dimensions>,
    pub aspect_ratio: Option<String>,
    /// `"sender"` or `"receiver"`: who scales content to the display.
    pub scaling: Option<String>,
}

impl DisplayDescription {
    pub fn supports_scaling(&self) -> bool {
        self.scaling.as_deref() == Some("receiver")
    }
}

/// The receiver's selection from an OFFER.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Answer {
    pub udp_port: u16,
    pub send_indexes: Vec<i32>,
    pub ssrcs: Vec<u32>,
    #[serde(default)]
    pub constraints: Option<Constraints>,
    #[serde(default)]
    pub display: Option<DisplayDescription>,
}

/// Body of a CAPABILITIES_RESPONSE.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiverCapability {
    #[serde(default)]
    pub media_caps: Vec<String>,
    /// Remoting protocol version; absent on old receivers.
    #[serde(default)]
    pub remoting: Option<i32>,
}

/// `error` object of a `result: "error"` reply.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ReceiverError {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq)]
enum ResponseBody {
    None,
    Answer(Answer),
    Capabilities(ReceiverCapability),
    Rpc(String),
}

/// A parsed reply from the receiver.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceiverResponse {
    response_type: ResponseType,
    sequence_number: i32,
    valid: bool,
    body: ResponseBody,
    error: Option<ReceiverError>,
}

impl ReceiverResponse {
    /// Synthetic response delivered when a request times out.
    pub fn unknown(sequence_number: i32) -> Self {
        Self {
            response_type: ResponseType::Unknown,
            sequence_number,
            valid: false,
            body: ResponseBody::None,
            error: None,
        }
    }

    /// Parse a JSON message body.
    ///
    /// Structural problems (not JSON, no type, no sequence number) are
    /// errors. A recognized reply whose body fails to parse, or whose
    /// `result` is not `"ok"`, is returned with `valid() == false`.
    pub fn parse(data: &str) -> Result<Self, MessageError> {
        let value: serde_json::Value = serde_json::from_str(data)?;
        let response_type = value
            .get("type")
            .and_then(|t| t.as_str())
            .map(ResponseType::from_wire)
            .ok_or(MessageError::MissingType)?;

        let sequence_number = match value.get("seqNum").and_then(|s| s.as_i64()) {
            Some(n) => i32::try_from(n).map_err(|_| MessageError::MissingSequenceNumber)?,
            // RPC messages are unsolicited and need no sequence number.
            None if response_type == ResponseType::Rpc => -1,
            None => return Err(MessageError::MissingSequenceNumber),
        };

        let result_ok = value
            .get("result")
            .and_then(|r| r.as_str())
            .map(|r| r == "ok")
            .unwrap_or(response_type == ResponseType::Rpc);

        let error = value
            .get("error")
            .and_then(|e| serde_json::from_value::<ReceiverError>(e.clone()).ok());

        let body = match response_type {
            ResponseType::Answer => value
                .get("answer")
                .and_then(|a| serde_json::from_value::<Answer>(a.clone()).ok())
                .map(ResponseBody::Answer),
            ResponseType::CapabilitiesResponse => value
                .get("capabilities")
                .and_then(|c| serde_json::from_value::<ReceiverCapability>(c.clone()).ok())
                .map(ResponseBody::Capabilities),
            ResponseType::Rpc => value
                .get("rpc")
                .and_then(|r| r.as_str())
                .map(|r| ResponseBody::Rpc(r.to_string())),
            ResponseType::Unknown => None,
        };

        let valid = result_ok && body.is_some();
        Ok(Self {
            response_type,
            sequence_number,
            valid,
            body: body.unwrap_or(ResponseBody::None),
            error,
        })
    }

    pub fn response_type(&self) -> ResponseType {
        self.response_type
    }

    pub fn sequence_number(&self) -> i32 {
        self.sequence_number
    }

    pub fn answer(&self) -> Option<&Answer> {
        match &self.body {
            ResponseBody::Answer(a) if self.valid => Some(a),
            _ => None,
        }
    }

    pub fn capabilities(&self) -> Option<&ReceiverCapability> {
        match &self.body {
            ResponseBody::Capabilities(c) if self.valid => Some(c),
            _ => None,
        }
    }

    pub fn rpc(&self) -> Option<&str> {
        match &self.body {
            ResponseBody::Rpc(r) => Some(r),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&ReceiverError> {
        self.error.as_ref()
    }
}
