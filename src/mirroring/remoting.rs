//! Remoting capability probe: decide whether to ask, and turn the
//! CAPABILITIES_RESPONSE into sink metadata for the remoter.

use super::messages::{ReceiverResponse, ResponseType};
use super::offer::Features;

/// Highest remoting protocol version this sender speaks.
pub const SUPPORTED_REMOTING_VERSION: i32 = 2;

/// Receivers that omit the version field speak version 1.
const FALLBACK_REMOTING_VERSION: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AudioCapability {
    BaselineSet,
    Aac,
    Opus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VideoCapability {
    BaselineSet,
    H264,
    Vp8,
    Vp9,
    Hevc,
    Support4k,
}

/// What the remoter needs to know about the receiver.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemotingSinkMetadata {
    pub friendly_name: String,
    pub build_version: String,
    pub audio_capabilities: Vec<AudioCapability>,
    pub video_capabilities: Vec<VideoCapability>,
}

/// Result of evaluating a CAPABILITIES_RESPONSE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Remoting is available with this sink.
    Sink(RemotingSinkMetadata),
    /// Bad or error response; carries the message to log.
    Unsupported(String),
    /// The receiver speaks a newer protocol. Remoting stays off for good.
    VersionTooNew(i32),
}

/// Only some receiver families support remoting; asking the rest is wasted
/// traffic.
pub fn should_query(receiver_model_name: &str, features: Features) -> bool {
    features.force_remoting_query
        || receiver_model_name.starts_with("Chromecast")
        || receiver_model_name.starts_with("Eureka Dongle")
}

/// Map `mediaCaps` names onto sink capabilities.
pub fn to_sink_metadata(
    media_caps: &[String],
    receiver_model_name: &str,
    friendly_name: &str,
    build_version: &str,
) -> RemotingSinkMetadata {
    let ultra = receiver_model_name.starts_with("Chromecast Ultra");
    let mut sink = RemotingSinkMetadata {
        friendly_name: friendly_name.to_string(),
        build_version: build_version.to_string(),
        ..Default::default()
    };

    for cap in media_caps {
        match cap.as_str() {
            "audio" => sink.audio_capabilities.push(AudioCapability::BaselineSet),
            "aac" => sink.audio_capabilities.push(AudioCapability::Aac),
            "opus" => sink.audio_capabilities.push(AudioCapability::Opus),
            "video" => sink.video_capabilities.push(VideoCapability::BaselineSet),
            "4k" => sink.video_capabilities.push(VideoCapability::Support4k),
            "h264" => sink.video_capabilities.push(VideoCapability::H264),
            "vp8" => sink.video_capabilities.push(VideoCapability::Vp8),
            "vp9" if ultra => sink.video_capabilities.push(VideoCapability::Vp9),
            "hevc" if ultra => sink.video_capabilities.push(VideoCapability::Hevc),
            "vp9" | "hevc" => {
                tracing::debug!("Ignoring mediaCap {} for model {}", cap, receiver_model_name)
            }
            other => tracing::debug!("Unknown mediaCap name: {}", other),
        }
    }

    // 1080p30+ remoting content is only enabled on Chromecast Ultra.
    if receiver_model_name == "Chromecast Ultra"
        && !sink.video_capabilities.contains(&VideoCapability::Support4k)
    {
        sink.video_capabilities.push(VideoCapability::Support4k);
    }

    sink
}

/// Evaluate a CAPABILITIES_RESPONSE (or the synthetic timeout response).
pub fn evaluate(
    response: &ReceiverResponse,
    receiver_model_name: &str,
    friendly_name: &str,
    build_version: &str,
) -> ProbeOutcome {
    let capabilities = match response.capabilities() {
        Some(c) if response.response_type() == ResponseType::CapabilitiesResponse => c,
        _ => {
            let message = match response.error() {
                Some(e) => format!(
                    "Remoting is not supported. Error code: {}, description: {}, details: {}",
                    e.code,
                    e.description,
                    e.details
                        .as_ref()
                        .map(|d| d.to_string())
                        .unwrap_or_default()
                ),
                None => "Remoting is not supported. Bad CAPABILITIES_RESPONSE.".to_string(),
            };
            return ProbeOutcome::Unsupported(message);
        }
    };

    let version = capabilities.remoting.unwrap_or(FALLBACK_REMOTING_VERSION);
    if version > SUPPORTED_REMOTING_VERSION {
        return ProbeOutcome::VersionTooNew(version);
    }

    ProbeOutcome::Sink(to_sink_metadata(
        &capabilities.media_caps,
        receiver_model_name,
        friendly_name,
        build_version,
    ))
}
