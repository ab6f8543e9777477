//! Per-stream sender configuration and session key material.

use std::fmt;
use std::time::Duration;

/// Audio or video.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Audio,
    Video,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Audio => write!(f, "audio"),
            Self::Video => write!(f, "video"),
        }
    }
}

/// Codecs the sender can offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Codec {
    AudioOpus,
    AudioRemote,
    VideoVp8,
    VideoVp9,
    VideoH264,
    VideoAv1,
    VideoRemote,
}

impl Codec {
    /// Codec name as it appears in the OFFER (`codecName`, lower-cased).
    pub fn wire_name(self) -> &'static str {
        match self {
            Self::AudioOpus => "opus",
            Self::AudioRemote => "remote_audio",
            Self::VideoVp8 => "vp8",
            Self::VideoVp9 => "vp9",
            Self::VideoH264 => "h264",
            Self::VideoAv1 => "av1",
            Self::VideoRemote => "remote_video",
        }
    }

    pub fn kind(self) -> StreamKind {
        match self {
            Self::AudioOpus | Self::AudioRemote => StreamKind::Audio,
            _ => StreamKind::Video,
        }
    }

    pub fn is_remote(self) -> bool {
        matches!(self, Self::AudioRemote | Self::VideoRemote)
    }
}

/// Internal RTP payload type of a sender config.
///
/// Receivers only accept the two fixed values returned by
/// [`RtpPayloadType::wire_value`], whatever the codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RtpPayloadType {
    AudioOpus,
    RemoteAudio,
    VideoVp8,
    VideoVp9,
    VideoH264,
    VideoAv1,
    RemoteVideo,
}

/// `rtpPayloadType` for audio streams in the OFFER.
pub const AUDIO_PAYLOAD_TYPE: u8 = 127;
/// `rtpPayloadType` for video streams in the OFFER.
pub const VIDEO_PAYLOAD_TYPE: u8 = 96;

impl RtpPayloadType {
    pub fn for_codec(codec: Codec) -> Self {
        match codec {
            Codec::AudioOpus => Self::AudioOpus,
            Codec::AudioRemote => Self::RemoteAudio,
            Codec::VideoVp8 => Self::VideoVp8,
            Codec::VideoVp9 => Self::VideoVp9,
            Codec::VideoH264 => Self::VideoH264,
            Codec::VideoAv1 => Self::VideoAv1,
            Codec::VideoRemote => Self::RemoteVideo,
        }
    }

    pub fn is_audio(self) -> bool {
        matches!(self, Self::AudioOpus | Self::RemoteAudio)
    }

    pub fn wire_value(self) -> u8 {
        if self.is_audio() {
            AUDIO_PAYLOAD_TYPE
        } else {
            VIDEO_PAYLOAD_TYPE
        }
    }
}

/// AES-128 key and IV mask shared by every stream of one offer.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct EncryptionKeys {
    pub aes_key: [u8; 16],
    pub aes_iv_mask: [u8; 16],
}

impl EncryptionKeys {
    /// Draw a fresh key/IV pair from the OS CSPRNG.
    pub fn generate() -> Self {
        Self {
            aes_key: super::random::bytes(),
            aes_iv_mask: super::random::bytes(),
        }
    }
}

// Key material must never end up in logs.
impl fmt::Debug for EncryptionKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKeys { .. }")
    }
}

/// Upper-case hex, as receivers expect for `aesKey` / `aesIvMask`.
pub fn hex_upper(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02X}", b)).collect()
}

/// Width x height in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn pixels(self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

/// Sender configuration for a single audio or video stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    pub codec: Codec,
    pub rtp_payload_type: RtpPayloadType,
    pub sender_ssrc: u32,
    /// Set from the ANSWER once the receiver selects this stream.
    pub receiver_ssrc: Option<u32>,
    pub rtp_timebase: u32,
    /// Audio only.
    pub channels: u32,
    /// Bits per second. A `max_bitrate` of 0 on audio means automatic.
    pub min_bitrate: u32,
    pub max_bitrate: u32,
    pub start_bitrate: u32,
    pub min_playout_delay: Duration,
    pub max_playout_delay: Duration,
    pub animated_playout_delay: Duration,
    pub max_frame_rate: f64,
    /// Video only.
    pub min_resolution: Option<Resolution>,
    /// Video only.
    pub max_resolution: Option<Resolution>,
    /// Whether a hardware encoder is expected for this codec.
    pub use_external_encoder: bool,
    /// Video only; filled in when the stream is selected.
    pub number_of_encode_threads: usize,
    pub keys: EncryptionKeys,
}

impl StreamConfig {
    pub fn kind(&self) -> StreamKind {
        self.codec.kind()
    }

    /// `bitRate` advertised for an audio stream.
    ///
    /// Automatic bitrate follows libopus: 60 bits of packet overhead per
    /// packet plus one bit per sample per channel.
    pub fn advertised_audio_bitrate(&self) -> u32 {
        if self.max_bitrate > 0 {
            self.max_bitrate
        } else {
            60 * self.max_frame_rate as u32 + self.rtp_timebase * self.channels
        }
    }

    /// Apply a fixed target playout delay to all delay bounds.
    pub fn pin_playout_delay(&mut self, delay: Duration) {
        self.animated_playout_delay = delay;
        self.min_playout_delay = delay;
        self.max_playout_delay = delay;
    }
}
