//! OFFER construction: enumerate every stream the sender can produce.

use serde_json::{json, Value};

use super::error::SessionError;
use super::random;
use super::settings::MirrorSettings;
use super::stream::{hex_upper, Codec, EncryptionKeys, StreamConfig, StreamKind};
use super::{SessionParameters, SessionType};

/// Audio SSRC band (inclusive).
pub const AUDIO_SSRC_MIN: u32 = 1;
pub const AUDIO_SSRC_MAX: u32 = 500_000;
/// Video SSRC band (inclusive).
pub const VIDEO_SSRC_MIN: u32 = 500_001;
pub const VIDEO_SSRC_MAX: u32 = 1_000_000;

/// Hardware video encoders detected on this machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HardwareProfiles {
    pub vp8: bool,
    pub h264: bool,
}

/// Feature gates, passed in explicitly at session construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Features {
    /// Offer software AV1 alongside hardware codecs.
    pub av1: bool,
    /// Prefer software VP9 over VP8 when no hardware encoder exists.
    pub vp9: bool,
    /// Query remoting capabilities regardless of receiver model.
    pub force_remoting_query: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CastMode {
    Mirroring,
    Remoting,
}

impl CastMode {
    fn wire_name(self) -> &'static str {
        match self {
            Self::Mirroring => "mirroring",
            Self::Remoting => "remoting",
        }
    }
}

/// A built offer: the candidate configs plus the `offer` JSON object.
#[derive(Debug, Clone)]
pub struct Offer {
    pub audio_configs: Vec<StreamConfig>,
    pub video_configs: Vec<StreamConfig>,
    pub document: Value,
}

impl Offer {
    pub fn stream_count(&self) -> usize {
        self.audio_configs.len() + self.video_configs.len()
    }
}

pub struct OfferBuilder<'a> {
    params: &'a SessionParameters,
    settings: &'a MirrorSettings,
    hardware: HardwareProfiles,
    features: Features,
}

impl<'a> OfferBuilder<'a> {
    pub fn new(
        params: &'a SessionParameters,
        settings: &'a MirrorSettings,
        hardware: HardwareProfiles,
        features: Features,
    ) -> Self {
        Self {
            params,
            settings,
            hardware,
            features,
        }
    }

    /// Build a fresh offer. Key material and SSRCs are drawn anew each call.
    pub fn build(&self, mode: CastMode) -> Result<Offer, SessionError> {
        let keys = EncryptionKeys::generate();
        let mut audio_configs = Vec::new();
        let mut video_configs = Vec::new();

        if self.params.session_type != SessionType::VideoOnly {
            let ssrc = random::in_range(AUDIO_SSRC_MIN, AUDIO_SSRC_MAX);
            let codec = match mode {
                CastMode::Mirroring => Codec::AudioOpus,
                CastMode::Remoting => Codec::AudioRemote,
            };
            let config = self.settings.default_audio_config(codec, keys);
            audio_configs.push(self.finish(config, ssrc));
        }

        if self.params.session_type != SessionType::AudioOnly {
            let ssrc = random::in_range(VIDEO_SSRC_MIN, VIDEO_SSRC_MAX);
            for (codec, external) in self.video_candidates(mode) {
                let mut config = self.settings.default_video_config(codec, keys);
                config.use_external_encoder = external;
                video_configs.push(self.finish(config, ssrc));
            }
        }

        if audio_configs.is_empty() && video_configs.is_empty() {
            return Err(SessionError::OfferConfigurationError);
        }

        let streams: Vec<Value> = audio_configs
            .iter()
            .chain(video_configs.iter())
            .enumerate()
            .map(|(index, config)| stream_object(index, config))
            .collect();

        let document = json!({
            "castMode": mode.wire_name(),
            "receiverGetStatus": true,
            "supportedStreams": streams,
        });

        tracing::debug!(
            "Built {} offer: {} audio, {} video stream(s)",
            mode.wire_name(),
            audio_configs.len(),
            video_configs.len()
        );

        Ok(Offer {
            audio_configs,
            video_configs,
            document,
        })
    }

    /// Video codecs to offer, in order, with the external-encoder flag.
    fn video_candidates(&self, mode: CastMode) -> Vec<(Codec, bool)> {
        if mode == CastMode::Remoting {
            return vec![(Codec::VideoRemote, false)];
        }

        let mut codecs = Vec::new();
        if self.hardware.vp8 {
            codecs.push((Codec::VideoVp8, true));
        }
        if self.hardware.h264 {
            codecs.push((Codec::VideoH264, true));
        }
        if self.features.av1 {
            codecs.push((Codec::VideoAv1, false));
        }
        if codecs.is_empty() {
            if self.features.vp9 {
                codecs.push((Codec::VideoVp9, false));
            }
            codecs.push((Codec::VideoVp8, false));
        }
        codecs
    }

    fn finish(&self, mut config: StreamConfig, ssrc: u32) -> StreamConfig {
        config.sender_ssrc = ssrc;
        if let Some(delay) = self.params.target_playout_delay {
            config.pin_playout_delay(delay);
        }
        config
    }
}

/// One `supportedStreams` entry.
fn stream_object(index: usize, config: &StreamConfig) -> Value {
    let mut stream = json!({
        "index": index,
        "codecName": config.codec.wire_name(),
        "rtpProfile": "cast",
        "rtpPayloadType": config.rtp_payload_type.wire_value(),
        "ssrc": config.sender_ssrc,
        "targetDelay": config.animated_playout_delay.as_millis() as u64,
        "aesKey": hex_upper(&config.keys.aes_key),
        "aesIvMask": hex_upper(&config.keys.aes_iv_mask),
        "timeBase": format!("1/{}", config.rtp_timebase),
        "receiverRtcpEventLog": true,
        "rtpExtensions": "adaptive_playout_delay",
    });

    let extra = match config.kind() {
        StreamKind::Audio => json!({
            "type": "audio_source",
            "bitRate": config.advertised_audio_bitrate(),
            "sampleRate": config.rtp_timebase,
            "channels": config.channels,
        }),
        StreamKind::Video => {
            let resolutions: Vec<Value> = config
                .max_resolution
                .iter()
                .map(|r| json!({"width": r.width, "height": r.height}))
                .collect();
            json!({
                "type": "video_source",
                "renderMode": "video",
                "maxFrameRate": format!("{}/1000", (config.max_frame_rate * 1000.0) as u64),
                "maxBitRate": config.max_bitrate,
                "resolutions": resolutions,
            })
        }
    };

    if let (Some(stream), Some(extra)) = (stream.as_object_mut(), extra.as_object()) {
        for (k, v) in extra {
            stream.insert(k.clone(), v.clone());
        }
    }
    stream
}
