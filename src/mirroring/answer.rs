//! ANSWER validation, stream selection and receiver constraint application.

use std::time::Duration;

use super::error::SessionError;
use super::messages::{Answer, ReceiverResponse, ResponseType};
use super::settings::MirrorSettings;
use super::stream::{Resolution, StreamConfig};

/// The streams the receiver accepted, ready to start.
#[derive(Debug, Clone, PartialEq)]
pub struct NegotiatedStreams {
    pub audio: Option<StreamConfig>,
    pub video: Option<StreamConfig>,
    pub udp_port: u16,
    /// Pad video locally because the receiver cannot scale it. Always
    /// false without video.
    pub sender_side_letterboxing: bool,
}

const DEFAULT_AUDIO_MIN_BITRATE: u32 = 32_000;
const DEFAULT_AUDIO_MAX_BITRATE: u32 = 256_000;
const DEFAULT_VIDEO_MIN_BITRATE: u32 = 300_000;
const DEFAULT_VIDEO_MAX_BITRATE: u32 = 8_000_000;
const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(400);
const DEFAULT_VIDEO_MAX: Resolution = Resolution::new(1920, 1080);
const DEFAULT_VIDEO_MAX_FRAME_RATE: f64 = 30.0;

#[derive(Debug, Clone, PartialEq)]
struct AudioRecommendation {
    min_bitrate: u32,
    max_bitrate: u32,
    max_delay: Duration,
}

#[derive(Debug, Clone, PartialEq)]
struct VideoRecommendation {
    min_bitrate: u32,
    max_bitrate: u32,
    max_delay: Duration,
    maximum: Resolution,
    max_frame_rate: f64,
    minimum: Option<Resolution>,
    supports_scaling: bool,
}

/// What the receiver asks for, with defaults for anything it left out.
#[derive(Debug, Clone, PartialEq)]
struct Recommendations {
    audio: AudioRecommendation,
    video: VideoRecommendation,
}

impl Recommendations {
    fn from_answer(answer: &Answer) -> Self {
        let constraints = answer.constraints.clone().unwrap_or_default();
        let audio = constraints.audio.unwrap_or_default();
        let video = constraints.video.unwrap_or_default();
        let max_dims = video.max_dimensions.as_ref();

        Self {
            audio: AudioRecommendation {
                min_bitrate: audio.min_bit_rate.unwrap_or(DEFAULT_AUDIO_MIN_BITRATE),
                max_bitrate: audio.max_bit_rate.unwrap_or(DEFAULT_AUDIO_MAX_BITRATE),
                max_delay: audio
                    .max_delay
                    .map(Duration::from_millis)
                    .unwrap_or(DEFAULT_MAX_DELAY),
            },
            video: VideoRecommendation {
                min_bitrate: video.min_bit_rate.unwrap_or(DEFAULT_VIDEO_MIN_BITRATE),
                max_bitrate: video.max_bit_rate.unwrap_or(DEFAULT_VIDEO_MAX_BITRATE),
                max_delay: video
                    .max_delay
                    .map(Duration::from_millis)
                    .unwrap_or(DEFAULT_MAX_DELAY),
                maximum: max_dims
                    .map(|d| Resolution::new(d.width, d.height))
                    .unwrap_or(DEFAULT_VIDEO_MAX),
                max_frame_rate: max_dims
                    .and_then(|d| d.frame_rate.as_ref())
                    .and_then(|f| f.value())
                    .unwrap_or(DEFAULT_VIDEO_MAX_FRAME_RATE),
                minimum: video
                    .min_resolution
                    .as_ref()
                    .map(|d| Resolution::new(d.width, d.height)),
                supports_scaling: answer
                    .display
                    .as_ref()
                    .map(|d| d.supports_scaling())
                    .unwrap_or(false),
            },
        }
    }
}

/// Validates an ANSWER against the offer it replies to.
pub struct AnswerNegotiator<'a> {
    audio_configs: &'a [StreamConfig],
    video_configs: &'a [StreamConfig],
}

impl<'a> AnswerNegotiator<'a> {
    pub fn new(audio_configs: &'a [StreamConfig], video_configs: &'a [StreamConfig]) -> Self {
        Self {
            audio_configs,
            video_configs,
        }
    }

    /// Select the receiver's streams and tighten them to its constraints.
    ///
    /// On error nothing is mutated: neither the offered configs nor
    /// `settings`.
    pub fn negotiate(
        &self,
        response: &ReceiverResponse,
        settings: &mut MirrorSettings,
    ) -> Result<NegotiatedStreams, SessionError> {
        if response.response_type() != ResponseType::Answer {
            return Err(SessionError::AnswerTimeOut);
        }
        let answer = response.answer().ok_or(SessionError::AnswerNotOk)?;
        if answer.send_indexes.len() != answer.ssrcs.len() {
            return Err(SessionError::AnswerMismatchedSsrcLength);
        }

        let (mut audio, mut video) = self.select(answer)?;
        if let Some(video) = video.as_mut() {
            video.number_of_encode_threads = number_of_encode_threads();
        }

        let recommendations = Recommendations::from_answer(answer);
        if let Some(audio) = audio.as_mut() {
            apply_audio_constraints(audio, &recommendations.audio);
        }
        if let Some(video) = video.as_mut() {
            apply_video_constraints(video, &recommendations.video, settings);
        }

        let sender_side_letterboxing = video.is_some() && !recommendations.video.supports_scaling;
        Ok(NegotiatedStreams {
            audio,
            video,
            udp_port: answer.udp_port,
            sender_side_letterboxing,
        })
    }

    fn select(
        &self,
        answer: &Answer,
    ) -> Result<(Option<StreamConfig>, Option<StreamConfig>), SessionError> {
        let video_start = self.audio_configs.len();
        let bound = video_start + self.video_configs.len();
        let mut audio: Option<StreamConfig> = None;
        let mut video: Option<StreamConfig> = None;

        for (&index, &ssrc) in answer.send_indexes.iter().zip(answer.ssrcs.iter()) {
            let index = match usize::try_from(index) {
                Ok(i) if i < bound => i,
                _ => return Err(SessionError::AnswerSelectInvalidIndex),
            };
            if index < video_start {
                if audio.is_some() {
                    return Err(SessionError::AnswerSelectMultipleAudio);
                }
                let mut config = self.audio_configs[index].clone();
                config.receiver_ssrc = Some(ssrc);
                audio = Some(config);
            } else {
                if video.is_some() {
                    return Err(SessionError::AnswerSelectMultipleVideo);
                }
                let mut config = self.video_configs[index - video_start].clone();
                config.receiver_ssrc = Some(ssrc);
                video = Some(config);
            }
        }

        if audio.is_none() && video.is_none() {
            return Err(SessionError::AnswerNoAudioOrVideo);
        }
        Ok((audio, video))
    }
}

fn apply_audio_constraints(config: &mut StreamConfig, rec: &AudioRecommendation) {
    config.min_bitrate = config.min_bitrate.max(rec.min_bitrate);
    config.start_bitrate = config.min_bitrate;
    config.max_bitrate = config.max_bitrate.min(rec.max_bitrate);
    config.max_playout_delay = config.max_playout_delay.min(rec.max_delay);
    // Only stereo capture exists, so the receiver's channel limit is ignored.
}

fn apply_video_constraints(
    config: &mut StreamConfig,
    rec: &VideoRecommendation,
    settings: &mut MirrorSettings,
) {
    // Compare pixel counts rather than width/height so aspect ratios may differ.
    if rec.maximum.pixels() < settings.max_resolution().pixels() {
        settings.set_resolution_constraints(rec.maximum);
    }
    config.max_resolution = Some(settings.max_resolution());
    if let Some(minimum) = rec.minimum {
        let local = config.min_resolution.map(|r| r.pixels()).unwrap_or(0);
        if minimum.pixels() > local && minimum.pixels() <= settings.max_resolution().pixels() {
            config.min_resolution = Some(minimum);
        }
    }

    config.min_bitrate = config.min_bitrate.max(rec.min_bitrate);
    config.start_bitrate = config.min_bitrate;
    config.max_bitrate = config.max_bitrate.min(rec.max_bitrate);
    config.max_playout_delay = config.max_playout_delay.min(rec.max_delay);
    config.max_frame_rate = config.max_frame_rate.min(rec.max_frame_rate);
}

/// Encode threads for a video stream: half the cores, at most 8.
fn number_of_encode_threads() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    ((cpus + 1) / 2).clamp(1, 8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mirroring::stream::{Codec, EncryptionKeys};

    fn configs() -> (Vec<StreamConfig>, Vec<StreamConfig>) {
        let settings = MirrorSettings::default();
        let keys = EncryptionKeys::generate();
        let mut audio = settings.default_audio_config(Codec::AudioOpus, keys);
        audio.sender_ssrc = 100;
        let mut vp8 = settings.default_video_config(Codec::VideoVp8, keys);
        vp8.sender_ssrc = 600_000;
        let mut h264 = settings.default_video_config(Codec::VideoH264, keys);
        h264.sender_ssrc = 600_000;
        (vec![audio], vec![vp8, h264])
    }

    fn answer(body: serde_json::Value) -> ReceiverResponse {
        let msg = serde_json::json!({
            "type": "ANSWER",
            "seqNum": 1,
            "result": "ok",
            "answer": body,
        });
        ReceiverResponse::parse(&msg.to_string()).unwrap()
    }

    fn negotiate(response: &ReceiverResponse) -> Result<NegotiatedStreams, SessionError> {
        let (audio, video) = configs();
        let mut settings = MirrorSettings::default();
        AnswerNegotiator::new(&audio, &video).negotiate(response, &mut settings)
    }

    #[test]
    fn test_selects_audio_and_video() {
        let response = answer(serde_json::json!({
            "udpPort": 50000,
            "sendIndexes": [0, 2],
            "ssrcs": [11, 22],
        }));
        let streams = negotiate(&response).unwrap();
        let audio = streams.audio.unwrap();
        let video = streams.video.unwrap();
        assert_eq!(audio.codec, Codec::AudioOpus);
        assert_eq!(audio.receiver_ssrc, Some(11));
        assert_eq!(video.codec, Codec::VideoH264);
        assert_eq!(video.receiver_ssrc, Some(22));
        assert!(video.number_of_encode_threads >= 1 && video.number_of_encode_threads <= 8);
        assert_eq!(streams.udp_port, 50000);
        assert!(streams.sender_side_letterboxing);
    }

    #[test]
    fn test_timeout_response() {
        let response = ReceiverResponse::unknown(1);
        assert_eq!(negotiate(&response), Err(SessionError::AnswerTimeOut));
    }

    #[test]
    fn test_error_answer() {
        let msg = r#"{"type":"ANSWER","seqNum":1,"result":"error","error":{"code":3}}"#;
        let response = ReceiverResponse::parse(msg).unwrap();
        assert_eq!(negotiate(&response), Err(SessionError::AnswerNotOk));
    }

    #[test]
    fn test_mismatched_lengths_checked_first() {
        // The index is also out of range; the length check must win.
        let response = answer(serde_json::json!({
            "udpPort": 50000,
            "sendIndexes": [0, 99],
            "ssrcs": [11],
        }));
        assert_eq!(
            negotiate(&response),
            Err(SessionError::AnswerMismatchedSsrcLength)
        );
    }

    #[test]
    fn test_invalid_indexes() {
        for index in [-1, 3, 1000] {
            let response = answer(serde_json::json!({
                "udpPort": 50000,
                "sendIndexes": [index],
                "ssrcs": [11],
            }));
            assert_eq!(
                negotiate(&response),
                Err(SessionError::AnswerSelectInvalidIndex)
            );
        }
    }

    #[test]
    fn test_multiple_audio_does_not_mutate() {
        let settings_before = MirrorSettings::default();
        let keys = EncryptionKeys::generate();
        let audio = vec![
            settings_before.default_audio_config(Codec::AudioOpus, keys),
            settings_before.default_audio_config(Codec::AudioOpus, keys),
        ];
        let video = vec![settings_before.default_video_config(Codec::VideoVp8, keys)];
        let snapshot = (audio.clone(), video.clone());

        let response = answer(serde_json::json!({
            "udpPort": 50000,
            "sendIndexes": [0, 1],
            "ssrcs": [11, 12],
            "constraints": {"video": {"maxDimensions": {"width": 640, "height": 360}}},
            "display": {"scaling": "receiver"},
        }));
        let mut settings = settings_before.clone();
        let result = AnswerNegotiator::new(&audio, &video).negotiate(&response, &mut settings);
        assert_eq!(result, Err(SessionError::AnswerSelectMultipleAudio));
        assert_eq!((audio, video), snapshot);
        assert_eq!(settings, settings_before);
    }

    #[test]
    fn test_multiple_video() {
        let response = answer(serde_json::json!({
            "udpPort": 50000,
            "sendIndexes": [1, 2],
            "ssrcs": [21, 22],
        }));
        assert_eq!(
            negotiate(&response),
            Err(SessionError::AnswerSelectMultipleVideo)
        );
    }

    #[test]
    fn test_nothing_selected() {
        let response = answer(serde_json::json!({
            "udpPort": 50000,
            "sendIndexes": [],
            "ssrcs": [],
        }));
        assert_eq!(negotiate(&response), Err(SessionError::AnswerNoAudioOrVideo));
    }

    #[test]
    fn test_constraints_never_loosen() {
        let response = answer(serde_json::json!({
            "udpPort": 50000,
            "sendIndexes": [0, 1],
            "ssrcs": [11, 21],
            "constraints": {
                "audio": {"minBitRate": 64000, "maxBitRate": 512000, "maxDelay": 2000},
                "video": {
                    "minBitRate": 100000,
                    "maxBitRate": 20000000,
                    "maxDelay": 250,
                    "maxDimensions": {"width": 3840, "height": 2160, "frameRate": 60}
                }
            },
            "display": {"scaling": "receiver"}
        }));
        let (audio_configs, video_configs) = configs();
        let mut settings = MirrorSettings::default();
        let streams = AnswerNegotiator::new(&audio_configs, &video_configs)
            .negotiate(&response, &mut settings)
            .unwrap();

        let video = streams.video.unwrap();
        let local = &video_configs[0];
        // Larger remote ceilings leave local limits alone.
        assert_eq!(video.max_bitrate, local.max_bitrate);
        assert!(video.max_bitrate <= 20_000_000);
        assert_eq!(video.min_bitrate, local.min_bitrate);
        assert_eq!(video.start_bitrate, video.min_bitrate);
        assert_eq!(video.max_frame_rate, 30.0);
        assert_eq!(video.max_playout_delay, Duration::from_millis(250));
        assert_eq!(video.max_resolution, Some(Resolution::new(1920, 1080)));
        assert!(!streams.sender_side_letterboxing);

        let audio = streams.audio.unwrap();
        assert_eq!(audio.min_bitrate, 64_000);
        assert_eq!(audio.start_bitrate, 64_000);
        // Automatic audio bitrate stays automatic.
        assert_eq!(audio.max_bitrate, 0);
        assert_eq!(audio.max_playout_delay, Duration::from_millis(800));
    }

    #[test]
    fn test_constraints_tighten() {
        let response = answer(serde_json::json!({
            "udpPort": 50000,
            "sendIndexes": [1],
            "ssrcs": [21],
            "constraints": {
                "video": {
                    "maxBitRate": 2000000,
                    "maxDimensions": {"width": 1280, "height": 720, "frameRate": "24"}
                }
            }
        }));
        let (audio_configs, video_configs) = configs();
        let mut settings = MirrorSettings::default();
        let streams = AnswerNegotiator::new(&audio_configs, &video_configs)
            .negotiate(&response, &mut settings)
            .unwrap();
        assert!(streams.audio.is_none());
        let video = streams.video.unwrap();
        assert_eq!(video.max_bitrate, 2_000_000);
        assert_eq!(video.max_frame_rate, 24.0);
        assert_eq!(video.max_playout_delay, Duration::from_millis(400));
        assert_eq!(video.max_resolution, Some(Resolution::new(1280, 720)));
        assert_eq!(settings.max_resolution(), Resolution::new(1280, 720));
        assert!(streams.sender_side_letterboxing);
    }

    #[test]
    fn test_letterboxing_follows_each_answer() {
        let (audio_configs, video_configs) = configs();
        let negotiator = AnswerNegotiator::new(&audio_configs, &video_configs);
        let mut settings = MirrorSettings::default();

        // The receiver cannot scale video, so the sender pads it.
        let video = answer(serde_json::json!({
            "udpPort": 50000, "sendIndexes": [1], "ssrcs": [21],
        }));
        let streams = negotiator.negotiate(&video, &mut settings).unwrap();
        assert!(streams.sender_side_letterboxing);

        // Same settings, audio only: nothing to letterbox.
        let audio = answer(serde_json::json!({
            "udpPort": 50001, "sendIndexes": [0], "ssrcs": [11],
            "display": {"scaling": "sender"},
        }));
        let streams = negotiator.negotiate(&audio, &mut settings).unwrap();
        assert!(streams.video.is_none());
        assert!(!streams.sender_side_letterboxing);

        let scaled = answer(serde_json::json!({
            "udpPort": 50002, "sendIndexes": [0, 1], "ssrcs": [11, 21],
            "display": {"scaling": "receiver"},
        }));
        assert!(!negotiator.negotiate(&scaled, &mut settings).unwrap().sender_side_letterboxing);
        let streams = negotiator.negotiate(&video, &mut settings).unwrap();
        assert!(streams.sender_side_letterboxing);
    }
}

