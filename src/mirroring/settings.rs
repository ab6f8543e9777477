//! Mirroring defaults: resolution limits, letterboxing and the default
//! audio/video sender configs.

use std::time::Duration;

use super::stream::{Codec, EncryptionKeys, Resolution, RtpPayloadType, StreamConfig};

pub const MIN_PLAYOUT_DELAY: Duration = Duration::from_millis(0);
pub const MAX_PLAYOUT_DELAY: Duration = Duration::from_millis(800);
pub const DEFAULT_PLAYOUT_DELAY: Duration = Duration::from_millis(400);

pub const AUDIO_TIMEBASE: u32 = 48_000;
pub const VIDEO_TIMEBASE: u32 = 90_000;
pub const AUDIO_CHANNELS: u32 = 2;
/// 100 packets per second (10ms buffers).
pub const AUDIO_FRAME_RATE: f64 = 100.0;
pub const MIN_VIDEO_BITRATE: u32 = 300_000;
pub const MAX_VIDEO_BITRATE: u32 = 5_000_000;
/// 0 selects the automatic audio bitrate.
pub const AUDIO_BITRATE: u32 = 0;
pub const MAX_FRAME_RATE: f64 = 30.0;
pub const DEFAULT_MAX_RESOLUTION: Resolution = Resolution::new(1920, 1080);
pub const MIN_RESOLUTION: Resolution = Resolution::new(180, 180);

/// Capture-side settings that negotiation may tighten.
#[derive(Debug, Clone, PartialEq)]
pub struct MirrorSettings {
    max_resolution: Resolution,
}

impl Default for MirrorSettings {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RESOLUTION)
    }
}

impl MirrorSettings {
    pub fn new(max_resolution: Resolution) -> Self {
        Self {
            max_resolution: clamp_resolution(max_resolution),
        }
    }

    pub fn max_resolution(&self) -> Resolution {
        self.max_resolution
    }

    pub fn set_resolution_constraints(&mut self, max: Resolution) {
        self.max_resolution = clamp_resolution(max);
    }

    pub fn default_audio_config(&self, codec: Codec, keys: EncryptionKeys) -> StreamConfig {
        StreamConfig {
            codec,
            rtp_payload_type: RtpPayloadType::for_codec(codec),
            sender_ssrc: 0,
            receiver_ssrc: None,
            rtp_timebase: AUDIO_TIMEBASE,
            channels: AUDIO_CHANNELS,
            min_bitrate: AUDIO_BITRATE,
            max_bitrate: AUDIO_BITRATE,
            start_bitrate: AUDIO_BITRATE,
            min_playout_delay: MIN_PLAYOUT_DELAY,
            max_playout_delay: MAX_PLAYOUT_DELAY,
            animated_playout_delay: DEFAULT_PLAYOUT_DELAY,
            max_frame_rate: AUDIO_FRAME_RATE,
            min_resolution: None,
            max_resolution: None,
            use_external_encoder: false,
            number_of_encode_threads: 1,
            keys,
        }
    }

    pub fn default_video_config(&self, codec: Codec, keys: EncryptionKeys) -> StreamConfig {
        StreamConfig {
            codec,
            rtp_payload_type: RtpPayloadType::for_codec(codec),
            sender_ssrc: 0,
            receiver_ssrc: None,
            rtp_timebase: VIDEO_TIMEBASE,
            channels: 1,
            min_bitrate: MIN_VIDEO_BITRATE,
            max_bitrate: MAX_VIDEO_BITRATE,
            start_bitrate: MIN_VIDEO_BITRATE,
            min_playout_delay: MIN_PLAYOUT_DELAY,
            max_playout_delay: MAX_PLAYOUT_DELAY,
            animated_playout_delay: DEFAULT_PLAYOUT_DELAY,
            max_frame_rate: MAX_FRAME_RATE,
            min_resolution: Some(MIN_RESOLUTION),
            max_resolution: Some(self.max_resolution),
            use_external_encoder: false,
            number_of_encode_threads: 1,
            keys,
        }
    }
}

fn clamp_resolution(r: Resolution) -> Resolution {
    Resolution::new(
        r.width.max(MIN_RESOLUTION.width),
        r.height.max(MIN_RESOLUTION.height),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = MirrorSettings::default();
        assert_eq!(settings.max_resolution(), Resolution::new(1920, 1080));

        let keys = EncryptionKeys::generate();
        let audio = settings.default_audio_config(Codec::AudioOpus, keys);
        assert_eq!(audio.rtp_timebase, 48_000);
        assert_eq!(audio.advertised_audio_bitrate(), 102_000);

        let video = settings.default_video_config(Codec::VideoVp8, keys);
        assert_eq!(video.max_bitrate, 5_000_000);
        assert_eq!(video.max_resolution, Some(Resolution::new(1920, 1080)));
    }

    #[test]
    fn test_resolution_is_clamped_to_minimum() {
        let mut settings = MirrorSettings::new(Resolution::new(100, 50));
        assert_eq!(settings.max_resolution(), Resolution::new(180, 180));
        settings.set_resolution_constraints(Resolution::new(1280, 720));
        assert_eq!(settings.max_resolution(), Resolution::new(1280, 720));
    }
}
