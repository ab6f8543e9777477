//! Sender side of a cast mirroring session.
//!
//! Negotiation runs over the WebRTC namespace: an OFFER listing every stream
//! the sender can produce, an ANSWER selecting at most one audio and one
//! video stream, and an optional GET_CAPABILITIES probe that enables
//! remoting. [`session::Session`] drives the whole lifecycle.

pub mod answer;
pub mod collaborators;
pub mod error;
pub mod exchange;
pub mod messages;
pub mod offer;
mod random;
pub mod remoting;
pub mod session;
pub mod settings;
pub mod setup;
pub mod stream;
pub mod workers;

#[cfg(test)]
pub(crate) mod testing;

use std::net::IpAddr;
use std::time::Duration;

pub use error::SessionError;
pub use session::{Session, SessionHandle, SessionOptions};

/// Which media kinds the session carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionType {
    AudioOnly,
    VideoOnly,
    AudioAndVideo,
}

impl SessionType {
    pub fn has_audio(self) -> bool {
        self != Self::VideoOnly
    }

    pub fn has_video(self) -> bool {
        self != Self::AudioOnly
    }
}

impl std::str::FromStr for SessionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "audio" | "audio-only" => Ok(Self::AudioOnly),
            "video" | "video-only" => Ok(Self::VideoOnly),
            "both" | "audio-and-video" => Ok(Self::AudioAndVideo),
            other => Err(format!(
                "unknown session type '{}' (expected audio, video or both)",
                other
            )),
        }
    }
}

/// Fixed for the lifetime of a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionParameters {
    pub receiver_address: IpAddr,
    pub session_type: SessionType,
    pub receiver_model_name: String,
    /// Overrides every playout delay bound when set.
    pub target_playout_delay: Option<Duration>,
}
