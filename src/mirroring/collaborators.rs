//! Seams between the session core and the media stack.
//!
//! Capture, encode, transport, remoting and observation each sit behind a
//! small trait. Collaborators never call back into the session directly:
//! they post events through an [`EventSink`], which tags every event with
//! the negotiation epoch it belongs to so the session can drop stale ones.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;

use super::answer::NegotiatedStreams;
use super::error::SessionError;
use super::remoting::RemotingSinkMetadata;
use super::session::SessionEvent;
use super::stream::{StreamConfig, StreamKind};

/// A captured audio buffer or video frame, before encoding.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    pub kind: StreamKind,
    /// Time since capture started.
    pub timestamp: Duration,
    /// Interleaved i16 samples (audio) or I420 pixels (video).
    pub data: Vec<u8>,
    /// Video only.
    pub width: u32,
    /// Video only.
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    pub kind: StreamKind,
    pub frame_id: u32,
    pub key_frame: bool,
    pub rtp_timestamp: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStatus {
    Uninitialized,
    Initialized,
    InvalidCryptoConfig,
    SocketError,
}

impl TransportStatus {
    pub fn is_error(self) -> bool {
        matches!(self, Self::InvalidCryptoConfig | Self::SocketError)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderStatus {
    Uninitialized,
    Initialized,
    CodecReinitPending,
    InvalidConfiguration,
    UnsupportedCodec,
    CodecInitFailed,
    CodecRuntimeError,
}

impl EncoderStatus {
    pub fn is_error(self) -> bool {
        matches!(
            self,
            Self::InvalidConfiguration
                | Self::UnsupportedCodec
                | Self::CodecInitFailed
                | Self::CodecRuntimeError
        )
    }
}

/// Media pipeline load report used to adapt capture.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptureFeedback {
    /// 0.0 idle, 1.0 fully loaded.
    pub resource_utilization: f64,
    /// Largest frame the encoder currently wants, if limited.
    pub max_pixels: Option<u64>,
}

/// Everything a collaborator can report back to the session.
#[derive(Debug, Clone, PartialEq)]
pub enum MediaEvent {
    Captured(RawFrame),
    CaptureError(StreamKind, String),
    Encoded(EncodedFrame),
    EncoderStatus(StreamKind, EncoderStatus),
    TransportStatus(TransportStatus),
    RtpStreamError(String),
    TargetPlayoutDelay(Duration),
    Feedback(CaptureFeedback),
    Log(String),
}

/// Handle collaborators use to post events into the session loop.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<SessionEvent>,
    epoch: u64,
}

impl EventSink {
    pub(crate) fn new(tx: mpsc::UnboundedSender<SessionEvent>, epoch: u64) -> Self {
        Self { tx, epoch }
    }

    /// Post an event. Returns false once the session is gone.
    pub fn post(&self, event: MediaEvent) -> bool {
        self.tx
            .send(SessionEvent::Media {
                epoch: self.epoch,
                event,
            })
            .is_ok()
    }

    pub fn captured(&self, frame: RawFrame) -> bool {
        self.post(MediaEvent::Captured(frame))
    }

    pub fn capture_error(&self, kind: StreamKind, message: impl Into<String>) -> bool {
        self.post(MediaEvent::CaptureError(kind, message.into()))
    }

    pub fn encoded(&self, frame: EncodedFrame) -> bool {
        self.post(MediaEvent::Encoded(frame))
    }

    pub fn encoder_status(&self, kind: StreamKind, status: EncoderStatus) -> bool {
        self.post(MediaEvent::EncoderStatus(kind, status))
    }

    pub fn transport_status(&self, status: TransportStatus) -> bool {
        self.post(MediaEvent::TransportStatus(status))
    }

    pub fn rtp_stream_error(&self, message: impl Into<String>) -> bool {
        self.post(MediaEvent::RtpStreamError(message.into()))
    }

    pub fn target_playout_delay(&self, delay: Duration) -> bool {
        self.post(MediaEvent::TargetPlayoutDelay(delay))
    }

    pub fn feedback(&self, feedback: CaptureFeedback) -> bool {
        self.post(MediaEvent::Feedback(feedback))
    }

    pub fn log(&self, message: impl Into<String>) -> bool {
        self.post(MediaEvent::Log(message.into()))
    }
}

/// The session's only outward API surface besides wire messages.
pub trait SessionObserver: Send {
    fn did_start(&mut self);
    fn did_stop(&mut self);
    fn on_error(&mut self, error: SessionError);
    fn log_info_message(&mut self, message: &str);
    fn log_error_message(&mut self, message: &str);
}

/// A running capture source.
pub trait CaptureStream: Send {
    fn stop(&mut self);
    /// Stop delivering frames but keep the device open.
    fn pause(&mut self);
    /// Deliver frames again, now to `sink`.
    fn resume(&mut self, sink: EventSink);
    fn request_refresh_frame(&mut self) {}
    fn process_feedback(&mut self, _feedback: &CaptureFeedback) {}
}

pub trait CaptureProvider: Send {
    fn start_audio(&mut self, config: &StreamConfig, sink: EventSink)
        -> Result<Box<dyn CaptureStream>>;

    fn start_video(
        &mut self,
        config: &StreamConfig,
        letterbox: bool,
        sink: EventSink,
    ) -> Result<Box<dyn CaptureStream>>;
}

/// One encoder instance, owned by an encode worker thread.
pub trait FrameEncoder: Send {
    fn encode(&mut self, frame: RawFrame) -> std::result::Result<EncodedFrame, EncoderStatus>;
    fn request_key_frame(&mut self) {}
}

pub trait EncoderFactory: Send {
    fn create(
        &mut self,
        config: &StreamConfig,
    ) -> std::result::Result<Box<dyn FrameEncoder>, EncoderStatus>;
}

/// Sends encoded frames to the receiver.
pub trait Transport: Send {
    fn send_frame(&mut self, frame: EncodedFrame);
    fn set_target_playout_delay(&mut self, delay: Duration);
    fn stop(&mut self);
}

pub trait TransportProvider: Send {
    fn create(
        &mut self,
        endpoint: SocketAddr,
        streams: &NegotiatedStreams,
        sink: EventSink,
    ) -> Result<Box<dyn Transport>>;
}

/// Renderer-controller side of remoting.
pub trait MediaRemoter: Send {
    fn on_sink_available(&mut self, sink: RemotingSinkMetadata);
    fn start_rpc_messaging(&mut self, audio: Option<&StreamConfig>, video: Option<&StreamConfig>);
    fn on_mirroring_resumed(&mut self);
    fn on_remoting_failed(&mut self);
    fn on_rpc_message(&mut self, _message: &str) {}
}

/// The full set of collaborators a session runs against.
pub struct Collaborators {
    pub observer: Box<dyn SessionObserver>,
    pub capture: Box<dyn CaptureProvider>,
    pub encoders: Box<dyn EncoderFactory>,
    pub transport: Box<dyn TransportProvider>,
    pub remoter: Box<dyn MediaRemoter>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(TransportStatus::SocketError.is_error());
        assert!(TransportStatus::InvalidCryptoConfig.is_error());
        assert!(!TransportStatus::Initialized.is_error());

        assert!(EncoderStatus::CodecRuntimeError.is_error());
        assert!(EncoderStatus::UnsupportedCodec.is_error());
        assert!(!EncoderStatus::CodecReinitPending.is_error());
        assert!(!EncoderStatus::Uninitialized.is_error());
    }

    #[test]
    fn test_sink_tags_epoch() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(tx, 7);
        assert!(sink.log("hello"));
        match rx.try_recv().unwrap() {
            SessionEvent::Media { epoch, event } => {
                assert_eq!(epoch, 7);
                assert_eq!(event, MediaEvent::Log("hello".into()));
            }
            other => panic!("unexpected event {:?}", other),
        }
        drop(rx);
        assert!(!sink.target_playout_delay(Duration::from_millis(100)));
    }
}
