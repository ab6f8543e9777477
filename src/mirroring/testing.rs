//! Fakes shared by the session tests.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::answer::NegotiatedStreams;
use super::collaborators::{
    CaptureFeedback, CaptureProvider, CaptureStream, Collaborators, EncodedFrame, EncoderFactory,
    EncoderStatus, EventSink, FrameEncoder, MediaRemoter, RawFrame, SessionObserver, Transport,
    TransportProvider,
};
use super::error::SessionError;
use super::messages::CastMessage;
use super::offer::{Features, HardwareProfiles};
use super::remoting::RemotingSinkMetadata;
use super::session::{Session, SessionHandle, SessionOptions};
use super::settings::MirrorSettings;
use super::stream::{Codec, StreamConfig, StreamKind};
use super::{SessionParameters, SessionType};

#[derive(Debug, Clone, PartialEq)]
pub enum ObserverEvent {
    DidStart,
    DidStop,
    Error(SessionError),
    Info(String),
    ErrorLog(String),
}

pub struct RecordingObserver {
    tx: mpsc::UnboundedSender<ObserverEvent>,
}

impl SessionObserver for RecordingObserver {
    fn did_start(&mut self) {
        let _ = self.tx.send(ObserverEvent::DidStart);
    }

    fn did_stop(&mut self) {
        let _ = self.tx.send(ObserverEvent::DidStop);
    }

    fn on_error(&mut self, error: SessionError) {
        let _ = self.tx.send(ObserverEvent::Error(error));
    }

    fn log_info_message(&mut self, message: &str) {
        let _ = self.tx.send(ObserverEvent::Info(message.to_string()));
    }

    fn log_error_message(&mut self, message: &str) {
        let _ = self.tx.send(ObserverEvent::ErrorLog(message.to_string()));
    }
}

/// A collaborator call, as seen by the fakes.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    AudioStarted,
    AudioStopped,
    VideoStarted { letterbox: bool },
    VideoPaused,
    VideoResumed,
    VideoStopped,
    RefreshRequested,
    Feedback,
    EncoderCreated(Codec),
    TransportCreated(SocketAddr),
    TransportStopped,
    FrameSent(StreamKind),
    PlayoutDelay(Duration),
    SinkAvailable(RemotingSinkMetadata),
    RpcStarted {
        audio: Option<Codec>,
        video: Option<Codec>,
    },
    MirroringResumed,
    RemotingFailed,
    RpcMessage(String),
}

/// Shared log of collaborator calls plus the latest sink handed to each.
#[derive(Clone, Default)]
pub struct Recorder {
    calls: Arc<Mutex<Vec<Call>>>,
    sinks: Arc<Mutex<Vec<(&'static str, EventSink)>>>,
}

impl Recorder {
    fn push(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn keep_sink(&self, label: &'static str, sink: EventSink) {
        self.sinks.lock().unwrap().push((label, sink));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, call: &Call) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == call).count()
    }

    /// Most recent sink given to the `"audio"`, `"video"` or `"transport"` fake.
    pub fn sink(&self, label: &str) -> Option<EventSink> {
        self.sinks
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(l, _)| *l == label)
            .map(|(_, s)| s.clone())
    }
}

struct FakeCapture {
    recorder: Recorder,
    fail_audio: bool,
}

struct FakeCaptureStream {
    kind: StreamKind,
    recorder: Recorder,
}

impl CaptureProvider for FakeCapture {
    fn start_audio(&mut self, _config: &StreamConfig, sink: EventSink) -> Result<Box<dyn CaptureStream>> {
        if self.fail_audio {
            bail!("no loopback device");
        }
        self.recorder.push(Call::AudioStarted);
        self.recorder.keep_sink("audio", sink);
        Ok(Box::new(FakeCaptureStream {
            kind: StreamKind::Audio,
            recorder: self.recorder.clone(),
        }))
    }

    fn start_video(
        &mut self,
        _config: &StreamConfig,
        letterbox: bool,
        sink: EventSink,
    ) -> Result<Box<dyn CaptureStream>> {
        self.recorder.push(Call::VideoStarted { letterbox });
        self.recorder.keep_sink("video", sink);
        Ok(Box::new(FakeCaptureStream {
            kind: StreamKind::Video,
            recorder: self.recorder.clone(),
        }))
    }
}

impl CaptureStream for FakeCaptureStream {
    fn stop(&mut self) {
        self.recorder.push(match self.kind {
            StreamKind::Audio => Call::AudioStopped,
            StreamKind::Video => Call::VideoStopped,
        });
    }

    fn pause(&mut self) {
        self.recorder.push(Call::VideoPaused);
    }

    fn resume(&mut self, sink: EventSink) {
        self.recorder.push(Call::VideoResumed);
        self.recorder.keep_sink("video", sink);
    }

    fn request_refresh_frame(&mut self) {
        self.recorder.push(Call::RefreshRequested);
    }

    fn process_feedback(&mut self, _feedback: &CaptureFeedback) {
        self.recorder.push(Call::Feedback);
    }
}

struct PassThroughEncoder {
    next_frame_id: u32,
}

impl FrameEncoder for PassThroughEncoder {
    fn encode(&mut self, frame: RawFrame) -> std::result::Result<EncodedFrame, EncoderStatus> {
        let frame_id = self.next_frame_id;
        self.next_frame_id += 1;
        Ok(EncodedFrame {
            kind: frame.kind,
            frame_id,
            key_frame: frame_id == 0,
            rtp_timestamp: 0,
            data: frame.data,
        })
    }
}

struct FakeEncoders {
    recorder: Recorder,
}

impl EncoderFactory for FakeEncoders {
    fn create(
        &mut self,
        config: &StreamConfig,
    ) -> std::result::Result<Box<dyn FrameEncoder>, EncoderStatus> {
        self.recorder.push(Call::EncoderCreated(config.codec));
        Ok(Box::new(PassThroughEncoder { next_frame_id: 0 }))
    }
}

struct FakeTransports {
    recorder: Recorder,
}

struct FakeTransport {
    recorder: Recorder,
}

impl TransportProvider for FakeTransports {
    fn create(
        &mut self,
        endpoint: SocketAddr,
        _streams: &NegotiatedStreams,
        sink: EventSink,
    ) -> Result<Box<dyn Transport>> {
        self.recorder.push(Call::TransportCreated(endpoint));
        self.recorder.keep_sink("transport", sink);
        Ok(Box::new(FakeTransport {
            recorder: self.recorder.clone(),
        }))
    }
}

impl Transport for FakeTransport {
    fn send_frame(&mut self, frame: EncodedFrame) {
        self.recorder.push(Call::FrameSent(frame.kind));
    }

    fn set_target_playout_delay(&mut self, delay: Duration) {
        self.recorder.push(Call::PlayoutDelay(delay));
    }

    fn stop(&mut self) {
        self.recorder.push(Call::TransportStopped);
    }
}

struct FakeRemoter {
    recorder: Recorder,
}

impl MediaRemoter for FakeRemoter {
    fn on_sink_available(&mut self, sink: RemotingSinkMetadata) {
        self.recorder.push(Call::SinkAvailable(sink));
    }

    fn start_rpc_messaging(&mut self, audio: Option<&StreamConfig>, video: Option<&StreamConfig>) {
        self.recorder.push(Call::RpcStarted {
            audio: audio.map(|c| c.codec),
            video: video.map(|c| c.codec),
        });
    }

    fn on_mirroring_resumed(&mut self) {
        self.recorder.push(Call::MirroringResumed);
    }

    fn on_remoting_failed(&mut self) {
        self.recorder.push(Call::RemotingFailed);
    }

    fn on_rpc_message(&mut self, message: &str) {
        self.recorder.push(Call::RpcMessage(message.to_string()));
    }
}

pub struct HarnessBuilder {
    model: String,
    session_type: SessionType,
    hardware: HardwareProfiles,
    features: Features,
    fail_audio_capture: bool,
}

impl HarnessBuilder {
    pub fn model(mut self, model: &str) -> Self {
        self.model = model.to_string();
        self
    }

    pub fn session_type(mut self, session_type: SessionType) -> Self {
        self.session_type = session_type;
        self
    }

    pub fn h264(mut self) -> Self {
        self.hardware.h264 = true;
        self
    }

    pub fn force_remoting_query(mut self) -> Self {
        self.features.force_remoting_query = true;
        self
    }

    pub fn fail_audio_capture(mut self) -> Self {
        self.fail_audio_capture = true;
        self
    }

    /// Build the session and spawn its loop on the current runtime.
    pub fn spawn(self) -> Harness {
        let recorder = Recorder::default();
        let (observer_tx, observer_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::channel(16);

        let collaborators = Collaborators {
            observer: Box::new(RecordingObserver { tx: observer_tx }),
            capture: Box::new(FakeCapture {
                recorder: recorder.clone(),
                fail_audio: self.fail_audio_capture,
            }),
            encoders: Box::new(FakeEncoders {
                recorder: recorder.clone(),
            }),
            transport: Box::new(FakeTransports {
                recorder: recorder.clone(),
            }),
            remoter: Box::new(FakeRemoter {
                recorder: recorder.clone(),
            }),
        };
        let params = SessionParameters {
            receiver_address: IpAddr::V4(Ipv4Addr::new(192, 168, 1, 50)),
            session_type: self.session_type,
            receiver_model_name: self.model,
            target_playout_delay: None,
        };
        let options = SessionOptions {
            hardware: self.hardware,
            features: self.features,
            query_receiver_setup: false,
            ..SessionOptions::default()
        };

        let (session, handle) = Session::new(
            params,
            MirrorSettings::default(),
            options,
            collaborators,
            outbound_tx,
        );
        let task = tokio::spawn(session.run());

        Harness {
            handle,
            outbound: outbound_rx,
            observer: observer_rx,
            recorder,
            _task: task,
        }
    }
}

pub struct Harness {
    pub handle: SessionHandle,
    pub outbound: mpsc::Receiver<CastMessage>,
    pub observer: mpsc::UnboundedReceiver<ObserverEvent>,
    pub recorder: Recorder,
    _task: JoinHandle<()>,
}

impl Harness {
    pub fn builder() -> HarnessBuilder {
        HarnessBuilder {
            model: "Nest Hub".to_string(),
            session_type: SessionType::AudioAndVideo,
            hardware: HardwareProfiles::default(),
            features: Features::default(),
            fail_audio_capture: false,
        }
    }

    /// Next message the session sent to the receiver, as JSON.
    pub async fn next_request(&mut self) -> Value {
        let message = self.outbound.recv().await.expect("outbound channel closed");
        serde_json::from_str(&message.data).expect("outbound message is JSON")
    }

    pub fn try_next_request(&mut self) -> Option<Value> {
        self.outbound
            .try_recv()
            .ok()
            .and_then(|m| serde_json::from_str(&m.data).ok())
    }

    pub async fn observer_event(&mut self) -> ObserverEvent {
        self.observer.recv().await.expect("observer dropped")
    }

    pub fn reply(&self, body: Value) {
        self.handle.on_message(CastMessage::webrtc(&body));
    }

    /// Answer `offer`, selecting `indexes`.
    pub fn answer(&self, offer: &Value, indexes: &[i32]) {
        let ssrcs: Vec<u32> = indexes.iter().map(|i| 9000 + *i as u32).collect();
        self.reply(json!({
            "type": "ANSWER",
            "seqNum": offer["seqNum"],
            "result": "ok",
            "answer": {
                "castMode": offer["offer"]["castMode"],
                "udpPort": 50000,
                "sendIndexes": indexes,
                "ssrcs": ssrcs,
            },
        }));
    }

    pub fn capabilities(&self, request: &Value, capabilities: Value) {
        self.reply(json!({
            "type": "CAPABILITIES_RESPONSE",
            "seqNum": request["seqNum"],
            "result": "ok",
            "capabilities": capabilities,
        }));
    }

    /// Let the session loop drain its queue.
    pub async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
