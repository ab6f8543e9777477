//! Mirroring session lifecycle: negotiation, streaming, remoting upgrade
//! and shutdown.
//!
//! A [`Session`] runs as a single tokio task. All state lives on that task;
//! the outside world talks to it through a [`SessionHandle`], and
//! collaborators talk to it through [`EventSink`]s. Every negotiation bumps
//! an epoch counter, and events tagged with an older epoch are dropped, so
//! late callbacks from torn-down streams never reach live state.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use super::answer::{AnswerNegotiator, NegotiatedStreams};
use super::collaborators::{
    CaptureProvider, CaptureStream, Collaborators, EncoderFactory, EventSink, MediaEvent,
    MediaRemoter, SessionObserver, Transport, TransportProvider,
};
use super::error::SessionError;
use super::exchange::MessageExchange;
use super::messages::{
    get_capabilities_message, offer_message, CastMessage, ReceiverResponse, ResponseType,
};
use super::offer::{CastMode, Features, HardwareProfiles, Offer, OfferBuilder};
use super::remoting::{self, ProbeOutcome, RemotingSinkMetadata, SUPPORTED_REMOTING_VERSION};
use super::settings::MirrorSettings;
use super::setup::{ReceiverSetupInfo, ReceiverSetupQuerier};
use super::stream::{StreamConfig, StreamKind};
use super::workers::{EncodeWorker, DEFAULT_QUEUE_DEPTH};
use super::SessionParameters;

pub const OFFER_ANSWER_TIMEOUT: Duration = Duration::from_secs(15);
pub const CAPABILITIES_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Mirroring,
    Remoting,
    Stopped,
}

/// Session knobs fixed at construction.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub hardware: HardwareProfiles,
    pub features: Features,
    pub offer_answer_timeout: Duration,
    pub capabilities_timeout: Duration,
    pub encode_queue_depth: usize,
    /// Fetch the receiver's name and build over HTTP on start.
    pub query_receiver_setup: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            hardware: HardwareProfiles::default(),
            features: Features::default(),
            offer_answer_timeout: OFFER_ANSWER_TIMEOUT,
            capabilities_timeout: CAPABILITIES_TIMEOUT,
            encode_queue_depth: DEFAULT_QUEUE_DEPTH,
            query_receiver_setup: true,
        }
    }
}

#[derive(Debug)]
pub enum Command {
    Stop,
    RequestRemoting,
    RemotingStopped,
    Message(CastMessage),
    RequestRefreshFrame,
}

/// Everything the session loop consumes.
#[derive(Debug)]
pub enum SessionEvent {
    Command(Command),
    Answer {
        epoch: u64,
        response: ReceiverResponse,
    },
    Capabilities(ReceiverResponse),
    Setup(ReceiverSetupInfo),
    ParseError(String),
    Media {
        epoch: u64,
        event: MediaEvent,
    },
}

/// Cloneable command surface for a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<SessionEvent>,
    state: watch::Receiver<SessionState>,
}

impl SessionHandle {
    fn command(&self, command: Command) {
        if self.tx.send(SessionEvent::Command(command)).is_err() {
            tracing::debug!("Session already gone");
        }
    }

    pub fn stop(&self) {
        self.command(Command::Stop);
    }

    pub fn request_remoting(&self) {
        self.command(Command::RequestRemoting);
    }

    /// The remoting source finished; go back to mirroring.
    pub fn remoting_stopped(&self) {
        self.command(Command::RemotingStopped);
    }

    /// Deliver an inbound cast message.
    pub fn on_message(&self, message: CastMessage) {
        self.command(Command::Message(message));
    }

    pub fn request_refresh_frame(&self) {
        self.command(Command::RequestRefreshFrame);
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Wait until the session reaches `Stopped` (or its task is gone).
    pub async fn stopped(&self) {
        let mut state = self.state.clone();
        while *state.borrow_and_update() != SessionState::Stopped {
            if state.changed().await.is_err() {
                return;
            }
        }
    }
}

pub struct Session {
    params: SessionParameters,
    settings: MirrorSettings,
    options: SessionOptions,

    observer: Option<Box<dyn SessionObserver>>,
    capture: Box<dyn CaptureProvider>,
    encoders: Box<dyn EncoderFactory>,
    transports: Box<dyn TransportProvider>,
    remoter: Option<Box<dyn MediaRemoter>>,
    exchange: Option<MessageExchange>,

    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
    state_tx: watch::Sender<SessionState>,
    state: SessionState,
    epoch: u64,

    offer: Option<Offer>,
    pending_offer: Option<i32>,
    transport: Option<Box<dyn Transport>>,
    audio_capture: Option<Box<dyn CaptureStream>>,
    /// Survives renegotiation: paused for remoting, resumed after.
    video_capture: Option<Box<dyn CaptureStream>>,
    audio_worker: Option<EncodeWorker>,
    video_worker: Option<EncodeWorker>,

    started: bool,
    probe_sent: bool,
    remoting_sink: Option<RemotingSinkMetadata>,
    remoting_disabled: bool,
    setup_info: ReceiverSetupInfo,
}

impl Session {
    /// Create a session. Nothing happens until [`run`](Self::run) is polled.
    pub fn new(
        params: SessionParameters,
        settings: MirrorSettings,
        options: SessionOptions,
        collaborators: Collaborators,
        outbound: mpsc::Sender<CastMessage>,
    ) -> (Self, SessionHandle) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Mirroring);

        let parse_errors = events_tx.clone();
        let exchange = MessageExchange::new(
            outbound,
            Box::new(move |e| {
                let _ = parse_errors.send(SessionEvent::ParseError(e));
            }),
        );

        let handle = SessionHandle {
            tx: events_tx.clone(),
            state: state_rx,
        };

        let session = Self {
            params,
            settings,
            options,
            observer: Some(collaborators.observer),
            capture: collaborators.capture,
            encoders: collaborators.encoders,
            transports: collaborators.transport,
            remoter: Some(collaborators.remoter),
            exchange: Some(exchange),
            events_tx,
            events_rx,
            state_tx,
            state: SessionState::Mirroring,
            epoch: 0,
            offer: None,
            pending_offer: None,
            transport: None,
            audio_capture: None,
            video_capture: None,
            audio_worker: None,
            video_worker: None,
            started: false,
            probe_sent: false,
            remoting_sink: None,
            remoting_disabled: false,
            setup_info: ReceiverSetupInfo::default(),
        };
        (session, handle)
    }

    /// Run the session until it stops.
    pub async fn run(mut self) {
        self.start();
        while self.state != SessionState::Stopped {
            let Some(event) = self.events_rx.recv().await else {
                break;
            };
            self.handle_event(event);
        }
        tracing::debug!("Session loop exited");
    }

    fn start(&mut self) {
        tracing::info!(
            "Starting session with {} ({}), {:?}",
            self.params.receiver_address,
            self.params.receiver_model_name,
            self.params.session_type
        );
        if self.options.query_receiver_setup {
            let querier = ReceiverSetupQuerier::new(self.params.receiver_address);
            let tx = self.events_tx.clone();
            tokio::spawn(async move {
                let info = querier.query_or_default().await;
                let _ = tx.send(SessionEvent::Setup(info));
            });
        }
        self.send_offer();
    }

    fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Command(command) => self.handle_command(command),
            SessionEvent::Answer { epoch, response } => {
                if epoch == self.epoch {
                    self.on_answer(response);
                } else {
                    tracing::debug!("Dropping ANSWER from stale epoch {}", epoch);
                }
            }
            SessionEvent::Capabilities(response) => self.on_capabilities_response(response),
            SessionEvent::Setup(info) => self.setup_info = info,
            SessionEvent::ParseError(e) => {
                self.log_error(&format!("MessageDispatcher error: {}", e));
            }
            SessionEvent::Media { epoch, event } => {
                if epoch == self.epoch {
                    self.on_media_event(event);
                } else {
                    tracing::trace!("Dropping media event from stale epoch {}", epoch);
                }
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Stop => self.stop_session(),
            Command::RequestRemoting => self.request_remoting(),
            Command::RemotingStopped => self.restart_mirroring(),
            Command::Message(message) => self.on_message(message),
            Command::RequestRefreshFrame => {
                if let Some(capture) = self.video_capture.as_mut() {
                    capture.request_refresh_frame();
                }
                if let Some(worker) = &self.video_worker {
                    worker.request_key_frame();
                }
            }
        }
    }

    fn on_message(&mut self, message: CastMessage) {
        let Some(exchange) = &self.exchange else {
            return;
        };
        let Some(unsolicited) = exchange.on_message(&message) else {
            return;
        };
        if unsolicited.response_type() == ResponseType::Rpc {
            if let (Some(rpc), Some(remoter)) = (unsolicited.rpc(), self.remoter.as_mut()) {
                remoter.on_rpc_message(rpc);
            }
        }
    }

    fn send_offer(&mut self) {
        let mode = match self.state {
            SessionState::Mirroring => CastMode::Mirroring,
            SessionState::Remoting => CastMode::Remoting,
            SessionState::Stopped => return,
        };
        let built = OfferBuilder::new(
            &self.params,
            &self.settings,
            self.options.hardware,
            self.options.features,
        )
        .build(mode);
        let offer = match built {
            Ok(offer) => offer,
            Err(e) => {
                self.report_error(e);
                return;
            }
        };

        let Some(exchange) = self.exchange.as_mut() else {
            return;
        };
        if let Some(previous) = self.pending_offer.take() {
            exchange.cancel(previous);
        }

        let sequence_number = exchange.next_sequence_number();
        let tx = self.events_tx.clone();
        let epoch = self.epoch;
        exchange.request_reply(
            offer_message(sequence_number, offer.document.clone()),
            ResponseType::Answer,
            sequence_number,
            self.options.offer_answer_timeout,
            Box::new(move |response| {
                let _ = tx.send(SessionEvent::Answer { epoch, response });
            }),
        );
        tracing::info!(
            "Sent {:?} OFFER seqNum={} with {} stream(s)",
            mode,
            sequence_number,
            offer.stream_count()
        );
        self.pending_offer = Some(sequence_number);
        self.offer = Some(offer);
    }

    fn on_answer(&mut self, response: ReceiverResponse) {
        if self.state == SessionState::Stopped {
            return;
        }
        self.pending_offer = None;
        let Some(offer) = self.offer.take() else {
            return;
        };

        if let Some(error) = response.error() {
            self.log_error(&format!(
                "Receiver rejected OFFER. Error code: {}, description: {}",
                error.code, error.description
            ));
        }

        let negotiated = AnswerNegotiator::new(&offer.audio_configs, &offer.video_configs)
            .negotiate(&response, &mut self.settings);
        match negotiated {
            Ok(streams) => self.start_streaming(streams),
            Err(e) => self.report_error(e),
        }
    }

    fn start_streaming(&mut self, streams: NegotiatedStreams) {
        let initially_starting = !self.started;
        if initially_starting {
            if let Err(e) = self.create_workers() {
                tracing::error!("Failed to start encode threads: {}", e);
                self.report_error(SessionError::EncodingError);
                return;
            }
        }

        let sink = self.sink();
        let endpoint = SocketAddr::new(self.params.receiver_address, streams.udp_port);
        match self.transports.create(endpoint, &streams, sink.clone()) {
            Ok(transport) => self.transport = Some(transport),
            Err(e) => {
                tracing::warn!("Failed to create transport to {}: {:#}", endpoint, e);
                self.report_error(SessionError::CastTransportError);
                return;
            }
        }

        match self.state {
            SessionState::Remoting => {
                if let Some(remoter) = self.remoter.as_mut() {
                    remoter.start_rpc_messaging(streams.audio.as_ref(), streams.video.as_ref());
                }
            }
            SessionState::Mirroring => {
                if let Err(e) = self.start_mirroring_streams(&streams, &sink) {
                    self.report_error(e);
                    return;
                }
                if self.remoting_sink.is_some() {
                    if let Some(remoter) = self.remoter.as_mut() {
                        remoter.on_mirroring_resumed();
                    }
                }
            }
            SessionState::Stopped => return,
        }

        if initially_starting {
            self.started = true;
            if remoting::should_query(&self.params.receiver_model_name, self.options.features) {
                self.query_capabilities();
            }
            if let Some(observer) = self.observer.as_mut() {
                observer.did_start();
            }
        }
    }

    fn start_mirroring_streams(
        &mut self,
        streams: &NegotiatedStreams,
        sink: &EventSink,
    ) -> Result<(), SessionError> {
        if let Some(audio) = &streams.audio {
            self.configure_encoder(audio, sink)?;
            let capture = self.capture.start_audio(audio, sink.clone()).map_err(|e| {
                tracing::warn!("Audio capture failed to start: {:#}", e);
                SessionError::AudioCaptureError
            })?;
            self.audio_capture = Some(capture);
        }

        if let Some(video) = &streams.video {
            self.configure_encoder(video, sink)?;
            match self.video_capture.as_mut() {
                Some(capture) => capture.resume(sink.clone()),
                None => {
                    let capture = self
                        .capture
                        .start_video(video, streams.sender_side_letterboxing, sink.clone())
                        .map_err(|e| {
                            tracing::warn!("Video capture failed to start: {:#}", e);
                            SessionError::VideoCaptureError
                        })?;
                    self.video_capture = Some(capture);
                }
            }
        }
        Ok(())
    }

    fn configure_encoder(
        &mut self,
        config: &StreamConfig,
        sink: &EventSink,
    ) -> Result<(), SessionError> {
        let worker = match config.kind() {
            StreamKind::Audio => self.audio_worker.as_ref(),
            StreamKind::Video => self.video_worker.as_ref(),
        };
        let Some(worker) = worker else {
            return Ok(());
        };
        let encoder = self.encoders.create(config).map_err(|status| {
            tracing::warn!("No {} encoder: {:?}", config.codec.wire_name(), status);
            SessionError::EncodingError
        })?;
        worker.configure(encoder, sink.clone());
        Ok(())
    }

    fn create_workers(&mut self) -> std::io::Result<()> {
        let depth = self.options.encode_queue_depth;
        if self.params.session_type.has_audio() {
            self.audio_worker = Some(EncodeWorker::spawn(StreamKind::Audio, depth)?);
        }
        if self.params.session_type.has_video() {
            self.video_worker = Some(EncodeWorker::spawn(StreamKind::Video, depth)?);
        }
        Ok(())
    }

    fn sink(&self) -> EventSink {
        EventSink::new(self.events_tx.clone(), self.epoch)
    }

    fn on_media_event(&mut self, event: MediaEvent) {
        match event {
            MediaEvent::Captured(frame) => {
                if self.state != SessionState::Mirroring {
                    return;
                }
                let worker = match frame.kind {
                    StreamKind::Audio => self.audio_worker.as_ref(),
                    StreamKind::Video => self.video_worker.as_ref(),
                };
                if let Some(worker) = worker {
                    worker.encode(frame);
                }
            }
            MediaEvent::CaptureError(kind, message) => {
                tracing::warn!("{} capture error: {}", kind, message);
                self.report_error(match kind {
                    StreamKind::Audio => SessionError::AudioCaptureError,
                    StreamKind::Video => SessionError::VideoCaptureError,
                });
            }
            MediaEvent::Encoded(frame) => {
                if let Some(transport) = self.transport.as_mut() {
                    transport.send_frame(frame);
                }
            }
            MediaEvent::EncoderStatus(kind, status) => {
                tracing::debug!("{} encoder status: {:?}", kind, status);
                if status.is_error() {
                    self.report_error(SessionError::EncodingError);
                }
            }
            MediaEvent::TransportStatus(status) => {
                tracing::debug!("Transport status: {:?}", status);
                if status.is_error() {
                    self.report_error(SessionError::CastTransportError);
                }
            }
            MediaEvent::RtpStreamError(message) => {
                self.log_error(&message);
                self.report_error(SessionError::RtpStreamError);
            }
            MediaEvent::TargetPlayoutDelay(delay) => {
                if let Some(transport) = self.transport.as_mut() {
                    transport.set_target_playout_delay(delay);
                }
            }
            MediaEvent::Feedback(feedback) => {
                if let Some(capture) = self.video_capture.as_mut() {
                    capture.process_feedback(&feedback);
                }
            }
            MediaEvent::Log(message) => self.log_info(&message),
        }
    }

    fn query_capabilities(&mut self) {
        if self.probe_sent {
            return;
        }
        let Some(exchange) = self.exchange.as_mut() else {
            return;
        };
        self.probe_sent = true;
        let sequence_number = exchange.next_sequence_number();
        let tx = self.events_tx.clone();
        exchange.request_reply(
            get_capabilities_message(sequence_number),
            ResponseType::CapabilitiesResponse,
            sequence_number,
            self.options.capabilities_timeout,
            Box::new(move |response| {
                let _ = tx.send(SessionEvent::Capabilities(response));
            }),
        );
    }

    fn on_capabilities_response(&mut self, response: ReceiverResponse) {
        if self.state == SessionState::Stopped {
            return;
        }
        let outcome = remoting::evaluate(
            &response,
            &self.params.receiver_model_name,
            &self.setup_info.friendly_name,
            &self.setup_info.build_version,
        );
        match outcome {
            ProbeOutcome::Sink(sink) => {
                self.log_info("Remoting is supported by the receiver.");
                self.remoting_sink = Some(sink.clone());
                if let Some(remoter) = self.remoter.as_mut() {
                    remoter.on_sink_available(sink);
                }
            }
            ProbeOutcome::Unsupported(message) => self.log_error(&message),
            ProbeOutcome::VersionTooNew(version) => {
                self.remoting_disabled = true;
                self.log_error(&format!(
                    "Remoting is not supported. The receiver's remoting version ({}) \
                     is not supported by the sender ({}).",
                    version, SUPPORTED_REMOTING_VERSION
                ));
            }
        }
    }

    fn request_remoting(&mut self) {
        if self.state != SessionState::Mirroring {
            tracing::warn!("Ignoring remoting request in state {:?}", self.state);
            return;
        }
        if self.remoting_sink.is_none() || self.remoting_disabled {
            tracing::warn!("Ignoring remoting request: receiver does not support remoting");
            return;
        }
        tracing::info!("Switching to remoting");
        if let Some(capture) = self.video_capture.as_mut() {
            capture.pause();
        }
        self.stop_streaming();
        self.set_state(SessionState::Remoting);
        self.send_offer();
    }

    fn restart_mirroring(&mut self) {
        if self.state != SessionState::Remoting {
            return;
        }
        tracing::info!("Restarting mirroring");
        self.stop_streaming();
        self.set_state(SessionState::Mirroring);
        self.send_offer();
    }

    fn report_error(&mut self, error: SessionError) {
        match self.state {
            SessionState::Stopped => {}
            SessionState::Remoting => {
                tracing::warn!("Remoting failed ({}), falling back to mirroring", error);
                if let Some(remoter) = self.remoter.as_mut() {
                    remoter.on_remoting_failed();
                }
                self.restart_mirroring();
            }
            SessionState::Mirroring => {
                tracing::error!("Session error {}: {}", error.code(), error);
                if let Some(observer) = self.observer.as_mut() {
                    observer.on_error(error);
                }
                self.stop_session();
            }
        }
    }

    /// Tear down the current negotiation's transport, audio and encoders.
    fn stop_streaming(&mut self) {
        self.epoch += 1;
        if let Some(mut capture) = self.audio_capture.take() {
            capture.stop();
        }
        for worker in [&self.audio_worker, &self.video_worker].into_iter().flatten() {
            worker.reset();
        }
        if let Some(mut transport) = self.transport.take() {
            transport.stop();
        }
    }

    fn stop_session(&mut self) {
        if self.state == SessionState::Stopped {
            return;
        }
        tracing::info!("Stopping session");
        self.set_state(SessionState::Stopped);
        self.stop_streaming();
        self.pending_offer = None;
        self.offer = None;
        if let Some(mut capture) = self.video_capture.take() {
            capture.stop();
        }
        self.remoter = None;
        if let Some(exchange) = self.exchange.take() {
            exchange.cancel_all();
        }
        self.audio_worker = None;
        self.video_worker = None;
        if let Some(mut observer) = self.observer.take() {
            observer.did_stop();
        }
    }

    fn set_state(&mut self, state: SessionState) {
        tracing::debug!("Session state {:?} -> {:?}", self.state, state);
        self.state = state;
        self.state_tx.send_replace(state);
    }

    fn log_info(&mut self, message: &str) {
        if let Some(observer) = self.observer.as_mut() {
            observer.log_info_message(message);
        }
    }

    fn log_error(&mut self, message: &str) {
        if let Some(observer) = self.observer.as_mut() {
            observer.log_error_message(message);
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop_session();
    }
}
