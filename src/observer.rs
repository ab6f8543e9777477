//! Command-line collaborators: session observation and remoting through
//! `tracing`.

use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use crate::mirroring::collaborators::{MediaRemoter, SessionObserver};
use crate::mirroring::remoting::RemotingSinkMetadata;
use crate::mirroring::stream::StreamConfig;
use crate::mirroring::SessionError;

/// Logs observer calls and remembers the last error for the exit status.
#[derive(Debug, Default)]
pub struct TracingObserver {
    last_error: Arc<Mutex<Option<SessionError>>>,
}

impl TracingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared slot updated on every `on_error`.
    pub fn errors(&self) -> Arc<Mutex<Option<SessionError>>> {
        self.last_error.clone()
    }
}

impl SessionObserver for TracingObserver {
    fn did_start(&mut self) {
        tracing::info!("Mirroring session started");
    }

    fn did_stop(&mut self) {
        tracing::info!("Mirroring session stopped");
    }

    fn on_error(&mut self, error: SessionError) {
        if error.is_negotiation_error() {
            tracing::error!("Negotiation with receiver failed ({}): {}", error.code(), error);
        } else {
            tracing::error!("Session error {}: {}", error.code(), error);
        }
        if let Ok(mut slot) = self.last_error.lock() {
            *slot = Some(error);
        }
    }

    fn log_info_message(&mut self, message: &str) {
        tracing::info!("{}", message);
    }

    fn log_error_message(&mut self, message: &str) {
        tracing::warn!("{}", message);
    }
}

/// Remoter that has no media pipeline of its own. It publishes the
/// receiver's sink metadata so the caller can decide to switch modes.
pub struct LoggingRemoter {
    sink: watch::Sender<Option<RemotingSinkMetadata>>,
}

impl LoggingRemoter {
    pub fn new() -> (Self, watch::Receiver<Option<RemotingSinkMetadata>>) {
        let (tx, rx) = watch::channel(None);
        (Self { sink: tx }, rx)
    }
}

impl MediaRemoter for LoggingRemoter {
    fn on_sink_available(&mut self, sink: RemotingSinkMetadata) {
        tracing::info!(
            "Remoting sink available: {:?} (build {:?}), audio {:?}, video {:?}",
            sink.friendly_name,
            sink.build_version,
            sink.audio_capabilities,
            sink.video_capabilities
        );
        self.sink.send_replace(Some(sink));
    }

    fn start_rpc_messaging(&mut self, audio: Option<&StreamConfig>, video: Option<&StreamConfig>) {
        tracing::info!(
            "Remoting streams ready: audio={:?} video={:?}",
            audio.map(|c| c.sender_ssrc),
            video.map(|c| c.sender_ssrc)
        );
    }

    fn on_mirroring_resumed(&mut self) {
        tracing::info!("Back to mirroring");
    }

    fn on_remoting_failed(&mut self) {
        tracing::warn!("Remoting failed, falling back to mirroring");
    }

    fn on_rpc_message(&mut self, message: &str) {
        tracing::debug!("RPC: {}", message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mirroring::remoting::VideoCapability;

    #[test]
    fn test_observer_keeps_last_error() {
        let mut observer = TracingObserver::new();
        let errors = observer.errors();
        observer.did_start();
        assert_eq!(*errors.lock().unwrap(), None);

        observer.on_error(SessionError::AnswerTimeOut);
        observer.on_error(SessionError::CastTransportError);
        assert_eq!(*errors.lock().unwrap(), Some(SessionError::CastTransportError));
    }

    #[test]
    fn test_remoter_publishes_sink() {
        let (mut remoter, rx) = LoggingRemoter::new();
        assert!(rx.borrow().is_none());

        remoter.on_sink_available(RemotingSinkMetadata {
            friendly_name: "Living Room".into(),
            video_capabilities: vec![VideoCapability::Vp8],
            ..Default::default()
        });
        let sink = rx.borrow().clone().unwrap();
        assert_eq!(sink.friendly_name, "Living Room");
        assert!(rx.has_changed().unwrap());
    }
}
