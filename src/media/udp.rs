//! UDP transport: encrypts, packetizes and sends encoded frames.
//!
//! One socket per negotiation, bound to an ephemeral port. Frames are
//! handed to a send task through a bounded queue; socket failures are
//! reported back to the session as `TransportStatus::SocketError`, and
//! queue pressure as capture feedback.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::crypto::FrameCipher;
use super::rtp::Packetizer;
use crate::mirroring::answer::NegotiatedStreams;
use crate::mirroring::collaborators::{
    CaptureFeedback, EncodedFrame, EventSink, Transport, TransportProvider, TransportStatus,
};
use crate::mirroring::stream::{StreamConfig, StreamKind};

const SEND_QUEUE_DEPTH: usize = 64;
/// Send queue fill ratios that start and end a congestion report.
const CONGESTED_AT: f64 = 0.8;
const RECOVERED_AT: f64 = 0.25;

struct StreamSender {
    kind: StreamKind,
    cipher: FrameCipher,
    packetizer: Packetizer,
}

impl StreamSender {
    fn new(config: &StreamConfig) -> Self {
        Self {
            kind: config.kind(),
            cipher: FrameCipher::new(&config.keys),
            packetizer: Packetizer::new(config.rtp_payload_type.wire_value(), config.sender_ssrc),
        }
    }
}

#[derive(Debug, Default)]
pub struct UdpStats {
    pub frames_sent: u64,
    pub packets_sent: u64,
    pub bytes_sent: u64,
}

/// Creates a [`UdpTransport`] per negotiation.
#[derive(Debug, Default)]
pub struct UdpTransportProvider;

impl TransportProvider for UdpTransportProvider {
    fn create(
        &mut self,
        endpoint: SocketAddr,
        streams: &NegotiatedStreams,
        sink: EventSink,
    ) -> Result<Box<dyn Transport>> {
        let transport = UdpTransport::start(endpoint, streams, sink)?;
        Ok(Box::new(transport))
    }
}

pub struct UdpTransport {
    frames: mpsc::Sender<EncodedFrame>,
    playout_delay: watch::Sender<Option<Duration>>,
    sink: EventSink,
    congested: bool,
    send_handle: Option<JoinHandle<()>>,
}

impl UdpTransport {
    /// Bind a socket and start the send task. Must run inside a tokio runtime.
    pub fn start(endpoint: SocketAddr, streams: &NegotiatedStreams, sink: EventSink) -> Result<Self> {
        let bind_addr = match endpoint {
            SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
        };
        let std_socket = std::net::UdpSocket::bind(bind_addr)
            .with_context(|| format!("Failed to bind UDP socket on {}", bind_addr))?;
        std_socket
            .set_nonblocking(true)
            .context("Failed to make UDP socket non-blocking")?;
        let socket = UdpSocket::from_std(std_socket).context("Failed to register UDP socket")?;
        tracing::info!(
            "Cast transport bound to {}, receiver: {}",
            socket.local_addr()?,
            endpoint
        );

        let senders: Vec<StreamSender> = streams
            .audio
            .iter()
            .chain(streams.video.iter())
            .map(StreamSender::new)
            .collect();

        let (tx, rx) = mpsc::channel(SEND_QUEUE_DEPTH);
        let (delay_tx, delay_rx) = watch::channel(None);
        if senders.iter().any(|s| !s.cipher.is_valid()) {
            sink.transport_status(TransportStatus::InvalidCryptoConfig);
        } else {
            sink.transport_status(TransportStatus::Initialized);
        }
        let send_handle = tokio::spawn(send_loop(
            socket,
            endpoint,
            senders,
            rx,
            delay_rx,
            sink.clone(),
        ));

        Ok(Self {
            frames: tx,
            playout_delay: delay_tx,
            sink,
            congested: false,
            send_handle: Some(send_handle),
        })
    }

    /// Report send queue pressure when it crosses a watermark.
    fn report_load(&mut self) {
        let depth = self.frames.max_capacity();
        let queued = depth - self.frames.capacity();
        let utilization = queued as f64 / depth as f64;
        let congested = if self.congested {
            utilization > RECOVERED_AT
        } else {
            utilization >= CONGESTED_AT
        };
        if congested == self.congested {
            return;
        }
        self.congested = congested;
        tracing::debug!(
            "Cast transport {}: {}/{} frames queued",
            if congested { "congested" } else { "recovered" },
            queued,
            depth
        );
        self.sink.feedback(CaptureFeedback {
            resource_utilization: utilization,
            max_pixels: None,
        });
    }
}

impl Transport for UdpTransport {
    fn send_frame(&mut self, frame: EncodedFrame) {
        if let Err(e) = self.frames.try_send(frame) {
            tracing::warn!("Dropping encoded frame: {}", e);
        }
        self.report_load();
    }

    fn set_target_playout_delay(&mut self, delay: Duration) {
        let changed = self.playout_delay.send_if_modified(|current| {
            if *current == Some(delay) {
                return false;
            }
            *current = Some(delay);
            true
        });
        if changed {
            tracing::debug!("Target playout delay now {:?}", delay);
        }
    }

    fn stop(&mut self) {
        if let Some(h) = self.send_handle.take() {
            h.abort();
        }
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn send_loop(
    socket: UdpSocket,
    endpoint: SocketAddr,
    mut senders: Vec<StreamSender>,
    mut frames: mpsc::Receiver<EncodedFrame>,
    mut playout_delay: watch::Receiver<Option<Duration>>,
    sink: EventSink,
) {
    let mut stats = UdpStats::default();

    while let Some(frame) = frames.recv().await {
        if playout_delay.has_changed().unwrap_or(false) {
            if let Some(delay) = *playout_delay.borrow_and_update() {
                for sender in senders.iter_mut() {
                    sender.packetizer.set_playout_delay(delay);
                }
            }
        }

        let Some(sender) = senders.iter_mut().find(|s| s.kind == frame.kind) else {
            sink.rtp_stream_error(format!(
                "No {} stream negotiated for frame {}",
                frame.kind, frame.frame_id
            ));
            continue;
        };

        let payload = sender.cipher.encrypt(frame.frame_id, &frame.data);
        let packets = match sender.packetizer.packetize(
            frame.frame_id,
            frame.key_frame,
            frame.rtp_timestamp,
            &payload,
        ) {
            Ok(packets) => packets,
            Err(e) => {
                sink.rtp_stream_error(format!("Cannot packetize {} frame: {:#}", frame.kind, e));
                continue;
            }
        };
        for packet in &packets {
            match socket.send_to(packet, endpoint).await {
                Ok(n) => {
                    stats.packets_sent += 1;
                    stats.bytes_sent += n as u64;
                }
                Err(e) => {
                    tracing::error!("UDP send to {} failed: {}", endpoint, e);
                    sink.transport_status(TransportStatus::SocketError);
                    return;
                }
            }
        }
        stats.frames_sent += 1;
        if stats.frames_sent % 500 == 0 {
            tracing::debug!(
                "Cast transport: {} frames, {} packets, {} bytes",
                stats.frames_sent,
                stats.packets_sent,
                stats.bytes_sent
            );
        }
    }
}
