//! Cast message channel: moves messages between a session and the
//! receiver's message relay.

pub mod websocket;

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::mirroring::messages::CastMessage;
use crate::mirroring::SessionHandle;
use websocket::CastSocket;

/// Why [`pump`] returned.
#[derive(Debug)]
pub enum DisconnectReason {
    /// The session reached `Stopped`.
    SessionStopped,
    /// The relay closed the socket or failed.
    Closed(Option<anyhow::Error>),
}

/// Forward outbound session messages to the socket and inbound ones to the
/// session until either side goes away.
pub async fn pump<S>(
    socket: &mut CastSocket<S>,
    session: &SessionHandle,
    outbound: &mut mpsc::Receiver<CastMessage>,
) -> Result<DisconnectReason>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let stopped = session.stopped();
    tokio::pin!(stopped);

    let reason = loop {
        tokio::select! {
            inbound = socket.recv_message() => {
                match inbound {
                    Ok(Some(message)) => session.on_message(message),
                    Ok(None) => break DisconnectReason::Closed(None),
                    Err(e) => break DisconnectReason::Closed(Some(e)),
                }
            }
            message = outbound.recv() => {
                match message {
                    Some(message) => socket.send_message(&message).await?,
                    None => break DisconnectReason::SessionStopped,
                }
            }
            _ = &mut stopped => {
                // Flush anything queued before the stop.
                while let Ok(message) = outbound.try_recv() {
                    socket.send_message(&message).await?;
                }
                break DisconnectReason::SessionStopped;
            }
        }
    };

    if matches!(reason, DisconnectReason::SessionStopped) {
        socket.close().await;
    }
    Ok(reason)
}
