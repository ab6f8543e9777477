//! Request/reply correlation over the cast message channel.
//!
//! Every outbound request carries a sequence number. The matching reply (same
//! `seqNum`, expected type) completes the request; if none arrives before the
//! deadline, the callback receives a synthetic `Unknown` response instead.
//! Either way the callback runs exactly once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::messages::{CastMessage, ReceiverResponse, ResponseType, WEBRTC_NAMESPACE};

/// Completion for a single request.
pub type ReplyCallback = Box<dyn FnOnce(ReceiverResponse) + Send + 'static>;

/// Side channel for messages that could not be parsed.
pub type ParseErrorCallback = Box<dyn Fn(String) + Send + 'static>;

struct PendingRequest {
    expected: ResponseType,
    callback: ReplyCallback,
    timer: JoinHandle<()>,
}

type PendingMap = Arc<Mutex<HashMap<i32, PendingRequest>>>;

pub struct MessageExchange {
    outbound: mpsc::Sender<CastMessage>,
    pending: PendingMap,
    next_sequence_number: i32,
    on_parse_error: ParseErrorCallback,
}

impl MessageExchange {
    pub fn new(outbound: mpsc::Sender<CastMessage>, on_parse_error: ParseErrorCallback) -> Self {
        Self {
            outbound,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_sequence_number: 1,
            on_parse_error,
        }
    }

    pub fn next_sequence_number(&mut self) -> i32 {
        let n = self.next_sequence_number;
        self.next_sequence_number = self.next_sequence_number.wrapping_add(1).max(1);
        n
    }

    /// Send `message` and arrange for `callback` to receive the reply.
    ///
    /// Must be called inside a tokio runtime (the deadline is a spawned timer).
    pub fn request_reply(
        &mut self,
        message: CastMessage,
        expected: ResponseType,
        sequence_number: i32,
        timeout: Duration,
        callback: ReplyCallback,
    ) {
        {
            // Hold the lock while spawning so the timer cannot observe the map
            // before the request is registered.
            let mut pending = lock(&self.pending);
            let map = Arc::clone(&self.pending);
            let timer = tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let expired = lock(&map).remove(&sequence_number);
                if let Some(request) = expired {
                    tracing::debug!(
                        "Request seqNum={} timed out after {:?} waiting for {:?}",
                        sequence_number,
                        timeout,
                        request.expected
                    );
                    (request.callback)(ReceiverResponse::unknown(sequence_number));
                }
            });
            let previous = pending.insert(
                sequence_number,
                PendingRequest {
                    expected,
                    callback,
                    timer,
                },
            );
            if let Some(previous) = previous {
                tracing::warn!(
                    "Replacing pending request with duplicate seqNum={}",
                    sequence_number
                );
                previous.timer.abort();
            }
        }

        tracing::debug!("Sending {:?} request seqNum={}", expected, sequence_number);
        if let Err(e) = self.outbound.try_send(message) {
            // The request stays registered and will time out.
            tracing::warn!("Failed to send message seqNum={}: {}", sequence_number, e);
        }
    }

    /// Process one inbound message.
    ///
    /// Completes the matching pending request, if any. Parsed messages that
    /// complete nothing are returned to the caller; unparseable messages go
    /// to the parse-error callback.
    pub fn on_message(&self, message: &CastMessage) -> Option<ReceiverResponse> {
        if message.namespace != WEBRTC_NAMESPACE {
            tracing::trace!("Ignoring message on namespace {}", message.namespace);
            return None;
        }

        let response = match ReceiverResponse::parse(&message.data) {
            Ok(r) => r,
            Err(e) => {
                (self.on_parse_error)(e.to_string());
                return None;
            }
        };

        let matched = {
            let mut pending = lock(&self.pending);
            let is_match = pending
                .get(&response.sequence_number())
                .map(|p| p.expected == response.response_type())
                .unwrap_or(false);
            if is_match {
                pending.remove(&response.sequence_number())
            } else {
                None
            }
        };

        match matched {
            Some(request) => {
                request.timer.abort();
                (request.callback)(response);
                None
            }
            None => {
                tracing::debug!(
                    "Unsolicited {:?} seqNum={}",
                    response.response_type(),
                    response.sequence_number()
                );
                Some(response)
            }
        }
    }

    /// Drop a pending request without running its callback.
    pub fn cancel(&self, sequence_number: i32) -> bool {
        match lock(&self.pending).remove(&sequence_number) {
            Some(request) => {
                request.timer.abort();
                true
            }
            None => false,
        }
    }

    /// Drop every pending request without running callbacks.
    pub fn cancel_all(&self) {
        let drained: Vec<PendingRequest> = lock(&self.pending).drain().map(|(_, p)| p).collect();
        for request in drained {
            request.timer.abort();
        }
    }

    #[cfg(test)]
    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }
}

impl Drop for MessageExchange {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

/// Lock the pending map, recovering from a poisoned mutex.
fn lock(map: &PendingMap) -> std::sync::MutexGuard<'_, HashMap<i32, PendingRequest>> {
    map.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mirroring::messages::get_capabilities_message;

    fn exchange() -> (
        MessageExchange,
        mpsc::Receiver<CastMessage>,
        Arc<Mutex<Vec<String>>>,
    ) {
        let (tx, rx) = mpsc::channel(8);
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        let exchange = MessageExchange::new(
            tx,
            Box::new(move |e| sink.lock().unwrap().push(e)),
        );
        (exchange, rx, errors)
    }

    fn collector() -> (ReplyCallback, Arc<Mutex<Vec<ReceiverResponse>>>) {
        let got = Arc::new(Mutex::new(Vec::new()));
        let sink = got.clone();
        (
            Box::new(move |r| sink.lock().unwrap().push(r)),
            got,
        )
    }

    fn reply(kind: &str, seq: i32) -> CastMessage {
        CastMessage::webrtc(&serde_json::json!({
            "type": kind,
            "seqNum": seq,
            "result": "ok",
            "capabilities": {"mediaCaps": []},
        }))
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fires_exactly_once() {
        let (mut exchange, mut rx, _) = exchange();
        let (callback, got) = collector();
        let seq = exchange.next_sequence_number();
        exchange.request_reply(
            get_capabilities_message(seq),
            ResponseType::CapabilitiesResponse,
            seq,
            Duration::from_secs(30),
            callback,
        );
        assert!(rx.recv().await.is_some());

        tokio::time::sleep(Duration::from_secs(31)).await;
        {
            let got = got.lock().unwrap();
            assert_eq!(got.len(), 1);
            assert_eq!(got[0].response_type(), ResponseType::Unknown);
            assert_eq!(got[0].sequence_number(), seq);
        }

        // A late reply completes nothing.
        let late = exchange.on_message(&reply("CAPABILITIES_RESPONSE", seq));
        assert!(late.is_some());
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(got.lock().unwrap().len(), 1);
        assert_eq!(exchange.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replies_matched_by_sequence_number() {
        let (mut exchange, _rx, _) = exchange();
        let (cb_a, got_a) = collector();
        let (cb_b, got_b) = collector();
        let a = exchange.next_sequence_number();
        let b = exchange.next_sequence_number();
        assert!(b > a);
        for (seq, cb) in [(a, cb_a), (b, cb_b)] {
            exchange.request_reply(
                get_capabilities_message(seq),
                ResponseType::CapabilitiesResponse,
                seq,
                Duration::from_secs(30),
                cb,
            );
        }

        // Out-of-order delivery.
        assert!(exchange.on_message(&reply("CAPABILITIES_RESPONSE", b)).is_none());
        assert!(got_a.lock().unwrap().is_empty());
        assert_eq!(got_b.lock().unwrap()[0].sequence_number(), b);

        assert!(exchange.on_message(&reply("CAPABILITIES_RESPONSE", a)).is_none());
        assert_eq!(got_a.lock().unwrap()[0].sequence_number(), a);

        // Duplicate reply is ignored.
        assert!(exchange.on_message(&reply("CAPABILITIES_RESPONSE", a)).is_some());
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(got_a.lock().unwrap().len(), 1);
        assert_eq!(got_b.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wrong_type_does_not_complete() {
        let (mut exchange, _rx, _) = exchange();
        let (callback, got) = collector();
        let seq = exchange.next_sequence_number();
        exchange.request_reply(
            get_capabilities_message(seq),
            ResponseType::Answer,
            seq,
            Duration::from_secs(15),
            callback,
        );
        assert!(exchange.on_message(&reply("CAPABILITIES_RESPONSE", seq)).is_some());
        assert!(got.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_secs(16)).await;
        assert_eq!(got.lock().unwrap()[0].response_type(), ResponseType::Unknown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_request_never_completes() {
        let (mut exchange, _rx, _) = exchange();
        let (callback, got) = collector();
        let seq = exchange.next_sequence_number();
        exchange.request_reply(
            get_capabilities_message(seq),
            ResponseType::CapabilitiesResponse,
            seq,
            Duration::from_secs(1),
            callback,
        );
        assert!(exchange.cancel(seq));
        assert!(!exchange.cancel(seq));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(got.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_parse_errors_go_to_side_channel() {
        let (exchange, _rx, errors) = exchange();
        let garbage = CastMessage {
            namespace: WEBRTC_NAMESPACE.to_string(),
            data: "{oops".to_string(),
        };
        assert!(exchange.on_message(&garbage).is_none());
        assert_eq!(errors.lock().unwrap().len(), 1);

        let other = CastMessage {
            namespace: "urn:x-cast:com.google.cast.media".to_string(),
            data: "{oops".to_string(),
        };
        assert!(exchange.on_message(&other).is_none());
        assert_eq!(errors.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_failure_still_times_out() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let mut exchange = MessageExchange::new(tx, Box::new(|_| {}));
        let (callback, got) = collector();
        exchange.request_reply(
            get_capabilities_message(1),
            ResponseType::CapabilitiesResponse,
            1,
            Duration::from_secs(2),
            callback,
        );
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(got.lock().unwrap().len(), 1);
    }
}
