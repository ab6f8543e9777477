//! Dedicated encode threads, one per media kind.
//!
//! Each worker drains a job queue with at most `queue_depth` frames waiting.
//! Frames that do not fit are dropped; control jobs are never dropped.
//! Encoded output and status changes go back to the session loop through
//! the [`EventSink`] installed by the latest `Configure` job. Nothing here
//! blocks the caller: queueing never waits, and shutdown joins the thread
//! on the blocking pool when called from a runtime.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tokio::sync::mpsc;

use super::collaborators::{EncoderStatus, EventSink, FrameEncoder, RawFrame};
use super::stream::StreamKind;

/// Frames queued per worker before new ones are dropped.
pub const DEFAULT_QUEUE_DEPTH: usize = 8;

pub enum EncodeJob {
    Configure {
        encoder: Box<dyn FrameEncoder>,
        sink: EventSink,
    },
    Encode(RawFrame),
    RequestKeyFrame,
    /// Drop the current encoder; frames are ignored until reconfigured.
    Reset,
}

pub struct EncodeWorker {
    kind: StreamKind,
    jobs: Option<mpsc::UnboundedSender<EncodeJob>>,
    /// Frames sent but not yet picked up by the thread.
    queued: Arc<AtomicUsize>,
    queue_depth: usize,
    thread: Option<JoinHandle<()>>,
}

impl EncodeWorker {
    pub fn spawn(kind: StreamKind, queue_depth: usize) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let queued = Arc::new(AtomicUsize::new(0));
        let thread_queued = queued.clone();
        let thread = thread::Builder::new()
            .name(format!("{}-encode", kind))
            .spawn(move || run(kind, rx, thread_queued))?;
        tracing::debug!("Started {} encode thread", kind);
        Ok(Self {
            kind,
            jobs: Some(tx),
            queued,
            queue_depth: queue_depth.max(1),
            thread: Some(thread),
        })
    }

    /// Install a new encoder.
    pub fn configure(&self, encoder: Box<dyn FrameEncoder>, sink: EventSink) -> bool {
        self.send(EncodeJob::Configure { encoder, sink })
    }

    pub fn reset(&self) -> bool {
        self.send(EncodeJob::Reset)
    }

    pub fn request_key_frame(&self) -> bool {
        self.send(EncodeJob::RequestKeyFrame)
    }

    /// Queue a frame. Returns false if it was dropped.
    pub fn encode(&self, frame: RawFrame) -> bool {
        if self.jobs.is_none() {
            return false;
        }
        if self.queued.fetch_add(1, Ordering::AcqRel) >= self.queue_depth {
            self.queued.fetch_sub(1, Ordering::AcqRel);
            tracing::warn!("{} encode queue full, dropping frame", self.kind);
            return false;
        }
        if self.send(EncodeJob::Encode(frame)) {
            true
        } else {
            self.queued.fetch_sub(1, Ordering::AcqRel);
            false
        }
    }

    fn send(&self, job: EncodeJob) -> bool {
        match &self.jobs {
            Some(tx) => tx.send(job).is_ok(),
            None => false,
        }
    }

    /// Close the queue and join the thread. Inside a tokio runtime the join
    /// runs on the blocking pool so the caller returns at once.
    pub fn shutdown(&mut self) {
        self.jobs = None;
        let Some(thread) = self.thread.take() else {
            return;
        };
        let kind = self.kind;
        let join = move || {
            if thread.join().is_err() {
                tracing::error!("{} encode thread panicked", kind);
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn_blocking(join);
            }
            Err(_) => join(),
        }
    }
}

impl Drop for EncodeWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(kind: StreamKind, mut jobs: mpsc::UnboundedReceiver<EncodeJob>, queued: Arc<AtomicUsize>) {
    let mut active: Option<(Box<dyn FrameEncoder>, EventSink)> = None;

    while let Some(job) = jobs.blocking_recv() {
        if matches!(job, EncodeJob::Encode(_)) {
            queued.fetch_sub(1, Ordering::AcqRel);
        }
        match job {
            EncodeJob::Configure { encoder, sink } => {
                sink.encoder_status(kind, EncoderStatus::Initialized);
                active = Some((encoder, sink));
            }
            EncodeJob::Encode(frame) => {
                let failed = match active.as_mut() {
                    Some((encoder, sink)) => match encoder.encode(frame) {
                        Ok(encoded) => {
                            sink.encoded(encoded);
                            false
                        }
                        Err(status) => {
                            sink.encoder_status(kind, status);
                            status.is_error()
                        }
                    },
                    None => {
                        tracing::trace!("No {} encoder configured, dropping frame", kind);
                        false
                    }
                };
                if failed {
                    active = None;
                }
            }
            EncodeJob::RequestKeyFrame => {
                if let Some((encoder, _)) = active.as_mut() {
                    encoder.request_key_frame();
                }
            }
            EncodeJob::Reset => active = None,
        }
    }

    tracing::debug!("{} encode thread exiting", kind);
}
