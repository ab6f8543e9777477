//! Synthetic capture and pass-through encoding.
//!
//! Lets a session run end to end without capture devices or codec
//! libraries: audio is a 1kHz stereo tone, video a moving bar test
//! pattern in I420. The "encoder" frames raw buffers with ids and key
//! frame flags so they can be packetized and sent.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{ensure, Result};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};

use crate::mirroring::collaborators::{
    CaptureFeedback, CaptureProvider, CaptureStream, EncodedFrame, EncoderFactory,
    EncoderStatus, EventSink, FrameEncoder, RawFrame,
};
use crate::mirroring::settings::AUDIO_CHANNELS;
use crate::mirroring::stream::{Resolution, StreamConfig, StreamKind};

/// 10ms audio buffers.
const AUDIO_BUFFER: Duration = Duration::from_millis(10);
const DEFAULT_VIDEO_SIZE: Resolution = Resolution::new(160, 90);
/// At or above this load every other video frame is skipped and the
/// receiver is asked to buffer more.
const HIGH_UTILIZATION: f64 = 0.8;

/// Generates sine wave samples, interleaved across channels.
pub struct ToneGenerator {
    phase: f64,
    frequency: f64,
    sample_rate: f64,
    amplitude: f64,
    channels: usize,
}

impl ToneGenerator {
    pub fn new(sample_rate: u32, channels: u32) -> Self {
        Self {
            phase: 0.0,
            frequency: 1000.0,
            sample_rate: sample_rate as f64,
            amplitude: 0.5,
            channels: channels.max(1) as usize,
        }
    }

    /// Next `duration` of audio as little-endian i16 bytes.
    pub fn next_buffer(&mut self, duration: Duration) -> Vec<u8> {
        let frames = (self.sample_rate * duration.as_secs_f64()).round() as usize;
        let mut out = Vec::with_capacity(frames * self.channels * 2);
        let phase_inc = 2.0 * std::f64::consts::PI * self.frequency / self.sample_rate;
        for _ in 0..frames {
            let val = (self.phase.sin() * self.amplitude * 32767.0) as i16;
            for _ in 0..self.channels {
                out.extend_from_slice(&val.to_le_bytes());
            }
            self.phase += phase_inc;
            if self.phase > 2.0 * std::f64::consts::PI {
                self.phase -= 2.0 * std::f64::consts::PI;
            }
        }
        out
    }
}

/// Size of the padded frame that shows `source` inside `target`'s aspect
/// ratio with black bars. Dimensions are kept even for I420.
pub fn letterboxed_size(source: Resolution, target: Resolution) -> Resolution {
    if source.width == 0 || source.height == 0 || target.width == 0 || target.height == 0 {
        return source;
    }
    let src = source.width as u64 * target.height as u64;
    let dst = target.width as u64 * source.height as u64;
    let even = |v: u64| ((v + 1) & !1) as u32;
    if src > dst {
        // Wider than the target: bars top and bottom.
        let height = source.width as u64 * target.height as u64 / target.width as u64;
        Resolution::new(source.width, even(height))
    } else if src < dst {
        let width = source.height as u64 * target.width as u64 / target.height as u64;
        Resolution::new(even(width), source.height)
    } else {
        source
    }
}

/// Draws a vertical bar that moves one step per frame, centered in `frame`.
pub fn test_pattern(content: Resolution, frame: Resolution, index: u64) -> Vec<u8> {
    let (w, h) = (frame.width as usize, frame.height as usize);
    let luma = w * h;
    let chroma = (w / 2) * (h / 2);
    let mut buf = vec![16u8; luma];
    buf.resize(luma + 2 * chroma, 128);

    let x0 = (w - content.width as usize) / 2;
    let y0 = (h - content.height as usize) / 2;
    let bar_width = (content.width as usize / 8).max(1);
    let bar_x = (index as usize * 4) % content.width.max(1) as usize;
    for y in y0..y0 + content.height as usize {
        let row = &mut buf[y * w..(y + 1) * w];
        for (x, px) in row[x0..x0 + content.width as usize].iter_mut().enumerate() {
            let in_bar = x >= bar_x && x < bar_x + bar_width;
            *px = if in_bar { 235 } else { 128 };
        }
    }
    buf
}

struct StreamShared {
    /// `None` while paused.
    sink: Mutex<Option<EventSink>>,
    refresh: Notify,
    /// Emit one frame out of every `stride`.
    stride: AtomicU32,
}

impl StreamShared {
    fn new(sink: EventSink) -> Arc<Self> {
        Arc::new(Self {
            sink: Mutex::new(Some(sink)),
            refresh: Notify::new(),
            stride: AtomicU32::new(1),
        })
    }

    fn current_sink(&self) -> Option<EventSink> {
        self.sink.lock().ok().and_then(|s| s.clone())
    }

    fn set_sink(&self, sink: Option<EventSink>) {
        if let Ok(mut s) = self.sink.lock() {
            *s = sink;
        }
    }
}

/// Playout delays to request as load rises and falls.
#[derive(Debug, Clone, Copy)]
struct PlayoutDelays {
    normal: Duration,
    loaded: Duration,
}

pub struct SyntheticStream {
    kind: StreamKind,
    shared: Arc<StreamShared>,
    playout_delays: Option<PlayoutDelays>,
    handle: Option<JoinHandle<()>>,
}

impl CaptureStream for SyntheticStream {
    fn stop(&mut self) {
        if let Some(h) = self.handle.take() {
            h.abort();
            tracing::debug!("Synthetic {} capture stopped", self.kind);
        }
    }

    fn pause(&mut self) {
        self.shared.set_sink(None);
    }

    fn resume(&mut self, sink: EventSink) {
        self.shared.set_sink(Some(sink));
        self.shared.refresh.notify_one();
    }

    fn request_refresh_frame(&mut self) {
        self.shared.refresh.notify_one();
    }

    fn process_feedback(&mut self, feedback: &CaptureFeedback) {
        let loaded = feedback.resource_utilization >= HIGH_UTILIZATION;
        let stride = if loaded { 2 } else { 1 };
        let previous = self.shared.stride.swap(stride, Ordering::Relaxed);
        if previous == stride {
            return;
        }
        tracing::debug!(
            "Synthetic {} capture: utilization {:.2}, stride {}",
            self.kind,
            feedback.resource_utilization,
            stride
        );
        if let (Some(delays), Some(sink)) = (self.playout_delays, self.shared.current_sink()) {
            sink.target_playout_delay(if loaded { delays.loaded } else { delays.normal });
        }
    }
}

impl Drop for SyntheticStream {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Capture provider backed by generated media.
pub struct SyntheticCapture {
    video_size: Resolution,
}

impl Default for SyntheticCapture {
    fn default() -> Self {
        Self::new(DEFAULT_VIDEO_SIZE)
    }
}

impl SyntheticCapture {
    pub fn new(video_size: Resolution) -> Self {
        Self { video_size }
    }
}

impl CaptureProvider for SyntheticCapture {
    fn start_audio(&mut self, config: &StreamConfig, sink: EventSink) -> Result<Box<dyn CaptureStream>> {
        let channels = if config.channels > 0 {
            config.channels
        } else {
            AUDIO_CHANNELS
        };
        sink.log(format!(
            "Synthetic audio capture: {} Hz, {} channels",
            config.rtp_timebase, channels
        ));
        let shared = StreamShared::new(sink);
        let handle = spawn_stream(
            StreamKind::Audio,
            shared.clone(),
            run_audio(shared.clone(), config.rtp_timebase, channels),
        );
        Ok(Box::new(SyntheticStream {
            kind: StreamKind::Audio,
            shared,
            playout_delays: None,
            handle: Some(handle),
        }))
    }

    fn start_video(
        &mut self,
        config: &StreamConfig,
        letterbox: bool,
        sink: EventSink,
    ) -> Result<Box<dyn CaptureStream>> {
        let content = match config.max_resolution {
            Some(max) if max.pixels() < self.video_size.pixels() => max,
            _ => self.video_size,
        };
        let frame = match (letterbox, config.max_resolution) {
            (true, Some(target)) => letterboxed_size(content, target),
            _ => content,
        };
        let fps = if config.max_frame_rate > 0.0 {
            config.max_frame_rate
        } else {
            crate::mirroring::settings::MAX_FRAME_RATE
        };
        sink.log(format!(
            "Synthetic video capture: {}x{} in {}x{} at {} fps",
            content.width, content.height, frame.width, frame.height, fps
        ));
        let shared = StreamShared::new(sink);
        let handle = spawn_stream(
            StreamKind::Video,
            shared.clone(),
            run_video(shared.clone(), content, frame, Duration::from_secs_f64(1.0 / fps)),
        );
        Ok(Box::new(SyntheticStream {
            kind: StreamKind::Video,
            shared,
            playout_delays: Some(PlayoutDelays {
                normal: config.animated_playout_delay,
                loaded: config.max_playout_delay.max(config.animated_playout_delay),
            }),
            handle: Some(handle),
        }))
    }
}

/// Run a generator task; a failure is reported as a capture error.
fn spawn_stream<F>(kind: StreamKind, shared: Arc<StreamShared>, generator: F) -> JoinHandle<()>
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = generator.await {
            tracing::warn!("Synthetic {} capture failed: {:#}", kind, e);
            if let Some(sink) = shared.current_sink() {
                sink.capture_error(kind, format!("{:#}", e));
            }
        }
    })
}

async fn run_audio(shared: Arc<StreamShared>, sample_rate: u32, channels: u32) -> Result<()> {
    ensure!(sample_rate > 0, "audio sample rate is zero");
    let mut tone = ToneGenerator::new(sample_rate, channels);
    let mut ticker = interval(AUDIO_BUFFER);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut timestamp = Duration::ZERO;
    loop {
        ticker.tick().await;
        let data = tone.next_buffer(AUDIO_BUFFER);
        if let Some(sink) = shared.current_sink() {
            let frame = RawFrame {
                kind: StreamKind::Audio,
                timestamp,
                data,
                width: 0,
                height: 0,
            };
            if !sink.captured(frame) {
                return Ok(());
            }
        }
        timestamp += AUDIO_BUFFER;
    }
}

async fn run_video(
    shared: Arc<StreamShared>,
    content: Resolution,
    frame: Resolution,
    period: Duration,
) -> Result<()> {
    ensure!(
        content.pixels() > 0,
        "empty {}x{} video capture",
        content.width,
        content.height
    );
    ensure!(
        content.width <= frame.width && content.height <= frame.height,
        "{}x{} video does not fit a {}x{} frame",
        content.width,
        content.height,
        frame.width,
        frame.height
    );
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let start = Instant::now();
    let mut index: u64 = 0;
    loop {
        let forced = tokio::select! {
            _ = ticker.tick() => false,
            _ = shared.refresh.notified() => true,
        };
        index += 1;
        let stride = shared.stride.load(Ordering::Relaxed).max(1) as u64;
        if !forced && index % stride != 0 {
            continue;
        }
        let Some(sink) = shared.current_sink() else {
            continue;
        };
        let raw = RawFrame {
            kind: StreamKind::Video,
            timestamp: start.elapsed(),
            data: test_pattern(content, frame, index),
            width: frame.width,
            height: frame.height,
        };
        if !sink.captured(raw) {
            return Ok(());
        }
    }
}

/// Frames raw buffers without compressing them.
pub struct RawEncoder {
    kind: StreamKind,
    timebase: u32,
    key_frame_interval: u32,
    next_frame_id: u32,
    since_key_frame: u32,
    force_key_frame: bool,
}

impl RawEncoder {
    pub fn new(config: &StreamConfig) -> Self {
        Self {
            kind: config.kind(),
            timebase: config.rtp_timebase,
            key_frame_interval: (config.max_frame_rate.round() as u32).max(1),
            next_frame_id: 0,
            since_key_frame: 0,
            force_key_frame: true,
        }
    }
}

impl FrameEncoder for RawEncoder {
    fn encode(&mut self, frame: RawFrame) -> std::result::Result<EncodedFrame, EncoderStatus> {
        if frame.kind != self.kind {
            return Err(EncoderStatus::InvalidConfiguration);
        }
        let key_frame = self.force_key_frame || self.since_key_frame >= self.key_frame_interval;
        if key_frame {
            self.force_key_frame = false;
            self.since_key_frame = 0;
        }
        self.since_key_frame += 1;

        let frame_id = self.next_frame_id;
        self.next_frame_id = self.next_frame_id.wrapping_add(1);
        let ticks = frame.timestamp.as_micros() * self.timebase as u128 / 1_000_000;

        Ok(EncodedFrame {
            kind: self.kind,
            frame_id,
            key_frame,
            rtp_timestamp: ticks as u32,
            data: frame.data,
        })
    }

    fn request_key_frame(&mut self) {
        self.force_key_frame = true;
    }
}

#[derive(Debug, Default)]
pub struct RawEncoderFactory;

impl EncoderFactory for RawEncoderFactory {
    fn create(
        &mut self,
        config: &StreamConfig,
    ) -> std::result::Result<Box<dyn FrameEncoder>, EncoderStatus> {
        if config.codec.is_remote() {
            return Err(EncoderStatus::UnsupportedCodec);
        }
        tracing::debug!("Raw {} encoder for {}", config.kind(), config.codec.wire_name());
        Ok(Box::new(RawEncoder::new(config)))
    }
}
