//! SUB-stream RTSP client feeding the detector.
//!
//! A GStreamer pipeline decodes the low-res stream, downscales it and hands
//! GRAY8 frames to an appsink. Connection loss is reported on the frame
//! channel so the detector loop can reset its state and ask for a reconnect.

use crate::events::SubFrame;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use bytes::Bytes;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Detection does not need full resolution; frames are scaled down before
/// analysis.
const DETECTION_WIDTH: u32 = 640;
const DETECTION_HEIGHT: u32 = 360;

const CONNECT_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Error)]
pub enum SubStreamError {
    #[error("gstreamer initialization failed: {0}")]
    Init(String),

    #[error("pipeline creation failed: {0}")]
    PipelineCreation(String),

    #[error("pipeline element not found: {0}")]
    ElementNotFound(String),

    #[error("stream connection failed: {0}")]
    ConnectionFailed(String),

    #[error("pipeline state change failed: {0}")]
    StateChangeFailed(String),

    #[error("client stopped")]
    Stopped,
}

/// Everything flowing out of the client.
#[derive(Debug)]
pub enum SubStreamEvent {
    Frame(SubFrame),
    Disconnected,
}

#[derive(Debug, Clone)]
pub struct SubStreamConfig {
    pub url: String,
    /// rtspsrc jitterbuffer latency in milliseconds
    pub latency_ms: u32,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
}

impl SubStreamConfig {
    pub fn new(url: String, reconnect_max_delay: Duration) -> Self {
        Self {
            url,
            latency_ms: 200,
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay,
        }
    }
}

pub struct SubStreamClient {
    config: SubStreamConfig,
    pipeline: Option<gst::Pipeline>,
    running: Arc<AtomicBool>,
    frames_dropped: Arc<AtomicU64>,
}

impl SubStreamClient {
    pub fn new(config: SubStreamConfig) -> Result<Self, SubStreamError> {
        gst::init().map_err(|e| SubStreamError::Init(e.to_string()))?;

        Ok(Self {
            config,
            pipeline: None,
            running: Arc::new(AtomicBool::new(false)),
            frames_dropped: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Connect (retrying with backoff) and return the frame channel.
    pub async fn start(&mut self) -> Result<mpsc::Receiver<SubStreamEvent>, SubStreamError> {
        self.running.store(true, Ordering::SeqCst);
        self.connect_with_retry().await
    }

    /// Tear down the current pipeline and connect again from scratch.
    pub async fn reconnect(&mut self) -> Result<mpsc::Receiver<SubStreamEvent>, SubStreamError> {
        self.teardown();
        self.connect_with_retry().await
    }

    /// Frames discarded because the detector was behind.
    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped.load(Ordering::Relaxed)
    }

    pub fn stop(&mut self) {
        info!(dropped = self.frames_dropped(), "stopping sub-stream client");
        self.running.store(false, Ordering::SeqCst);
        self.teardown();
    }

    fn teardown(&mut self) {
        if let Some(pipeline) = self.pipeline.take() {
            let _ = pipeline.set_state(gst::State::Null);
        }
    }

    async fn connect_with_retry(
        &mut self,
    ) -> Result<mpsc::Receiver<SubStreamEvent>, SubStreamError> {
        let mut backoff = ExponentialBackoff {
            initial_interval: self.config.reconnect_base_delay,
            max_interval: self.config.reconnect_max_delay,
            max_elapsed_time: None,
            ..Default::default()
        };
        let mut attempts = 0u32;

        loop {
            if !self.running.load(Ordering::SeqCst) {
                return Err(SubStreamError::Stopped);
            }

            match self.create_and_start_pipeline() {
                Ok(rx) => {
                    info!(attempts, "connected to sub stream");
                    return Ok(rx);
                }
                Err(e) => {
                    attempts += 1;
                    let delay = backoff
                        .next_backoff()
                        .unwrap_or(self.config.reconnect_max_delay);
                    warn!(
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "sub-stream connection failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn create_and_start_pipeline(
        &mut self,
    ) -> Result<mpsc::Receiver<SubStreamEvent>, SubStreamError> {
        let pipeline_str = build_pipeline_string(&self.config);
        debug!(pipeline = %pipeline_str, "creating sub-stream pipeline");

        let pipeline = gst::parse::launch(&pipeline_str)
            .map_err(|e| SubStreamError::PipelineCreation(e.to_string()))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| {
                SubStreamError::PipelineCreation("failed to cast to Pipeline".to_string())
            })?;

        let appsink = pipeline
            .by_name("sink")
            .ok_or_else(|| SubStreamError::ElementNotFound("appsink".to_string()))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| SubStreamError::ElementNotFound("appsink cast".to_string()))?;

        let (tx, rx) = mpsc::channel(32);
        self.configure_appsink(&appsink, tx.clone());

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| SubStreamError::StateChangeFailed(e.to_string()))?;

        let (result, _state, _pending) =
            pipeline.state(gst::ClockTime::from_seconds(CONNECT_TIMEOUT_SECS));
        if result.is_err() {
            let _ = pipeline.set_state(gst::State::Null);
            return Err(SubStreamError::ConnectionFailed(
                "timeout waiting for pipeline to start".to_string(),
            ));
        }

        self.spawn_bus_monitor(&pipeline, tx);
        self.pipeline = Some(pipeline);

        Ok(rx)
    }

    fn configure_appsink(&self, appsink: &gst_app::AppSink, tx: mpsc::Sender<SubStreamEvent>) {
        let running = Arc::clone(&self.running);
        let dropped = Arc::clone(&self.frames_dropped);

        appsink.set_callbacks(
            gst_app::AppSinkCallbacks::builder()
                .new_sample(move |sink| {
                    if !running.load(Ordering::SeqCst) {
                        return Err(gst::FlowError::Eos);
                    }

                    let sample = sink.pull_sample().map_err(|_| gst::FlowError::Error)?;
                    let buffer = sample.buffer().ok_or(gst::FlowError::Error)?;
                    let caps = sample.caps().ok_or(gst::FlowError::Error)?;
                    let structure = caps.structure(0).ok_or(gst::FlowError::Error)?;
                    let width: i32 = structure.get("width").unwrap_or(DETECTION_WIDTH as i32);
                    let height: i32 = structure.get("height").unwrap_or(DETECTION_HEIGHT as i32);

                    let map = buffer.map_readable().map_err(|_| gst::FlowError::Error)?;
                    let frame = SubFrame {
                        data: Bytes::copy_from_slice(map.as_slice()),
                        width: width as u32,
                        height: height as u32,
                        captured_at: Instant::now(),
                    };

                    match tx.try_send(SubStreamEvent::Frame(frame)) {
                        Ok(()) => Ok(gst::FlowSuccess::Ok),
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            // Detector is behind; dropping frames is fine.
                            dropped.fetch_add(1, Ordering::Relaxed);
                            Ok(gst::FlowSuccess::Ok)
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => Err(gst::FlowError::Eos),
                    }
                })
                .build(),
        );
    }

    /// Watch the pipeline bus; on error or end-of-stream, notify the
    /// consumer and exit.
    fn spawn_bus_monitor(&self, pipeline: &gst::Pipeline, tx: mpsc::Sender<SubStreamEvent>) {
        let Some(bus) = pipeline.bus() else {
            return;
        };
        let running = Arc::clone(&self.running);

        tokio::task::spawn_blocking(move || {
            loop {
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                let Some(msg) = bus.timed_pop(gst::ClockTime::from_mseconds(250)) else {
                    continue;
                };
                match msg.view() {
                    gst::MessageView::Error(err) => {
                        error!(error = %err.error(), debug = ?err.debug(), "sub-stream pipeline error");
                        let _ = tx.blocking_send(SubStreamEvent::Disconnected);
                        break;
                    }
                    gst::MessageView::Eos(_) => {
                        warn!("sub stream ended");
                        let _ = tx.blocking_send(SubStreamEvent::Disconnected);
                        break;
                    }
                    gst::MessageView::Warning(w) => {
                        warn!(warning = %w.error(), "sub-stream pipeline warning");
                    }
                    _ => {}
                }
            }
        });
    }
}

impl Drop for SubStreamClient {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.teardown();
    }
}

fn build_pipeline_string(config: &SubStreamConfig) -> String {
    format!(
        "rtspsrc location={url} protocols=tcp latency={latency} \
         ! rtph264depay ! h264parse ! avdec_h264 \
         ! videoconvert ! videoscale \
         ! video/x-raw,format=GRAY8,width={width},height={height} \
         ! appsink name=sink emit-signals=true sync=false max-buffers=2 drop=true",
        url = config.url,
        latency = config.latency_ms,
        width = DETECTION_WIDTH,
        height = DETECTION_HEIGHT,
    )
}
