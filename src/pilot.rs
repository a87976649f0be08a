//! System wiring and the core event loop.
//!
//! One task owns the session manager and serializes every state mutation:
//! segment discoveries, motion transitions, ticks and recorder completions
//! all arrive on a single queue. Producers and recorder workers run around
//! it and only ever communicate through channels.

use crate::buffer::{BufferConfig, SegmentBuffer};
use crate::config::PilotConfig;
use crate::detector::{Detector, DetectorConfig};
use crate::events::{MotionEvent, PilotEvent};
use crate::recorder::{spawn_workers, Recorder};
use crate::session_manager::{FinalizeJob, SessionManager, SessionTimings};
use crate::substream::{SubStreamClient, SubStreamConfig, SubStreamEvent};
use crate::watcher::platform_watcher;
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

const TICK_INTERVAL: Duration = Duration::from_millis(250);
/// In-flight recorder work gets this long after shutdown begins.
const RECORDER_DRAIN_GRACE: Duration = Duration::from_secs(30);
const WATCH_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Bring the whole system up and run until SIGINT/SIGTERM.
pub async fn run(config: PilotConfig) -> Result<()> {
    config
        .ensure_directories()
        .context("failed to create working directories")?;

    match clear_stale_sessions(&config.sessions_dir, &config.evidence_dir).await {
        Ok(0) => {}
        Ok(cleared) => info!(cleared, "cleared stale session scratch from previous runs"),
        Err(e) => warn!(error = %e, "failed to clear stale session scratch"),
    }

    let (events_tx, mut events_rx) = mpsc::channel::<PilotEvent>(256);
    let (jobs_tx, jobs_rx) = mpsc::unbounded_channel::<FinalizeJob>();
    let running = Arc::new(AtomicBool::new(true));

    let mut buffer = SegmentBuffer::new(BufferConfig::from_pilot(&config), events_tx.clone());
    buffer
        .start(platform_watcher(WATCH_POLL_INTERVAL))
        .await
        .context("failed to start segment buffer")?;

    let timings = SessionTimings {
        pre_roll: config.pre_roll(),
        cooldown: config.cooldown(),
        segment_len: config.segment_len(),
    };
    let mut manager = SessionManager::new(
        timings,
        config.evidence_dir.clone(),
        config.sessions_dir.clone(),
        Arc::new(buffer.view()),
    );

    let recorder = Arc::new(Recorder::new());
    let worker_handles = spawn_workers(
        recorder,
        config.recorder_workers,
        jobs_rx,
        events_tx.clone(),
    );

    let client = SubStreamClient::new(SubStreamConfig::new(
        config.rtsp_url_sub.clone(),
        config.max_reconnect(),
    ))
    .context("failed to initialize sub-stream client")?;
    let detector = Detector::new(DetectorConfig {
        motion_threshold: config.motion_threshold,
        light_jump_threshold: config.light_jump_threshold,
        min_motion: config.min_motion(),
        startup_delay: config.startup_delay(),
    });
    let detector_handle = tokio::spawn(detector_loop(
        client,
        detector,
        events_tx.clone(),
        Arc::clone(&running),
    ));

    let ticker_handle = tokio::spawn(ticker(events_tx.clone()));
    // The loop's own sender is gone; the channel closes when the last
    // producer does.
    drop(events_tx);

    info!("device pilot running");

    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received SIGINT, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
                break;
            }
            event = events_rx.recv() => match event {
                Some(event) => handle_event(&mut manager, &jobs_tx, event),
                None => {
                    error!("event channel closed unexpectedly");
                    break;
                }
            }
        }
    }

    // Stop producers first so no new events race the drain.
    running.store(false, Ordering::SeqCst);
    ticker_handle.abort();
    detector_handle.abort();
    buffer.stop().await;

    // Live sessions still get their MP4s, bounded by the drain grace.
    for job in manager.drain(Instant::now()) {
        let _ = jobs_tx.send(job);
    }
    drop(jobs_tx);

    let deadline = tokio::time::Instant::now() + RECORDER_DRAIN_GRACE;
    while manager.live_count() > 0 {
        match tokio::time::timeout_at(deadline, events_rx.recv()).await {
            Ok(Some(PilotEvent::SessionDone {
                session_id,
                outcome,
            })) => manager.complete(&session_id, &outcome),
            Ok(Some(_)) => {}
            Ok(None) => break,
            Err(_) => {
                warn!(
                    remaining = manager.live_count(),
                    "recorder drain timed out, abandoning remaining sessions"
                );
                manager.fail_remaining();
                break;
            }
        }
    }
    for handle in worker_handles {
        handle.abort();
    }

    info!("device pilot stopped");
    Ok(())
}

/// Dispatch one queued event. Handlers are synchronous; the only outbound
/// path is the non-blocking recorder queue.
fn handle_event(
    manager: &mut SessionManager,
    jobs_tx: &mpsc::UnboundedSender<FinalizeJob>,
    event: PilotEvent,
) {
    match event {
        PilotEvent::Segment(info) => manager.on_segment(&info),
        PilotEvent::Motion(MotionEvent::Start(t)) => manager.on_motion_start(t),
        PilotEvent::Motion(MotionEvent::Stop(t)) => manager.on_motion_stop(t),
        PilotEvent::Tick(now) => {
            for job in manager.tick(now) {
                if jobs_tx.send(job).is_err() {
                    error!("recorder queue closed");
                }
            }
        }
        PilotEvent::SessionDone {
            session_id,
            outcome,
        } => manager.complete(&session_id, &outcome),
    }
}

/// Producer: consume SUB-stream frames, run detection, push motion
/// transitions into the core loop. Reconnects reset the detector so a scene
/// change after an outage cannot fire a spurious trigger.
async fn detector_loop(
    mut client: SubStreamClient,
    mut detector: Detector,
    events: mpsc::Sender<PilotEvent>,
    running: Arc<AtomicBool>,
) {
    let mut frames = match client.start().await {
        Ok(rx) => rx,
        Err(e) => {
            error!(error = %e, "sub-stream client failed to start");
            return;
        }
    };
    info!("detector running");

    while running.load(Ordering::SeqCst) {
        match frames.recv().await {
            Some(SubStreamEvent::Frame(frame)) => {
                let now = Instant::now();
                let (analysis, event) = detector.analyze(&frame, now);
                let Some(event) = event else { continue };

                match event {
                    MotionEvent::Start(_) => info!(
                        smoothed = analysis.smoothed_motion_score,
                        light_delta = analysis.brightness_delta,
                        "motion started"
                    ),
                    MotionEvent::Stop(_) => info!("motion stopped"),
                }
                if events.send(PilotEvent::Motion(event)).await.is_err() {
                    break;
                }
            }
            Some(SubStreamEvent::Disconnected) | None => {
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                warn!("sub stream lost, reconnecting");
                detector.reset();
                match client.reconnect().await {
                    Ok(rx) => frames = rx,
                    Err(e) => {
                        debug!(error = %e, "reconnect aborted");
                        break;
                    }
                }
            }
        }
    }
    client.stop();
    debug!("detector loop exiting");
}

/// Producer: periodic ticks advance cooldown timers.
async fn ticker(events: mpsc::Sender<PilotEvent>) {
    let mut interval = tokio::time::interval(TICK_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        if events.send(PilotEvent::Tick(Instant::now())).await.is_err() {
            break;
        }
    }
}

/// Remove per-session scratch directories left behind by previous runs.
/// Finished MP4s live in the evidence directory and are never touched.
async fn clear_stale_sessions(
    sessions_dir: &Path,
    evidence_dir: &Path,
) -> std::io::Result<usize> {
    if sessions_dir == evidence_dir {
        warn!("refusing to clear scratch: sessions dir equals evidence dir");
        return Ok(0);
    }
    if !sessions_dir.exists() {
        return Ok(0);
    }

    let mut cleared = 0;
    let mut entries = tokio::fs::read_dir(sessions_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => cleared += 1,
            Err(e) => warn!(path = %path.display(), error = %e, "failed to remove old session"),
        }
    }
    Ok(cleared)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_clear_stale_sessions_removes_only_directories() {
        let root = TempDir::new().unwrap();
        let sessions = root.path().join("sessions");
        let evidence = root.path().join("evidence");
        tokio::fs::create_dir_all(sessions.join("abcd1234"))
            .await
            .unwrap();
        tokio::fs::write(sessions.join("abcd1234").join("concat.txt"), b"x")
            .await
            .unwrap();
        tokio::fs::write(sessions.join("stray.txt"), b"y").await.unwrap();
        tokio::fs::create_dir_all(&evidence).await.unwrap();

        let cleared = clear_stale_sessions(&sessions, &evidence).await.unwrap();
        assert_eq!(cleared, 1);
        assert!(!sessions.join("abcd1234").exists());
        assert!(sessions.join("stray.txt").exists());
    }

    #[tokio::test]
    async fn test_clear_stale_sessions_refuses_evidence_dir() {
        let root = TempDir::new().unwrap();
        let dir = root.path().join("both");
        tokio::fs::create_dir_all(dir.join("abcd1234")).await.unwrap();

        let cleared = clear_stale_sessions(&dir, &dir).await.unwrap();
        assert_eq!(cleared, 0);
        assert!(dir.join("abcd1234").exists());
    }

    #[tokio::test]
    async fn test_clear_stale_sessions_missing_dir_is_fine() {
        let root = TempDir::new().unwrap();
        let cleared = clear_stale_sessions(
            &root.path().join("nope"),
            &root.path().join("evidence"),
        )
        .await
        .unwrap();
        assert_eq!(cleared, 0);
    }
}
