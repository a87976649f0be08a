//! Multi-session orchestration for overlapping events.
//!
//! All handlers run on the core event loop, so the live-session set is only
//! ever touched from one task. Overlap rule: a MotionStart while the active
//! session is already cooling down opens a second session; the cooldown
//! session keeps collecting the shared tail independently.

use crate::events::{SegmentInfo, SessionOutcome};
use crate::session::{Session, SessionPhase};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Read-only view of the segment buffer used to seed pre-roll.
pub trait SegmentStore: Send + Sync {
    /// The youngest `count` segments in playback order. Never blocks.
    fn recent_segments(&self, count: usize) -> Vec<SegmentInfo>;
}

/// Timing knobs the manager needs from the configuration.
#[derive(Debug, Clone)]
pub struct SessionTimings {
    pub pre_roll: Duration,
    pub cooldown: Duration,
    pub segment_len: Duration,
}

impl SessionTimings {
    /// Whole segments covering the pre-roll window, rounding up.
    pub fn preroll_segment_count(&self) -> usize {
        let segment = self.segment_len.as_secs_f64();
        if segment <= 0.0 {
            return 0;
        }
        (self.pre_roll.as_secs_f64() / segment).ceil() as usize
    }
}

/// Work handed to the recorder pool when a session reaches Finalizing.
#[derive(Debug, Clone)]
pub struct FinalizeJob {
    pub session_id: String,
    pub segments: Vec<PathBuf>,
    pub output_path: PathBuf,
    pub scratch_dir: PathBuf,
}

pub struct SessionManager {
    timings: SessionTimings,
    evidence_dir: PathBuf,
    sessions_dir: PathBuf,
    store: Arc<dyn SegmentStore>,
    sessions: Vec<Session>,
}

impl SessionManager {
    pub fn new(
        timings: SessionTimings,
        evidence_dir: PathBuf,
        sessions_dir: PathBuf,
        store: Arc<dyn SegmentStore>,
    ) -> Self {
        Self {
            timings,
            evidence_dir,
            sessions_dir,
            store,
            sessions: Vec::new(),
        }
    }

    /// Route a MotionStart: extend the recording session if one exists,
    /// otherwise open a new session seeded with pre-roll footage.
    pub fn on_motion_start(&mut self, t: Instant) {
        if let Some(session) = self.recording_session_mut() {
            debug!(session_id = %session.id(), "motion start while recording");
            session.on_motion_start(t);
            return;
        }

        let count = self.timings.preroll_segment_count();
        let preroll = if count == 0 {
            Vec::new()
        } else {
            self.store.recent_segments(count)
        };

        let session = Session::open(preroll, t, self.timings.pre_roll);
        info!(
            session_id = %session.id(),
            preroll_segments = session.segments().len(),
            live_sessions = self.sessions.len() + 1,
            "session opened"
        );
        self.sessions.push(session);
    }

    /// Route a MotionStop to the recording session.
    pub fn on_motion_stop(&mut self, t: Instant) {
        let cooldown = self.timings.cooldown;
        match self.recording_session_mut() {
            Some(session) => {
                session.on_motion_stop(t, cooldown);
                info!(session_id = %session.id(), "session cooling down");
            }
            None => {
                error!("motion stop without a recording session");
            }
        }
    }

    /// Fan a discovered segment out to every live session. This is how
    /// overlapping sessions capture shared tail footage.
    pub fn on_segment(&mut self, segment: &SegmentInfo) {
        for session in self.sessions.iter_mut() {
            session.on_segment(segment);
        }
    }

    /// Advance cooldown timers; sessions crossing their deadline become
    /// recorder jobs.
    pub fn tick(&mut self, now: Instant) -> Vec<FinalizeJob> {
        let evidence_dir = self.evidence_dir.clone();
        let sessions_dir = self.sessions_dir.clone();
        let mut jobs = Vec::new();

        for session in self.sessions.iter_mut() {
            if let Some(output_path) = session.tick(now, &evidence_dir) {
                info!(
                    session_id = %session.id(),
                    segments = session.segments().len(),
                    output = %output_path.display(),
                    "session finalizing"
                );
                jobs.push(build_job(session, output_path, &sessions_dir));
            }
        }
        jobs
    }

    /// Recorder outcome for a finalizing session: record it and drop the
    /// session from the live set.
    pub fn complete(&mut self, session_id: &str, outcome: &SessionOutcome) {
        let Some(pos) = self.sessions.iter().position(|s| s.id() == session_id) else {
            warn!(session_id, "completion for unknown session");
            return;
        };
        let mut session = self.sessions.remove(pos);
        match outcome {
            SessionOutcome::Completed(path) => {
                session.mark_completed();
                info!(session_id, output = %path.display(), "session completed");
            }
            SessionOutcome::Failed(reason) => {
                session.mark_failed();
                warn!(session_id, reason = %reason, "session failed");
            }
        }
    }

    /// Shutdown path: push every live session straight to Finalizing so its
    /// footage still reaches the recorder.
    pub fn drain(&mut self, _now: Instant) -> Vec<FinalizeJob> {
        let evidence_dir = self.evidence_dir.clone();
        let sessions_dir = self.sessions_dir.clone();
        let mut jobs = Vec::new();

        for session in self.sessions.iter_mut() {
            if let Some(output_path) = session.force_finalize(&evidence_dir) {
                info!(session_id = %session.id(), "finalizing session on shutdown");
                jobs.push(build_job(session, output_path, &sessions_dir));
            }
        }
        jobs
    }

    /// Mark every session still in the live set as failed (drain timeout).
    pub fn fail_remaining(&mut self) {
        for session in self.sessions.iter_mut() {
            warn!(session_id = %session.id(), "session abandoned at shutdown");
            session.mark_failed();
        }
        self.sessions.clear();
    }

    pub fn live_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn recording_count(&self) -> usize {
        self.count_phase(SessionPhase::Recording)
    }

    pub fn cooldown_count(&self) -> usize {
        self.count_phase(SessionPhase::Cooldown)
    }

    fn count_phase(&self, phase: SessionPhase) -> usize {
        self.sessions.iter().filter(|s| s.phase() == phase).count()
    }

    fn recording_session_mut(&mut self) -> Option<&mut Session> {
        self.sessions
            .iter_mut()
            .find(|s| s.phase() == SessionPhase::Recording)
    }
}

fn build_job(session: &Session, output_path: PathBuf, sessions_dir: &Path) -> FinalizeJob {
    FinalizeJob {
        session_id: session.id().to_string(),
        segments: session.segments().iter().map(|s| s.path.clone()).collect(),
        output_path,
        scratch_dir: sessions_dir.join(session.id()),
    }
}
