//! Per-event recording session state machine.
//!
//! A session is pure bookkeeping: it collects segment references across the
//! pre-roll, active and cooldown phases and decides when it is ready for the
//! recorder. It never touches the filesystem; all clock reads are passed in.

use crate::events::SegmentInfo;
use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Recording,
    Cooldown,
    Finalizing,
    Completed,
    Failed,
}

impl SessionPhase {
    /// Live sessions still collect segments.
    pub fn is_live(&self) -> bool {
        matches!(self, SessionPhase::Recording | SessionPhase::Cooldown)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionPhase::Completed | SessionPhase::Failed)
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    id: String,
    started_wall: DateTime<Local>,
    started_at: Instant,
    pre_roll: Duration,
    segments: Vec<SegmentInfo>,
    phase: SessionPhase,
    cooldown_deadline: Option<Instant>,
    output_path: Option<PathBuf>,
}

impl Session {
    /// Open a new session in Recording, adopting the supplied pre-roll
    /// segments (already in playback order).
    pub fn open(preroll: Vec<SegmentInfo>, start: Instant, pre_roll: Duration) -> Self {
        let id = short_id();
        Self {
            id,
            started_wall: Local::now(),
            started_at: start,
            pre_roll,
            segments: preroll,
            phase: SessionPhase::Recording,
            cooldown_deadline: None,
            output_path: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn segments(&self) -> &[SegmentInfo] {
        &self.segments
    }

    pub fn cooldown_deadline(&self) -> Option<Instant> {
        self.cooldown_deadline
    }

    pub fn output_path(&self) -> Option<&Path> {
        self.output_path.as_deref()
    }

    /// Append a newly captured segment while the session is live.
    ///
    /// Segments at or below the last held sequence number are dropped, as are
    /// segments created before the session's pre-roll window opened.
    pub fn on_segment(&mut self, segment: &SegmentInfo) {
        if !self.phase.is_live() {
            return;
        }
        if let Some(last) = self.segments.last() {
            if segment.seq <= last.seq {
                return;
            }
        }
        if let Some(cutoff) = self.started_at.checked_sub(self.pre_roll) {
            if segment.created_at < cutoff {
                return;
            }
        }
        self.segments.push(segment.clone());
    }

    /// Motion resumed. Idempotent while Recording; returns a Cooldown
    /// session to Recording.
    pub fn on_motion_start(&mut self, _t: Instant) {
        if self.phase == SessionPhase::Cooldown {
            self.phase = SessionPhase::Recording;
            self.cooldown_deadline = None;
        }
    }

    /// Motion ceased: Recording -> Cooldown with a deadline.
    pub fn on_motion_stop(&mut self, t: Instant, cooldown: Duration) {
        if self.phase == SessionPhase::Recording {
            self.phase = SessionPhase::Cooldown;
            self.cooldown_deadline = Some(t + cooldown);
        }
    }

    /// Advance the cooldown timer. Returns the assigned output path when the
    /// session transitions to Finalizing.
    pub fn tick(&mut self, now: Instant, evidence_dir: &Path) -> Option<PathBuf> {
        if self.phase != SessionPhase::Cooldown {
            return None;
        }
        let deadline = self.cooldown_deadline?;
        if now < deadline {
            return None;
        }
        self.enter_finalizing(evidence_dir)
    }

    /// Shutdown path: finalize a live session immediately, bypassing any
    /// remaining cooldown.
    pub fn force_finalize(&mut self, evidence_dir: &Path) -> Option<PathBuf> {
        if !self.phase.is_live() {
            return None;
        }
        self.enter_finalizing(evidence_dir)
    }

    fn enter_finalizing(&mut self, evidence_dir: &Path) -> Option<PathBuf> {
        self.phase = SessionPhase::Finalizing;
        self.cooldown_deadline = None;
        let name = format!(
            "{}_{}.mp4",
            self.started_wall.format("%Y-%m-%d_%H-%M-%S"),
            self.id
        );
        let path = evidence_dir.join(name);
        self.output_path = Some(path.clone());
        Some(path)
    }

    pub fn mark_completed(&mut self) {
        if self.phase == SessionPhase::Finalizing {
            self.phase = SessionPhase::Completed;
        }
    }

    pub fn mark_failed(&mut self) {
        if !self.phase.is_terminal() {
            self.phase = SessionPhase::Failed;
        }
    }
}

fn short_id() -> String {
    let full = Uuid::new_v4().simple().to_string();
    full[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Instant {
        // Far enough from process start that `start - pre_roll` never
        // underflows in tests.
        Instant::now() + Duration::from_secs(1000)
    }

    fn at(base: Instant, secs: f64) -> Instant {
        base + Duration::from_secs_f64(secs)
    }

    fn seg(seq: u64, base: Instant, created_secs: f64) -> SegmentInfo {
        SegmentInfo {
            path: PathBuf::from(format!("/buf/clip_{seq:05}.ts")),
            seq,
            index: seq as u32,
            created_at: at(base, created_secs),
        }
    }

    fn create_test_session(base: Instant) -> Session {
        Session::open(
            vec![seg(2, base, 10.0)],
            at(base, 12.0),
            Duration::from_secs(3),
        )
    }

    #[test]
    fn test_opens_recording_with_preroll() {
        let b = base();
        let session = create_test_session(b);
        assert_eq!(session.phase(), SessionPhase::Recording);
        assert_eq!(session.segments().len(), 1);
        assert_eq!(session.id().len(), 8);
    }

    #[test]
    fn test_segments_strictly_increasing() {
        let b = base();
        let mut session = create_test_session(b);
        session.on_segment(&seg(3, b, 15.0));
        session.on_segment(&seg(3, b, 15.0)); // duplicate seq dropped
        session.on_segment(&seg(2, b, 10.0)); // stale seq dropped
        session.on_segment(&seg(4, b, 20.0));

        let seqs: Vec<u64> = session.segments().iter().map(|s| s.seq).collect();
        assert_eq!(seqs, vec![2, 3, 4]);
    }

    #[test]
    fn test_segment_before_preroll_window_ignored() {
        let b = base();
        // No pre-roll adopted, so the window filter is what drops it.
        let mut session = Session::open(Vec::new(), at(b, 12.0), Duration::from_secs(3));
        session.on_segment(&seg(1, b, 5.0)); // created before 12 - 3 = 9
        session.on_segment(&seg(2, b, 10.0));
        assert_eq!(session.segments().len(), 1);
        assert_eq!(session.segments()[0].seq, 2);
    }

    #[test]
    fn test_motion_stop_sets_deadline() {
        let b = base();
        let mut session = create_test_session(b);
        session.on_motion_stop(at(b, 20.0), Duration::from_secs(3));
        assert_eq!(session.phase(), SessionPhase::Cooldown);
        assert_eq!(session.cooldown_deadline(), Some(at(b, 23.0)));
    }

    #[test]
    fn test_motion_start_during_cooldown_resumes_recording() {
        let b = base();
        let mut session = create_test_session(b);
        session.on_motion_stop(at(b, 20.0), Duration::from_secs(3));
        session.on_motion_start(at(b, 21.0));
        assert_eq!(session.phase(), SessionPhase::Recording);
        assert_eq!(session.cooldown_deadline(), None);
    }

    #[test]
    fn test_motion_start_while_recording_is_noop() {
        let b = base();
        let mut session = create_test_session(b);
        session.on_motion_start(at(b, 14.0));
        assert_eq!(session.phase(), SessionPhase::Recording);
    }

    #[test]
    fn test_tick_finalizes_at_deadline() {
        let b = base();
        let mut session = create_test_session(b);
        session.on_motion_stop(at(b, 20.0), Duration::from_secs(3));

        assert!(session.tick(at(b, 22.0), Path::new("/evidence")).is_none());
        let path = session
            .tick(at(b, 23.0), Path::new("/evidence"))
            .expect("should finalize at deadline");

        assert_eq!(session.phase(), SessionPhase::Finalizing);
        assert!(path.starts_with("/evidence"));
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.ends_with(&format!("_{}.mp4", session.id())));
        // 2026-01-02_15-04-05 prefix shape
        assert_eq!(name.len(), "2026-01-02_15-04-05".len() + 1 + 8 + 4);
    }

    #[test]
    fn test_zero_cooldown_finalizes_on_next_tick() {
        let b = base();
        let mut session = create_test_session(b);
        session.on_motion_stop(at(b, 20.0), Duration::ZERO);
        assert!(session.tick(at(b, 20.0), Path::new("/evidence")).is_some());
    }

    #[test]
    fn test_no_segments_after_finalizing() {
        let b = base();
        let mut session = create_test_session(b);
        session.on_motion_stop(at(b, 20.0), Duration::ZERO);
        session.tick(at(b, 20.0), Path::new("/evidence"));

        session.on_segment(&seg(9, b, 21.0));
        assert_eq!(session.segments().len(), 1);
    }

    #[test]
    fn test_terminal_phases_freeze() {
        let b = base();
        let mut session = create_test_session(b);
        session.on_motion_stop(at(b, 20.0), Duration::ZERO);
        session.tick(at(b, 20.0), Path::new("/evidence"));
        session.mark_completed();

        assert_eq!(session.phase(), SessionPhase::Completed);
        session.on_motion_start(at(b, 25.0));
        session.on_motion_stop(at(b, 26.0), Duration::ZERO);
        session.mark_failed();
        assert_eq!(session.phase(), SessionPhase::Completed);
    }

    #[test]
    fn test_force_finalize_from_recording() {
        let b = base();
        let mut session = create_test_session(b);
        let path = session.force_finalize(Path::new("/evidence"));
        assert!(path.is_some());
        assert_eq!(session.phase(), SessionPhase::Finalizing);
    }
}
