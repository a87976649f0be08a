//! Event types crossing the core loop's input queue.
//!
//! Producers (segment discovery, the detector loop, the ticker, recorder
//! workers) stamp events at the edge with the process monotonic clock; the
//! core loop and the state machines it drives only ever consume these values.

use bytes::Bytes;
use std::path::PathBuf;
use std::time::Instant;

/// A closed MPEG-TS slice of the MAIN stream, owned by the segment buffer.
///
/// `seq` is assigned by the buffer at discovery and increases monotonically
/// for the life of the process, across FFmpeg restarts and hard resets.
/// `index` is the `clip_%05d.ts` counter and restarts with the capture
/// process; it is kept for diagnostics only.
#[derive(Debug, Clone)]
pub struct SegmentInfo {
    pub path: PathBuf,
    pub seq: u64,
    pub index: u32,
    pub created_at: Instant,
}

/// Motion transition emitted by the detector, in strict Start/Stop
/// alternation beginning with Start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionEvent {
    Start(Instant),
    Stop(Instant),
}

impl MotionEvent {
    pub fn timestamp(&self) -> Instant {
        match self {
            MotionEvent::Start(t) | MotionEvent::Stop(t) => *t,
        }
    }
}

/// A decoded GRAY8 frame from the SUB stream.
#[derive(Debug, Clone)]
pub struct SubFrame {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    pub captured_at: Instant,
}

/// Terminal result of recorder work for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Completed(PathBuf),
    Failed(String),
}

/// Everything the core event loop reacts to.
#[derive(Debug)]
pub enum PilotEvent {
    Segment(SegmentInfo),
    Motion(MotionEvent),
    Tick(Instant),
    SessionDone {
        session_id: String,
        outcome: SessionOutcome,
    },
}
