//! Device Pilot: motion-triggered event capture from a dual-stream camera.
//!
//! Two RTSP streams come in, MP4 files come out. The high-res MAIN stream is
//! continuously captured into a rolling buffer of HLS segments; the low-res
//! SUB stream feeds motion and light-change detection. Every detected event
//! becomes one self-contained MP4 with pre-roll footage, the active period
//! and a cooldown tail. Overlapping events produce overlapping files.
//!
//! # Architecture
//!
//! ```text
//! MAIN RTSP ─ ffmpeg ─ SegmentBuffer ──┐
//!                                      ├─► event loop ─ SessionManager ─► Recorder pool ─ ffmpeg ─► MP4
//! SUB  RTSP ─ gstreamer ─ Detector ────┘        ▲
//!                                    Ticker ────┘
//! ```
//!
//! All state mutation is serialized through the event loop in [`pilot`];
//! the state machines in [`session`] and [`session_manager`] are pure and
//! take the clock as a parameter.

pub mod buffer;
pub mod config;
pub mod detector;
pub mod events;
pub mod pilot;
pub mod recorder;
pub mod session;
pub mod session_manager;
pub mod substream;
pub mod watcher;

pub use buffer::{BufferConfig, BufferError, SegmentBuffer};
pub use config::{ConfigValidationError, PilotConfig};
pub use detector::{Detector, DetectorConfig, FrameAnalysis};
pub use events::{MotionEvent, PilotEvent, SegmentInfo, SessionOutcome, SubFrame};
pub use recorder::{Recorder, RecorderError};
pub use session::{Session, SessionPhase};
pub use session_manager::{FinalizeJob, SegmentStore, SessionManager, SessionTimings};
pub use substream::{SubStreamClient, SubStreamConfig, SubStreamError};
pub use watcher::{SegmentWatcher, WatchError, WatchEvent, WatchKind};
