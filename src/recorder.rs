//! MP4 assembly from captured segments.
//!
//! The recorder turns a finalizing session into one MP4 via FFmpeg's concat
//! demuxer in stream-copy mode. Workers run off the core loop so a slow
//! assembly never delays the next event.

use crate::events::{PilotEvent, SessionOutcome};
use crate::session_manager::FinalizeJob;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

const CONCAT_TIMEOUT: Duration = Duration::from_secs(60);
const RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("no usable segments for session {0}")]
    NoUsableSegments(String),

    #[error("ffmpeg concat failed: {0}")]
    ConcatFailed(String),

    #[error("ffmpeg concat timed out after {0:?}")]
    Timeout(Duration),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Default)]
pub struct Recorder;

impl Recorder {
    pub fn new() -> Self {
        Self
    }

    /// Assemble one session into its MP4.
    ///
    /// Missing or empty segments are skipped; the session still succeeds if
    /// any usable input remains. A failed concat is retried once; on the
    /// second failure the scratch directory is preserved for post-mortem.
    pub async fn finalize(&self, job: &FinalizeJob) -> Result<PathBuf, RecorderError> {
        let inputs = usable_segments(job).await?;

        tokio::fs::create_dir_all(&job.scratch_dir).await?;
        if let Some(parent) = job.output_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let manifest = job.scratch_dir.join("concat.txt");
        write_manifest(&manifest, &inputs).await?;
        debug!(
            session_id = %job.session_id,
            inputs = inputs.len(),
            manifest = %manifest.display(),
            "concat manifest written"
        );

        let mut last_err = None;
        for attempt in 1..=2u32 {
            match run_concat(&manifest, &job.output_path).await {
                Ok(()) => {
                    sync_output(&job.output_path).await?;
                    if let Err(e) = tokio::fs::remove_dir_all(&job.scratch_dir).await {
                        warn!(
                            session_id = %job.session_id,
                            error = %e,
                            "failed to remove scratch directory"
                        );
                    }
                    info!(
                        session_id = %job.session_id,
                        output = %job.output_path.display(),
                        segments = inputs.len(),
                        "recording written"
                    );
                    return Ok(job.output_path.clone());
                }
                Err(e) => {
                    warn!(
                        session_id = %job.session_id,
                        attempt,
                        error = %e,
                        "concat attempt failed"
                    );
                    last_err = Some(e);
                    if attempt == 1 {
                        tokio::time::sleep(RETRY_DELAY).await;
                    }
                }
            }
        }

        warn!(
            session_id = %job.session_id,
            scratch = %job.scratch_dir.display(),
            "giving up on session, scratch preserved"
        );
        Err(last_err.unwrap_or_else(|| {
            RecorderError::ConcatFailed("concat failed with no diagnostic output".to_string())
        }))
    }
}

/// De-duplicate by path preserving order and drop inputs that no longer
/// exist or are empty (retention may have raced the recorder).
async fn usable_segments(job: &FinalizeJob) -> Result<Vec<PathBuf>, RecorderError> {
    let mut seen: HashSet<&Path> = HashSet::new();
    let mut usable = Vec::new();

    for path in &job.segments {
        if !seen.insert(path.as_path()) {
            continue;
        }
        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.len() > 0 => usable.push(path.clone()),
            Ok(_) => {
                warn!(
                    session_id = %job.session_id,
                    path = %path.display(),
                    "segment is empty, skipping"
                );
            }
            Err(_) => {
                warn!(
                    session_id = %job.session_id,
                    path = %path.display(),
                    "segment missing at concat, skipping"
                );
            }
        }
    }

    if usable.is_empty() {
        return Err(RecorderError::NoUsableSegments(job.session_id.clone()));
    }
    Ok(usable)
}

/// Concat demuxer manifest: one `file '<absolute-path>'` line per segment.
async fn write_manifest(path: &Path, inputs: &[PathBuf]) -> std::io::Result<()> {
    let mut body = String::new();
    for input in inputs {
        body.push_str(&format!("file '{}'\n", input.display()));
    }
    tokio::fs::write(path, body).await
}

fn concat_args(manifest: &Path, output: &Path) -> Vec<String> {
    vec![
        "-hide_banner".to_string(),
        "-nostdin".to_string(),
        "-y".to_string(),
        "-f".to_string(),
        "concat".to_string(),
        "-safe".to_string(),
        "0".to_string(),
        "-i".to_string(),
        manifest.display().to_string(),
        "-c".to_string(),
        "copy".to_string(),
        "-movflags".to_string(),
        "+faststart".to_string(),
        output.display().to_string(),
    ]
}

async fn run_concat(manifest: &Path, output: &Path) -> Result<(), RecorderError> {
    let child = Command::new("ffmpeg")
        .args(concat_args(manifest, output))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    let result = tokio::time::timeout(CONCAT_TIMEOUT, child)
        .await
        .map_err(|_| RecorderError::Timeout(CONCAT_TIMEOUT))??;

    if result.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&result.stderr);
    let tail: Vec<&str> = stderr.lines().rev().take(5).collect();
    let diagnostic: Vec<&str> = tail.into_iter().rev().collect();
    Err(RecorderError::ConcatFailed(format!(
        "exit {:?}: {}",
        result.status.code(),
        diagnostic.join(" | ")
    )))
}

/// Flush the finished MP4 to stable storage before reporting success.
async fn sync_output(path: &Path) -> std::io::Result<()> {
    let file = tokio::fs::File::open(path).await?;
    file.sync_all().await
}

/// Spawn the recorder worker pool. Each worker pops finalize jobs and pushes
/// the terminal transition back into the core loop. The job queue is
/// unbounded so the core loop never blocks handing work off.
pub fn spawn_workers(
    recorder: Arc<Recorder>,
    workers: usize,
    jobs: mpsc::UnboundedReceiver<FinalizeJob>,
    events: mpsc::Sender<PilotEvent>,
) -> Vec<tokio::task::JoinHandle<()>> {
    let jobs = Arc::new(Mutex::new(jobs));

    (0..workers)
        .map(|worker_id| {
            let jobs = Arc::clone(&jobs);
            let recorder = Arc::clone(&recorder);
            let events = events.clone();

            tokio::spawn(async move {
                loop {
                    let job = { jobs.lock().await.recv().await };
                    let Some(job) = job else {
                        debug!(worker_id, "recorder worker exiting");
                        break;
                    };

                    debug!(worker_id, session_id = %job.session_id, "assembling session");
                    let outcome = match recorder.finalize(&job).await {
                        Ok(path) => SessionOutcome::Completed(path),
                        Err(e) => SessionOutcome::Failed(e.to_string()),
                    };

                    let done = PilotEvent::SessionDone {
                        session_id: job.session_id,
                        outcome,
                    };
                    if events.send(done).await.is_err() {
                        break;
                    }
                }
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_job(dir: &TempDir, segments: Vec<PathBuf>) -> FinalizeJob {
        FinalizeJob {
            session_id: "abcd1234".to_string(),
            segments,
            output_path: dir.path().join("evidence").join("out.mp4"),
            scratch_dir: dir.path().join("scratch").join("abcd1234"),
        }
    }

    async fn touch(path: &Path, contents: &[u8]) {
        tokio::fs::write(path, contents).await.unwrap();
    }

    #[tokio::test]
    async fn test_usable_segments_skips_missing_and_empty() {
        let dir = TempDir::new().unwrap();
        let good = dir.path().join("clip_00001.ts");
        let empty = dir.path().join("clip_00002.ts");
        let missing = dir.path().join("clip_00003.ts");
        touch(&good, b"data").await;
        touch(&empty, b"").await;

        let job = create_test_job(&dir, vec![good.clone(), empty, missing]);
        let usable = usable_segments(&job).await.unwrap();
        assert_eq!(usable, vec![good]);
    }

    #[tokio::test]
    async fn test_usable_segments_dedups_preserving_order() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("clip_00001.ts");
        let b = dir.path().join("clip_00002.ts");
        touch(&a, b"a").await;
        touch(&b, b"b").await;

        let job = create_test_job(&dir, vec![a.clone(), b.clone(), a.clone()]);
        let usable = usable_segments(&job).await.unwrap();
        assert_eq!(usable, vec![a, b]);
    }

    #[tokio::test]
    async fn test_no_usable_segments_is_an_error() {
        let dir = TempDir::new().unwrap();
        let job = create_test_job(&dir, vec![dir.path().join("clip_00001.ts")]);
        let err = usable_segments(&job).await.unwrap_err();
        assert!(matches!(err, RecorderError::NoUsableSegments(_)));
    }

    #[tokio::test]
    async fn test_manifest_format() {
        let dir = TempDir::new().unwrap();
        let manifest = dir.path().join("concat.txt");
        let inputs = vec![
            PathBuf::from("/buf/clip_00004.ts"),
            PathBuf::from("/buf/clip_00005.ts"),
        ];
        write_manifest(&manifest, &inputs).await.unwrap();

        let body = tokio::fs::read_to_string(&manifest).await.unwrap();
        assert_eq!(body, "file '/buf/clip_00004.ts'\nfile '/buf/clip_00005.ts'\n");
    }

    #[test]
    fn test_concat_args_shape() {
        let args = concat_args(Path::new("/scratch/s/concat.txt"), Path::new("/out/a.mp4"));
        let joined = args.join(" ");
        assert!(joined.contains("-f concat"));
        assert!(joined.contains("-safe 0"));
        assert!(joined.contains("-i /scratch/s/concat.txt"));
        assert!(joined.contains("-c copy"));
        assert!(joined.contains("-movflags +faststart"));
        assert!(joined.ends_with("/out/a.mp4"));
    }

    #[tokio::test]
    async fn test_finalize_with_no_inputs_preserves_nothing() {
        let dir = TempDir::new().unwrap();
        let job = create_test_job(&dir, vec![dir.path().join("gone.ts")]);
        let recorder = Recorder::new();
        let err = recorder.finalize(&job).await.unwrap_err();
        assert!(matches!(err, RecorderError::NoUsableSegments(_)));
        // Rejected before any scratch state was created.
        assert!(!job.scratch_dir.exists());
    }
}
