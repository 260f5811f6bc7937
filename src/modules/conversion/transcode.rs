use super::job::{CodecPair, JobDescriptor, TargetFormat, UnsupportedFormat};
use async_trait::async_trait;
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

const STDERR_TAIL_LEN: usize = 2_000;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{program} exited with {status}: {stderr}")]
    Exit {
        program: String,
        status: ExitStatus,
        stderr: String,
    },

    #[error("{program} timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error(transparent)]
    InvalidFormat(#[from] UnsupportedFormat),

    #[error("Transcode engine failed: {0}")]
    EngineFailure(#[source] EngineError),
}

/// The thing that actually re-encodes media.
#[async_trait]
pub trait TranscodeEngine: Send + Sync {
    async fn transcode(
        &self,
        input: &Path,
        output: &Path,
        codecs: CodecPair,
    ) -> Result<(), EngineError>;
}

/// Runs the `ffmpeg` CLI as a child process.
#[derive(Debug, Clone)]
pub struct FfmpegEngine {
    program: PathBuf,
    timeout: Option<Duration>,
}

impl FfmpegEngine {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            timeout: None,
        }
    }

    /// Kill the child if it runs longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    fn program_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.program.to_string_lossy().to_string())
    }

    pub fn args(input: &Path, output: &Path, codecs: CodecPair) -> Vec<OsString> {
        let mut args: Vec<OsString> = ["-nostdin", "-hide_banner", "-loglevel", "error", "-y", "-i"]
            .into_iter()
            .map(OsString::from)
            .collect();
        args.push(input.as_os_str().to_owned());
        args.extend(
            ["-c:v", codecs.video, "-c:a", codecs.audio]
                .into_iter()
                .map(OsString::from),
        );
        args.push(output.as_os_str().to_owned());
        args
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    let skip = text.chars().count().saturating_sub(STDERR_TAIL_LEN);
    text.chars().skip(skip).collect()
}

#[async_trait]
impl TranscodeEngine for FfmpegEngine {
    async fn transcode(
        &self,
        input: &Path,
        output: &Path,
        codecs: CodecPair,
    ) -> Result<(), EngineError> {
        let program = self.program_name();
        let child = Command::new(&self.program)
            .args(Self::args(input, output, codecs))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| EngineError::Spawn {
                program: program.clone(),
                source,
            })?;

        let result = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, child.wait_with_output())
                .await
                .map_err(|_| EngineError::Timeout {
                    program: program.clone(),
                    timeout,
                })?,
            None => child.wait_with_output().await,
        };
        let output = result?;

        if !output.status.success() {
            return Err(EngineError::Exit {
                program,
                status: output.status,
                stderr: stderr_tail(&output.stderr),
            });
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranscodeResult {
    pub start: OffsetDateTime,
    pub end: OffsetDateTime,
    pub elapsed: Duration,
}

/// Hidden sibling of `destination` the engine writes into. The original
/// file name stays as the suffix so ffmpeg still picks the container from it.
fn staging_path(destination: &Path) -> Result<PathBuf, TranscodeError> {
    let name = destination.file_name().ok_or_else(|| {
        TranscodeError::EngineFailure(EngineError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("destination {} has no file name", destination.display()),
        )))
    })?;
    let mut staged = OsString::from(format!(".part-{}-", Uuid::new_v4().simple()));
    staged.push(name);
    Ok(destination.with_file_name(staged))
}

async fn discard(staged: &Path) {
    match tokio::fs::remove_file(staged).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove partial output {}: {}", staged.display(), e),
    }
}

/// Resolves the job's format, prepares the output location and times the engine call.
/// The destination is replaced only once the engine has succeeded.
#[derive(Clone)]
pub struct TranscodeAdapter {
    engine: Arc<dyn TranscodeEngine>,
}

impl TranscodeAdapter {
    pub fn new(engine: Arc<dyn TranscodeEngine>) -> Self {
        Self { engine }
    }

    pub async fn run(&self, job: &JobDescriptor) -> Result<TranscodeResult, TranscodeError> {
        let format: TargetFormat = job.target_format.parse()?;

        if let Some(parent) = job
            .destination_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| TranscodeError::EngineFailure(EngineError::Io(e)))?;
        }

        debug!(
            job_id = %job.job_id,
            input = %job.source_path.display(),
            output = %job.destination_path.display(),
            %format,
            "Starting transcode"
        );

        let staged = staging_path(&job.destination_path)?;
        let start = OffsetDateTime::now_utc();
        let clock = Instant::now();
        let transcoded = self
            .engine
            .transcode(&job.source_path, &staged, format.codecs())
            .await;
        if let Err(e) = transcoded {
            discard(&staged).await;
            return Err(TranscodeError::EngineFailure(e));
        }
        if let Err(e) = tokio::fs::rename(&staged, &job.destination_path).await {
            discard(&staged).await;
            return Err(TranscodeError::EngineFailure(EngineError::Io(e)));
        }
        let elapsed = clock.elapsed();
        let end = OffsetDateTime::now_utc();

        info!(
            job_id = %job.job_id,
            %format,
            elapsed_ms = elapsed.as_millis() as u64,
            "Transcode finished"
        );

        Ok(TranscodeResult { start, end, elapsed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct ScriptedEngine {
        fail: bool,
        calls: AtomicUsize,
        seen: Mutex<Vec<(PathBuf, PathBuf, CodecPair)>>,
    }

    #[async_trait]
    impl TranscodeEngine for ScriptedEngine {
        async fn transcode(
            &self,
            input: &Path,
            output: &Path,
            codecs: CodecPair,
        ) -> Result<(), EngineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen
                .lock()
                .unwrap()
                .push((input.to_path_buf(), output.to_path_buf(), codecs));
            if self.fail {
                tokio::fs::write(output, b"half written").await?;
                Err(EngineError::Io(io::Error::other("corrupt input")))
            } else {
                tokio::fs::write(output, b"converted").await?;
                Ok(())
            }
        }
    }

    fn job(destination: PathBuf, format: &str) -> JobDescriptor {
        JobDescriptor {
            job_id: "J1".to_string(),
            source_path: PathBuf::from("/in/a.mov"),
            destination_path: destination,
            target_format: format.to_string(),
        }
    }

    #[tokio::test]
    async fn success_creates_output_dir_and_times_the_call() {
        let tmp = tempfile::tempdir().unwrap();
        let destination = tmp.path().join("nested/out/a.webm");
        let engine = Arc::new(ScriptedEngine::default());
        let adapter = TranscodeAdapter::new(engine.clone());

        let result = adapter.run(&job(destination.clone(), "webm")).await.unwrap();

        assert!(tmp.path().join("nested/out").is_dir());
        assert!(result.start <= result.end);
        assert_eq!(engine.calls.load(Ordering::SeqCst), 1);
        let seen = engine.seen.lock().unwrap();
        assert_eq!(seen[0].0, PathBuf::from("/in/a.mov"));
        assert_eq!(seen[0].1.parent(), destination.parent());
        assert!(seen[0].1.to_string_lossy().ends_with("a.webm"));
        assert_ne!(seen[0].1, destination);
        assert_eq!(seen[0].2, TargetFormat::Webm.codecs());
        assert_eq!(std::fs::read(&destination).unwrap(), b"converted");
        assert!(!seen[0].1.exists());
    }

    #[tokio::test]
    async fn failed_rerun_keeps_previous_output() {
        let tmp = tempfile::tempdir().unwrap();
        let destination = tmp.path().join("a.mp4");
        std::fs::write(&destination, b"finished earlier").unwrap();
        let adapter = TranscodeAdapter::new(Arc::new(ScriptedEngine {
            fail: true,
            ..Default::default()
        }));

        let err = adapter.run(&job(destination.clone(), "mp4")).await.unwrap_err();

        assert!(matches!(err, TranscodeError::EngineFailure(_)));
        assert_eq!(std::fs::read(&destination).unwrap(), b"finished earlier");
        let leftovers: Vec<_> = std::fs::read_dir(tmp.path()).unwrap().collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[test]
    fn staging_path_is_a_hidden_sibling() {
        let staged = staging_path(Path::new("/out/clip.mp4")).unwrap();

        assert_eq!(staged.parent(), Some(Path::new("/out")));
        let name = staged.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with(".part-"));
        assert!(name.ends_with("-clip.mp4"));
        assert!(staging_path(Path::new("/")).is_err());
    }

    #[tokio::test]
    async fn existing_output_dir_is_fine() {
        let tmp = tempfile::tempdir().unwrap();
        let adapter = TranscodeAdapter::new(Arc::new(ScriptedEngine::default()));

        adapter.run(&job(tmp.path().join("a.mp4"), "mp4")).await.unwrap();
        adapter.run(&job(tmp.path().join("b.mp4"), "mp4")).await.unwrap();
    }

    #[tokio::test]
    async fn invalid_format_fails_before_any_side_effect() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = Arc::new(ScriptedEngine::default());
        let adapter = TranscodeAdapter::new(engine.clone());

        let err = adapter
            .run(&job(tmp.path().join("fresh/a.mkv"), "mkv"))
            .await
            .unwrap_err();

        match err {
            TranscodeError::InvalidFormat(UnsupportedFormat(format)) => assert_eq!(format, "mkv"),
            other => panic!("Expected InvalidFormat, got {:?}", other),
        }
        assert_eq!(engine.calls.load(Ordering::SeqCst), 0);
        assert!(!tmp.path().join("fresh").exists());
    }

    #[tokio::test]
    async fn engine_error_is_wrapped() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = Arc::new(ScriptedEngine {
            fail: true,
            ..Default::default()
        });
        let adapter = TranscodeAdapter::new(engine);

        let err = adapter
            .run(&job(tmp.path().join("a.avi"), "avi"))
            .await
            .unwrap_err();

        assert!(matches!(err, TranscodeError::EngineFailure(EngineError::Io(_))));
    }

    #[test]
    fn ffmpeg_args_carry_codecs_and_paths() {
        let args = FfmpegEngine::args(
            Path::new("/in/a.mov"),
            Path::new("/out/a.wmv"),
            TargetFormat::Wmv.codecs(),
        );
        let args: Vec<String> = args
            .into_iter()
            .map(|a| a.to_string_lossy().to_string())
            .collect();

        assert_eq!(
            args,
            vec![
                "-nostdin", "-hide_banner", "-loglevel", "error", "-y", "-i", "/in/a.mov",
                "-c:v", "wmv2", "-c:a", "wmav2", "/out/a.wmv",
            ]
        );
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let engine = FfmpegEngine::new("nonexistent_ffmpeg_xyz_12345");

        let err = engine
            .transcode(
                Path::new("/in/a.mov"),
                Path::new("/out/a.mp4"),
                TargetFormat::Mp4.codecs(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::Spawn { .. }), "unexpected error: {err}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_zero_exit_is_reported() {
        let engine = FfmpegEngine::new("false");

        let err = engine
            .transcode(
                Path::new("/in/a.mov"),
                Path::new("/out/a.mp4"),
                TargetFormat::Mp4.codecs(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::Exit { .. }), "unexpected error: {err}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_kills_the_child() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let script = tmp.path().join("slow-ffmpeg");
        std::fs::write(&script, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        let engine = FfmpegEngine::new(&script).with_timeout(Some(Duration::from_millis(100)));

        let clock = Instant::now();
        let mut result = Err(EngineError::Io(io::Error::other("not run")));
        for _ in 0..5 {
            result = engine
                .transcode(
                    Path::new("/in/a.mov"),
                    Path::new("/out/a.mp4"),
                    TargetFormat::Mp4.codecs(),
                )
                .await;
            // A freshly written script can be briefly busy while another test forks.
            match &result {
                Err(EngineError::Spawn { source, .. })
                    if source.kind() == io::ErrorKind::ExecutableFileBusy =>
                {
                    tokio::time::sleep(Duration::from_millis(20)).await
                }
                _ => break,
            }
        }

        let err = result.unwrap_err();
        assert!(matches!(err, EngineError::Timeout { .. }), "unexpected error: {err}");
        assert!(clock.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn stderr_tail_keeps_the_end() {
        let long = format!("{}END", "x".repeat(5_000));
        let tail = stderr_tail(long.as_bytes());

        assert_eq!(tail.chars().count(), STDERR_TAIL_LEN);
        assert!(tail.ends_with("END"));
    }
}
