//! Spawns and feeds an external encoder process (§4.7). Stdin is the data
//! sink; a fixed output path receives the muxed MP4. Two argument profiles
//! cover the only two codecs `Exporter` ever hands it.

use std::collections::VecDeque;
use std::path::Path;
use std::process::Stdio;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Bound on the captured stderr ring (§4.7 "bounded in-memory ring").
const STDERR_RING_CAPACITY: usize = 8 * 1024;

/// Nominal framerate for JPEG-sequence mode; exact inter-frame timing is
/// not preserved in this mode (§4.7, a documented limitation).
const JPEG_FALLBACK_FPS: u32 = 15;

#[derive(Debug, Error)]
pub enum EncoderError {
    #[error("failed to spawn encoder binary {bin:?}: {source}")]
    SpawnFailed {
        bin: String,
        #[source]
        source: std::io::Error,
    },

    #[error("encoder exited with status {status}; stderr: {stderr}")]
    NonZeroExit { status: String, stderr: String },

    #[error("I/O error writing to encoder stdin: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeMode {
    H264Passthrough,
    JpegSequence,
}

/// A running encoder process. Write-only from the caller's side; stderr is
/// drained into a bounded ring concurrently so the encoder never blocks on
/// a full pipe.
pub struct EncoderPipe {
    bin: String,
    child: Child,
    stdin: Option<ChildStdin>,
    stderr_task: JoinHandle<Vec<u8>>,
}

impl EncoderPipe {
    /// Spawns the encoder for `mode`, writing its output to `output_path`.
    pub fn spawn(bin: &str, mode: EncodeMode, output_path: &Path) -> Result<Self, EncoderError> {
        let mut cmd = Command::new(bin);
        cmd.args(encoder_args(mode, output_path));
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::piped());

        info!(bin, ?mode, output = %output_path.display(), "spawning encoder");

        let mut child = cmd.spawn().map_err(|source| EncoderError::SpawnFailed {
            bin: bin.to_string(),
            source,
        })?;

        let stdin = child.stdin.take();
        let stderr = child.stderr.take();
        let stderr_task = tokio::spawn(drain_stderr_ring(stderr));

        Ok(Self {
            bin: bin.to_string(),
            child,
            stdin,
            stderr_task,
        })
    }

    /// Writes one payload to the encoder's stdin.
    pub async fn write(&mut self, payload: &[u8]) -> Result<(), EncoderError> {
        let stdin = self
            .stdin
            .as_mut()
            .expect("write called after finish/abort");
        stdin.write_all(payload).await?;
        Ok(())
    }

    /// Closes stdin and awaits the encoder's exit. A non-zero exit folds
    /// the captured stderr ring into the error (§7).
    pub async fn finish(mut self) -> Result<(), EncoderError> {
        drop(self.stdin.take());
        let status = self.child.wait().await?;
        let stderr = self.stderr_task.await.unwrap_or_default();

        if status.success() {
            Ok(())
        } else {
            Err(EncoderError::NonZeroExit {
                status: status.to_string(),
                stderr: String::from_utf8_lossy(&stderr).into_owned(),
            })
        }
    }

    /// Kills the encoder without waiting for a clean exit (export
    /// cancellation, §5 P7 — no zombie processes survive cancellation).
    pub async fn abort(mut self) {
        drop(self.stdin.take());
        if let Err(e) = self.child.kill().await {
            warn!(bin = %self.bin, error = %e, "failed to kill encoder process on abort");
        }
        let _ = self.stderr_task.await;
    }
}

fn encoder_args(mode: EncodeMode, output_path: &Path) -> Vec<String> {
    let output = output_path.to_string_lossy().into_owned();
    match mode {
        EncodeMode::H264Passthrough => vec![
            "-hide_banner".into(),
            "-loglevel".into(),
            "warning".into(),
            "-f".into(),
            "h264".into(),
            "-i".into(),
            "pipe:0".into(),
            "-c".into(),
            "copy".into(),
            "-movflags".into(),
            "+faststart".into(),
            "-y".into(),
            output,
        ],
        EncodeMode::JpegSequence => vec![
            "-hide_banner".into(),
            "-loglevel".into(),
            "warning".into(),
            "-f".into(),
            "mjpeg".into(),
            "-framerate".into(),
            JPEG_FALLBACK_FPS.to_string(),
            "-i".into(),
            "pipe:0".into(),
            "-c:v".into(),
            "libx264".into(),
            "-pix_fmt".into(),
            "yuv420p".into(),
            "-movflags".into(),
            "+faststart".into(),
            "-y".into(),
            output,
        ],
    }
}

async fn drain_stderr_ring(stderr: Option<impl AsyncRead + Unpin>) -> Vec<u8> {
    use tokio::io::AsyncReadExt;

    let mut ring: VecDeque<u8> = VecDeque::with_capacity(STDERR_RING_CAPACITY);
    let Some(mut stderr) = stderr else {
        return Vec::new();
    };

    let mut buf = [0u8; 1024];
    loop {
        match stderr.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                for &byte in &buf[..n] {
                    if ring.len() == STDERR_RING_CAPACITY {
                        ring.pop_front();
                    }
                    ring.push_back(byte);
                }
            }
        }
    }
    ring.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn runs_true_and_succeeds() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("out.mp4");
        let mut pipe = EncoderPipe::spawn("true", EncodeMode::H264Passthrough, &out).unwrap();
        pipe.write(b"irrelevant").await.unwrap();
        pipe.finish().await.unwrap();
    }

    #[tokio::test]
    async fn nonzero_exit_surfaces_stderr() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("out.mp4");
        // `false` ignores args and always exits non-zero.
        let pipe = EncoderPipe::spawn("false", EncodeMode::JpegSequence, &out).unwrap();
        let err = pipe.finish().await.unwrap_err();
        assert!(matches!(err, EncoderError::NonZeroExit { .. }));
    }

    #[tokio::test]
    async fn missing_binary_fails_to_spawn() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("out.mp4");
        let err = EncoderPipe::spawn(
            "definitely-not-a-real-encoder-binary",
            EncodeMode::H264Passthrough,
            &out,
        )
        .unwrap_err();
        assert!(matches!(err, EncoderError::SpawnFailed { .. }));
    }

    #[test]
    fn h264_args_use_raw_annexb_input() {
        let args = encoder_args(EncodeMode::H264Passthrough, Path::new("/tmp/out.mp4"));
        assert!(args.iter().any(|a| a == "h264"));
        assert!(args.iter().any(|a| a == "copy"));
    }

    #[test]
    fn jpeg_args_specify_nominal_framerate() {
        let args = encoder_args(EncodeMode::JpegSequence, Path::new("/tmp/out.mp4"));
        assert!(args.iter().any(|a| a == JPEG_FALLBACK_FPS.to_string()));
        assert!(args.iter().any(|a| a == "libx264"));
    }
}
