//! Video sinks available from the command line.

use std::io::Write as _;
use std::path::Path;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use clap::ValueEnum;
use pipeline::gpu::PresentedFrame;
use pipeline::{
    EncoderConfig, EncoderError, FrameConsumer, MemoryRecording, NativeSurface, SharedSinkFactory,
    VideoSink,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SinkKind {
    /// Pipe frames to the system `ffmpeg` and write an H.264 MP4.
    Ffmpeg,
    /// Count frames in memory and write nothing.
    Null,
}

/// The factory handed to the pipeline plus whatever the CLI needs to report
/// afterwards.
pub struct SinkSetup {
    pub factory: SharedSinkFactory,
    pub memory: Option<Arc<MemoryRecording>>,
}

pub fn build(kind: SinkKind) -> anyhow::Result<SinkSetup> {
    match kind {
        SinkKind::Ffmpeg => {
            if !is_ffmpeg_on_path() {
                anyhow::bail!("ffmpeg was not found on PATH; install it or use `--sink null`");
            }
            Ok(SinkSetup {
                factory: Arc::new(|| -> Box<dyn VideoSink> { Box::new(FfmpegSink::default()) }),
                memory: None,
            })
        }
        SinkKind::Null => {
            let recording = MemoryRecording::counting();
            Ok(SinkSetup {
                factory: recording.factory(),
                memory: Some(recording),
            })
        }
    }
}

pub fn is_ffmpeg_on_path() -> bool {
    Command::new("ffmpeg")
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

/// Encodes the frames swapped into its input surface with an `ffmpeg` child
/// reading raw RGBA on stdin.
#[derive(Default)]
pub struct FfmpegSink {
    child: Option<Child>,
    input: Option<Arc<FfmpegInput>>,
}

struct FfmpegInput {
    stdin: Mutex<Option<ChildStdin>>,
    frame_len: usize,
    frames: AtomicU64,
    error: Mutex<Option<String>>,
}

impl FfmpegInput {
    fn stdin(&self) -> MutexGuard<'_, Option<ChildStdin>> {
        self.stdin.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn take_error(&self) -> Option<String> {
        self.error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    fn fail(&self, message: String) {
        let mut error = self.error.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if error.is_none() {
            tracing::error!(%message, "ffmpeg input failed");
            *error = Some(message);
        }
    }
}

impl FrameConsumer for FfmpegInput {
    fn present(&self, frame: PresentedFrame) {
        if frame.pixels.data.len() != self.frame_len {
            self.fail(format!(
                "frame of {} bytes does not match the {} byte input",
                frame.pixels.data.len(),
                self.frame_len
            ));
            return;
        }
        let mut stdin = self.stdin();
        let Some(pipe) = stdin.as_mut() else {
            return;
        };
        if let Err(err) = pipe.write_all(&frame.pixels.data) {
            stdin.take();
            drop(stdin);
            self.fail(format!("failed to write frame to ffmpeg: {err}"));
            return;
        }
        self.frames.fetch_add(1, Ordering::Relaxed);
    }
}

fn ensure_parent_dir(path: &Path) -> Result<(), EncoderError> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => std::fs::create_dir_all(parent)
            .map_err(|err| {
                EncoderError::Sink(format!(
                    "failed to create output directory '{}': {err}",
                    parent.display()
                ))
            }),
        _ => Ok(()),
    }
}

impl VideoSink for FfmpegSink {
    fn prepare(&mut self, config: &EncoderConfig) -> Result<NativeSurface, EncoderError> {
        // yuv420p output needs even dimensions.
        if config.width % 2 != 0 || config.height % 2 != 0 {
            return Err(EncoderError::UnsupportedSize {
                width: config.width,
                height: config.height,
            });
        }
        ensure_parent_dir(&config.output)?;

        let mut command = Command::new("ffmpeg");
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .args([
                "-y",
                "-loglevel",
                "error",
                "-f",
                "rawvideo",
                "-pix_fmt",
                "rgba",
                "-s",
                &format!("{}x{}", config.width, config.height),
                "-r",
                &config.frame_rate.to_string(),
                "-i",
                "pipe:0",
                "-an",
                "-c:v",
                "libx264",
                "-b:v",
                &config.bit_rate.to_string(),
                "-pix_fmt",
                "yuv420p",
                "-movflags",
                "+faststart",
            ])
            .arg(&config.output);

        let mut child = command
            .spawn()
            .map_err(|err| EncoderError::Sink(format!("failed to spawn ffmpeg: {err}")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EncoderError::Sink("ffmpeg stdin was not captured".into()))?;
        tracing::info!(
            output = %config.output.display(),
            width = config.width,
            height = config.height,
            bit_rate = config.bit_rate,
            "ffmpeg encoder started"
        );

        let input = Arc::new(FfmpegInput {
            stdin: Mutex::new(Some(stdin)),
            frame_len: config.width as usize * config.height as usize * 4,
            frames: AtomicU64::new(0),
            error: Mutex::new(None),
        });
        self.child = Some(child);
        self.input = Some(input.clone());
        Ok(NativeSurface::new(config.width, config.height, input))
    }

    fn drain(&mut self, end_of_stream: bool) -> Result<(), EncoderError> {
        let Some(input) = self.input.as_ref() else {
            return Ok(());
        };
        if let Some(message) = input.take_error() {
            return Err(EncoderError::Sink(message));
        }
        if !end_of_stream {
            return Ok(());
        }

        input.stdin().take();
        let frames = input.frames.load(Ordering::Relaxed);
        let Some(child) = self.child.take() else {
            return Ok(());
        };
        let output = child
            .wait_with_output()
            .map_err(|err| EncoderError::Sink(format!("failed to wait for ffmpeg: {err}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EncoderError::Sink(format!(
                "ffmpeg exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        tracing::info!(frames, "ffmpeg encoder finished");
        Ok(())
    }

    fn release(&mut self) {
        if let Some(input) = self.input.take() {
            input.stdin().take();
        }
        if let Some(mut child) = self.child.take() {
            if let Err(err) = child.kill() {
                tracing::debug!(error = %err, "ffmpeg already exited");
            }
            let _ = child.wait();
        }
    }
}

impl Drop for FfmpegSink {
    fn drop(&mut self) {
        self.release();
    }
}
