//! Camera capture
//!
//! Frames come from a [`FrameSource`] (FFmpeg reading V4L2 by default) and
//! are piped into an FFmpeg H.264 encoder that burns in the wall-clock time.
//! Every frame's capture time is appended to `video_timestamp.txt` in
//! "timecode format v2", in milliseconds since the session start.

use super::traits::{FrameSource, PixelEncoding, VideoFormat, VideoSink};
use crate::config::CameraConfig;
use crate::recorder::{Recorder, RecorderError, RecorderKind, RecorderResult, StopFlag};
use crate::session::{Session, VIDEO_FILE, VIDEO_TIMESTAMP_FILE};
use chrono::{DateTime, Utc};
use std::fs::File;
use std::io::{self, BufReader, LineWriter, Read, Write};
use std::path::Path;
use std::process::{Child, ChildStdout, Command, Stdio};

const TIMECODE_HEADER: &str = "# timecode format v2";

/// Fail early with a clear message when FFmpeg is not installed
pub fn ensure_ffmpeg() -> RecorderResult<()> {
    match Command::new("ffmpeg").arg("-version").output() {
        Ok(output) if output.status.success() => Ok(()),
        _ => Err(RecorderError::ConfigurationError(
            "FFmpeg not found. Please install FFmpeg: apt install ffmpeg".to_string(),
        )),
    }
}

/// FFmpeg H.264 encoder fed raw frames on stdin
pub struct FfmpegEncoder {
    process: Option<Child>,
    frame_count: u64,
}

impl FfmpegEncoder {
    pub fn spawn(format: &VideoFormat, config: &CameraConfig, output: &Path) -> RecorderResult<Self> {
        let mut cmd = Command::new("ffmpeg");
        cmd.args(["-hide_banner", "-loglevel", "error", "-y"]);

        match &format.encoding {
            PixelEncoding::Raw(pixel_format) => {
                cmd.args(["-f", "rawvideo", "-pixel_format", pixel_format.as_str()])
                    .args(["-video_size", &format!("{}x{}", format.width, format.height)]);
            }
            PixelEncoding::Mjpeg => {
                cmd.args(["-f", "mjpeg"]);
            }
        }

        cmd.args(["-framerate", &format.fps.to_string(), "-i", "-"]);

        if config.overlay_timestamp {
            cmd.args([
                "-vf",
                "drawtext=text='%{localtime}':x=0:y=30:fontsize=32:fontcolor=0x00FF00",
            ]);
        }

        cmd.args([
            "-c:v",
            "libx264",
            "-preset",
            "veryfast",
            "-pix_fmt",
            "yuv420p",
            "-b:v",
            &config.bitrate.to_string(),
            "-g",
            &(format.fps * 2).to_string(),
            "-f",
            "h264",
        ])
        .arg(output)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped());

        let process = cmd
            .spawn()
            .map_err(|e| RecorderError::Encoder(format!("Failed to start FFmpeg encoder: {e}")))?;

        tracing::info!(
            "Started FFmpeg encoder: {}x{} @ {}fps, {:?} -> {:?}",
            format.width,
            format.height,
            format.fps,
            format.encoding,
            output
        );

        Ok(Self {
            process: Some(process),
            frame_count: 0,
        })
    }
}

impl VideoSink for FfmpegEncoder {
    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        let stdin = self
            .process
            .as_mut()
            .and_then(|p| p.stdin.as_mut())
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "encoder already finished"))?;
        stdin.write_all(frame)?;
        self.frame_count += 1;
        Ok(())
    }

    fn finish(&mut self) -> io::Result<()> {
        let Some(mut process) = self.process.take() else {
            return Ok(());
        };

        // Closing stdin makes FFmpeg flush and finalize the stream
        drop(process.stdin.take());
        let output = process.wait_with_output()?;
        if !output.status.success() {
            tracing::warn!(
                "FFmpeg encoder exited with status {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            );
        }

        tracing::info!("FFmpeg encoder finished: {} frames", self.frame_count);
        Ok(())
    }
}

impl Drop for FfmpegEncoder {
    fn drop(&mut self) {
        if let Some(mut process) = self.process.take() {
            let _ = process.kill();
            let _ = process.wait();
        }
    }
}

/// V4L2 capture through FFmpeg, decoded to raw `yuv420p` frames
pub struct V4l2Source {
    process: Child,
    stdout: BufReader<ChildStdout>,
    format: VideoFormat,
    frame_size: usize,
}

impl V4l2Source {
    pub fn open(config: &CameraConfig) -> RecorderResult<Self> {
        if !Path::new(&config.device).exists() {
            return Err(RecorderError::DeviceUnavailable(format!(
                "camera device {} not found",
                config.device
            )));
        }
        ensure_ffmpeg()?;

        let mut process = Command::new("ffmpeg")
            .args(["-hide_banner", "-loglevel", "error", "-f", "v4l2"])
            .args(["-framerate", &config.fps.to_string()])
            .args(["-video_size", &format!("{}x{}", config.width, config.height)])
            .args(["-i", &config.device])
            .args(["-f", "rawvideo", "-pix_fmt", "yuv420p", "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| RecorderError::DeviceUnavailable(format!("Failed to start FFmpeg capture: {e}")))?;

        let frame_size = (config.width * config.height * 3 / 2) as usize;
        let stdout = process
            .stdout
            .take()
            .ok_or_else(|| RecorderError::DeviceUnavailable("Failed to capture FFmpeg stdout".to_string()))?;

        tracing::info!(
            "Opened camera {} at {}x{} @ {}fps",
            config.device,
            config.width,
            config.height,
            config.fps
        );

        Ok(Self {
            process,
            stdout: BufReader::with_capacity(frame_size * 2, stdout),
            format: VideoFormat {
                width: config.width,
                height: config.height,
                fps: config.fps,
                encoding: PixelEncoding::Raw("yuv420p".to_string()),
            },
            frame_size,
        })
    }
}

impl FrameSource for V4l2Source {
    fn format(&self) -> &VideoFormat {
        &self.format
    }

    fn next_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut frame = vec![0u8; self.frame_size];
        match self.stdout.read_exact(&mut frame) {
            Ok(()) => Ok(Some(frame)),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "camera stream ended",
            )),
            Err(e) => Err(e),
        }
    }
}

impl Drop for V4l2Source {
    fn drop(&mut self) {
        let _ = self.process.kill();
        let _ = self.process.wait();
    }
}

/// Writes one capture time per frame
struct TimestampIndex {
    out: LineWriter<File>,
    origin: DateTime<Utc>,
}

impl TimestampIndex {
    fn create(path: &Path, origin: DateTime<Utc>) -> io::Result<Self> {
        let mut out = LineWriter::new(File::create(path)?);
        writeln!(out, "{TIMECODE_HEADER}")?;
        Ok(Self { out, origin })
    }

    fn push(&mut self, captured_at: DateTime<Utc>) -> io::Result<()> {
        let micros = (captured_at - self.origin).num_microseconds().unwrap_or(0);
        writeln!(self.out, "{:.3}", micros as f64 / 1000.0)
    }
}

/// Streams camera frames to `video.h264`
pub struct CameraRecorder {
    source: Box<dyn FrameSource>,
    sink: Box<dyn VideoSink>,
    index: TimestampIndex,
    frames: u64,
}

impl CameraRecorder {
    /// Wire an opened source to an encoder writing into the session
    pub fn new(source: Box<dyn FrameSource>, sink: Box<dyn VideoSink>, session: &Session) -> RecorderResult<Self> {
        let index = TimestampIndex::create(&session.path_for(VIDEO_TIMESTAMP_FILE), session.started_at())?;
        Ok(Self {
            source,
            sink,
            index,
            frames: 0,
        })
    }

    /// Open the configured camera and encoder for `session`
    pub fn open(source: Box<dyn FrameSource>, config: &CameraConfig, session: &Session) -> RecorderResult<Self> {
        ensure_ffmpeg()?;
        let encoder = FfmpegEncoder::spawn(source.format(), config, &session.path_for(VIDEO_FILE))?;
        Self::new(source, Box::new(encoder), session)
    }

    fn capture(&mut self, stop: &StopFlag) -> RecorderResult<()> {
        while !stop.is_requested() {
            let Some(frame) = self.source.next_frame()? else {
                continue;
            };
            self.index.push(Utc::now())?;
            self.sink
                .write_frame(&frame)
                .map_err(|e| RecorderError::Encoder(format!("Failed to write frame: {e}")))?;
            self.frames += 1;
        }
        Ok(())
    }
}

impl Recorder for CameraRecorder {
    fn kind(&self) -> RecorderKind {
        RecorderKind::Camera
    }

    fn record(&mut self, stop: &StopFlag) -> RecorderResult<()> {
        tracing::info!("Camera recording started ({:?})", self.source.format());

        let result = self.capture(stop);

        // Finalize even after a capture error; a broken tail is logged only
        if let Err(e) = self.sink.finish() {
            tracing::warn!("Failed to finalize video: {}", e);
        }
        if let Err(e) = self.index.out.flush() {
            tracing::warn!("Failed to flush frame timestamps: {}", e);
        }

        tracing::info!("Camera recording ended: {} frames", self.frames);
        result
    }
}
