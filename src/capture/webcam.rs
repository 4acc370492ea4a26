//! UVC webcam capture using nokhwa
//!
//! nokhwa's `Camera` is not `Send`, so it lives on its own capture thread and
//! hands raw frames over a bounded channel.

use super::traits::{FrameSource, PixelEncoding, VideoFormat};
use crate::config::CameraConfig;
use crate::recorder::{RecorderError, RecorderResult};
use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType};
use nokhwa::Camera;
use std::io;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::thread::JoinHandle;
use std::time::Duration;

const FRAME_QUEUE: usize = 8;
const FRAME_WAIT: Duration = Duration::from_millis(500);

/// `/dev/videoN` maps to index N, anything else is passed through by name
fn camera_index(device: &str) -> CameraIndex {
    device
        .strip_prefix("/dev/video")
        .and_then(|n| n.parse().ok())
        .map(CameraIndex::Index)
        .unwrap_or_else(|| CameraIndex::String(device.to_string()))
}

/// FFmpeg input encoding for a nokhwa frame format
fn encoding_for(format: FrameFormat) -> PixelEncoding {
    match format {
        FrameFormat::MJPEG => PixelEncoding::Mjpeg,
        FrameFormat::YUYV => PixelEncoding::Raw("yuyv422".to_string()),
        FrameFormat::NV12 => PixelEncoding::Raw("nv12".to_string()),
        FrameFormat::GRAY => PixelEncoding::Raw("gray".to_string()),
        FrameFormat::RAWRGB => PixelEncoding::Raw("rgb24".to_string()),
        _ => {
            tracing::warn!("Unknown camera format {:?}, falling back to yuyv422", format);
            PixelEncoding::Raw("yuyv422".to_string())
        }
    }
}

/// Frames from a nokhwa camera, passed through undecoded
pub struct NokhwaSource {
    frames: Option<Receiver<io::Result<Vec<u8>>>>,
    format: VideoFormat,
    thread: Option<JoinHandle<()>>,
}

impl NokhwaSource {
    pub fn open(config: &CameraConfig) -> RecorderResult<Self> {
        let index = camera_index(&config.device);
        let requested = CameraFormat::new_from(config.width, config.height, FrameFormat::MJPEG, config.fps);
        let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<VideoFormat, String>>(1);
        let (frame_tx, frame_rx) = mpsc::sync_channel(FRAME_QUEUE);

        let thread = std::thread::Builder::new()
            .name("nokhwa-capture".to_string())
            .spawn(move || capture_loop(index, requested, ready_tx, frame_tx))
            .map_err(RecorderError::Io)?;

        let format = match ready_rx.recv() {
            Ok(Ok(format)) => format,
            Ok(Err(reason)) => {
                let _ = thread.join();
                return Err(RecorderError::DeviceUnavailable(reason));
            }
            Err(_) => {
                let _ = thread.join();
                return Err(RecorderError::DeviceUnavailable(
                    "camera thread exited before opening the stream".to_string(),
                ));
            }
        };

        Ok(Self {
            frames: Some(frame_rx),
            format,
            thread: Some(thread),
        })
    }
}

fn capture_loop(
    index: CameraIndex,
    requested: CameraFormat,
    ready: SyncSender<Result<VideoFormat, String>>,
    frames: SyncSender<io::Result<Vec<u8>>>,
) {
    let format = RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(requested));
    let mut camera = match Camera::new(index.clone(), format) {
        Ok(camera) => camera,
        Err(e) => {
            let _ = ready.send(Err(format!("Failed to open camera {index:?}: {e}")));
            return;
        }
    };
    if let Err(e) = camera.open_stream() {
        let _ = ready.send(Err(format!("Failed to open camera stream: {e}")));
        return;
    }

    let actual = camera.camera_format();
    let video_format = VideoFormat {
        width: actual.resolution().width(),
        height: actual.resolution().height(),
        fps: actual.frame_rate(),
        encoding: encoding_for(actual.format()),
    };
    tracing::info!(
        "Webcam opened: {}x{} @ {}fps, format={:?}",
        video_format.width,
        video_format.height,
        video_format.fps,
        actual.format()
    );
    if ready.send(Ok(video_format)).is_err() {
        let _ = camera.stop_stream();
        return;
    }

    loop {
        let next = camera
            .frame()
            .map(|frame| frame.buffer().to_vec())
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()));
        let failed = next.is_err();
        // Receiver dropped: the recorder is done
        if frames.send(next).is_err() || failed {
            break;
        }
    }

    if let Err(e) = camera.stop_stream() {
        tracing::warn!("Failed to stop camera stream: {}", e);
    }
}

impl FrameSource for NokhwaSource {
    fn format(&self) -> &VideoFormat {
        &self.format
    }

    fn next_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
        let Some(frames) = self.frames.as_ref() else {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "camera closed"));
        };
        match frames.recv_timeout(FRAME_WAIT) {
            Ok(frame) => frame.map(Some),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "camera capture thread stopped",
            )),
        }
    }
}

impl Drop for NokhwaSource {
    fn drop(&mut self) {
        // Dropping the receiver ends the capture loop at its next frame
        self.frames.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
