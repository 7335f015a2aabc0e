//! Sequential frame sources consumed by the capture loop.

use crate::camera::{Camera, CameraError, VideoStream};
use crate::frame::FrameError;
use image::RgbImage;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};

const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// A source of raw color frames, read one at a time.
pub trait FrameSource {
    /// The next frame, or `Ok(None)` once the source is exhausted.
    ///
    /// An error means the source is unusable; callers end their loop.
    fn next_frame(&mut self) -> Result<Option<RgbImage>, CameraError>;
}

/// A capture device read through a long-lived stream.
pub trait StreamingDevice {
    type Stream;

    fn start_stream(&self) -> Result<Self::Stream, CameraError>;
    fn read_frame(&self, stream: &mut Self::Stream) -> Result<RgbImage, CameraError>;
}

impl StreamingDevice for Camera {
    type Stream = VideoStream;

    fn start_stream(&self) -> Result<VideoStream, CameraError> {
        Camera::start_stream(self)
    }

    fn read_frame(&self, stream: &mut VideoStream) -> Result<RgbImage, CameraError> {
        Camera::read_frame(self, stream)
    }
}

/// Live camera. The stream starts on the first read and stays open for the
/// rest of the session; a failed read drops it so the next read restarts.
pub struct CameraSource<D: StreamingDevice = Camera> {
    device: D,
    stream: Option<D::Stream>,
}

impl CameraSource<Camera> {
    pub fn open(device_path: &str, width: u32, height: u32) -> Result<Self, CameraError> {
        Ok(Self::new(Camera::open(device_path, width, height)?))
    }
}

impl<D: StreamingDevice> CameraSource<D> {
    pub fn new(device: D) -> Self {
        Self {
            device,
            stream: None,
        }
    }

    pub fn device(&self) -> &D {
        &self.device
    }
}

impl<D: StreamingDevice> FrameSource for CameraSource<D> {
    fn next_frame(&mut self) -> Result<Option<RgbImage>, CameraError> {
        let mut stream = match self.stream.take() {
            Some(stream) => stream,
            None => self.device.start_stream()?,
        };
        let frame = self.device.read_frame(&mut stream)?;
        self.stream = Some(stream);
        Ok(Some(frame))
    }
}

/// Replays image files in file-name order, then ends.
pub struct ImageFolderSource {
    pending: VecDeque<PathBuf>,
}

impl ImageFolderSource {
    pub fn open(dir: &Path) -> Result<Self, CameraError> {
        if !dir.is_dir() {
            return Err(CameraError::DeviceNotFound(dir.display().to_string()));
        }
        Ok(Self::from_paths(list_images(dir)?))
    }

    pub fn from_paths(paths: Vec<PathBuf>) -> Self {
        Self {
            pending: paths.into(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.pending.len()
    }
}

impl FrameSource for ImageFolderSource {
    fn next_frame(&mut self) -> Result<Option<RgbImage>, CameraError> {
        let Some(path) = self.pending.pop_front() else {
            return Ok(None);
        };
        tracing::debug!(path = %path.display(), "replaying frame");
        let image = image::open(&path).map_err(FrameError::from)?;
        Ok(Some(image.to_rgb8()))
    }
}

/// Whether the path has a `.jpg`, `.jpeg` or `.png` extension (any case).
pub fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.iter().any(|x| x.eq_ignore_ascii_case(e)))
        .unwrap_or(false)
}

/// Image files directly inside `dir`, sorted by path.
pub fn list_images(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && is_image_file(&path) {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}
