/// Camera module - frame delivery. The scanner consumes ready frames and never
/// drives a camera itself; sources are pluggable and run on one capture thread each.

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, TrySendError};
use image::{GrayImage, ImageFormat};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::events::EventBus;

/// 8-bit grayscale frame, indexed `[row, column]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub pixels: Array2<u8>,
    pub sequence: u64,
}

impl Frame {
    pub fn new(pixels: Array2<u8>, sequence: u64) -> Self {
        Self { pixels, sequence }
    }

    pub fn width(&self) -> usize {
        self.pixels.ncols()
    }

    pub fn height(&self) -> usize {
        self.pixels.nrows()
    }

    pub fn from_gray_image(image: &GrayImage, sequence: u64) -> Result<Self> {
        let (w, h) = image.dimensions();
        let pixels = Array2::from_shape_vec((h as usize, w as usize), image.as_raw().clone())
            .context("Gray image buffer does not match its dimensions")?;
        Ok(Self { pixels, sequence })
    }

    pub fn to_gray_image(&self) -> Result<GrayImage> {
        let raw: Vec<u8> = self.pixels.iter().copied().collect();
        GrayImage::from_raw(self.width() as u32, self.height() as u32, raw)
            .ok_or_else(|| anyhow!("Frame of {}x{} does not fit an image buffer", self.width(), self.height()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let image = image::open(path).with_context(|| format!("Failed to open image {:?}", path))?;
        Self::from_gray_image(&image.to_luma8(), 0)
    }

    pub fn save_png(&self, path: &Path) -> Result<()> {
        self.to_gray_image()?
            .save_with_format(path, ImageFormat::Png)
            .with_context(|| format!("Failed to write {:?}", path))
    }
}

pub trait FrameSource: Send {
    fn next_frame(&mut self) -> Result<Frame>;
    fn name(&self) -> String;
}

/// Well-plate pattern for the simulated rig: bright wells of alternating
/// width (ratio sqrt 2) between dark grid lines, with a few dark worms that
/// crawl a little every frame.
#[derive(Debug, Clone)]
pub struct SyntheticGridSource {
    pub width: usize,
    pub height: usize,
    pub well: usize,
    pub line: usize,
    pub worms: usize,
    sequence: u64,
}

impl SyntheticGridSource {
    pub fn new(width: usize, height: usize) -> Self {
        Self { width, height, well: 100, line: 12, worms: 6, sequence: 0 }
    }

    /// Grid line positions along one axis of `len` pixels.
    fn line_mask(&self, len: usize) -> Vec<bool> {
        let long = (self.well as f64 * std::f64::consts::SQRT_2).round() as usize;
        let mut mask = vec![false; len];
        let mut pos = 0;
        let mut short = true;
        while pos < len {
            for p in pos..(pos + self.line).min(len) {
                mask[p] = true;
            }
            pos += self.line + if short { self.well } else { long };
            short = !short;
        }
        mask
    }

    pub fn render(&self, sequence: u64) -> Frame {
        let cols = self.line_mask(self.width);
        let rows = self.line_mask(self.height);
        let mut pixels = Array2::from_shape_fn((self.height, self.width), |(r, c)| {
            // Soft vignette so the high-pass filter has something to remove.
            let dx = c as f64 / self.width.max(1) as f64 - 0.5;
            let dy = r as f64 / self.height.max(1) as f64 - 0.5;
            let shade = 20.0 * (dx * dx + dy * dy);
            if rows[r] || cols[c] {
                (45.0 - shade).max(0.0) as u8
            } else {
                (205.0 - shade) as u8
            }
        });

        for worm in 0..self.worms {
            let seed = worm as u64 * 7919 + 17;
            let cx = (seed * 131 + sequence * 3) as usize % self.width.max(1);
            let cy = (seed * 197 + sequence * 2) as usize % self.height.max(1);
            let (half_len, half_width) = (9i64, 3i64);
            for dy in -half_width..=half_width {
                for dx in -half_len..=half_len {
                    let (x, y) = (cx as i64 + dx, cy as i64 + dy);
                    if x < 0 || y < 0 || x >= self.width as i64 || y >= self.height as i64 {
                        continue;
                    }
                    let inside = (dx * dx) as f64 / (half_len * half_len) as f64
                        + (dy * dy) as f64 / (half_width * half_width) as f64
                        <= 1.0;
                    if inside {
                        pixels[[y as usize, x as usize]] = 90;
                    }
                }
            }
        }
        Frame::new(pixels, sequence)
    }
}

impl FrameSource for SyntheticGridSource {
    fn next_frame(&mut self) -> Result<Frame> {
        let frame = self.render(self.sequence);
        self.sequence += 1;
        Ok(frame)
    }

    fn name(&self) -> String {
        format!("synthetic {}x{}", self.width, self.height)
    }
}

/// Cycles through image files on disk.
#[derive(Debug, Clone)]
pub struct ImageFileSource {
    paths: Vec<PathBuf>,
    index: usize,
    sequence: u64,
}

impl ImageFileSource {
    pub fn new(paths: Vec<PathBuf>) -> Result<Self> {
        if paths.is_empty() {
            return Err(anyhow!("Image file source needs at least one file"));
        }
        Ok(Self { paths, index: 0, sequence: 0 })
    }

    /// All PNG files in `dir`, in name order.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
            .with_context(|| format!("Failed to list {:?}", dir))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.extension()
                    .and_then(|e| e.to_str())
                    .map_or(false, |e| e.eq_ignore_ascii_case("png"))
            })
            .collect();
        paths.sort();
        Self::new(paths).with_context(|| format!("No PNG images in {:?}", dir))
    }
}

impl FrameSource for ImageFileSource {
    fn next_frame(&mut self) -> Result<Frame> {
        let path = &self.paths[self.index % self.paths.len()];
        let mut frame = Frame::load(path)?;
        frame.sequence = self.sequence;
        self.index = (self.index + 1) % self.paths.len();
        self.sequence += 1;
        Ok(frame)
    }

    fn name(&self) -> String {
        format!("{} image file(s)", self.paths.len())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraSourceKind {
    #[default]
    Synthetic,
    Directory,
    /// No camera; snapshots log coordinates only.
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "SCREAMING_SNAKE_CASE")]
pub struct CameraSettings {
    pub source: CameraSourceKind,
    pub directory: Option<PathBuf>,
    pub width: usize,
    pub height: usize,
    pub interval_ms: u64,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self { source: CameraSourceKind::Synthetic, directory: None, width: 640, height: 480, interval_ms: 200 }
    }
}

impl CameraSettings {
    pub fn validate(&self) -> Result<()> {
        match self.source {
            CameraSourceKind::Synthetic if self.width == 0 || self.height == 0 => {
                Err(anyhow!("Synthetic camera needs a non-zero WIDTH and HEIGHT"))
            }
            CameraSourceKind::Directory if self.directory.is_none() => {
                Err(anyhow!("SOURCE directory needs DIRECTORY"))
            }
            _ => Ok(()),
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }

    /// The configured source, `None` when the camera is switched off.
    pub fn open(&self) -> Result<Option<Box<dyn FrameSource>>> {
        self.validate()?;
        let source: Box<dyn FrameSource> = match (self.source, &self.directory) {
            (CameraSourceKind::Synthetic, _) => Box::new(SyntheticGridSource::new(self.width, self.height)),
            (CameraSourceKind::Directory, Some(dir)) => Box::new(ImageFileSource::from_dir(dir)?),
            _ => return Ok(None),
        };
        Ok(Some(source))
    }
}

/// Background capture with latest-frame semantics: when the consumer falls
/// behind, the oldest queued frame is dropped.
pub struct CaptureThread {
    rx: Receiver<Frame>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl CaptureThread {
    pub fn spawn(mut source: Box<dyn FrameSource>, interval: Duration, events: EventBus) -> Result<Self> {
        let (tx, rx) = bounded::<Frame>(2);
        let overflow = rx.clone();
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let name = source.name();

        let handle = std::thread::Builder::new()
            .name("capture".to_string())
            .spawn(move || {
                log::info!(target: "platescanner::camera", "capture started: {}", name);
                let mut failing = false;
                while flag.load(Ordering::SeqCst) {
                    match source.next_frame() {
                        Ok(frame) => {
                            failing = false;
                            match tx.try_send(frame) {
                                Ok(()) => {}
                                Err(TrySendError::Full(frame)) => {
                                    let _ = overflow.try_recv();
                                    let _ = tx.try_send(frame);
                                }
                                Err(TrySendError::Disconnected(_)) => break,
                            }
                        }
                        Err(e) if !failing => {
                            failing = true;
                            events.warn("camera", format!("frame capture failed: {:#}", e));
                        }
                        Err(e) => log::debug!(target: "platescanner::camera", "capture still failing: {}", e),
                    }
                    std::thread::sleep(interval);
                }
                log::info!(target: "platescanner::camera", "capture stopped");
            })
            .context("Failed to start capture thread")?;

        Ok(Self { rx, running, handle: Some(handle) })
    }

    /// Newest frame since the last call, if any.
    pub fn latest(&self) -> Option<Frame> {
        self.rx.try_iter().last()
    }

    pub fn wait_frame(&self, timeout: Duration) -> Option<Frame> {
        match self.rx.recv_timeout(timeout) {
            Ok(first) => Some(self.latest().unwrap_or(first)),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn close(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CaptureThread {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gray_image_conversion_keeps_orientation() {
        let mut pixels = Array2::<u8>::zeros((2, 3));
        pixels[[0, 2]] = 200;
        pixels[[1, 0]] = 7;
        let frame = Frame::new(pixels, 4);
        let image = frame.to_gray_image().unwrap();
        assert_eq!(image.dimensions(), (3, 2));
        assert_eq!(image.get_pixel(2, 0)[0], 200);
        assert_eq!(image.get_pixel(0, 1)[0], 7);
        let back = Frame::from_gray_image(&image, 4).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn synthetic_grid_has_dark_lines_and_bright_wells() {
        let source = SyntheticGridSource { worms: 0, ..SyntheticGridSource::new(400, 300) };
        let frame = source.render(0);
        assert_eq!((frame.width(), frame.height()), (400, 300));
        assert!(frame.pixels[[150, 5]] < 60);
        assert!(frame.pixels[[60, 60]] > 180);
    }

    #[test]
    fn image_files_cycle() {
        let dir = tempfile::tempdir().unwrap();
        for (i, value) in [10u8, 250].iter().enumerate() {
            let frame = Frame::new(Array2::from_elem((4, 5), *value), 0);
            frame.save_png(&dir.path().join(format!("img_{}.png", i))).unwrap();
        }
        std::fs::write(dir.path().join("notes.txt"), "skip me").unwrap();

        let mut source = ImageFileSource::from_dir(dir.path()).unwrap();
        let a = source.next_frame().unwrap();
        let b = source.next_frame().unwrap();
        let c = source.next_frame().unwrap();
        assert_eq!(a.pixels[[0, 0]], 10);
        assert_eq!(b.pixels[[3, 4]], 250);
        assert_eq!(c.pixels[[0, 0]], 10);
        assert_eq!(c.sequence, 2);
    }

    #[test]
    fn empty_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ImageFileSource::from_dir(dir.path()).is_err());
    }

    #[test]
    fn settings_open_the_configured_source() {
        let mut settings = CameraSettings { width: 32, height: 24, ..CameraSettings::default() };
        let mut source = settings.open().unwrap().unwrap();
        assert_eq!(source.next_frame().unwrap().width(), 32);

        settings.source = CameraSourceKind::None;
        assert!(settings.open().unwrap().is_none());

        settings.source = CameraSourceKind::Directory;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn capture_thread_delivers_latest_frames() {
        let source = SyntheticGridSource::new(64, 48);
        let mut capture = CaptureThread::spawn(Box::new(source), Duration::from_millis(2), EventBus::detached()).unwrap();
        let first = capture.wait_frame(Duration::from_secs(2)).unwrap();
        std::thread::sleep(Duration::from_millis(30));
        let later = capture.latest().unwrap();
        assert!(later.sequence > first.sequence);
        capture.close();
        capture.close();
    }
}
