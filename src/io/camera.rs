//! Camera service: power state, still capture, and pre-trigger clip buffer
//!
//! The hardware sits behind [`CameraDriver`]. [`CommandCamera`] runs an
//! external still-capture command that writes a JPEG to stdout.
//!
//! While the camera is on and `clip_buffer` is enabled, a background task
//! keeps the last `buffer_secs * fps` frames in a ring buffer. A clip is the
//! buffered frames plus `post_secs` of fresh frames, written as an MJPEG
//! stream (concatenated JPEGs).

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::infra::config::CameraConfig;

const JPEG_MAGIC: [u8; 2] = [0xFF, 0xD8];
const CAPTURE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum CameraError {
    #[error("camera is not active")]
    Inactive,
    #[error("capture command failed: {0}")]
    Command(String),
    #[error("capture produced no JPEG data")]
    InvalidImage,
    #[error("no frames available for clip")]
    NoFrames,
    #[error("camera I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait CameraDriver: Send + Sync {
    async fn start(&self) -> Result<(), CameraError>;

    async fn stop(&self) -> Result<(), CameraError>;

    /// Grab one frame as JPEG
    async fn capture_jpeg(&self) -> Result<Bytes, CameraError>;
}

/// Driver that shells out to a still-capture command (e.g. `rpicam-still -o -`)
pub struct CommandCamera {
    command: Vec<String>,
}

impl CommandCamera {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

#[async_trait]
impl CameraDriver for CommandCamera {
    async fn start(&self) -> Result<(), CameraError> {
        debug!(program = ?self.command.first(), "camera_driver_start");
        Ok(())
    }

    async fn stop(&self) -> Result<(), CameraError> {
        debug!("camera_driver_stop");
        Ok(())
    }

    async fn capture_jpeg(&self) -> Result<Bytes, CameraError> {
        let (program, args) =
            self.command.split_first().ok_or_else(|| CameraError::Command("empty command".into()))?;

        let child = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let output = tokio::time::timeout(CAPTURE_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| CameraError::Command(format!("{} timed out", program)))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CameraError::Command(format!(
                "{} exited with {}: {}",
                program,
                output.status,
                stderr.trim()
            )));
        }
        if !output.stdout.starts_with(&JPEG_MAGIC) {
            return Err(CameraError::InvalidImage);
        }
        Ok(Bytes::from(output.stdout))
    }
}

/// Default still filename: local timestamp
pub fn timestamp_filename(now: chrono::DateTime<chrono::Local>) -> String {
    format!("{}.jpg", now.format("%Y%m%d_%H%M%S"))
}

pub struct CameraService {
    driver: Arc<dyn CameraDriver>,
    capture_dir: PathBuf,
    clip_dir: PathBuf,
    clip_buffer: bool,
    max_frames: usize,
    frame_interval: Duration,
    post_frames: usize,
    active: Arc<AtomicBool>,
    frames: Arc<Mutex<VecDeque<Bytes>>>,
    /// Frames pushed by the buffer task since start
    frame_seq: Arc<AtomicU64>,
    buffer_task: Mutex<Option<JoinHandle<()>>>,
    /// Serializes power transitions
    power: tokio::sync::Mutex<()>,
}

impl CameraService {
    pub fn new(config: &CameraConfig, driver: Arc<dyn CameraDriver>) -> Self {
        let fps = config.fps.max(1);
        Self {
            driver,
            capture_dir: config.capture_dir.clone(),
            clip_dir: config.clip_dir.clone(),
            clip_buffer: config.clip_buffer,
            max_frames: (config.buffer_secs * u64::from(fps)) as usize,
            frame_interval: Duration::from_secs(1) / fps,
            post_frames: (config.post_secs * u64::from(fps)) as usize,
            active: Arc::new(AtomicBool::new(false)),
            frames: Arc::new(Mutex::new(VecDeque::new())),
            frame_seq: Arc::new(AtomicU64::new(0)),
            buffer_task: Mutex::new(None),
            power: tokio::sync::Mutex::new(()),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Power the camera on; a no-op if already on
    pub async fn turn_on(&self) -> Result<(), CameraError> {
        let _guard = self.power.lock().await;
        if self.is_active() {
            debug!("camera_already_active");
            return Ok(());
        }

        self.driver.start().await?;
        self.active.store(true, Ordering::Release);
        info!(clip_buffer = %self.clip_buffer, "camera_on");

        if self.clip_buffer && self.max_frames > 0 {
            let handle = tokio::spawn(buffer_frames(
                self.driver.clone(),
                self.active.clone(),
                self.frames.clone(),
                self.frame_seq.clone(),
                self.max_frames,
                self.frame_interval,
            ));
            *self.buffer_task.lock() = Some(handle);
        }
        Ok(())
    }

    /// Power the camera off and drop buffered frames
    pub async fn turn_off(&self) -> Result<(), CameraError> {
        let _guard = self.power.lock().await;
        if !self.is_active() {
            return Ok(());
        }

        self.active.store(false, Ordering::Release);
        if let Some(handle) = self.buffer_task.lock().take() {
            handle.abort();
        }
        self.frames.lock().clear();
        info!("camera_off");
        self.driver.stop().await
    }

    /// Newest buffered frame while the ring buffer runs
    ///
    /// The buffer task owns the driver then, so stills and clips read from it
    /// instead of issuing concurrent captures.
    fn latest_frame(&self) -> Option<Bytes> {
        if self.buffer_task.lock().is_none() {
            return None;
        }
        self.frames.lock().back().cloned()
    }

    /// Capture a still into the capture directory
    ///
    /// Without a filename the local timestamp is used. While the ring buffer
    /// runs the newest buffered frame is saved.
    pub async fn take_picture(&self, filename: Option<&str>) -> Result<PathBuf, CameraError> {
        if !self.is_active() {
            return Err(CameraError::Inactive);
        }

        let filename = match filename {
            Some(name) => name.to_string(),
            None => timestamp_filename(chrono::Local::now()),
        };
        let path = self.capture_dir.join(filename);

        let jpeg = match self.latest_frame() {
            Some(frame) => frame,
            None => self.driver.capture_jpeg().await?,
        };
        tokio::fs::create_dir_all(&self.capture_dir).await?;
        tokio::fs::write(&path, &jpeg).await?;

        info!(path = %path.display(), bytes = jpeg.len(), "picture_taken");
        Ok(path)
    }

    /// Write buffered frames plus `post_secs` of new frames as an MJPEG clip
    pub async fn save_video_clip(&self, filename: &str) -> Result<PathBuf, CameraError> {
        if !self.is_active() {
            return Err(CameraError::Inactive);
        }

        let mut clip: Vec<Bytes> = self.frames.lock().iter().cloned().collect();
        let pre_trigger = clip.len();

        let mut seen_seq = self.frame_seq.load(Ordering::Acquire);
        let mut ticker = tokio::time::interval(self.frame_interval);
        for _ in 0..self.post_frames {
            ticker.tick().await;
            if !self.is_active() {
                break;
            }
            if self.buffer_task.lock().is_some() {
                let seq = self.frame_seq.load(Ordering::Acquire);
                if seq != seen_seq {
                    seen_seq = seq;
                    if let Some(frame) = self.latest_frame() {
                        clip.push(frame);
                    }
                }
                continue;
            }
            match self.driver.capture_jpeg().await {
                Ok(frame) => clip.push(frame),
                Err(e) => debug!(error = %e, "clip_frame_skipped"),
            }
        }

        if clip.is_empty() {
            warn!(filename = %filename, "clip_no_frames");
            return Err(CameraError::NoFrames);
        }

        let path = clip_path(&self.clip_dir, filename);
        tokio::fs::create_dir_all(&self.clip_dir).await?;
        let mut data = Vec::with_capacity(clip.iter().map(Bytes::len).sum());
        for frame in &clip {
            data.extend_from_slice(frame);
        }
        tokio::fs::write(&path, data).await?;

        info!(
            path = %path.display(),
            pre_trigger_frames = pre_trigger,
            total_frames = clip.len(),
            "clip_saved"
        );
        Ok(path)
    }

    #[cfg(test)]
    pub(crate) fn buffered_frames(&self) -> usize {
        self.frames.lock().len()
    }
}

fn clip_path(dir: &Path, filename: &str) -> PathBuf {
    let stem = Path::new(filename).file_stem().and_then(|s| s.to_str()).unwrap_or(filename);
    dir.join(format!("{}.mjpeg", stem))
}

async fn buffer_frames(
    driver: Arc<dyn CameraDriver>,
    active: Arc<AtomicBool>,
    frames: Arc<Mutex<VecDeque<Bytes>>>,
    frame_seq: Arc<AtomicU64>,
    max_frames: usize,
    frame_interval: Duration,
) {
    let mut ticker = tokio::time::interval(frame_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    while active.load(Ordering::Acquire) {
        ticker.tick().await;
        match driver.capture_jpeg().await {
            Ok(frame) => {
                let mut frames = frames.lock();
                if frames.len() == max_frames {
                    frames.pop_front();
                }
                frames.push_back(frame);
                frame_seq.fetch_add(1, Ordering::Release);
            }
            Err(e) => {
                tracing::trace!(error = %e, "buffer_frame_skipped");
            }
        }
    }
}
