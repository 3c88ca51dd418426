//! Turning captured frames into a video
//!
//! Frames live in one directory per job. A `lapse.lock` marker exists while a
//! video is being assembled; directories still holding one at startup belong
//! to an assembly that never finished and are removed.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use image::codecs::jpeg::JpegEncoder;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::notify::chat::VideoPayload;

pub const FRAME_EXTENSION: &str = "jpeg";
const LOCK_FILE: &str = "lapse.lock";
const THUMBNAIL_SIZE: u32 = 320;

#[derive(Debug, Error)]
pub enum AssemblyError {
    #[error("no frames captured in {0:?}")]
    NoFrames(PathBuf),

    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read last frame: {0}")]
    Thumbnail(String),

    #[error("video encoding failed: {0:#}")]
    Encoder(anyhow::Error),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> AssemblyError + '_ {
    move |source| AssemblyError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Frame rate settings, adjustable at runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FpsSettings {
    pub target_fps: u32,
    pub min_lapse_duration: u32,
    pub max_lapse_duration: u32,
    pub last_frame_duration: u32,
}

/// Pick the frame rate so the video length stays within the min/max duration
pub fn calculate_fps(frame_count: usize, settings: &FpsSettings) -> u32 {
    let target = settings.target_fps.max(1);
    let min = settings.min_lapse_duration;
    let max = settings.max_lapse_duration;
    let frames = frame_count as f64;
    let actual_duration = frames / f64::from(target);

    let within_bounds = (min == 0 && max == 0)
        || (max > 0 && f64::from(min) <= actual_duration && actual_duration <= f64::from(max))
        || (max == 0 && actual_duration > f64::from(min));
    if within_bounds {
        return target;
    }

    if min > 0 && actual_duration < f64::from(min) {
        return ((frames / f64::from(min)).ceil() as u32).max(1);
    }
    if max > 0 && actual_duration > f64::from(max) {
        return (frames / f64::from(max)).ceil() as u32;
    }

    warn!(
        "Unexpected lapse durations min:{} max:{} actual:{}, using target fps",
        min, max, actual_duration
    );
    target
}

/// Path for a frame captured at `captured_at`.
///
/// Names sort like captures; `sequence` keeps frames taken within the same
/// millisecond apart.
pub fn frame_path(lapse_dir: &Path, captured_at: DateTime<Utc>, sequence: u64) -> PathBuf {
    lapse_dir.join(format!(
        "{:013}_{:06}.{}",
        captured_at.timestamp_millis(),
        sequence,
        FRAME_EXTENSION
    ))
}

/// Frames in capture order
pub async fn list_frames(lapse_dir: &Path) -> Result<Vec<PathBuf>, AssemblyError> {
    let mut entries = match tokio::fs::read_dir(lapse_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(io_error(lapse_dir)(e)),
    };

    let mut frames = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(io_error(lapse_dir))? {
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some(FRAME_EXTENSION) {
            continue;
        }
        frames.push(path);
    }

    frames.sort();
    Ok(frames)
}

/// Remove every file in a lapse directory, keeping the directory
pub async fn clean_lapse_dir(lapse_dir: &Path) -> std::io::Result<usize> {
    let mut entries = match tokio::fs::read_dir(lapse_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            tokio::fs::remove_file(entry.path()).await?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// Lapse directories left with a lock file by an interrupted assembly
pub fn unfinished_lapses(base_dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(base_dir) else {
        return Vec::new();
    };
    entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.join(LOCK_FILE).is_file())
        .collect()
}

/// Remove lapse directories whose assembly never finished
pub fn cleanup_unfinished_lapses(base_dir: &Path) {
    for lapse_dir in unfinished_lapses(base_dir) {
        warn!("Removing unfinished timelapse {:?}", lapse_dir);
        if let Err(e) = std::fs::remove_dir_all(&lapse_dir) {
            warn!("Failed to remove {:?}: {}", lapse_dir, e);
        }
    }
}

/// Encodes ordered frames into a video file
#[async_trait]
pub trait VideoEncoder: Send + Sync {
    async fn encode(
        &self,
        frames: &[PathBuf],
        fps: u32,
        hold_last_secs: u32,
        output: &Path,
    ) -> anyhow::Result<()>;
}

/// Encodes with the ffmpeg concat demuxer
pub struct FfmpegEncoder {
    program: String,
}

impl FfmpegEncoder {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

/// ffconcat list showing each frame for one frame period and the last one for `hold_last_secs`
fn concat_list(frames: &[PathBuf], fps: u32, hold_last_secs: u32) -> String {
    let quote = |path: &Path| path.to_string_lossy().replace('\'', "'\\''");
    let frame_duration = 1.0 / f64::from(fps.max(1));

    let mut list = String::from("ffconcat version 1.0\n");
    for frame in frames {
        let _ = writeln!(list, "file '{}'", quote(frame));
        let _ = writeln!(list, "duration {:.6}", frame_duration);
    }
    if let Some(last) = frames.last() {
        if hold_last_secs > 0 {
            let _ = writeln!(list, "file '{}'", quote(last));
            let _ = writeln!(list, "duration {}", hold_last_secs);
        }
        // The concat demuxer ignores the duration of the final entry
        let _ = writeln!(list, "file '{}'", quote(last));
    }
    list
}

#[async_trait]
impl VideoEncoder for FfmpegEncoder {
    async fn encode(
        &self,
        frames: &[PathBuf],
        fps: u32,
        hold_last_secs: u32,
        output: &Path,
    ) -> anyhow::Result<()> {
        let list_path = output.with_extension("ffconcat");
        tokio::fs::write(&list_path, concat_list(frames, fps, hold_last_secs))
            .await
            .with_context(|| format!("Failed to write concat list {:?}", list_path))?;

        let result = Command::new(&self.program)
            .args(["-y", "-loglevel", "error", "-f", "concat", "-safe", "0", "-i"])
            .arg(&list_path)
            .args([
                "-vf",
                &format!("fps={},scale=trunc(iw/2)*2:trunc(ih/2)*2,format=yuv420p", fps),
                "-c:v",
                "libx264",
                "-movflags",
                "+faststart",
            ])
            .arg(output)
            .output()
            .await
            .with_context(|| format!("Failed to run {}", self.program));

        let _ = tokio::fs::remove_file(&list_path).await;
        let result = result?;
        if !result.status.success() {
            anyhow::bail!(
                "{} exited with {}: {}",
                self.program,
                result.status,
                String::from_utf8_lossy(&result.stderr).trim()
            );
        }
        Ok(())
    }
}

/// Builds the video for a lapse directory
pub struct LapseAssembler {
    encoder: Arc<dyn VideoEncoder>,
    ready_dir: Option<PathBuf>,
}

impl LapseAssembler {
    pub fn new(encoder: Arc<dyn VideoEncoder>, ready_dir: Option<PathBuf>) -> Self {
        Self { encoder, ready_dir }
    }

    /// Encode every frame in `lapse_dir` into `<lapse_dir>/<video_name>.mp4`
    pub async fn assemble(
        &self,
        lapse_dir: &Path,
        video_name: &str,
        settings: &FpsSettings,
    ) -> Result<VideoPayload, AssemblyError> {
        let frames = list_frames(lapse_dir).await?;
        let Some(last_frame) = frames.last().cloned() else {
            return Err(AssemblyError::NoFrames(lapse_dir.to_path_buf()));
        };

        let lock = lapse_dir.join(LOCK_FILE);
        tokio::fs::write(&lock, b"").await.map_err(io_error(&lock))?;

        let result = self.encode(lapse_dir, video_name, settings, &frames, last_frame).await;

        if let Err(e) = tokio::fs::remove_file(&lock).await {
            warn!("Failed to remove {:?}: {}", lock, e);
        }
        result
    }

    async fn encode(
        &self,
        lapse_dir: &Path,
        video_name: &str,
        settings: &FpsSettings,
        frames: &[PathBuf],
        last_frame: PathBuf,
    ) -> Result<VideoPayload, AssemblyError> {
        let (thumbnail, width, height) = tokio::task::spawn_blocking(move || make_thumbnail(&last_frame))
            .await
            .map_err(|e| AssemblyError::Thumbnail(e.to_string()))??;

        let video_path = lapse_dir.join(format!("{}.mp4", video_name));
        if tokio::fs::try_exists(&video_path).await.unwrap_or(false) {
            tokio::fs::remove_file(&video_path)
                .await
                .map_err(io_error(&video_path))?;
        }

        let fps = calculate_fps(frames.len(), settings);
        info!(
            "Encoding {} frames at {} fps into {:?}",
            frames.len(),
            fps,
            video_path
        );
        self.encoder
            .encode(frames, fps, settings.last_frame_duration, &video_path)
            .await
            .map_err(AssemblyError::Encoder)?;

        let size = tokio::fs::metadata(&video_path)
            .await
            .map_err(io_error(&video_path))?
            .len();

        if let Some(ready_dir) = &self.ready_dir {
            self.copy_to_ready_dir(ready_dir, &video_path).await;
        }

        Ok(VideoPayload {
            path: video_path,
            size,
            thumbnail,
            width,
            height,
        })
    }

    async fn copy_to_ready_dir(&self, ready_dir: &Path, video_path: &Path) {
        let Some(file_name) = video_path.file_name() else {
            return;
        };
        let target = ready_dir.join(file_name);
        let copied = async {
            tokio::fs::create_dir_all(ready_dir).await?;
            tokio::fs::copy(video_path, &target).await
        }
        .await;
        match copied {
            Ok(_) => debug!("Copied timelapse to {:?}", target),
            Err(e) => warn!("Failed to copy timelapse to {:?}: {}", target, e),
        }
    }
}

fn make_thumbnail(frame: &Path) -> Result<(Vec<u8>, u32, u32), AssemblyError> {
    let image = image::open(frame).map_err(|e| AssemblyError::Thumbnail(e.to_string()))?;
    let (width, height) = (image.width(), image.height());

    let thumb = image.thumbnail(THUMBNAIL_SIZE, THUMBNAIL_SIZE).to_rgb8();
    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, 85)
        .encode_image(&thumb)
        .map_err(|e| AssemblyError::Thumbnail(e.to_string()))?;
    Ok((jpeg, width, height))
}
