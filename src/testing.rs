//! In-memory stand-ins for the external collaborators, shared by unit tests

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::camera::FrameSource;
use crate::notify::chat::{ChatError, ChatId, ChatSink, VideoPayload};
use crate::printer::api::{ApiError, FileMetadata, MoonrakerApi};
use crate::timelapse::assembly::VideoEncoder;

/// Let spawned jobs run to completion
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

/// Records power switches and gcode scripts
#[derive(Default)]
pub struct RecordingApi {
    pub power_calls: Mutex<Vec<(String, bool)>>,
    pub scripts: Mutex<Vec<String>>,
    pub metadata: Mutex<Option<FileMetadata>>,
    pub metadata_requests: Mutex<Vec<String>>,
    pub fail_power: AtomicBool,
}

impl RecordingApi {
    pub fn off_calls(&self) -> usize {
        self.power_calls.lock().unwrap().iter().filter(|(_, on)| !on).count()
    }

    pub fn on_calls(&self) -> usize {
        self.power_calls.lock().unwrap().iter().filter(|(_, on)| *on).count()
    }

    pub fn scripts(&self) -> Vec<String> {
        self.scripts.lock().unwrap().clone()
    }
}

#[async_trait]
impl MoonrakerApi for RecordingApi {
    async fn file_metadata(&self, filename: &str) -> Result<FileMetadata, ApiError> {
        self.metadata_requests.lock().unwrap().push(filename.to_string());
        self.metadata
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| ApiError::Malformed("no metadata".to_string()))
    }

    async fn set_device_power(&self, device: &str, on: bool) -> Result<bool, ApiError> {
        self.power_calls.lock().unwrap().push((device.to_string(), on));
        if self.fail_power.load(Ordering::SeqCst) {
            return Err(ApiError::Status {
                status: 500,
                message: "relay stuck".to_string(),
            });
        }
        Ok(on)
    }

    async fn run_gcode(&self, script: &str) -> Result<(), ApiError> {
        self.scripts.lock().unwrap().push(script.to_string());
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Sent {
    Text { target: ChatId, text: String, silent: bool },
    Photo { target: ChatId, caption: String },
    Video { target: ChatId, path: PathBuf, size: u64 },
    Document { target: ChatId, path: PathBuf },
    Keyboard { target: ChatId, title: String, rows: usize },
}

/// Records everything sent; targets in `failing` return an error
#[derive(Default)]
pub struct RecordingChat {
    sent: Mutex<Vec<Sent>>,
    failing: Mutex<HashSet<ChatId>>,
}

impl RecordingChat {
    pub fn fail_for(&self, target: ChatId) {
        self.failing.lock().unwrap().insert(target);
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    pub fn texts_to(&self, target: ChatId) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter_map(|sent| match sent {
                Sent::Text { target: t, text, .. } if t == target => Some(text),
                Sent::Photo { target: t, caption } if t == target => Some(caption),
                _ => None,
            })
            .collect()
    }

    pub fn videos(&self) -> usize {
        self.sent()
            .iter()
            .filter(|sent| matches!(sent, Sent::Video { .. }))
            .count()
    }

    fn record(&self, target: ChatId, sent: Sent) -> Result<(), ChatError> {
        if self.failing.lock().unwrap().contains(&target) {
            return Err(ChatError::Rejected("chat not found".to_string()));
        }
        self.sent.lock().unwrap().push(sent);
        Ok(())
    }
}

#[async_trait]
impl ChatSink for RecordingChat {
    async fn send_text(&self, target: ChatId, text: &str, silent: bool) -> Result<(), ChatError> {
        self.record(
            target,
            Sent::Text {
                target,
                text: text.to_string(),
                silent,
            },
        )
    }

    async fn send_photo(
        &self,
        target: ChatId,
        _photo: &[u8],
        caption: &str,
        _silent: bool,
    ) -> Result<(), ChatError> {
        self.record(
            target,
            Sent::Photo {
                target,
                caption: caption.to_string(),
            },
        )
    }

    async fn send_video(
        &self,
        target: ChatId,
        video: &VideoPayload,
        _caption: &str,
        _timeout: Duration,
        _silent: bool,
    ) -> Result<(), ChatError> {
        self.record(
            target,
            Sent::Video {
                target,
                path: video.path.clone(),
                size: video.size,
            },
        )
    }

    async fn send_document(
        &self,
        target: ChatId,
        path: &Path,
        _caption: &str,
        _silent: bool,
    ) -> Result<(), ChatError> {
        self.record(
            target,
            Sent::Document {
                target,
                path: path.to_path_buf(),
            },
        )
    }

    async fn send_keyboard(
        &self,
        target: ChatId,
        title: &str,
        keyboard: &[Vec<String>],
        _silent: bool,
    ) -> Result<(), ChatError> {
        self.record(
            target,
            Sent::Keyboard {
                target,
                title: title.to_string(),
                rows: keyboard.len(),
            },
        )
    }
}

/// Always returns the same frame, or always fails
pub struct StaticFrames {
    frame: Option<Vec<u8>>,
    pub grabs: AtomicUsize,
}

impl StaticFrames {
    pub fn new(frame: Vec<u8>) -> Self {
        Self {
            frame: Some(frame),
            grabs: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            frame: None,
            grabs: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl FrameSource for StaticFrames {
    async fn grab(&self) -> Result<Vec<u8>> {
        self.grabs.fetch_add(1, Ordering::SeqCst);
        match &self.frame {
            Some(frame) => Ok(frame.clone()),
            None => anyhow::bail!("camera unplugged"),
        }
    }
}

/// Writes a fixed number of bytes instead of encoding
pub struct FakeEncoder {
    pub output_size: usize,
    pub calls: Mutex<Vec<(usize, u32)>>,
}

impl FakeEncoder {
    pub fn new(output_size: usize) -> Self {
        Self {
            output_size,
            calls: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl VideoEncoder for FakeEncoder {
    async fn encode(
        &self,
        frames: &[PathBuf],
        fps: u32,
        _hold_last_secs: u32,
        output: &Path,
    ) -> Result<()> {
        self.calls.lock().unwrap().push((frames.len(), fps));
        tokio::fs::write(output, vec![0u8; self.output_size]).await?;
        Ok(())
    }
}

/// Poll `condition` until it holds, giving up after a few seconds
pub async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..300 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
