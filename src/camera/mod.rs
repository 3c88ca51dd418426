//! Camera snapshots
//!
//! Frames come from a [`FrameSource`]; every capture goes through the
//! [`CaptureLock`] so the light is on while the frame is taken.

pub mod light;

pub use light::{CaptureLock, LightGuard};

use anyhow::{Context, Result};
use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

use crate::config::CameraConfig;

/// Produces a single JPEG frame
#[async_trait]
pub trait FrameSource: Send + Sync {
    async fn grab(&self) -> Result<Vec<u8>>;
}

/// Fetches frames from an HTTP snapshot endpoint (mjpg-streamer, crowsnest, ...)
pub struct SnapshotSource {
    client: Client,
    url: String,
}

impl SnapshotSource {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build snapshot HTTP client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn from_config(config: &CameraConfig) -> Result<Option<Self>> {
        match (&config.snapshot_url, config.enabled) {
            (Some(url), true) => Ok(Some(Self::new(
                url.clone(),
                Duration::from_secs(config.timeout_secs),
            )?)),
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl FrameSource for SnapshotSource {
    async fn grab(&self) -> Result<Vec<u8>> {
        let bytes = self
            .client
            .get(&self.url)
            .send()
            .await
            .context("Failed to request snapshot")?
            .error_for_status()
            .context("Snapshot endpoint returned error status")?
            .bytes()
            .await
            .context("Failed to read snapshot body")?;

        if bytes.is_empty() {
            anyhow::bail!("Snapshot endpoint returned an empty frame");
        }
        Ok(bytes.to_vec())
    }
}

pub struct Camera {
    source: Option<Arc<dyn FrameSource>>,
    lock: CaptureLock,
}

impl Camera {
    pub fn new(source: Option<Arc<dyn FrameSource>>, lock: CaptureLock) -> Self {
        Self { source, lock }
    }

    pub fn enabled(&self) -> bool {
        self.source.is_some()
    }

    pub fn lock(&self) -> &CaptureLock {
        &self.lock
    }

    /// Take a photo with the light on.
    ///
    /// A failed capture yields the "no signal" placeholder instead of an error.
    pub async fn take_photo(&self) -> Vec<u8> {
        let Some(source) = &self.source else {
            return placeholder_image();
        };

        let frame = self.lock.with_light(source.grab()).await;
        match frame {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Camera capture failed: {:#}", e);
                placeholder_image()
            }
        }
    }
}

const PLACEHOLDER_WIDTH: u32 = 640;
const PLACEHOLDER_HEIGHT: u32 = 480;

/// Dark grey frame with a red bar, standing in for a failed capture
pub fn placeholder_image() -> Vec<u8> {
    let mut frame = RgbImage::from_pixel(PLACEHOLDER_WIDTH, PLACEHOLDER_HEIGHT, Rgb([32, 32, 32]));
    for y in (PLACEHOLDER_HEIGHT / 2 - 8)..(PLACEHOLDER_HEIGHT / 2 + 8) {
        for x in (PLACEHOLDER_WIDTH / 4)..(PLACEHOLDER_WIDTH * 3 / 4) {
            frame.put_pixel(x, y, Rgb([200, 40, 40]));
        }
    }

    let mut jpeg = Vec::new();
    if let Err(e) = JpegEncoder::new_with_quality(&mut jpeg, 80).encode_image(&frame) {
        error!("Failed to encode placeholder frame: {}", e);
        jpeg.clear();
    }
    jpeg
}
