//! Timelapse capture and delivery
//!
//! Frames are taken on height milestones, on a timer, or on demand from
//! gcode. Captures run on a two-worker pool. When the print ends a single
//! assembly job waits for pending captures, encodes the video and sends it.

pub mod assembly;

use anyhow::{Context, Result};
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::camera::Camera;
use crate::config::TimelapseConfig;
use crate::notify::chat::{ChatId, ChatSink, VideoPayload, MAX_UPLOAD_BYTES};
use crate::params::{split_params, ParamsReport};
use crate::printer::{MoonrakerApi, PrinterState};
use crate::scheduler::{Scheduler, SingletonJob, Tick, TickSender, TimerHandle, WorkerPool};
use crate::threshold::crossed;
use assembly::{clean_lapse_dir, frame_path, FpsSettings, LapseAssembler};

const CAPTURE_WORKERS: usize = 2;
const VIDEO_UPLOAD_TIMEOUT: Duration = Duration::from_secs(120);

/// Bare `timelapse ...` lines in the gcode console
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimelapseTrigger {
    Start,
    Stop,
    Pause,
    Resume,
    Create,
    Photo,
    PhotoAndGcode,
}

impl TimelapseTrigger {
    pub fn parse(line: &str) -> Option<Self> {
        match line.trim() {
            "timelapse start" => Some(Self::Start),
            "timelapse stop" => Some(Self::Stop),
            "timelapse pause" => Some(Self::Pause),
            "timelapse resume" => Some(Self::Resume),
            "timelapse create" => Some(Self::Create),
            "timelapse photo" => Some(Self::Photo),
            "timelapse photo_and_gcode" => Some(Self::PhotoAndGcode),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TimelapseState {
    pub is_running: bool,
    pub is_paused: bool,
    pub manual_mode: bool,
    pub last_captured_height: f64,
}

/// Lapse directory chosen when a job starts; survives reconnects
#[derive(Debug, Clone, PartialEq, Eq)]
struct PinnedJob {
    filename: String,
    label: String,
}

/// How a finished lapse reached the chat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LapseDelivery {
    Video,
    TooLarge,
    NotSent,
}

pub struct TimelapseCoordinator {
    config: TimelapseConfig,
    camera: Arc<Camera>,
    api: Arc<dyn MoonrakerApi>,
    chat: Arc<dyn ChatSink>,
    chat_id: ChatId,
    silent: bool,
    assembler: Arc<LapseAssembler>,
    scheduler: Scheduler,
    pool: WorkerPool,
    assembly: SingletonJob,
    ticks: TickSender,
    timer: Option<TimerHandle>,
    state: TimelapseState,
    job: Option<PinnedJob>,
    frame_sequence: u64,
}

impl TimelapseCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: TimelapseConfig,
        camera: Arc<Camera>,
        api: Arc<dyn MoonrakerApi>,
        chat: Arc<dyn ChatSink>,
        chat_id: ChatId,
        silent: bool,
        assembler: LapseAssembler,
        scheduler: Scheduler,
        ticks: TickSender,
    ) -> Self {
        let state = TimelapseState {
            manual_mode: config.manual_mode,
            ..Default::default()
        };
        Self {
            config,
            camera,
            api,
            chat,
            chat_id,
            silent,
            assembler: Arc::new(assembler),
            scheduler,
            pool: WorkerPool::new(CAPTURE_WORKERS),
            assembly: SingletonJob::new(),
            ticks,
            timer: None,
            state,
            job: None,
            frame_sequence: 0,
        }
    }

    pub fn state(&self) -> &TimelapseState {
        &self.state
    }

    pub fn config(&self) -> &TimelapseConfig {
        &self.config
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled && self.camera.enabled()
    }

    pub fn manual_mode(&self) -> bool {
        self.state.manual_mode
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn assembly(&self) -> &SingletonJob {
        &self.assembly
    }

    pub fn timer_armed(&self) -> bool {
        self.timer.is_some()
    }

    fn job_label(&self, printer: &PrinterState) -> String {
        match &self.job {
            Some(job) if job.filename == printer.filename => job.label.clone(),
            _ => printer.job_label(),
        }
    }

    /// Keep writing frames for this file into the same directory
    fn pin_job(&mut self, printer: &PrinterState) {
        if !printer.has_file() {
            return;
        }
        self.job = Some(PinnedJob {
            filename: printer.filename.clone(),
            label: printer.job_label(),
        });
    }

    /// Directory frames of the current job are written to
    pub fn lapse_dir(&self, printer: &PrinterState) -> PathBuf {
        self.config.base_dir.join(self.job_label(printer))
    }

    fn fps_settings(&self) -> FpsSettings {
        FpsSettings {
            target_fps: self.config.target_fps,
            min_lapse_duration: self.config.min_lapse_duration,
            max_lapse_duration: self.config.max_lapse_duration,
            last_frame_duration: self.config.last_frame_duration,
        }
    }

    /// Queue a frame capture.
    ///
    /// `height` of `None` captures unconditionally (timer and manual frames);
    /// otherwise a frame is taken on each height milestone.
    pub fn take_lapse_photo(
        &mut self,
        printer: &PrinterState,
        height: Option<f64>,
        manual: bool,
        with_gcode: bool,
    ) -> bool {
        if !self.enabled() {
            debug!("Timelapse is disabled");
            return false;
        }
        if !printer.has_file() {
            debug!("Timelapse inactive, no file");
            return false;
        }
        if !self.state.is_running {
            debug!("Timelapse is not running");
            return false;
        }
        if self.state.is_paused && !manual {
            debug!("Timelapse is paused");
            return false;
        }
        if !self.state.manual_mode && printer.print_duration <= 0.0 {
            debug!("Timelapse waits for print duration in automatic mode");
            return false;
        }

        if let Some(height) = height {
            if !crossed(height, &mut self.state.last_captured_height, self.config.height) {
                return false;
            }
        }

        let camera = self.camera.clone();
        let api = self.api.clone();
        let lapse_dir = self.lapse_dir(printer);
        let gcode = self
            .config
            .after_photo_gcode
            .clone()
            .filter(|gcode| with_gcode && !gcode.trim().is_empty());
        let sequence = self.frame_sequence;
        self.frame_sequence += 1;

        self.pool.submit("lapse_photo", async move {
            let captured_at = Utc::now();
            let frame = camera.take_photo().await;
            tokio::fs::create_dir_all(&lapse_dir)
                .await
                .with_context(|| format!("Failed to create lapse directory {:?}", lapse_dir))?;
            let path = frame_path(&lapse_dir, captured_at, sequence);
            tokio::fs::write(&path, frame)
                .await
                .with_context(|| format!("Failed to write frame {:?}", path))?;
            debug!("Captured lapse frame {:?}", path);

            if let Some(gcode) = gcode {
                api.run_gcode(gcode.trim())
                    .await
                    .context("Failed to run after-photo gcode")?;
            }
            Ok(())
        });
        true
    }

    fn arm_timer(&mut self) {
        if self.config.interval_secs == 0 || !self.state.is_running || self.state.is_paused {
            return;
        }
        self.timer = Some(self.scheduler.arm_ticker(
            "timelapse",
            Duration::from_secs(self.config.interval_secs),
            Tick::Timelapse,
            self.ticks.clone(),
        ));
    }

    fn disarm_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }

    pub fn set_running(&mut self, running: bool) {
        self.state.is_running = running;
        self.state.is_paused = false;
        if running {
            self.arm_timer();
        } else {
            self.disarm_timer();
        }
    }

    pub fn set_paused(&mut self, paused: bool) {
        self.state.is_paused = paused;
        if paused {
            self.disarm_timer();
        } else {
            self.arm_timer();
        }
    }

    pub fn on_print_start(&mut self, printer: &PrinterState) {
        self.state.last_captured_height = 0.0;
        self.pin_job(printer);
        if self.state.manual_mode {
            return;
        }
        self.clean(printer);
        self.set_running(true);
    }

    /// State snapshot showed a print already underway
    pub fn on_print_resumed_after_reconnect(&mut self, printer: &PrinterState) {
        let pinned = matches!(&self.job, Some(job) if job.filename == printer.filename);
        if !pinned {
            self.pin_job(printer);
        }
        if !self.state.manual_mode {
            self.set_running(true);
        }
    }

    pub fn on_pause(&mut self) {
        if !self.state.manual_mode {
            self.set_paused(true);
        }
    }

    pub fn on_resume(&mut self) {
        if !self.state.manual_mode {
            self.set_paused(false);
        }
    }

    /// Returns whether an assembly job was submitted
    pub fn on_complete(&mut self, printer: &PrinterState) -> bool {
        if self.state.manual_mode {
            return false;
        }
        self.set_running(false);
        self.send_timelapse(printer)
    }

    pub fn on_error(&mut self) {
        self.set_running(false);
    }

    pub fn on_cancel(&mut self, printer: &PrinterState) {
        self.set_running(false);
        self.clean(printer);
    }

    pub fn stop_all(&mut self) {
        self.disarm_timer();
        self.state.is_running = false;
        self.state.is_paused = false;
        self.state.last_captured_height = 0.0;
    }

    /// Handle a `timelapse ...` console trigger
    pub fn handle_trigger(&mut self, trigger: TimelapseTrigger, printer: &PrinterState) {
        let manual_only = matches!(
            trigger,
            TimelapseTrigger::Start
                | TimelapseTrigger::Stop
                | TimelapseTrigger::Pause
                | TimelapseTrigger::Resume
                | TimelapseTrigger::Create
        );
        if manual_only && !self.state.manual_mode {
            debug!("Ignoring {:?}, timelapse is not in manual mode", trigger);
            return;
        }

        match trigger {
            TimelapseTrigger::Start => {
                if !printer.has_file() {
                    warn!("timelapse start without an active file");
                }
                self.pin_job(printer);
                self.clean(printer);
                self.state.last_captured_height = 0.0;
                self.set_running(true);
            }
            TimelapseTrigger::Stop => self.set_running(false),
            TimelapseTrigger::Pause => self.set_paused(true),
            TimelapseTrigger::Resume => self.set_paused(false),
            TimelapseTrigger::Create => {
                self.send_timelapse(printer);
            }
            TimelapseTrigger::Photo => {
                self.take_lapse_photo(printer, None, true, false);
            }
            TimelapseTrigger::PhotoAndGcode => {
                self.take_lapse_photo(printer, None, true, true);
            }
        }
    }

    /// Remove this job's frames if cleanup is enabled
    pub fn clean(&self, printer: &PrinterState) {
        if !self.config.cleanup || !printer.has_file() {
            return;
        }
        let lapse_dir = self.lapse_dir(printer);
        self.scheduler.spawn("lapse_cleanup", async move {
            let removed = clean_lapse_dir(&lapse_dir)
                .await
                .with_context(|| format!("Failed to clean {:?}", lapse_dir))?;
            if removed > 0 {
                debug!("Removed {} files from {:?}", removed, lapse_dir);
            }
            Ok(())
        });
    }

    /// Assemble and deliver the current job's video.
    ///
    /// Returns whether an assembly job was started; an assembly already in
    /// progress is never run twice.
    pub fn send_timelapse(&self, printer: &PrinterState) -> bool {
        if !self.enabled() || !printer.has_file() {
            debug!("Timelapse disabled or no file, nothing to assemble");
            return false;
        }

        let job = LapseJob {
            lapse_dir: self.lapse_dir(printer),
            video_name: self.job_label(printer),
            gcode_name: printer.filename.clone(),
            fps: self.fps_settings(),
            send_finished: self.config.send_finished_lapse,
            after_lapse_gcode: self
                .config
                .after_lapse_gcode
                .clone()
                .filter(|gcode| !gcode.trim().is_empty()),
            chat: self.chat.clone(),
            chat_id: self.chat_id,
            silent: self.silent,
            api: self.api.clone(),
            assembler: self.assembler.clone(),
            pool: self.pool.clone(),
        };
        self.assembly
            .submit(&self.scheduler, "send_timelapse", job.run())
    }

    /// Apply `set_timelapse_params key=value ...`.
    ///
    /// Returns `RESPOND` scripts echoing the result to the console.
    pub fn apply_params(&mut self, message: &str) -> Vec<String> {
        let mut report = ParamsReport::new("Timelapse params");

        for part in split_params(message) {
            let Some((key, value)) = part.split_once('=') else {
                report.unknown(part);
                continue;
            };
            match key {
                "enabled" => match parse_flag(value) {
                    Ok(enabled) => {
                        self.config.enabled = enabled;
                        report.changed(key, enabled);
                    }
                    Err(e) => report.failed(part, e),
                },
                "manual_mode" => match parse_flag(value) {
                    Ok(manual) => {
                        self.config.manual_mode = manual;
                        self.state.manual_mode = manual;
                        report.changed(key, manual);
                    }
                    Err(e) => report.failed(part, e),
                },
                "height" => match value.parse::<f64>() {
                    Ok(height) if height >= 0.0 => {
                        self.config.height = height;
                        report.changed(key, height);
                    }
                    Ok(_) => report.failed(part, "height must not be negative"),
                    Err(e) => report.failed(part, e),
                },
                "time" => match value.parse::<u64>() {
                    Ok(interval) => {
                        self.config.interval_secs = interval;
                        self.disarm_timer();
                        self.arm_timer();
                        report.changed(key, interval);
                    }
                    Err(e) => report.failed(part, e),
                },
                "target_fps" => match value.parse::<u32>() {
                    Ok(fps) if fps >= 1 => {
                        self.config.target_fps = fps;
                        report.changed(key, fps);
                    }
                    Ok(_) => report.failed(part, "target_fps must be at least 1"),
                    Err(e) => report.failed(part, e),
                },
                "last_frame_duration" | "min_lapse_duration" | "max_lapse_duration" => {
                    match value.parse::<u32>() {
                        Ok(seconds) => {
                            let slot = match key {
                                "last_frame_duration" => &mut self.config.last_frame_duration,
                                "min_lapse_duration" => &mut self.config.min_lapse_duration,
                                _ => &mut self.config.max_lapse_duration,
                            };
                            *slot = seconds;
                            report.changed(key, seconds);
                        }
                        Err(e) => report.failed(part, e),
                    }
                }
                _ => report.unknown(part),
            }
        }

        let c = &self.config;
        let full = format!(
            "enabled={} manual_mode={} height={} time={} target_fps={} last_frame_duration={} min_lapse_duration={} max_lapse_duration={}",
            c.enabled,
            c.manual_mode,
            c.height,
            c.interval_secs,
            c.target_fps,
            c.last_frame_duration,
            c.min_lapse_duration,
            c.max_lapse_duration
        );
        if report.has_changes() {
            info!("Timelapse params now {}", full);
        }
        report.into_scripts(&full)
    }
}

fn parse_flag(value: &str) -> Result<bool, String> {
    match value {
        "1" | "true" | "True" => Ok(true),
        "0" | "false" | "False" => Ok(false),
        other => Err(format!("expected 0 or 1, got {}", other)),
    }
}

/// Everything the assembly job needs, detached from the coordinator
struct LapseJob {
    lapse_dir: PathBuf,
    video_name: String,
    gcode_name: String,
    fps: FpsSettings,
    send_finished: bool,
    after_lapse_gcode: Option<String>,
    chat: Arc<dyn ChatSink>,
    chat_id: ChatId,
    silent: bool,
    api: Arc<dyn MoonrakerApi>,
    assembler: Arc<LapseAssembler>,
    pool: WorkerPool,
}

impl LapseJob {
    async fn notify(&self, text: &str) {
        if let Err(e) = self.chat.send_text(self.chat_id, text, self.silent).await {
            warn!("Failed to send timelapse status: {}", e);
        }
    }

    async fn run(self) -> Result<()> {
        self.notify(&format!("Starting time-lapse assembly for {}", self.gcode_name))
            .await;

        if self.pool.in_flight() > 0 {
            self.notify("Waiting for the completion of tasks for photographing")
                .await;
        }
        self.pool.drain().await;

        let video = match self
            .assembler
            .assemble(&self.lapse_dir, &self.video_name, &self.fps)
            .await
        {
            Ok(video) => video,
            Err(e) => {
                self.notify(&format!(
                    "Time-lapse assembly for {} failed: {}",
                    self.gcode_name, e
                ))
                .await;
                return Err(e.into());
            }
        };

        let delivery = deliver_lapse(
            self.chat.as_ref(),
            self.chat_id,
            &video,
            &self.gcode_name,
            self.send_finished,
            self.silent,
        )
        .await;
        info!("Timelapse {:?} finished: {:?}", video.path, delivery);

        if let Some(gcode) = &self.after_lapse_gcode {
            let file_name = format!("{}.mp4", self.gcode_name);
            let scripts = [
                format!(
                    "SET_GCODE_VARIABLE MACRO=bot_data VARIABLE=lapse_video_size VALUE={}",
                    video.size
                ),
                format!(
                    "SET_GCODE_VARIABLE MACRO=bot_data VARIABLE=lapse_filename VALUE='\"{}\"'",
                    video.path.display()
                ),
                format!(
                    "SET_GCODE_VARIABLE MACRO=bot_data VARIABLE=lapse_path VALUE='\"{}\"'",
                    file_name
                ),
            ];
            for script in &scripts {
                if let Err(e) = self.api.run_gcode(script).await {
                    warn!("Failed to store lapse data in bot_data macro: {}", e);
                }
            }
            self.api
                .run_gcode(gcode.trim())
                .await
                .context("Failed to run after-lapse gcode")?;
        }
        Ok(())
    }
}

/// Send the video, or a pointer to it on disk when it exceeds the upload limit
pub async fn deliver_lapse(
    chat: &dyn ChatSink,
    target: ChatId,
    video: &VideoPayload,
    gcode_name: &str,
    send_finished: bool,
    silent: bool,
) -> LapseDelivery {
    let (delivery, sent) = if !send_finished {
        (
            LapseDelivery::NotSent,
            chat.send_text(target, "Time-lapse creation finished", silent).await,
        )
    } else if video.size > MAX_UPLOAD_BYTES {
        let text = format!(
            "Telegram bots have a 50mb filesize restriction, please retrieve the timelapse from the configured folder\n{}",
            video.path.display()
        );
        (LapseDelivery::TooLarge, chat.send_text(target, &text, silent).await)
    } else {
        let caption = format!("time-lapse of {}", gcode_name);
        (
            LapseDelivery::Video,
            chat.send_video(target, video, &caption, VIDEO_UPLOAD_TIMEOUT, silent)
                .await,
        )
    };

    if let Err(e) = sent {
        warn!("Failed to deliver timelapse {:?}: {}", video.path, e);
    }
    delivery
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{placeholder_image, CaptureLock};
    use crate::config::LightConfig;
    use crate::testing::{settle, wait_for, FakeEncoder, RecordingApi, RecordingChat, Sent, StaticFrames};
    use tokio::sync::mpsc;

    struct Fixture {
        timelapse: TimelapseCoordinator,
        chat: Arc<RecordingChat>,
        api: Arc<RecordingApi>,
        frames: Arc<StaticFrames>,
        _base: tempfile::TempDir,
        _ticks: mpsc::UnboundedReceiver<Tick>,
    }

    fn fixture(configure: impl FnOnce(&mut TimelapseConfig)) -> Fixture {
        let base = tempfile::tempdir().unwrap();
        let mut config = TimelapseConfig {
            enabled: true,
            height: 0.2,
            base_dir: base.path().to_path_buf(),
            ..Default::default()
        };
        configure(&mut config);

        let scheduler = Scheduler::new();
        let frames = Arc::new(StaticFrames::new(placeholder_image()));
        let camera = Arc::new(Camera::new(
            Some(frames.clone()),
            CaptureLock::new(None, &LightConfig::default(), scheduler.clone()),
        ));
        let chat = Arc::new(RecordingChat::default());
        let api = Arc::new(RecordingApi::default());
        let (tx, ticks) = mpsc::unbounded_channel();

        let timelapse = TimelapseCoordinator::new(
            config,
            camera,
            api.clone(),
            chat.clone(),
            1,
            false,
            LapseAssembler::new(Arc::new(FakeEncoder::new(1024)), None),
            scheduler,
            tx,
        );
        Fixture {
            timelapse,
            chat,
            api,
            frames,
            _base: base,
            _ticks: ticks,
        }
    }

    fn printing() -> PrinterState {
        PrinterState {
            printing: true,
            print_duration: 30.0,
            filename: "cube.gcode".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_not_running_submits_nothing() {
        let mut f = fixture(|_| {});
        assert!(!f.timelapse.take_lapse_photo(&printing(), Some(0.2), false, false));
        assert!(!f.timelapse.take_lapse_photo(&printing(), None, true, false));
        assert_eq!(f.timelapse.pool().submitted(), 0);
    }

    #[tokio::test]
    async fn test_height_milestones_and_sentinel() {
        let mut f = fixture(|_| {});
        let printer = printing();
        f.timelapse.on_print_start(&printer);

        assert!(f.timelapse.take_lapse_photo(&printer, Some(0.2), false, false));
        assert!(!f.timelapse.take_lapse_photo(&printer, Some(0.2), false, false));
        assert!(!f.timelapse.take_lapse_photo(&printer, Some(0.3), false, false));
        assert!(f.timelapse.take_lapse_photo(&printer, Some(0.4), false, false));
        assert!(f.timelapse.take_lapse_photo(&printer, None, false, false));
        assert_eq!(f.timelapse.pool().submitted(), 3);

        f.timelapse.pool().drain().await;
        assert_eq!(f.frames.grabs.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_burst_of_frames_all_kept() {
        let mut f = fixture(|_| {});
        let printer = printing();
        f.timelapse.on_print_start(&printer);
        settle().await;

        for _ in 0..6 {
            assert!(f.timelapse.take_lapse_photo(&printer, None, false, false));
        }
        f.timelapse.pool().drain().await;

        let frames = assembly::list_frames(&f.timelapse.lapse_dir(&printer))
            .await
            .unwrap();
        assert_eq!(frames.len(), 6);
    }

    #[tokio::test]
    async fn test_lapse_dir_pinned_for_the_job() {
        let mut f = fixture(|_| {});
        let printer = printing();
        f.timelapse.on_print_start(&printer);
        let pinned = f.timelapse.lapse_dir(&printer);

        let with_metadata = PrinterState {
            start_time_epoch: 1_700_000_000.0,
            ..printing()
        };
        assert_ne!(with_metadata.job_label(), printer.job_label());
        f.timelapse.on_print_resumed_after_reconnect(&with_metadata);
        assert_eq!(f.timelapse.lapse_dir(&with_metadata), pinned);

        let other = PrinterState {
            filename: "other.gcode".to_string(),
            ..printing()
        };
        assert_ne!(f.timelapse.lapse_dir(&other), pinned);
    }

    #[tokio::test]
    async fn test_height_regression_rebases() {
        let mut f = fixture(|c| c.height = 5.0);
        let printer = printing();
        f.timelapse.on_print_start(&printer);
        f.timelapse.state.last_captured_height = 40.0;

        assert!(!f.timelapse.take_lapse_photo(&printer, Some(2.0), false, false));
        assert_eq!(f.timelapse.state().last_captured_height, 2.0);
    }

    #[tokio::test]
    async fn test_pause_blocks_automatic_frames_only() {
        let mut f = fixture(|_| {});
        let printer = printing();
        f.timelapse.on_print_start(&printer);
        f.timelapse.on_pause();

        assert!(!f.timelapse.take_lapse_photo(&printer, None, false, false));
        assert!(f.timelapse.take_lapse_photo(&printer, None, true, false));
    }

    #[tokio::test]
    async fn test_automatic_mode_needs_print_duration() {
        let mut f = fixture(|_| {});
        let mut printer = printing();
        printer.print_duration = 0.0;
        f.timelapse.on_print_start(&printer);
        assert!(!f.timelapse.take_lapse_photo(&printer, None, false, false));
    }

    #[tokio::test]
    async fn test_manual_mode_ignores_lifecycle() {
        let mut f = fixture(|c| c.manual_mode = true);
        let printer = printing();

        f.timelapse.on_print_start(&printer);
        assert!(!f.timelapse.state().is_running);

        f.timelapse
            .handle_trigger(TimelapseTrigger::Start, &printer);
        assert!(f.timelapse.state().is_running);

        f.timelapse.set_paused(false);
        f.timelapse.on_pause();
        assert!(!f.timelapse.state().is_paused);
        assert!(!f.timelapse.on_complete(&printer));
        assert!(f.timelapse.state().is_running);
    }

    #[tokio::test]
    async fn test_manual_triggers_need_manual_mode() {
        let mut f = fixture(|_| {});
        f.timelapse.handle_trigger(TimelapseTrigger::Start, &printing());
        assert!(!f.timelapse.state().is_running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_timer_follows_running_and_pause() {
        let mut f = fixture(|c| c.interval_secs = 10);
        let printer = printing();

        f.timelapse.on_print_start(&printer);
        assert!(f.timelapse.timer_armed());
        f.timelapse.on_pause();
        assert!(!f.timelapse.timer_armed());
        f.timelapse.on_resume();
        assert!(f.timelapse.timer_armed());
        f.timelapse.on_error();
        assert!(!f.timelapse.timer_armed());
    }

    #[tokio::test]
    async fn test_complete_assembles_and_sends_video() {
        let mut f = fixture(|c| c.after_lapse_gcode = Some("LAPSE_DONE".to_string()));
        let printer = printing();
        f.timelapse.on_print_start(&printer);
        settle().await;
        f.timelapse.take_lapse_photo(&printer, Some(0.2), false, false);
        f.timelapse.take_lapse_photo(&printer, Some(0.4), false, false);

        assert!(f.timelapse.on_complete(&printer));
        assert!(!f.timelapse.state().is_running);
        assert_eq!(f.timelapse.assembly().accepted(), 1);

        let chat = f.chat.clone();
        assert!(wait_for(|| chat.videos() == 1).await);
        let api = f.api.clone();
        assert!(wait_for(|| api.scripts().last().map(String::as_str) == Some("LAPSE_DONE")).await);
        assert!(f.api.scripts()[0].contains("lapse_video_size VALUE=1024"));
    }

    #[tokio::test]
    async fn test_zero_frames_reported() {
        let mut f = fixture(|_| {});
        let printer = printing();
        f.timelapse.on_print_start(&printer);
        assert!(f.timelapse.on_complete(&printer));

        let chat = f.chat.clone();
        assert!(wait_for(|| chat.texts_to(1).iter().any(|t| t.contains("failed"))).await);
        assert_eq!(f.chat.videos(), 0);
    }

    #[tokio::test]
    async fn test_oversized_video_falls_back_to_text() {
        let chat = RecordingChat::default();
        let video = VideoPayload {
            path: PathBuf::from("/lapses/cube.mp4"),
            size: MAX_UPLOAD_BYTES + 1,
            thumbnail: Vec::new(),
            width: 640,
            height: 480,
        };

        let delivery = deliver_lapse(&chat, 1, &video, "cube.gcode", true, false).await;
        assert_eq!(delivery, LapseDelivery::TooLarge);
        assert_eq!(chat.videos(), 0);
        assert!(chat.texts_to(1)[0].contains("/lapses/cube.mp4"));

        let video = VideoPayload {
            size: MAX_UPLOAD_BYTES,
            ..video
        };
        assert_eq!(
            deliver_lapse(&chat, 1, &video, "cube.gcode", true, false).await,
            LapseDelivery::Video
        );
        assert!(chat.sent().contains(&Sent::Video {
            target: 1,
            path: PathBuf::from("/lapses/cube.mp4"),
            size: MAX_UPLOAD_BYTES,
        }));
    }

    #[tokio::test]
    async fn test_apply_params() {
        let mut f = fixture(|_| {});
        let scripts = f.timelapse.apply_params(
            "set_timelapse_params manual_mode=1 target_fps=30 max_lapse_duration=60 enabled=maybe",
        );
        assert!(f.timelapse.manual_mode());
        assert_eq!(f.timelapse.config().target_fps, 30);
        assert_eq!(f.timelapse.config().max_lapse_duration, 60);
        assert!(f.timelapse.config().enabled);
        assert_eq!(scripts.len(), 3);
    }

    #[test]
    fn test_trigger_parsing() {
        assert_eq!(
            TimelapseTrigger::parse("timelapse photo_and_gcode"),
            Some(TimelapseTrigger::PhotoAndGcode)
        );
        assert_eq!(TimelapseTrigger::parse(" timelapse photo "), Some(TimelapseTrigger::Photo));
        assert_eq!(TimelapseTrigger::parse("timelapse photos"), None);
    }
}
