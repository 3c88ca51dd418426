//! Progress notifications
//!
//! [`Notifier`] lives on the connection task. It decides *whether* to notify
//! from progress and height milestones; the actual photo capture and chat
//! delivery run as background jobs.

pub mod chat;

pub use chat::{ChatError, ChatId, ChatSink, TelegramSink, VideoPayload, MAX_UPLOAD_BYTES};

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::camera::Camera;
use crate::config::NotificationConfig;
use crate::params::{split_params, ParamsReport};
use crate::printer::{PrinterState, StatusComposer, StatusNotes};
use crate::scheduler::{Scheduler, Tick, TickSender, TimerHandle};
use crate::threshold::crossed;

/// Milestones already notified in the current job
#[derive(Debug, Clone, Default)]
pub struct NotifierState {
    pub last_percent: f64,
    pub last_height: f64,
    pub last_notify: Option<Instant>,
    /// Latest `tgnotify_status` line
    pub status_line: String,
    /// Latest M117 display message
    pub display_message: String,
}

/// Kind of file sent with `tg_send_*`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Image,
    Video,
    Document,
}

pub struct Notifier {
    config: NotificationConfig,
    chat_id: ChatId,
    chat: Arc<dyn ChatSink>,
    camera: Arc<Camera>,
    composer: StatusComposer,
    scheduler: Scheduler,
    ticks: TickSender,
    state: NotifierState,
    timer: Option<TimerHandle>,
}

impl Notifier {
    pub fn new(
        config: NotificationConfig,
        chat_id: ChatId,
        chat: Arc<dyn ChatSink>,
        camera: Arc<Camera>,
        composer: StatusComposer,
        scheduler: Scheduler,
        ticks: TickSender,
    ) -> Self {
        Self {
            config,
            chat_id,
            chat,
            camera,
            composer,
            scheduler,
            ticks,
            state: NotifierState::default(),
            timer: None,
        }
    }

    pub fn state(&self) -> &NotifierState {
        &self.state
    }

    pub fn config(&self) -> &NotificationConfig {
        &self.config
    }

    pub fn timer_armed(&self) -> bool {
        self.timer.is_some()
    }

    fn targets(&self, group_only: bool) -> Vec<ChatId> {
        let mut targets = Vec::with_capacity(self.config.groups.len() + 1);
        if !group_only {
            targets.push(self.chat_id);
        }
        targets.extend(self.config.groups.iter().copied());
        targets
    }

    fn status_text(&self, printer: &PrinterState, prefix: Option<&str>) -> String {
        self.composer.compose(
            printer,
            prefix,
            StatusNotes {
                display_message: &self.state.display_message,
                status_line: &self.state.status_line,
            },
        )
    }

    fn min_interval_elapsed(&self) -> bool {
        let min_interval = Duration::from_secs(self.config.min_interval_secs);
        match self.state.last_notify {
            Some(last) => last.elapsed() >= min_interval,
            None => true,
        }
    }

    /// Check progress (percent) and height (mm) against the milestone steps
    /// and send a status update when one is crossed.
    ///
    /// Returns whether a notification was queued.
    pub fn schedule_notification(
        &mut self,
        printer: &PrinterState,
        percent: Option<u32>,
        height: Option<f64>,
    ) -> bool {
        if !printer.printing
            || printer.print_duration <= 0.0
            || (self.config.percent == 0 && self.config.height == 0.0)
        {
            return false;
        }
        if !self.min_interval_elapsed() {
            debug!("Skipping progress check, last notification too recent");
            return false;
        }

        let mut notify = false;
        if let Some(percent) = percent {
            notify |= crossed(
                f64::from(percent),
                &mut self.state.last_percent,
                f64::from(self.config.percent),
            );
        }
        if let Some(height) = height {
            notify |= crossed(height, &mut self.state.last_height, self.config.height);
        }

        if notify {
            self.send_status_update(printer);
        }
        notify
    }

    /// Periodic status update from the notifier timer
    pub fn notify_by_time(&mut self, printer: &PrinterState) {
        if !printer.printing || printer.print_duration <= 0.0 {
            return;
        }
        if !self.min_interval_elapsed() {
            debug!("Skipping timed update, last notification too recent");
            return;
        }
        self.send_status_update(printer);
    }

    /// Queue a status update to every progress target
    pub fn send_status_update(&mut self, printer: &PrinterState) {
        self.state.last_notify = Some(Instant::now());
        let text = self.status_text(printer, None);
        self.deliver(
            "progress_notification",
            text,
            self.config.silent_progress,
            self.config.group_only,
            true,
        );
    }

    pub fn reset_notifications(&mut self) {
        self.state.last_percent = 0.0;
        self.state.last_height = 0.0;
        self.state.last_notify = None;
        self.state.status_line.clear();
        self.state.display_message.clear();
    }

    /// Arm the periodic notifier, if an interval is configured
    pub fn add_timer(&mut self) {
        if self.config.interval_secs == 0 {
            return;
        }
        self.timer = Some(self.scheduler.arm_ticker(
            "notifier",
            Duration::from_secs(self.config.interval_secs),
            Tick::Notifier,
            self.ticks.clone(),
        ));
    }

    pub fn remove_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }

    pub fn stop_all(&mut self) {
        self.reset_notifications();
        self.remove_timer();
    }

    /// Remember the `tgnotify_status` line; pushes an update while printing
    pub fn set_status_line(&mut self, printer: &PrinterState, line: &str) {
        self.state.status_line = line.to_string();
        if printer.printing {
            self.send_status_update(printer);
        }
    }

    /// Remember the M117 message; pushes an update while printing if configured
    pub fn set_display_message(&mut self, printer: &PrinterState, message: &str) {
        if self.state.display_message == message {
            return;
        }
        self.state.display_message = message.to_string();
        if printer.printing && self.config.m117_update {
            self.send_status_update(printer);
        }
    }

    pub fn send_print_start(&self, printer: &PrinterState) {
        if !self.config.enabled {
            return;
        }
        let text = self.status_text(printer, Some("Printer started printing"));
        self.deliver("print_start", text, self.config.silent_status, false, true);
    }

    pub fn send_print_finish(&mut self, printer: &PrinterState) {
        if self.config.enabled {
            let text = self.status_text(printer, Some("Finished printing"));
            self.deliver("print_finish", text, self.config.silent_status, false, true);
        }
        self.reset_notifications();
    }

    pub fn send_notification(&self, text: &str) {
        self.deliver("notification", text.to_string(), self.config.silent_commands, false, false);
    }

    pub fn send_notification_with_photo(&self, text: &str) {
        self.deliver("notification", text.to_string(), self.config.silent_commands, false, true);
    }

    /// Errors always make a sound
    pub fn send_error(&self, text: &str) {
        self.deliver("error_notification", text.to_string(), false, false, false);
    }

    pub fn send_error_with_photo(&self, text: &str) {
        self.deliver("error_notification", text.to_string(), false, false, true);
    }

    pub fn send_printer_status(&self, text: &str) {
        self.deliver("status_notification", text.to_string(), self.config.silent_status, false, false);
    }

    pub fn send_keyboard(&self, title: &str, keyboard: Vec<Vec<String>>) {
        let chat = self.chat.clone();
        let target = self.chat_id;
        let title = title.to_string();
        let silent = self.config.silent_commands;
        self.scheduler.spawn("custom_keyboard", async move {
            chat.send_keyboard(target, &title, &keyboard, silent).await?;
            Ok(())
        });
    }

    /// Send files from the printer host's disk to the primary chat
    pub fn send_files(&self, kind: FileKind, paths: Vec<PathBuf>, caption: &str) {
        let chat = self.chat.clone();
        let target = self.chat_id;
        let caption = caption.to_string();
        let silent = self.config.silent_commands;
        self.scheduler.spawn("send_files", async move {
            for path in paths {
                if let Err(e) = send_file(chat.as_ref(), target, kind, &path, &caption, silent).await {
                    warn!("Failed to send {:?}: {}", path, e);
                }
            }
            Ok(())
        });
    }

    fn deliver(&self, name: &'static str, text: String, silent: bool, group_only: bool, photo: bool) {
        let delivery = Delivery {
            chat: self.chat.clone(),
            camera: (photo && self.camera.enabled()).then(|| self.camera.clone()),
            targets: self.targets(group_only),
            text,
            silent,
        };
        self.scheduler.spawn(name, delivery.run());
    }

    /// Apply `set_notify_params percent=.. height=.. time=..`.
    ///
    /// Returns `RESPOND` scripts echoing the result to the console.
    pub fn apply_params(&mut self, message: &str) -> Vec<String> {
        let mut report = ParamsReport::new("Notification params");

        for part in split_params(message) {
            let Some((key, value)) = part.split_once('=') else {
                report.unknown(part);
                continue;
            };
            match key {
                "percent" => match value.parse::<u32>() {
                    Ok(percent) => {
                        self.config.percent = percent;
                        report.changed(key, percent);
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
                        self.set_interval(interval);
                        report.changed(key, interval);
                    }
                    Err(e) => report.failed(part, e),
                },
                _ => report.unknown(part),
            }
        }

        if report.has_changes() {
            info!(
                "Notification params now percent={} height={} time={}",
                self.config.percent, self.config.height, self.config.interval_secs
            );
        }
        let full = format!(
            "percent={} height={} time={}",
            self.config.percent, self.config.height, self.config.interval_secs
        );
        report.into_scripts(&full)
    }

    /// Zero removes the timer; a new period re-arms a running one
    fn set_interval(&mut self, interval_secs: u64) {
        self.config.interval_secs = interval_secs;
        if interval_secs == 0 {
            self.remove_timer();
        } else if self.timer.is_some() {
            self.add_timer();
        }
    }
}

/// One message, optionally with a fresh photo, to a list of chats
struct Delivery {
    chat: Arc<dyn ChatSink>,
    camera: Option<Arc<Camera>>,
    targets: Vec<ChatId>,
    text: String,
    silent: bool,
}

impl Delivery {
    async fn run(self) -> Result<()> {
        let photo = match &self.camera {
            Some(camera) => Some(camera.take_photo().await),
            None => None,
        };

        for target in &self.targets {
            let sent = match &photo {
                Some(photo) => {
                    self.chat
                        .send_photo(*target, photo, &self.text, self.silent)
                        .await
                }
                None => self.chat.send_text(*target, &self.text, self.silent).await,
            };
            if let Err(e) = sent {
                warn!("Failed to notify chat {}: {}", target, e);
            }
        }
        Ok(())
    }
}

async fn send_file(
    chat: &dyn ChatSink,
    target: ChatId,
    kind: FileKind,
    path: &std::path::Path,
    caption: &str,
    silent: bool,
) -> Result<(), ChatError> {
    match kind {
        FileKind::Image => {
            let photo = tokio::fs::read(path).await.map_err(|source| ChatError::File {
                path: path.to_path_buf(),
                source,
            })?;
            chat.send_photo(target, &photo, caption, silent).await
        }
        FileKind::Video | FileKind::Document => {
            chat.send_document(target, path, caption, silent).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::CaptureLock;
    use crate::config::{LightConfig, StatusMessageConfig};
    use crate::testing::{settle, RecordingChat, Sent};
    use tokio::sync::mpsc;

    struct Fixture {
        notifier: Notifier,
        chat: Arc<RecordingChat>,
        scheduler: Scheduler,
        ticks: mpsc::UnboundedReceiver<Tick>,
    }

    fn fixture(config: NotificationConfig) -> Fixture {
        let chat = Arc::new(RecordingChat::default());
        let scheduler = Scheduler::new();
        let camera = Arc::new(Camera::new(
            None,
            CaptureLock::new(None, &LightConfig::default(), scheduler.clone()),
        ));
        let (tx, ticks) = mpsc::unbounded_channel();
        let notifier = Notifier::new(
            config,
            1,
            chat.clone(),
            camera,
            StatusComposer::new(&StatusMessageConfig::default(), None),
            scheduler.clone(),
            tx,
        );
        Fixture {
            notifier,
            chat,
            scheduler,
            ticks,
        }
    }

    fn printing() -> PrinterState {
        PrinterState {
            printing: true,
            print_duration: 60.0,
            filename: "a.gcode".to_string(),
            ..Default::default()
        }
    }

    fn every(percent: u32, height: f64) -> NotificationConfig {
        NotificationConfig {
            percent,
            height,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_threshold_fires_once_per_value() {
        let mut f = fixture(every(10, 0.0));
        let printer = printing();

        assert!(f.notifier.schedule_notification(&printer, Some(10), None));
        assert!(!f.notifier.schedule_notification(&printer, Some(10), None));
        assert!(!f.notifier.schedule_notification(&printer, Some(15), None));
        assert!(f.notifier.schedule_notification(&printer, Some(20), None));
        assert_eq!(f.scheduler.spawned(), 2);

        settle().await;
        assert_eq!(f.chat.texts_to(1).len(), 2);
    }

    #[tokio::test]
    async fn test_reset_allows_same_milestone_again() {
        let mut f = fixture(every(10, 0.0));
        let printer = printing();

        assert!(f.notifier.schedule_notification(&printer, Some(50), None));
        f.notifier.reset_notifications();
        assert!(f.notifier.schedule_notification(&printer, Some(50), None));
    }

    #[tokio::test]
    async fn test_height_regression_rebases() {
        let mut f = fixture(every(0, 5.0));
        let printer = printing();

        assert!(f.notifier.schedule_notification(&printer, None, Some(40.0)));
        assert!(!f.notifier.schedule_notification(&printer, None, Some(2.0)));
        assert_eq!(f.notifier.state().last_height, 2.0);
        assert!(f.notifier.schedule_notification(&printer, None, Some(5.0)));
    }

    #[tokio::test]
    async fn test_noop_unless_printing_with_duration() {
        let mut f = fixture(every(10, 0.0));
        let mut printer = printing();
        printer.print_duration = 0.0;
        assert!(!f.notifier.schedule_notification(&printer, Some(10), None));

        printer.print_duration = 5.0;
        printer.printing = false;
        assert!(!f.notifier.schedule_notification(&printer, Some(10), None));

        let mut disabled = fixture(every(0, 0.0));
        assert!(!disabled.notifier.schedule_notification(&printing(), Some(10), Some(5.0)));
        assert_eq!(f.scheduler.spawned(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_min_interval_suppresses() {
        let mut f = fixture(NotificationConfig {
            min_interval_secs: 60,
            ..every(10, 0.0)
        });
        let printer = printing();

        assert!(f.notifier.schedule_notification(&printer, Some(10), None));
        assert!(!f.notifier.schedule_notification(&printer, Some(20), None));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(f.notifier.schedule_notification(&printer, Some(30), None));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_update_respects_guards() {
        let mut f = fixture(NotificationConfig {
            min_interval_secs: 600,
            interval_secs: 60,
            ..every(10, 0.0)
        });
        let printer = printing();

        assert!(f.notifier.schedule_notification(&printer, Some(10), None));
        f.notifier.notify_by_time(&printer);
        assert_eq!(f.scheduler.spawned(), 1);

        let mut idle = printing();
        idle.print_duration = 0.0;
        tokio::time::advance(Duration::from_secs(601)).await;
        f.notifier.notify_by_time(&idle);
        idle.print_duration = 5.0;
        idle.printing = false;
        f.notifier.notify_by_time(&idle);
        assert_eq!(f.scheduler.spawned(), 1);

        f.notifier.notify_by_time(&printer);
        assert_eq!(f.scheduler.spawned(), 2);
    }

    #[tokio::test]
    async fn test_group_only_and_failure_isolation() {
        let mut f = fixture(NotificationConfig {
            groups: vec![-10, -20],
            group_only: true,
            ..every(10, 0.0)
        });
        f.chat.fail_for(-10);

        f.notifier.schedule_notification(&printing(), Some(10), None);
        settle().await;

        assert!(f.chat.texts_to(1).is_empty());
        assert!(f.chat.texts_to(-10).is_empty());
        assert_eq!(f.chat.texts_to(-20).len(), 1);
    }

    #[tokio::test]
    async fn test_errors_are_not_silent() {
        let f = fixture(NotificationConfig {
            silent_commands: true,
            ..Default::default()
        });
        f.notifier.send_error("Printer state change error");
        f.notifier.send_notification("hello");
        settle().await;

        let sent = f.chat.sent();
        assert!(sent.contains(&Sent::Text {
            target: 1,
            text: "Printer state change error".to_string(),
            silent: false,
        }));
        assert!(sent.contains(&Sent::Text {
            target: 1,
            text: "hello".to_string(),
            silent: true,
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_lifecycle() {
        let mut f = fixture(NotificationConfig {
            interval_secs: 30,
            ..Default::default()
        });

        f.notifier.add_timer();
        assert!(f.notifier.timer_armed());
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(f.ticks.try_recv().unwrap(), Tick::Notifier);

        f.notifier.remove_timer();
        assert!(!f.notifier.timer_armed());
    }

    #[tokio::test]
    async fn test_apply_params() {
        let mut f = fixture(NotificationConfig::default());
        f.notifier.add_timer();
        assert!(!f.notifier.timer_armed());

        let scripts = f
            .notifier
            .apply_params("set_notify_params percent=5 height=2.5 time=0 bogus=1 percent=x");
        assert_eq!(f.notifier.config().percent, 5);
        assert_eq!(f.notifier.config().height, 2.5);
        assert!(!f.notifier.timer_armed());
        // Two errors, then changed and full config
        assert_eq!(scripts.len(), 4);
        assert!(scripts.last().unwrap().contains("percent=5 height=2.5 time=0"));
    }

    #[tokio::test]
    async fn test_print_finish_resets() {
        let mut f = fixture(every(10, 0.0));
        let printer = printing();
        f.notifier.schedule_notification(&printer, Some(30), None);
        f.notifier.send_print_finish(&printer);
        assert_eq!(f.notifier.state().last_percent, 0.0);

        settle().await;
        assert!(f
            .chat
            .texts_to(1)
            .iter()
            .any(|text| text.starts_with("Finished printing: a.gcode")));
    }
}
