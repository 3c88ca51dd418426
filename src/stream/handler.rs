//! Inbound message to state transition mapping

use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::gcode::{parse_response, GcodeCommand};
use super::rpc::{subscribe_objects, Inbound, Request};
use super::{ConnectionState, MetadataUpdate};
use crate::notify::Notifier;
use crate::printer::{MoonrakerApi, PowerDevice, PrinterTracker, StateError, StateLabel};
use crate::scheduler::{Scheduler, Tick, TickSender, TimerHandle};
use crate::timelapse::TimelapseCoordinator;

/// How often Klippy is asked for its state until it reports ready
const KLIPPY_POLL: Duration = Duration::from_secs(2);

/// Print job transition carried by `print_stats.state`
#[derive(Debug, Clone, PartialEq)]
enum PrintTransition {
    Started,
    Resumed,
    Paused,
    Complete,
    Error(String),
    Standby,
    Cancelled,
}

/// Channels the handler writes into; the client task owns the receivers
#[derive(Debug, Clone)]
pub struct HandlerChannels {
    pub outbox: mpsc::UnboundedSender<Request>,
    pub ticks: TickSender,
    pub metadata: mpsc::UnboundedSender<MetadataUpdate>,
}

pub struct EventHandler {
    tracker: PrinterTracker,
    notifier: Notifier,
    timelapse: TimelapseCoordinator,
    power_devices: Vec<Arc<PowerDevice>>,
    sensors: Vec<String>,
    api: Arc<dyn MoonrakerApi>,
    scheduler: Scheduler,
    channels: HandlerChannels,
    reconnect: Option<TimerHandle>,
    connection: ConnectionState,
    socket_open: bool,
}

impl EventHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        notifier: Notifier,
        timelapse: TimelapseCoordinator,
        power_devices: Vec<Arc<PowerDevice>>,
        sensors: Vec<String>,
        api: Arc<dyn MoonrakerApi>,
        scheduler: Scheduler,
        channels: HandlerChannels,
    ) -> Self {
        Self {
            tracker: PrinterTracker::new(),
            notifier,
            timelapse,
            power_devices,
            sensors,
            api,
            scheduler,
            channels,
            reconnect: None,
            connection: ConnectionState::Disconnected,
            socket_open: false,
        }
    }

    pub fn tracker(&self) -> &PrinterTracker {
        &self.tracker
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn timelapse(&self) -> &TimelapseCoordinator {
        &self.timelapse
    }

    pub fn connection(&self) -> ConnectionState {
        self.connection
    }

    pub fn reconnect_armed(&self) -> bool {
        self.reconnect.is_some()
    }

    fn send(&self, request: Request) {
        if self.channels.outbox.send(request).is_err() {
            warn!("Outbox closed, dropping request");
        }
    }

    fn arm_reconnect(&mut self) {
        if self.reconnect.is_some() {
            return;
        }
        self.reconnect = Some(self.scheduler.arm_ticker(
            "reconnect",
            KLIPPY_POLL,
            Tick::Reconnect,
            self.channels.ticks.clone(),
        ));
    }

    fn disarm_reconnect(&mut self) {
        if let Some(timer) = self.reconnect.take() {
            timer.cancel();
        }
    }

    fn identify(&self) {
        self.send(Request::PrinterInfo);
        self.send(Request::DevicePowerDevices);
    }

    /// Socket connected: identify the printer and poll until Klippy is ready
    pub fn on_open(&mut self) {
        info!("Event stream connected");
        self.socket_open = true;
        self.connection = ConnectionState::Connecting;
        self.identify();
        self.arm_reconnect();
    }

    /// Socket closed or failed
    pub fn on_closed(&mut self) {
        if self.socket_open {
            warn!("Event stream disconnected");
        }
        self.socket_open = false;
        self.connection = ConnectionState::Disconnected;
        self.disarm_reconnect();
        self.tracker.set_connected(false);
    }

    pub fn handle_tick(&mut self, tick: Tick) {
        match tick {
            Tick::Reconnect => {
                if !self.tracker.state().connected && self.socket_open {
                    debug!("Klippy not ready, asking again");
                    self.identify();
                }
            }
            Tick::Notifier => self.notifier.notify_by_time(self.tracker.state()),
            Tick::Timelapse => {
                self.timelapse
                    .take_lapse_photo(self.tracker.state(), None, false, false);
            }
        }
    }

    pub fn handle_metadata(&mut self, update: MetadataUpdate) {
        match self
            .tracker
            .apply_file_metadata(&update.filename, update.result)
        {
            Ok(()) => {}
            Err(e @ StateError::StaleMetadata { .. }) => debug!("{}", e),
            Err(e) => warn!("{}", e),
        }
    }

    /// Decode and apply one text frame
    pub fn handle_text(&mut self, text: &str) {
        debug!("<- {}", text);
        let inbound = match Inbound::parse(text) {
            Ok(inbound) => inbound,
            Err(e) => {
                warn!("Dropping malformed frame: {}", e);
                return;
            }
        };

        match inbound {
            Inbound::ErrorReply { id, message } => {
                warn!("Error received from event stream (id {:?}): {}", id, message);
            }
            Inbound::Reply { result, .. } => self.handle_reply(result),
            Inbound::Notification { method, params } => self.handle_notification(&method, params),
        }
    }

    fn handle_reply(&mut self, result: Value) {
        if let Some(status) = result.get("status").and_then(Value::as_object) {
            self.apply_status_snapshot(status);
        } else if let Some(label) = result.get("state").and_then(Value::as_str) {
            let message = result
                .get("state_message")
                .and_then(Value::as_str)
                .unwrap_or_default();
            self.handle_klippy_state(label, message);
        } else if let Some(devices) = result.get("devices").and_then(Value::as_array) {
            self.apply_power_devices(devices);
        } else {
            debug!("Ignoring reply of unknown shape");
        }
    }

    fn handle_notification(&mut self, method: &str, params: Vec<Value>) {
        match method {
            "notify_klippy_disconnected" | "notify_klippy_shutdown" => {
                warn!("Klippy disconnect detected: {}", method);
                self.notifier.stop_all();
                self.timelapse.stop_all();
                self.tracker.set_connected(false);
                self.connection = if self.socket_open {
                    ConnectionState::Connecting
                } else {
                    ConnectionState::Disconnected
                };
                self.arm_reconnect();
            }
            "notify_gcode_response" => self.handle_gcode_response(&params),
            "notify_status_update" => match params.first().and_then(Value::as_object) {
                Some(delta) => self.apply_status_update(delta),
                None => warn!("Status update without a payload"),
            },
            "notify_power_changed" => self.apply_power_devices(&params),
            other => debug!("Ignoring notification {}", other),
        }
    }

    fn handle_klippy_state(&mut self, label: &str, message: &str) {
        let parsed = StateLabel::parse(label);
        match parsed {
            StateLabel::Ready => {
                if !self.socket_open {
                    return;
                }
                self.tracker.set_connected(true);
                if !self.tracker.state().state_message.is_empty() {
                    self.notifier
                        .send_error(&format!("Klippy changed state to {}", parsed.as_str()));
                }
                self.tracker.set_state_label(StateLabel::Ready, "");
                self.send(Request::Subscribe(subscribe_objects(&self.sensors)));
                self.connection = ConnectionState::Subscribed;
                self.disarm_reconnect();
                info!("Klippy ready, subscribed to printer objects");
            }
            StateLabel::Error | StateLabel::Shutdown | StateLabel::Startup | StateLabel::Unknown => {
                if parsed == StateLabel::Unknown {
                    error!("Unknown klippy state: {}", label);
                }
                self.tracker.set_connected(false);
                self.connection = ConnectionState::Connecting;
                self.arm_reconnect();

                let alert = matches!(parsed, StateLabel::Error | StateLabel::Shutdown)
                    && self.tracker.state().state_message != message;
                let kept = if alert {
                    message.to_string()
                } else {
                    self.tracker.state().state_message.clone()
                };
                self.tracker.set_state_label(parsed, &kept);
                if alert {
                    self.notifier.send_error(&format!(
                        "Klippy changed state to {}\n{}",
                        parsed.as_str(),
                        message
                    ));
                }
            }
        }
    }

    fn set_active_file(&mut self, filename: &str) {
        if !self.tracker.set_active_file(filename) {
            return;
        }
        let api = self.api.clone();
        let tx = self.channels.metadata.clone();
        let filename = filename.to_string();
        self.scheduler.spawn("file_metadata", async move {
            let result = api.file_metadata(&filename).await;
            // Receiver gone means the client is shutting down
            let _ = tx.send(MetadataUpdate { filename, result });
            Ok(())
        });
    }

    /// Print stats fields that feed the tracker; the state transition runs later
    fn apply_print_stats_fields(&mut self, stats: &Map<String, Value>) {
        if let Some(filename) = stats.get("filename").and_then(Value::as_str) {
            self.set_active_file(filename);
        }
        if let Some(used) = stats.get("filament_used").and_then(Value::as_f64) {
            self.tracker.set_filament_used(used);
        }
        if let Some(duration) = stats.get("print_duration").and_then(Value::as_f64) {
            self.tracker.set_print_duration(duration);
        }
    }

    /// Full status returned by the subscription request
    fn apply_status_snapshot(&mut self, status: &Map<String, Value>) {
        let print_state = status
            .get("print_stats")
            .and_then(|stats| stats.get("state"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        if matches!(print_state.as_str(), "printing" | "paused") {
            self.tracker.set_printing(true);
            if let Some(stats) = status.get("print_stats").and_then(Value::as_object) {
                self.apply_print_stats_fields(stats);
            }
        }
        if let Some(display) = status.get("display_status") {
            if let Some(progress) = display.get("progress").and_then(Value::as_f64) {
                self.tracker.set_progress(progress);
            }
        }
        if let Some(progress) = status
            .get("virtual_sdcard")
            .and_then(|vsd| vsd.get("progress"))
            .and_then(Value::as_f64)
        {
            self.tracker.set_vsd_progress(progress);
        }
        self.tracker.apply_sensors(status);

        match print_state.as_str() {
            "printing" => {
                self.tracker.set_paused(false);
                self.notifier.add_timer();
                self.timelapse
                    .on_print_resumed_after_reconnect(self.tracker.state());
            }
            "paused" => {
                self.tracker.set_paused(true);
                self.notifier.add_timer();
                self.timelapse
                    .on_print_resumed_after_reconnect(self.tracker.state());
                self.timelapse.on_pause();
            }
            _ => {}
        }
        if let Some(message) = status
            .get("display_status")
            .and_then(|display| display.get("message"))
            .and_then(Value::as_str)
        {
            self.notifier
                .set_display_message(self.tracker.state(), message);
        }
    }

    /// Incremental `notify_status_update`
    fn apply_status_update(&mut self, delta: &Map<String, Value>) {
        let display = delta.get("display_status");
        let progress = display
            .and_then(|display| display.get("progress"))
            .and_then(Value::as_f64);
        let height = delta
            .get("gcode_move")
            .and_then(|gcode_move| gcode_move.get("gcode_position"))
            .and_then(|position| position.get(2))
            .and_then(Value::as_f64);
        let stats = delta.get("print_stats").and_then(Value::as_object);

        if let Some(progress) = progress {
            self.tracker.set_progress(progress);
        }
        if let Some(height) = height {
            self.tracker.set_height(height);
        }
        if let Some(progress) = delta
            .get("virtual_sdcard")
            .and_then(|vsd| vsd.get("progress"))
            .and_then(Value::as_f64)
        {
            self.tracker.set_vsd_progress(progress);
        }
        if let Some(stats) = stats {
            self.apply_print_stats_fields(stats);
        }
        self.tracker.apply_sensors(delta);
        let transition = stats.and_then(|stats| self.apply_print_transition(stats));

        if let Some(message) = display
            .and_then(|display| display.get("message"))
            .and_then(Value::as_str)
        {
            self.notifier
                .set_display_message(self.tracker.state(), message);
        }
        if let Some(transition) = transition {
            self.run_print_transition(transition);
        }
        if let Some(progress) = progress {
            let percent = (progress * 100.0) as u32;
            self.notifier
                .schedule_notification(self.tracker.state(), Some(percent), None);
        }
        if let Some(height) = height {
            self.notifier
                .schedule_notification(self.tracker.state(), None, Some(height.trunc()));
            self.timelapse
                .take_lapse_photo(self.tracker.state(), Some(height), false, false);
        }
    }

    /// Apply the print state to the tracker; hooks run afterwards
    fn apply_print_transition(&mut self, stats: &Map<String, Value>) -> Option<PrintTransition> {
        let state = stats.get("state").and_then(Value::as_str)?;

        let transition = match state {
            "printing" => {
                let resumed = self.tracker.state().printing;
                self.tracker.set_printing(true);
                self.tracker.set_paused(false);
                if resumed {
                    PrintTransition::Resumed
                } else {
                    PrintTransition::Started
                }
            }
            "paused" => {
                self.tracker.set_paused(true);
                PrintTransition::Paused
            }
            "complete" => PrintTransition::Complete,
            "error" => PrintTransition::Error(
                stats
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            ),
            "standby" => PrintTransition::Standby,
            "cancelled" => PrintTransition::Cancelled,
            other => {
                error!("Unknown print state: {}", other);
                return None;
            }
        };
        if !matches!(
            transition,
            PrintTransition::Started | PrintTransition::Resumed | PrintTransition::Paused
        ) {
            self.tracker.set_printing(false);
        }
        Some(transition)
    }

    fn run_print_transition(&mut self, transition: PrintTransition) {
        match transition {
            PrintTransition::Started => {
                info!("Print started: {}", self.tracker.state().filename);
                self.notifier.reset_notifications();
                self.notifier.add_timer();
                self.timelapse.on_print_start(self.tracker.state());
                self.notifier.send_print_start(self.tracker.state());
            }
            PrintTransition::Resumed => self.timelapse.on_resume(),
            PrintTransition::Paused => self.timelapse.on_pause(),
            PrintTransition::Complete => {
                info!("Print complete: {}", self.tracker.state().filename);
                self.notifier.remove_timer();
                self.timelapse.on_complete(self.tracker.state());
                self.notifier.send_print_finish(self.tracker.state());
            }
            PrintTransition::Error(message) => {
                self.timelapse.on_error();
                self.notifier.remove_timer();
                let mut text = "Printer state change error: error\n".to_string();
                if !message.is_empty() {
                    text.push_str(&message);
                    text.push('\n');
                }
                self.notifier.send_error(&text);
            }
            PrintTransition::Standby => {
                self.notifier.remove_timer();
                self.timelapse.set_running(false);
                self.notifier
                    .send_printer_status("Printer state change: standby \n");
            }
            PrintTransition::Cancelled => {
                self.notifier.remove_timer();
                self.timelapse.on_cancel(self.tracker.state());
                self.notifier.send_printer_status("Print cancelled");
            }
        }
    }

    fn apply_power_devices(&mut self, devices: &[Value]) {
        for device in devices {
            let (Some(name), Some(status)) = (
                device.get("device").and_then(Value::as_str),
                device.get("status").and_then(Value::as_str),
            ) else {
                debug!("Ignoring power device entry without name or status");
                continue;
            };
            self.tracker.set_power_device(name, status);
            for power in self.power_devices.iter().filter(|power| power.name() == name) {
                power.set_state_str(status);
            }
        }
    }

    fn handle_gcode_response(&mut self, params: &[Value]) {
        for command in parse_response(params) {
            match command {
                GcodeCommand::Notify(text) => self.notifier.send_notification(&text),
                GcodeCommand::NotifyPhoto(text) => self.notifier.send_notification_with_photo(&text),
                GcodeCommand::Alarm(text) => self.notifier.send_error(&text),
                GcodeCommand::AlarmPhoto(text) => self.notifier.send_error_with_photo(&text),
                GcodeCommand::StatusLine(line) => {
                    self.notifier.set_status_line(self.tracker.state(), &line)
                }
                GcodeCommand::TimelapseParams(line) => {
                    for script in self.timelapse.apply_params(&line) {
                        self.send(Request::GcodeScript(script));
                    }
                }
                GcodeCommand::NotifyParams(line) => {
                    for script in self.notifier.apply_params(&line) {
                        self.send(Request::GcodeScript(script));
                    }
                }
                GcodeCommand::Keyboard { title, rows } => self.notifier.send_keyboard(&title, rows),
                GcodeCommand::SendFiles {
                    kind,
                    paths,
                    message,
                } => self.notifier.send_files(kind, paths, &message),
                GcodeCommand::Timelapse(trigger) => {
                    self.timelapse.handle_trigger(trigger, self.tracker.state())
                }
            }
        }
    }
}
