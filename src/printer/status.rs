//! Human-readable status messages

use chrono::Local;
use std::fmt::Write;
use std::time::Duration;

use super::state::{PrinterState, SensorReading};
use crate::config::{EtaSource, StatusMessageConfig, StatusPart};

/// Free-form lines set from the printer console
#[derive(Debug, Clone, Copy, Default)]
pub struct StatusNotes<'a> {
    /// Last M117 display message
    pub display_message: &'a str,
    /// Last `tgnotify_status` line
    pub status_line: &'a str,
}

/// Builds status text from a [`PrinterState`] snapshot
#[derive(Debug, Clone)]
pub struct StatusComposer {
    parts: Vec<StatusPart>,
    eta_source: EtaSource,
    devices: Vec<String>,
    light_device: Option<String>,
}

impl StatusComposer {
    pub fn new(config: &StatusMessageConfig, light_device: Option<String>) -> Self {
        Self {
            parts: config.content.clone(),
            eta_source: config.eta_source,
            devices: config.devices.clone(),
            light_device,
        }
    }

    fn has(&self, part: StatusPart) -> bool {
        self.parts.contains(&part)
    }

    /// Full status: job info (if any), sensors and power devices.
    ///
    /// `prefix` replaces the leading "Printing" label, e.g. "Finished printing".
    pub fn compose(&self, state: &PrinterState, prefix: Option<&str>, notes: StatusNotes<'_>) -> String {
        let mut message = String::new();
        if state.has_file() {
            message.push_str(&self.job_info(state, prefix));
        }
        if self.has(StatusPart::M117Status) && !notes.display_message.is_empty() {
            let _ = writeln!(message, "{}", notes.display_message);
        }
        if self.has(StatusPart::TgnotifyStatus) && !notes.status_line.is_empty() {
            let _ = writeln!(message, "{}", notes.status_line);
        }
        message.push_str(&self.sensors(state));
        message.push_str(&self.power_devices(state));
        if self.has(StatusPart::LastUpdateTime) {
            let _ = writeln!(message, "Last update at {}", Local::now().format("%H:%M:%S"));
        }
        message
    }

    fn job_info(&self, state: &PrinterState, prefix: Option<&str>) -> String {
        let mut message = format!("{}: {}\n", prefix.unwrap_or("Printing"), state.filename);

        if self.has(StatusPart::Progress) {
            let _ = write!(message, "Progress {:.0}%", state.progress * 100.0);
        }
        if self.has(StatusPart::Height) && state.height > 0.0 {
            let _ = write!(message, ", height: {:.2}mm", state.height);
        }
        message.push('\n');

        if state.filament_total > 0.0 {
            if self.has(StatusPart::FilamentLength) {
                let _ = write!(
                    message,
                    "Filament: {:.2}m / {:.2}m",
                    state.filament_used / 1000.0,
                    state.filament_total / 1000.0
                );
            }
            if self.has(StatusPart::FilamentWeight) && state.filament_weight > 0.0 {
                let _ = write!(
                    message,
                    ", weight: {:.2}/{}g",
                    state.filament_weight_used(),
                    state.filament_weight
                );
            }
            message.push('\n');
        }

        if self.has(StatusPart::PrintDuration) {
            let _ = writeln!(
                message,
                "Printing for {}",
                format_duration(Duration::from_secs(state.print_duration.round() as u64))
            );
        }

        let eta = state.eta(self.eta_source);
        if self.has(StatusPart::Eta) {
            let _ = writeln!(message, "Estimated time left: {}", format_duration(eta));
        }
        if self.has(StatusPart::FinishTime) {
            if let Ok(eta) = chrono::Duration::from_std(eta) {
                let _ = writeln!(message, "Finish at {}", (Local::now() + eta).format("%Y-%m-%d %H:%M"));
            }
        }
        message
    }

    fn sensors(&self, state: &PrinterState) -> String {
        let mut message = String::new();
        for (name, reading) in &state.sensors {
            let _ = writeln!(message, "{}", sensor_line(name, reading));
        }
        message
    }

    fn power_devices(&self, state: &PrinterState) -> String {
        let mut message = String::new();
        for (name, status) in &state.power_devices {
            if !self.devices.contains(name) {
                continue;
            }
            let icon = if self.light_device.as_deref() == Some(name.as_str()) {
                "🔦"
            } else {
                "🚦"
            };
            let _ = writeln!(message, "{} {}: {}", icon, name, status);
        }
        message
    }
}

/// `H:MM:SS`, with a day count once it exceeds 24 hours
pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    let days = total / 86_400;
    let hours = (total % 86_400) / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;
    if days > 0 {
        format!("{} days, {}:{:02}:{:02}", days, hours, minutes, seconds)
    } else {
        format!("{}:{:02}:{:02}", hours, minutes, seconds)
    }
}

fn sensor_line(name: &str, reading: &SensorReading) -> String {
    let icon = if reading.power.is_some() {
        "♨️ "
    } else if reading.speed.is_some() {
        "🌪 "
    } else if reading.temperature.is_some() {
        "🌡 "
    } else {
        ""
    };

    let mut line = format!("{}{}:", icon, title_case(name));
    if let Some(temperature) = reading.temperature {
        let _ = write!(line, " {:.0} °C", temperature);
        if let Some(target) = reading.target {
            if target > 0.0 && (target - temperature).abs() > 2.0 {
                let _ = write!(line, " ➡️ {:.0} °C", target);
            }
        }
    }
    if reading.power.is_some_and(|p| p > 0.0) {
        line.push_str(" 🔥");
    }
    if let Some(speed) = reading.speed {
        let _ = write!(line, " {:.0}%", speed * 100.0);
    }
    if let Some(rpm) = reading.rpm {
        let _ = write!(line, " {:.0} RPM", rpm);
    }
    line
}

fn title_case(name: &str) -> String {
    name.split('_')
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
