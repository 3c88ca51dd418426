//! In-memory view of the printer
//!
//! Only the connection task mutates [`PrinterTracker`]; jobs get a cloned
//! [`PrinterState`] snapshot.

use chrono::{DateTime, Local, TimeZone};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use super::api::{ApiError, FileMetadata};
use crate::config::EtaSource;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("metadata for {requested} arrived after the active file changed to {active:?}")]
    StaleMetadata { requested: String, active: String },

    #[error("failed to fetch metadata for {filename}: {source}")]
    Metadata {
        filename: String,
        #[source]
        source: ApiError,
    },
}

/// Klippy state reported by `printer.info`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StateLabel {
    Ready,
    Startup,
    Shutdown,
    Error,
    #[default]
    Unknown,
}

impl StateLabel {
    pub fn parse(label: &str) -> Self {
        match label {
            "ready" => StateLabel::Ready,
            "startup" => StateLabel::Startup,
            "shutdown" => StateLabel::Shutdown,
            "error" => StateLabel::Error,
            _ => StateLabel::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StateLabel::Ready => "ready",
            StateLabel::Startup => "startup",
            StateLabel::Shutdown => "shutdown",
            StateLabel::Error => "error",
            StateLabel::Unknown => "unknown",
        }
    }
}

/// Last known values of a temperature sensor, heater or fan
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SensorReading {
    pub temperature: Option<f64>,
    pub target: Option<f64>,
    pub power: Option<f64>,
    pub speed: Option<f64>,
    pub rpm: Option<f64>,
}

impl SensorReading {
    /// Overwrite the fields present in `fields`, keep the rest
    fn merge(&mut self, fields: &Map<String, Value>) {
        let slots: [(&str, &mut Option<f64>); 5] = [
            ("temperature", &mut self.temperature),
            ("target", &mut self.target),
            ("power", &mut self.power),
            ("speed", &mut self.speed),
            ("rpm", &mut self.rpm),
        ];
        for (key, slot) in slots {
            if let Some(value) = fields.get(key) {
                *slot = value.as_f64();
            }
        }
    }
}

const SENSOR_PREFIXES: &[&str] = &[
    "temperature_sensor",
    "temperature_fan",
    "heater_fan",
    "controller_fan",
    "fan_generic",
    "heater_generic",
    "heater_bed",
    "extruder",
];

/// Display name for a sensor object, or `None` if the object is not a sensor.
///
/// `"temperature_sensor chamber"` becomes `"chamber"`; single-word objects
/// such as `"extruder"` or `"fan"` keep their name.
pub fn sensor_name(object: &str) -> Option<&str> {
    let is_sensor = object == "fan" || SENSOR_PREFIXES.iter().any(|p| object.starts_with(p));
    if !is_sensor {
        return None;
    }
    object.rsplit(' ').next()
}

#[derive(Debug, Clone)]
pub struct PrinterState {
    pub connected: bool,
    pub printing: bool,
    pub paused: bool,
    pub state_label: StateLabel,
    pub state_message: String,
    pub print_duration: f64,
    pub progress: f64,
    pub vsd_progress: f64,
    pub filename: String,
    pub job_started_at: DateTime<Local>,
    pub estimated_time: f64,
    pub start_time_epoch: f64,
    pub filament_used: f64,
    pub filament_total: f64,
    pub filament_weight: f64,
    pub height: f64,
    pub sensors: BTreeMap<String, SensorReading>,
    pub power_devices: BTreeMap<String, String>,
}

impl Default for PrinterState {
    fn default() -> Self {
        Self {
            connected: false,
            printing: false,
            paused: false,
            state_label: StateLabel::Unknown,
            state_message: String::new(),
            print_duration: 0.0,
            progress: 0.0,
            vsd_progress: 0.0,
            filename: String::new(),
            job_started_at: Local::now(),
            estimated_time: 0.0,
            start_time_epoch: 0.0,
            filament_used: 0.0,
            filament_total: 0.0,
            filament_weight: 0.0,
            height: 0.0,
            sensors: BTreeMap::new(),
            power_devices: BTreeMap::new(),
        }
    }
}

impl PrinterState {
    pub fn has_file(&self) -> bool {
        !self.filename.is_empty()
    }

    /// Estimated time left
    pub fn eta(&self, source: EtaSource) -> Duration {
        let eta = match source {
            EtaSource::Slicer => self.estimated_time - self.print_duration,
            EtaSource::File if self.vsd_progress > 0.0 => {
                self.print_duration / self.vsd_progress - self.print_duration
            }
            EtaSource::File => self.estimated_time,
        };
        Duration::from_secs(eta.max(0.0) as u64)
    }

    pub fn filament_weight_used(&self) -> f64 {
        if self.filament_total > 0.0 {
            self.filament_weight * (self.filament_used / self.filament_total)
        } else {
            0.0
        }
    }

    /// When the job started: the metadata's print start time if known,
    /// otherwise the time the file became active
    pub fn job_start(&self) -> DateTime<Local> {
        if self.start_time_epoch > 0.0 {
            let secs = self.start_time_epoch.trunc() as i64;
            if let Some(start) = Local.timestamp_opt(secs, 0).single() {
                return start;
            }
        }
        self.job_started_at
    }

    /// Name for the current job's timelapse directory and video:
    /// file stem plus local job start time
    pub fn job_label(&self) -> String {
        let stem = Path::new(&self.filename)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("print");
        format!("{}_{}", stem, self.job_start().format("%Y-%m-%d_%H-%M"))
    }
}

/// Owner of the [`PrinterState`]
#[derive(Debug, Default)]
pub struct PrinterTracker {
    state: PrinterState,
}

impl PrinterTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &PrinterState {
        &self.state
    }

    pub fn snapshot(&self) -> PrinterState {
        self.state.clone()
    }

    /// Connection changes always drop the print job view
    pub fn set_connected(&mut self, connected: bool) {
        self.state.connected = connected;
        self.state.printing = false;
        self.state.paused = false;
        self.reset_file_info();
    }

    pub fn set_state_label(&mut self, label: StateLabel, message: &str) {
        self.state.state_label = label;
        self.state.state_message = message.to_string();
    }

    pub fn set_printing(&mut self, printing: bool) {
        self.state.printing = printing;
        if !printing {
            self.state.paused = false;
        }
    }

    /// Pausing implies a print is in progress
    pub fn set_paused(&mut self, paused: bool) {
        self.state.paused = paused;
        if paused {
            self.state.printing = true;
        }
    }

    pub fn set_print_duration(&mut self, seconds: f64) {
        self.state.print_duration = seconds.max(0.0);
    }

    pub fn set_progress(&mut self, fraction: f64) {
        self.state.progress = fraction.clamp(0.0, 1.0);
    }

    pub fn set_vsd_progress(&mut self, fraction: f64) {
        self.state.vsd_progress = fraction.clamp(0.0, 1.0);
    }

    pub fn set_height(&mut self, mm: f64) {
        self.state.height = mm.max(0.0);
    }

    pub fn set_filament_used(&mut self, mm: f64) {
        self.state.filament_used = mm.max(0.0);
    }

    /// Set the active file.
    ///
    /// Returns `true` when the file changed to a new non-empty name, meaning
    /// its metadata should be fetched and handed to [`Self::apply_file_metadata`].
    pub fn set_active_file(&mut self, name: &str) -> bool {
        if name == self.state.filename {
            return false;
        }

        self.reset_file_info();
        if name.is_empty() {
            return false;
        }

        self.state.filename = name.to_string();
        self.state.job_started_at = Local::now();
        true
    }

    /// Apply fetched metadata for `filename`.
    ///
    /// Results for a file that is no longer active are rejected, and a
    /// failed fetch leaves the estimates at zero.
    pub fn apply_file_metadata(
        &mut self,
        filename: &str,
        metadata: Result<FileMetadata, ApiError>,
    ) -> Result<(), StateError> {
        if filename != self.state.filename {
            return Err(StateError::StaleMetadata {
                requested: filename.to_string(),
                active: self.state.filename.clone(),
            });
        }

        let metadata = metadata.map_err(|source| StateError::Metadata {
            filename: filename.to_string(),
            source,
        })?;

        self.state.estimated_time = metadata.estimated_time.unwrap_or(0.0).max(0.0);
        self.state.start_time_epoch = metadata.print_start_time.unwrap_or(0.0);
        self.state.filament_total = metadata.filament_total.unwrap_or(0.0);
        self.state.filament_weight = metadata.filament_weight_total.unwrap_or(0.0);
        debug!(
            "Metadata for {}: estimated {}s, filament {}mm",
            filename, self.state.estimated_time, self.state.filament_total
        );
        Ok(())
    }

    /// Merge every sensor object found in a status payload
    pub fn apply_sensors(&mut self, status: &Map<String, Value>) {
        for (object, fields) in status {
            let (Some(name), Some(fields)) = (sensor_name(object), fields.as_object()) else {
                continue;
            };
            self.state
                .sensors
                .entry(name.to_string())
                .or_default()
                .merge(fields);
        }
    }

    pub fn set_power_device(&mut self, name: &str, status: &str) {
        self.state
            .power_devices
            .insert(name.to_string(), status.to_string());
    }

    pub fn reset_file_info(&mut self) {
        let state = &mut self.state;
        state.print_duration = 0.0;
        state.progress = 0.0;
        state.vsd_progress = 0.0;
        state.height = 0.0;
        state.filename.clear();
        state.estimated_time = 0.0;
        state.start_time_epoch = 0.0;
        state.filament_used = 0.0;
        state.filament_total = 0.0;
        state.filament_weight = 0.0;
    }
}
