//! JSON-RPC 2.0 framing for the Moonraker websocket

use serde_json::{json, Map, Value};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("invalid JSON frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame is not an object")]
    NotAnObject,

    #[error("frame has neither an id nor a method")]
    Unroutable,
}

/// A decoded inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Reply to one of our requests
    Reply { id: Value, result: Value },
    /// Error reply, with or without an id
    ErrorReply { id: Option<Value>, message: String },
    /// Server-pushed notification
    Notification { method: String, params: Vec<Value> },
}

impl Inbound {
    pub fn parse(text: &str) -> Result<Self, RpcError> {
        let value: Value = serde_json::from_str(text)?;
        let Value::Object(mut frame) = value else {
            return Err(RpcError::NotAnObject);
        };

        if let Some(error) = frame.remove("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            return Ok(Self::ErrorReply {
                id: frame.remove("id"),
                message,
            });
        }

        if let Some(id) = frame.remove("id") {
            return Ok(Self::Reply {
                id,
                result: frame.remove("result").unwrap_or(Value::Null),
            });
        }

        let Some(Value::String(method)) = frame.remove("method") else {
            return Err(RpcError::Unroutable);
        };
        let params = match frame.remove("params") {
            Some(Value::Array(params)) => params,
            Some(other) => vec![other],
            None => Vec::new(),
        };
        Ok(Self::Notification { method, params })
    }
}

/// Outbound requests
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    PrinterInfo,
    Subscribe(Map<String, Value>),
    Pause,
    Resume,
    Cancel,
    EmergencyStop,
    FirmwareRestart,
    GcodeScript(String),
    DevicePowerDevices,
    MachineShutdown,
    MachineReboot,
    RestartService(String),
}

impl Request {
    pub fn method(&self) -> &'static str {
        match self {
            Self::PrinterInfo => "printer.info",
            Self::Subscribe(_) => "printer.objects.subscribe",
            Self::Pause => "printer.print.pause",
            Self::Resume => "printer.print.resume",
            Self::Cancel => "printer.print.cancel",
            Self::EmergencyStop => "printer.emergency_stop",
            Self::FirmwareRestart => "printer.firmware_restart",
            Self::GcodeScript(_) => "printer.gcode.script",
            Self::DevicePowerDevices => "machine.device_power.devices",
            Self::MachineShutdown => "machine.shutdown",
            Self::MachineReboot => "machine.reboot",
            Self::RestartService(_) => "machine.services.restart",
        }
    }

    pub fn params(&self) -> Option<Value> {
        match self {
            Self::Subscribe(objects) => Some(json!({ "objects": objects })),
            Self::GcodeScript(script) => Some(json!({ "script": script })),
            Self::RestartService(service) => Some(json!({ "service": service })),
            _ => None,
        }
    }

    pub fn to_frame(&self, id: u64) -> String {
        let mut frame = json!({
            "jsonrpc": "2.0",
            "method": self.method(),
            "id": id,
        });
        if let (Some(params), Some(object)) = (self.params(), frame.as_object_mut()) {
            object.insert("params".to_string(), params);
        }
        frame.to_string()
    }
}

/// Objects subscribed once Klippy reports ready
pub fn subscribe_objects(sensors: &[String]) -> Map<String, Value> {
    let mut objects = Map::new();
    objects.insert("print_stats".to_string(), Value::Null);
    objects.insert("display_status".to_string(), Value::Null);
    objects.insert("toolhead".to_string(), json!(["position"]));
    objects.insert("gcode_move".to_string(), json!(["position", "gcode_position"]));
    objects.insert("virtual_sdcard".to_string(), json!(["progress"]));
    for sensor in sensors {
        objects.insert(sensor.clone(), Value::Null);
    }
    objects
}
