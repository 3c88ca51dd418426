//! Moonraker event stream
//!
//! [`client::EventStreamClient`] owns the websocket and reconnects forever.
//! Every inbound frame, timer tick and finished metadata fetch is funnelled
//! into one task and handled serially by [`handler::EventHandler`].

pub mod client;
pub mod gcode;
pub mod handler;
pub mod rpc;

pub use client::EventStreamClient;
pub use handler::EventHandler;
pub use rpc::Request;

use tokio::sync::mpsc;

use crate::printer::{ApiError, FileMetadata};

/// Connection lifecycle as seen by the handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    /// Socket open, waiting for Klippy to report ready
    Connecting,
    /// Klippy ready and status objects subscribed
    Subscribed,
}

/// Result of a background metadata fetch
#[derive(Debug)]
pub struct MetadataUpdate {
    pub filename: String,
    pub result: Result<FileMetadata, ApiError>,
}

/// Commands accepted by the client task
#[derive(Debug, Clone)]
pub enum ClientCommand {
    /// Send a request over the socket
    Request(Request),
    /// Close the socket and stop the client
    Shutdown,
}

/// Cloneable handle for driving the printer through the client task
#[derive(Debug, Clone)]
pub struct ClientHandle {
    tx: mpsc::Sender<ClientCommand>,
}

impl ClientHandle {
    pub fn new(tx: mpsc::Sender<ClientCommand>) -> Self {
        Self { tx }
    }

    async fn request(&self, request: Request) -> bool {
        self.tx.send(ClientCommand::Request(request)).await.is_ok()
    }

    pub async fn pause(&self) -> bool {
        self.request(Request::Pause).await
    }

    pub async fn resume(&self) -> bool {
        self.request(Request::Resume).await
    }

    pub async fn cancel(&self) -> bool {
        self.request(Request::Cancel).await
    }

    pub async fn emergency_stop(&self) -> bool {
        self.request(Request::EmergencyStop).await
    }

    pub async fn firmware_restart(&self) -> bool {
        self.request(Request::FirmwareRestart).await
    }

    pub async fn run_gcode(&self, script: impl Into<String>) -> bool {
        self.request(Request::GcodeScript(script.into())).await
    }

    pub async fn shutdown_host(&self) -> bool {
        self.request(Request::MachineShutdown).await
    }

    pub async fn reboot_host(&self) -> bool {
        self.request(Request::MachineReboot).await
    }

    pub async fn restart_service(&self, service: impl Into<String>) -> bool {
        self.request(Request::RestartService(service.into())).await
    }

    /// Stop the client; pending work in spawned jobs is not awaited
    pub async fn shutdown(&self) -> bool {
        self.tx.send(ClientCommand::Shutdown).await.is_ok()
    }

    /// For signal handlers running outside the runtime
    pub fn blocking_shutdown(&self) -> bool {
        self.tx.blocking_send(ClientCommand::Shutdown).is_ok()
    }
}

/// Channel pair for a [`ClientHandle`]
pub fn create_client_channels() -> (ClientHandle, mpsc::Receiver<ClientCommand>) {
    let (tx, rx) = mpsc::channel(32);
    (ClientHandle::new(tx), rx)
}
