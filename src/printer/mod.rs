//! Printer-side model: tracked state, REST calls, power devices and status text

pub mod api;
pub mod power;
pub mod state;
pub mod status;

pub use api::{ApiError, FileMetadata, MoonrakerApi, MoonrakerClient};
pub use power::PowerDevice;
pub use state::{PrinterState, PrinterTracker, StateError, StateLabel};
pub use status::{StatusComposer, StatusNotes};
