//! klipper-watch
//!
//! Watches a Klipper printer through Moonraker's event stream, sends progress
//! notifications to Telegram and records timelapses of each print.

pub mod camera;
pub mod config;
pub mod logging;
pub mod notify;
pub mod params;
pub mod printer;
pub mod scheduler;
pub mod stream;
pub mod threshold;
pub mod timelapse;

#[cfg(test)]
pub(crate) mod testing;
