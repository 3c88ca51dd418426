use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error};

use super::api::MoonrakerApi;

/// A Moonraker power device with its last known state
pub struct PowerDevice {
    name: String,
    on: AtomicBool,
    // Serializes switch requests so concurrent callers see a consistent state
    switching: Mutex<()>,
    api: Arc<dyn MoonrakerApi>,
}

impl std::fmt::Debug for PowerDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PowerDevice")
            .field("name", &self.name)
            .field("on", &self.is_on())
            .finish()
    }
}

impl PowerDevice {
    pub fn new(name: impl Into<String>, api: Arc<dyn MoonrakerApi>) -> Self {
        Self {
            name: name.into(),
            on: AtomicBool::new(false),
            switching: Mutex::new(()),
            api,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_on(&self) -> bool {
        self.on.load(Ordering::Acquire)
    }

    /// Record a state reported by the printer host
    pub fn set_state(&self, on: bool) {
        self.on.store(on, Ordering::Release);
    }

    /// Record a state string (`"on"`, `"off"`, `"error"`, ...) reported by the printer host
    pub fn set_state_str(&self, state: &str) {
        self.set_state(state == "on");
    }

    /// Switch the device and return the state it ended up in.
    ///
    /// Failures are logged and leave the last known state untouched.
    pub async fn switch(&self, on: bool) -> bool {
        let _switching = self.switching.lock().await;
        if self.is_on() == on {
            return on;
        }

        match self.api.set_device_power(&self.name, on).await {
            Ok(state) => {
                debug!("Power device {} is now {}", self.name, if state { "on" } else { "off" });
                self.set_state(state);
                state
            }
            Err(e) => {
                error!("Failed to switch power device {}: {}", self.name, e);
                self.is_on()
            }
        }
    }

    pub async fn toggle(&self) -> bool {
        let target = !self.is_on();
        self.switch(target).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingApi;

    #[tokio::test]
    async fn test_switch_updates_state() {
        let api = Arc::new(RecordingApi::default());
        let device = PowerDevice::new("light", api.clone());

        assert!(device.switch(true).await);
        assert!(device.is_on());
        // Already on: no second request
        assert!(device.switch(true).await);
        assert_eq!(api.on_calls(), 1);

        assert!(!device.toggle().await);
        assert_eq!(api.off_calls(), 1);
    }

    #[tokio::test]
    async fn test_failed_switch_keeps_state() {
        let api = Arc::new(RecordingApi::default());
        api.fail_power.store(true, Ordering::SeqCst);
        let device = PowerDevice::new("light", api.clone());

        assert!(!device.switch(true).await);
        assert!(!device.is_on());
    }

    #[test]
    fn test_state_strings() {
        let device = PowerDevice::new("psu", Arc::new(RecordingApi::default()));
        device.set_state_str("on");
        assert!(device.is_on());
        device.set_state_str("error");
        assert!(!device.is_on());
    }
}
