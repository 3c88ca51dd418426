//! Shared capture light
//!
//! Every capture holds a [`LightGuard`] while it runs. The first capture that
//! finds the light off switches it on and owes an auto-off; the light goes off
//! again one settle delay after the last guard is released, unless another
//! capture has started in the meantime.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::config::LightConfig;
use crate::printer::PowerDevice;
use crate::scheduler::Scheduler;

#[derive(Debug, Default)]
struct LightLockState {
    reference_count: usize,
    light_forced_on: bool,
    light_auto_off_pending: bool,
}

struct LockInner {
    light: Option<Arc<PowerDevice>>,
    settle_delay: Duration,
    confirm_timeout: Duration,
    state: Mutex<LightLockState>,
    /// `true` whenever no capture is in the middle of switching the light on
    settled: watch::Sender<bool>,
    scheduler: Scheduler,
}

impl LockInner {
    fn state(&self) -> MutexGuard<'_, LightLockState> {
        // The state is plain counters; a poisoned lock still holds usable values
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn switch_off_if_idle(&self) {
        let Some(light) = &self.light else {
            return;
        };

        let should_switch = {
            let mut state = self.state();
            let idle = state.reference_count == 0
                && state.light_auto_off_pending
                && !state.light_forced_on;
            if idle {
                state.light_auto_off_pending = false;
            }
            idle
        };

        if should_switch {
            debug!("No captures left, switching light {} off", light.name());
            light.switch(false).await;
        } else {
            debug!("Light {} still in use, leaving it on", light.name());
        }
    }
}

/// Reference-counted light control for camera captures
#[derive(Clone)]
pub struct CaptureLock {
    inner: Arc<LockInner>,
}

impl CaptureLock {
    pub fn new(light: Option<Arc<PowerDevice>>, config: &LightConfig, scheduler: Scheduler) -> Self {
        let (settled, _) = watch::channel(true);
        Self {
            inner: Arc::new(LockInner {
                light,
                settle_delay: Duration::from_secs(config.settle_delay_secs),
                confirm_timeout: Duration::from_secs(config.confirm_timeout_secs),
                state: Mutex::new(LightLockState::default()),
                settled,
                scheduler,
            }),
        }
    }

    /// Take a reference on the light, switching it on if needed.
    ///
    /// Waiting for another capture to switch the light on is bounded; on
    /// timeout the capture proceeds in whatever light there is.
    pub async fn acquire(&self) -> LightGuard {
        let inner = &self.inner;
        let light = inner.light.as_ref().filter(|_| !inner.settle_delay.is_zero());

        let must_force = {
            let mut state = inner.state();
            state.reference_count += 1;
            match light {
                Some(light) if !light.is_on() && !state.light_forced_on => {
                    state.light_forced_on = true;
                    state.light_auto_off_pending = true;
                    inner.settled.send_replace(false);
                    true
                }
                _ => false,
            }
        };
        let guard = LightGuard {
            inner: self.inner.clone(),
        };

        let Some(light) = light else {
            return guard;
        };

        if must_force {
            if !light.switch(true).await {
                warn!("Light {} did not switch on, capturing anyway", light.name());
            }
            tokio::time::sleep(inner.settle_delay).await;
            inner.state().light_forced_on = false;
            inner.settled.send_replace(true);
        } else {
            let mut settled = inner.settled.subscribe();
            let wait = settled.wait_for(|settled| *settled);
            if tokio::time::timeout(inner.confirm_timeout, wait).await.is_err() {
                warn!(
                    "Timed out after {:?} waiting for light {}, capturing anyway",
                    inner.confirm_timeout,
                    light.name()
                );
            }
        }
        guard
    }

    /// Run `capture` while holding the light
    pub async fn with_light<F, T>(&self, capture: F) -> T
    where
        F: std::future::Future<Output = T>,
    {
        let _guard = self.acquire().await;
        capture.await
    }

    pub fn reference_count(&self) -> usize {
        self.inner.state().reference_count
    }
}

/// Releases the light reference on drop
pub struct LightGuard {
    inner: Arc<LockInner>,
}

impl Drop for LightGuard {
    fn drop(&mut self) {
        let schedule_off = {
            let mut state = self.inner.state();
            state.reference_count = state.reference_count.saturating_sub(1);
            state.reference_count == 0 && state.light_auto_off_pending
        };
        if !schedule_off {
            return;
        }

        let inner = self.inner.clone();
        self.inner
            .scheduler
            .spawn_after("light_off", self.inner.settle_delay, async move {
                inner.switch_off_if_idle().await;
                Ok(())
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingApi;

    fn lock_with_light(api: Arc<RecordingApi>, settle_secs: u64) -> (CaptureLock, Arc<PowerDevice>) {
        let light = Arc::new(PowerDevice::new("light", api));
        let config = LightConfig {
            settle_delay_secs: settle_secs,
            confirm_timeout_secs: 10,
        };
        (
            CaptureLock::new(Some(light.clone()), &config, Scheduler::new()),
            light,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_captures_switch_off_once_after_both() {
        let api = Arc::new(RecordingApi::default());
        let (lock, light) = lock_with_light(api.clone(), 1);

        let first = {
            let lock = lock.clone();
            tokio::spawn(async move {
                lock.with_light(tokio::time::sleep(Duration::from_secs(3))).await;
            })
        };
        let second = {
            let lock = lock.clone();
            tokio::spawn(async move {
                lock.with_light(tokio::time::sleep(Duration::from_secs(6))).await;
            })
        };

        first.await.unwrap();
        assert!(light.is_on());
        assert_eq!(api.off_calls(), 0);

        second.await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(api.on_calls(), 1);
        assert_eq!(api.off_calls(), 1);
        assert!(!light.is_on());
        assert_eq!(lock.reference_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_during_grace_period_keeps_light_on() {
        let api = Arc::new(RecordingApi::default());
        let (lock, light) = lock_with_light(api.clone(), 2);

        drop(lock.acquire().await);
        // Off is scheduled 2s out; a new capture starts before it fires
        tokio::time::sleep(Duration::from_secs(1)).await;
        let guard = lock.acquire().await;
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(light.is_on());
        assert_eq!(api.off_calls(), 0);

        drop(guard);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(api.off_calls(), 1);
        assert_eq!(api.on_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_light_already_on_is_left_alone() {
        let api = Arc::new(RecordingApi::default());
        let (lock, light) = lock_with_light(api.clone(), 1);
        light.set_state(true);

        drop(lock.acquire().await);
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert!(api.power_calls.lock().unwrap().is_empty());
        assert!(light.is_on());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_switch_on_does_not_block_capture() {
        let api = Arc::new(RecordingApi::default());
        api.fail_power
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let (lock, _light) = lock_with_light(api.clone(), 1);

        let taken = lock.with_light(async { "frame" }).await;
        assert_eq!(taken, "frame");
        assert_eq!(lock.reference_count(), 0);
    }

    #[tokio::test]
    async fn test_no_light_configured() {
        let lock = CaptureLock::new(None, &LightConfig::default(), Scheduler::new());
        let guard = lock.acquire().await;
        assert_eq!(lock.reference_count(), 1);
        drop(guard);
        assert_eq!(lock.reference_count(), 0);
    }
}
