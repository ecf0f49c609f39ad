use std::sync::Mutex;

use chrono::{DateTime, TimeDelta, Utc};

use crate::{
    config::PlugConfig,
    device::{PlugDevice, PlugReading},
    prelude::*,
    window::{OrderingError, RollingWindow, Sample},
};

/// Switch state as either proposed by the policy or reported by the device.
#[derive(Copy, Clone, Debug, Eq, PartialEq, derive_more::Display)]
pub enum SwitchState {
    On,
    Off,
}

impl From<bool> for SwitchState {
    fn from(on: bool) -> Self {
        if on { Self::On } else { Self::Off }
    }
}

/// Queryable snapshot of one load.
///
/// `proposed` is the state the policy last asked for; a persistent gap between
/// it and `is_on` points at a stuck or unreachable plug.
#[must_use]
#[derive(Copy, Clone, Debug)]
pub struct LoadState {
    pub enabled: bool,
    pub online: bool,
    pub is_on: bool,
    pub watt: f64,
    pub proposed: SwitchState,
}

struct Inner {
    window: RollingWindow,
    enabled: bool,
    online: bool,
    is_on: bool,
    watt: f64,
    proposed: SwitchState,
}

/// Per-load wrapper around a device capability.
///
/// Holds the load's own rolling window of provider-draw samples and its own
/// hysteresis decision. Device I/O happens under the device lock only – the
/// state lock is never held across an await point.
pub struct LoadController {
    config: PlugConfig,
    state: Mutex<Inner>,
    device: tokio::sync::Mutex<Box<dyn PlugDevice>>,
}

impl LoadController {
    pub fn new(config: PlugConfig, device: Box<dyn PlugDevice>) -> Self {
        let window = RollingWindow::new(TimeDelta::minutes(i64::from(config.eval_window_minutes)));
        let state = Mutex::new(Inner {
            window,
            enabled: config.enabled,
            online: false,
            is_on: false,
            watt: 0.0,
            proposed: SwitchState::Off,
        });
        Self { config, state, device: tokio::sync::Mutex::new(device) }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.config.id
    }

    /// Provider draw the load is expected to offset while running.
    #[must_use]
    pub fn contribution(&self) -> f64 {
        self.config.expected_consumption_watt * self.config.consumer_efficiency
    }

    pub fn state(&self) -> LoadState {
        let inner = self.lock_state();
        LoadState {
            enabled: inner.enabled,
            online: inner.online,
            is_on: inner.is_on,
            watt: inner.watt,
            proposed: inner.proposed,
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.lock_state().enabled = enabled;
        info!(id = self.id(), enabled, "load toggled");
    }

    /// Append a provider-draw sample to the load's own window.
    ///
    /// # Errors
    ///
    /// Propagates [`OrderingError`] for a stale timestamp, leaving the window unchanged.
    pub fn record(&self, sample: Sample) -> Result<(), OrderingError> {
        self.lock_state().window.add(sample)
    }

    /// Poll the device and refresh the cached snapshot.
    ///
    /// A failure marks the load offline and drops the cached connection, so the
    /// next poll starts from scratch. It never escapes this call.
    pub async fn refresh(&self) {
        let mut device = self.device.lock().await;
        match device.poll().await {
            Ok(reading) => self.note_reading(reading),
            Err(error) => {
                warn!(id = self.id(), %error, "poll failed, resetting the device handle");
                device.reset();
                self.note_offline();
            }
        }
    }

    /// Drive the device into the desired state, refreshing first.
    ///
    /// No-op when the device already is in the desired state.
    ///
    /// # Errors
    ///
    /// Surfaces device failures to the caller; the load is marked offline and
    /// the connection dropped before returning.
    pub async fn set_on(&self, desired: bool) -> Result<bool> {
        let mut device = self.device.lock().await;
        let reading = match device.poll().await {
            Ok(reading) => reading,
            Err(error) => {
                device.reset();
                self.note_offline();
                return Err(error.context(format!("failed to poll `{}`", self.id())));
            }
        };
        self.note_reading(reading);
        self.lock_state().proposed = SwitchState::from(desired);
        if reading.is_on == desired {
            return Ok(false);
        }
        let switched =
            if desired { device.turn_on().await } else { device.turn_off().await };
        if let Err(error) = switched {
            device.reset();
            self.note_offline();
            return Err(error.context(format!("failed to switch `{}`", self.id())));
        }
        self.lock_state().is_on = desired;
        info!(id = self.id(), state = %SwitchState::from(desired), "switched");
        Ok(true)
    }

    /// [`Self::set_on`] with the device failure absorbed, for the autonomous pass.
    ///
    /// Returns whether the device actually flipped.
    pub async fn apply(&self, desired: bool) -> bool {
        match self.set_on(desired).await {
            Ok(changed) => changed,
            Err(error) => {
                warn!(id = self.id(), %error, "leaving the load untouched");
                false
            }
        }
    }

    /// Single-load decision path: ingest one provider-draw reading and react to it.
    ///
    /// With the load on, the draw must mostly stay below its own break-even
    /// (`expected consumption × efficiency`) to keep it on; with the load off,
    /// the draw must mostly sit at zero before it is worth switching on.
    ///
    /// # Errors
    ///
    /// Propagates [`OrderingError`] for a stale timestamp; everything else is absorbed.
    pub async fn report_provider_draw(
        &self,
        value: f64,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<(), OrderingError> {
        let at = timestamp.unwrap_or_else(Utc::now);
        self.record(Sample::new(value, at))?;
        self.refresh().await;

        let desired = {
            let inner = self.lock_state();
            if !inner.online {
                debug!(id = self.id(), "offline, skipping the decision");
                None
            } else {
                let threshold = if inner.is_on { self.contribution() } else { 1.0 };
                match inner.window.ratio(threshold) {
                    Ok(ratio) => Some(ratio.below_ratio > 0.5),
                    Err(error) => {
                        debug!(id = self.id(), %error, "skipping the decision");
                        None
                    }
                }
            }
        };
        if let Some(desired) = desired {
            self.apply(desired).await;
        }
        Ok(())
    }

    fn note_reading(&self, reading: PlugReading) {
        let mut inner = self.lock_state();
        inner.online = true;
        inner.is_on = reading.is_on;
        inner.watt = reading.watt;
    }

    /// The last known switch state is preserved, only the flag drops.
    fn note_offline(&self) {
        self.lock_state().online = false;
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.state.lock().expect("the load state lock must not be poisoned")
    }
}
