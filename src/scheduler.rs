use std::sync::Mutex;

use chrono::{DateTime, TimeDelta, Utc};

use crate::{
    config::{PlugConfig, SchedulerConfig},
    controller::{LoadController, LoadState},
    credit::DecayingCredit,
    device::PlugDevice,
    prelude::*,
    window::{OrderingError, RollingWindow, Sample},
};

struct Inner {
    /// Provider-draw history, used for the base load estimate and the no-producer fallback.
    window: RollingWindow,
    latest_produced: Option<f64>,
    break_even: f64,
    base_load: f64,
    /// Armed after every turn-off, decays once per ingestion.
    margin: f64,
}

/// Multi-load surplus scheduler.
///
/// Ingests smart-meter samples, tracks the break-even threshold and hands the
/// surplus budget to the loads in fixed priority order. Insertion order is
/// priority order: the first registered load gets the first claim.
pub struct SurplusScheduler {
    config: SchedulerConfig,
    controllers: Vec<LoadController>,
    credit: DecayingCredit,
    state: Mutex<Inner>,
}

impl SurplusScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let inner = Inner {
            window: RollingWindow::new(TimeDelta::minutes(i64::from(config.eval_window_minutes))),
            latest_produced: None,
            break_even: 0.0,
            base_load: config.default_base_load_watt,
            margin: 0.0,
        };
        Self {
            config,
            controllers: Vec::new(),
            credit: DecayingCredit::default(),
            state: Mutex::new(inner),
        }
    }

    /// Register a load at the end of the priority order.
    pub fn push_load(&mut self, config: PlugConfig, device: Box<dyn PlugDevice>) {
        self.controllers.push(LoadController::new(config, device));
    }

    /// Load identities in priority order.
    #[must_use]
    pub fn list_loads(&self) -> Vec<&str> {
        self.controllers.iter().map(LoadController::id).collect()
    }

    /// # Errors
    ///
    /// Fails for an unknown load identity.
    pub fn load_state(&self, id: &str) -> Result<LoadState> {
        Ok(self.find(id)?.state())
    }

    /// # Errors
    ///
    /// Fails for an unknown load identity.
    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result {
        self.find(id)?.set_enabled(enabled);
        Ok(())
    }

    /// Manual override, bypassing the decision pass.
    ///
    /// # Errors
    ///
    /// Unlike the autonomous pass, device failures surface to the caller here.
    pub async fn set_on(&self, id: &str, on: bool) -> Result<bool> {
        self.find(id)?.set_on(on).await
    }

    /// Current idle-draw estimate.
    #[must_use]
    pub fn base_load(&self) -> f64 {
        self.lock_state().base_load
    }

    /// Ingest one smart-meter sample and run the decision pass.
    ///
    /// With a production reading present, the break-even threshold is the
    /// midpoint of the two most recent production values; without one, the
    /// threshold degenerates to "provider draw below the base load". The
    /// resulting surplus budget – lessened by the savings still credited to
    /// recently turned-off loads and by the re-entry margin – is then handed
    /// out to the loads in priority order.
    ///
    /// # Errors
    ///
    /// Fails with [`OrderingError`] when the timestamp does not advance the
    /// scheduler's window; the sample should be dropped as stale. Device
    /// trouble never surfaces here – an unreachable load is skipped and the
    /// pass moves on.
    pub async fn ingest(
        &self,
        obtained_watt: f64,
        produced_watt: Option<f64>,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<(), OrderingError> {
        let now = timestamp.unwrap_or_else(Utc::now);

        let budget = {
            let mut inner = self.lock_state();
            inner.window.add(Sample::new(obtained_watt, now))?;
            let surplus = if let Some(produced) = produced_watt {
                let break_even = match inner.latest_produced {
                    Some(previous) => f64::midpoint(previous, produced),
                    None => produced,
                };
                inner.latest_produced = Some(produced);
                inner.break_even = break_even;
                break_even - inner.base_load
            } else {
                inner.break_even = inner.base_load;
                inner.base_load - obtained_watt
            };
            let budget = surplus - self.credit.value(now) - inner.margin;
            inner.margin = (inner.margin - self.config.margin_decay_watt).max(0.0);
            debug!(
                obtained_watt,
                produced_watt,
                break_even = inner.break_even,
                surplus,
                budget,
                "ingested a meter sample",
            );
            budget
        };

        // Device polls happen with no shared window lock held.
        for controller in &self.controllers {
            controller.refresh().await;
            if let Err(error) = controller.record(Sample::new(obtained_watt, now)) {
                warn!(id = controller.id(), %error, "discarding the sample for this load");
            }
        }

        let mut remaining = budget;
        let mut any_turned_off = false;
        for controller in &self.controllers {
            let state = controller.state();
            if !state.enabled {
                continue;
            }
            if !state.online {
                debug!(id = controller.id(), "offline, skipping");
                continue;
            }
            let contribution = controller.contribution();
            let desired = remaining >= contribution;
            if desired {
                remaining -= contribution;
            }
            let changed = controller.apply(desired).await;
            if changed && !desired {
                self.credit.add(controller.id(), contribution, now, self.settle_time());
                // The freed-up draw is no fresh surplus for the rest of this pass.
                remaining -= contribution;
                any_turned_off = true;
            }
        }
        if any_turned_off {
            self.lock_state().margin = self.config.re_entry_margin_watt;
        }
        Ok(())
    }

    /// Re-estimate the idle base load from the recent provider-draw history,
    /// discounting the draw of the loads currently running.
    ///
    /// Meant to be driven by an external timer; skipping it only delays
    /// adaptation, it never corrupts anything.
    pub fn reset_base_load(&self) {
        let running_watt: f64 = self
            .controllers
            .iter()
            .map(|controller| {
                let state = controller.state();
                if state.online && state.is_on { state.watt } else { 0.0 }
            })
            .sum();
        let mut inner = self.lock_state();
        match inner.window.median() {
            Ok(median) => {
                inner.base_load = (median - running_watt).max(0.0);
                info!(base_load = inner.base_load, "base load re-estimated");
            }
            Err(error) => {
                debug!(%error, "not enough samples, keeping the current base load");
            }
        }
    }

    fn find(&self, id: &str) -> Result<&LoadController> {
        self.controllers
            .iter()
            .find(|controller| controller.id() == id)
            .with_context(|| format!("unknown load `{id}`"))
    }

    fn settle_time(&self) -> TimeDelta {
        TimeDelta::minutes(i64::from(self.config.settle_minutes))
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.state.lock().expect("the scheduler state lock must not be poisoned")
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex as StdMutex};

    use approx::assert_abs_diff_eq;

    use super::*;
    use crate::{
        config::DeviceConfig,
        device::testing::{MockPlug, MockState},
    };

    fn scheduler_config(settle_minutes: u32) -> SchedulerConfig {
        SchedulerConfig {
            eval_window_minutes: 10,
            default_base_load_watt: 200.0,
            settle_minutes,
            re_entry_margin_watt: 10.0,
            margin_decay_watt: 1.0,
        }
    }

    fn plug_config(id: &str, expected_watt: f64) -> PlugConfig {
        PlugConfig {
            id: id.to_owned(),
            expected_consumption_watt: expected_watt,
            consumer_efficiency: 0.5,
            eval_window_minutes: 10,
            enabled: true,
            device: DeviceConfig::Shelly { url: "http://127.0.0.1".to_owned() },
        }
    }

    struct Fixture {
        scheduler: SurplusScheduler,
        mocks: Vec<Arc<StdMutex<MockState>>>,
        start: DateTime<Utc>,
    }

    impl Fixture {
        /// Three loads in priority order A > B > C, claiming 100/50/25 W of surplus.
        fn three_loads(settle_minutes: u32) -> Self {
            let mut scheduler = SurplusScheduler::new(scheduler_config(settle_minutes));
            let mut mocks = Vec::new();
            for (id, watt) in [("a", 200.0), ("b", 100.0), ("c", 50.0)] {
                let (device, mock) = MockPlug::online(watt);
                scheduler.push_load(plug_config(id, watt), Box::new(device));
                mocks.push(mock);
            }
            Self { scheduler, mocks, start: Utc::now() }
        }

        async fn ingest(&self, minute: i64, obtained: f64, produced: Option<f64>) {
            self.scheduler
                .ingest(obtained, produced, Some(self.start + TimeDelta::minutes(minute)))
                .await
                .unwrap();
        }

        fn on_states(&self) -> Vec<bool> {
            self.mocks.iter().map(|mock| mock.lock().unwrap().is_on).collect()
        }
    }

    #[tokio::test]
    async fn loads_switch_in_priority_order() {
        let fixture = Fixture::three_loads(1);

        // Not enough production yet.
        fixture.ingest(0, 200.0, Some(0.0)).await;
        fixture.ingest(1, 100.0, Some(100.0)).await;
        fixture.ingest(2, 0.0, Some(250.0)).await;
        assert_eq!(fixture.on_states(), [false, false, false]);

        // Rising production: on strictly in priority order.
        fixture.ingest(3, 0.0, Some(370.0)).await;
        assert_eq!(fixture.on_states(), [true, false, false]);
        fixture.ingest(4, 0.0, Some(350.0)).await;
        assert_eq!(fixture.on_states(), [true, true, false]);
        fixture.ingest(5, 0.0, Some(410.0)).await;
        assert_eq!(fixture.on_states(), [true, true, true]);

        // Falling production: off in reverse order.
        fixture.ingest(6, 0.0, Some(330.0)).await;
        assert_eq!(fixture.on_states(), [true, true, false]);
        fixture.ingest(7, 0.0, Some(330.0)).await;
        assert_eq!(fixture.on_states(), [true, false, false]);
        fixture.ingest(8, 0.0, Some(250.0)).await;
        assert_eq!(fixture.on_states(), [false, false, false]);
    }

    #[tokio::test]
    async fn freed_watts_are_not_reclaimed_within_the_same_pass() {
        let mut scheduler = SurplusScheduler::new(scheduler_config(1));
        let mut mocks = Vec::new();
        for (id, watt) in [("a", 200.0), ("b", 100.0)] {
            let (device, mock) = MockPlug::online(watt);
            scheduler.push_load(plug_config(id, watt), Box::new(device));
            mocks.push(mock);
        }
        let start = Utc::now();
        let ingest = async |minute: i64, produced: f64| {
            scheduler
                .ingest(0.0, Some(produced), Some(start + TimeDelta::minutes(minute)))
                .await
                .unwrap();
        };

        ingest(0, 0.0).await;
        ingest(1, 320.0).await;
        ingest(2, 500.0).await;
        assert!(mocks[0].lock().unwrap().is_on);
        assert!(mocks[1].lock().unwrap().is_on);

        // The surplus drops to 80 W: A is shed, and its freed 100 W must not
        // bankroll B within the very same pass.
        ingest(3, 60.0).await;
        assert!(!mocks[0].lock().unwrap().is_on);
        assert!(!mocks[1].lock().unwrap().is_on);
        assert_eq!(mocks[0].lock().unwrap().switch_count, 2);
        assert_eq!(mocks[1].lock().unwrap().switch_count, 2);
    }

    #[tokio::test]
    async fn load_that_goes_offline_while_on_stays_on_through_deficit() {
        let fixture = Fixture::three_loads(1);

        fixture.ingest(0, 200.0, Some(0.0)).await;
        fixture.ingest(1, 0.0, Some(600.0)).await;
        assert_eq!(fixture.on_states(), [true, false, false]);

        // A drops off the network while running.
        fixture.mocks[0].lock().unwrap().online = false;

        // A deep deficit sheds the reachable loads, but never forces A off.
        fixture.ingest(2, 0.0, Some(700.0)).await;
        fixture.ingest(3, 400.0, Some(0.0)).await;
        fixture.ingest(4, 400.0, Some(0.0)).await;
        assert!(fixture.mocks[0].lock().unwrap().is_on);
        assert_eq!(fixture.mocks[0].lock().unwrap().switch_count, 1);
        assert!(!fixture.scheduler.load_state("a").unwrap().online);
        assert!(!fixture.mocks[1].lock().unwrap().is_on);
        assert!(!fixture.mocks[2].lock().unwrap().is_on);
    }

    #[tokio::test]
    async fn borderline_reading_does_not_toggle_twice_within_the_settle_window() {
        let mut scheduler = SurplusScheduler::new(scheduler_config(3));
        let (device, mock) = MockPlug::online(200.0);
        scheduler.push_load(plug_config("a", 200.0), Box::new(device));
        let start = Utc::now();
        let ingest = async |minute: i64, produced: f64| {
            scheduler
                .ingest(0.0, Some(produced), Some(start + TimeDelta::minutes(minute)))
                .await
                .unwrap();
        };

        ingest(0, 0.0).await;
        ingest(1, 320.0).await;
        assert!(!mock.lock().unwrap().is_on);
        ingest(2, 400.0).await;
        assert!(mock.lock().unwrap().is_on);
        ingest(3, 340.0).await;
        assert!(mock.lock().unwrap().is_on);

        // A borderline dip turns the load off…
        ingest(4, 250.0).await;
        assert!(!mock.lock().unwrap().is_on);

        // …and recovering readings within the settle window must not flip it back.
        ingest(5, 400.0).await;
        assert!(!mock.lock().unwrap().is_on);
        ingest(6, 380.0).await;
        assert!(!mock.lock().unwrap().is_on);

        // The credit has expired, the surplus is real: back on.
        ingest(7, 400.0).await;
        assert!(mock.lock().unwrap().is_on);
        assert_eq!(mock.lock().unwrap().switch_count, 3);
    }

    #[tokio::test]
    async fn offline_load_is_skipped_but_never_blocks_the_others() {
        let fixture = Fixture::three_loads(1);
        fixture.mocks[0].lock().unwrap().online = false;

        fixture.ingest(0, 200.0, Some(0.0)).await;
        fixture.ingest(1, 0.0, Some(200.0)).await;
        // 70 W of surplus: the offline A neither claims its 100 W nor blocks B.
        fixture.ingest(2, 0.0, Some(340.0)).await;
        assert_eq!(fixture.on_states(), [false, true, false]);
        fixture.ingest(3, 0.0, Some(360.0)).await;
        assert_eq!(fixture.on_states(), [false, true, true]);
        assert_eq!(fixture.mocks[0].lock().unwrap().switch_count, 0);
        assert!(!fixture.scheduler.load_state("a").unwrap().online);
    }

    #[tokio::test]
    async fn disabled_load_is_left_alone() {
        let fixture = Fixture::three_loads(1);
        fixture.scheduler.set_enabled("a", false).unwrap();

        fixture.ingest(0, 0.0, Some(0.0)).await;
        fixture.ingest(1, 0.0, Some(400.0)).await;
        fixture.ingest(2, 0.0, Some(500.0)).await;
        // B and C claim the surplus, the disabled A stays off.
        assert_eq!(fixture.on_states(), [false, true, true]);
    }

    #[tokio::test]
    async fn without_production_the_base_load_acts_as_the_threshold() {
        let mut scheduler = SurplusScheduler::new(scheduler_config(3));
        let (device, mock) = MockPlug::online(200.0);
        scheduler.push_load(plug_config("a", 200.0), Box::new(device));
        let start = Utc::now();

        // Obtained well below the 200 W base load: implicit surplus.
        scheduler.ingest(50.0, None, Some(start)).await.unwrap();
        assert!(mock.lock().unwrap().is_on);

        // Draw above the base load: the surplus is gone.
        scheduler.ingest(150.0, None, Some(start + TimeDelta::minutes(1))).await.unwrap();
        assert!(!mock.lock().unwrap().is_on);

        // The freed-up 100 W stay credited, so the lower draw is no licence to re-enable.
        scheduler.ingest(40.0, None, Some(start + TimeDelta::minutes(2))).await.unwrap();
        assert!(!mock.lock().unwrap().is_on);
    }

    #[tokio::test]
    async fn manual_override_bypasses_the_decision_pass() {
        let fixture = Fixture::three_loads(1);
        assert!(fixture.scheduler.set_on("c", true).await.unwrap());
        assert!(fixture.mocks[2].lock().unwrap().is_on);
        // Repeating the override is a no-op.
        assert!(!fixture.scheduler.set_on("c", true).await.unwrap());
        fixture.scheduler.set_on("nope", true).await.unwrap_err();
    }

    #[tokio::test]
    async fn base_load_reset_follows_the_median_draw() {
        let fixture = Fixture::three_loads(1);

        // Too early: the estimate stays at the configured default.
        fixture.scheduler.reset_base_load();
        assert_abs_diff_eq!(fixture.scheduler.base_load(), 200.0);

        fixture.ingest(0, 310.0, None).await;
        fixture.ingest(1, 290.0, None).await;
        fixture.ingest(2, 300.0, None).await;
        fixture.scheduler.reset_base_load();
        assert_abs_diff_eq!(fixture.scheduler.base_load(), 300.0);
    }

    #[tokio::test]
    async fn stale_meter_sample_is_rejected() {
        let fixture = Fixture::three_loads(1);
        fixture.ingest(1, 100.0, None).await;
        fixture
            .scheduler
            .ingest(100.0, None, Some(fixture.start))
            .await
            .unwrap_err();
    }

    #[test]
    fn loads_are_listed_in_priority_order() {
        let fixture = Fixture::three_loads(1);
        assert_eq!(fixture.scheduler.list_loads(), ["a", "b", "c"]);
    }
}
