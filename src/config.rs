use std::{fmt::Debug, fs, path::Path};

use itertools::Itertools;
use reqwest::Url;
use serde::Deserialize;

use crate::{
    device::{PlugDevice, shelly::ShellyPlug},
    prelude::*,
};

#[must_use]
#[derive(Debug, Deserialize)]
pub struct Config {
    pub scheduler: SchedulerConfig,

    pub meter: MeterConfig,

    #[serde(default, rename = "plug")]
    pub plugs: Vec<PlugConfig>,
}

impl Config {
    /// Read and validate the configuration.
    ///
    /// Validation failures are fatal here, at startup – never at decision time.
    #[instrument(name = "Reading the configuration…")]
    pub fn read_from<P: AsRef<Path> + Debug>(path: P) -> Result<Self> {
        let config: Self = toml::from_slice(&fs::read(path)?)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result {
        self.scheduler.validate()?;
        self.meter.validate()?;
        ensure!(
            self.plugs.iter().map(|plug| &plug.id).all_unique(),
            "plug identifiers must be unique",
        );
        for plug in &self.plugs {
            plug.validate().with_context(|| format!("invalid plug `{}`", plug.id))?;
        }
        Ok(())
    }
}

#[must_use]
#[derive(Clone, Debug, Deserialize)]
pub struct SchedulerConfig {
    /// Span of the scheduler's own provider-draw window.
    #[serde(default = "default_eval_window_minutes")]
    pub eval_window_minutes: u32,

    /// Idle draw of the site used until the first base load reset,
    /// and the implicit break-even when the meter reports no production.
    #[serde(default = "default_base_load_watt")]
    pub default_base_load_watt: f64,

    /// How long a turned-off load's contribution keeps counting as committed.
    #[serde(default = "default_settle_minutes")]
    pub settle_minutes: u32,

    /// Margin armed after every turn-off, withheld from the surplus budget.
    #[serde(default = "default_re_entry_margin_watt")]
    pub re_entry_margin_watt: f64,

    /// Per-ingestion decay of the re-entry margin.
    #[serde(default = "default_margin_decay_watt")]
    pub margin_decay_watt: f64,
}

impl SchedulerConfig {
    fn validate(&self) -> Result {
        ensure!(self.eval_window_minutes > 0, "the evaluation window must not be empty");
        ensure!(self.default_base_load_watt >= 0.0, "the default base load must not be negative");
        ensure!(self.settle_minutes > 0, "the settle time must not be empty");
        ensure!(self.re_entry_margin_watt >= 0.0, "the re-entry margin must not be negative");
        ensure!(self.margin_decay_watt > 0.0, "the margin decay must be positive");
        Ok(())
    }
}

#[must_use]
#[derive(Clone, Debug, Deserialize)]
pub struct MeterConfig {
    /// Measurement endpoint of a HomeWizard-compatible meter.
    pub url: String,

    #[serde(default = "default_poll_seconds")]
    pub poll_seconds: u64,

    #[serde(default = "default_base_load_reset_minutes")]
    pub base_load_reset_minutes: u64,
}

impl MeterConfig {
    fn validate(&self) -> Result {
        Url::parse(&self.url).context("invalid meter URL")?;
        ensure!(self.poll_seconds > 0, "the meter poll period must be positive");
        ensure!(self.base_load_reset_minutes > 0, "the base load reset period must be positive");
        Ok(())
    }
}

#[must_use]
#[derive(Clone, Debug, Deserialize)]
pub struct PlugConfig {
    pub id: String,

    /// Draw of the consumer(s) behind the plug while running.
    pub expected_consumption_watt: f64,

    /// 0 means "only switch on with no power obtained at all",
    /// 1 would mean "switch on as soon as the expected draw is covered".
    pub consumer_efficiency: f64,

    #[serde(default = "default_eval_window_minutes")]
    pub eval_window_minutes: u32,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    pub device: DeviceConfig,
}

impl PlugConfig {
    fn validate(&self) -> Result {
        ensure!(!self.id.is_empty(), "the identifier must not be empty");
        ensure!(self.expected_consumption_watt >= 1.0, "the expected consumption must be at least 1 W");
        ensure!(
            self.consumer_efficiency > 0.0 && self.consumer_efficiency < 1.0,
            "the consumer efficiency must lie strictly between 0 and 1",
        );
        ensure!(self.eval_window_minutes > 0, "the evaluation window must not be empty");
        self.device.validate()
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceConfig {
    Shelly { url: String },
}

impl DeviceConfig {
    fn validate(&self) -> Result {
        match self {
            Self::Shelly { url } => {
                Url::parse(url).context("invalid device URL")?;
            }
        }
        Ok(())
    }

    /// Build the device handle for this plug family.
    pub fn build(&self) -> Result<Box<dyn PlugDevice>> {
        match self {
            Self::Shelly { url } => Ok(Box::new(ShellyPlug::new(Url::parse(url)?))),
        }
    }
}

const fn default_eval_window_minutes() -> u32 {
    10
}

const fn default_base_load_watt() -> f64 {
    200.0
}

const fn default_settle_minutes() -> u32 {
    3
}

const fn default_re_entry_margin_watt() -> f64 {
    10.0
}

const fn default_margin_decay_watt() -> f64 {
    1.0
}

const fn default_poll_seconds() -> u64 {
    60
}

const fn default_base_load_reset_minutes() -> u64 {
    30
}

const fn default_enabled() -> bool {
    true
}
