use std::time::Duration;

use reqwest::{Client, Url};
use serde::Deserialize;

use crate::prelude::*;

/// Latest measurement of a HomeWizard-compatible meter.
///
/// API docs: <https://api-documentation.homewizard.com/docs/v1/measurement>.
#[must_use]
#[derive(Deserialize)]
pub struct MeterSample {
    /// Net power at the grid connection: import is positive, export negative.
    #[serde(rename = "active_power_w")]
    pub active_power: f64,

    /// Local production, reported by firmwares with a PV channel attached.
    #[serde(default, rename = "active_power_pv_w")]
    pub produced_power: Option<f64>,
}

impl MeterSample {
    /// Power obtained from the provider; export clamps to zero.
    #[must_use]
    pub fn obtained(&self) -> f64 {
        self.active_power.max(0.0)
    }
}

pub struct Meter {
    client: Client,
    url: Url,
}

impl Meter {
    /// # Errors
    ///
    /// Fails when the client cannot be built.
    pub fn try_new(url: Url) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self { client, url })
    }

    /// Fetch the latest measurement.
    ///
    /// # Errors
    ///
    /// Fails when the meter is unreachable or responds with garbage.
    pub async fn fetch(&self) -> Result<MeterSample> {
        self.client
            .get(self.url.clone())
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("failed to deserialize the measurement")
    }
}
