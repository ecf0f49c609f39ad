use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Deserialize;

use crate::{
    device::{PlugDevice, PlugReading},
    prelude::*,
};

/// Shelly relay over its Gen1 HTTP API.
///
/// API docs: <https://shelly-api-docs.shelly.cloud/gen1/#shelly-plug-plugs>.
pub struct ShellyPlug {
    base_url: Url,
    client: Option<Client>,
}

impl ShellyPlug {
    pub const fn new(base_url: Url) -> Self {
        Self { base_url, client: None }
    }

    /// Client is built lazily so that a reset drops it and the next poll reconnects.
    fn client(&mut self) -> Result<&Client> {
        match &mut self.client {
            Some(client) => Ok(client),
            slot @ None => {
                Ok(slot.insert(Client::builder().timeout(Duration::from_secs(10)).build()?))
            }
        }
    }

    async fn switch(&mut self, turn: &'static str) -> Result {
        let url = self.base_url.join("relay/0")?;
        self.client()?
            .get(url)
            .query(&[("turn", turn)])
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[async_trait]
impl PlugDevice for ShellyPlug {
    async fn poll(&mut self) -> Result<PlugReading> {
        let url = self.base_url.join("status")?;
        let status: StatusResponse =
            self.client()?.get(url).send().await?.error_for_status()?.json().await?;
        let relay = status.relays.first().context("the device reported no relays")?;
        let watt = status.meters.first().map_or(0.0, |meter| meter.power);
        Ok(PlugReading { is_on: relay.ison, watt })
    }

    async fn turn_on(&mut self) -> Result {
        self.switch("on").await
    }

    async fn turn_off(&mut self) -> Result {
        self.switch("off").await
    }

    fn reset(&mut self) {
        self.client = None;
    }
}

#[derive(Deserialize)]
struct StatusResponse {
    relays: Vec<RelayStatus>,

    #[serde(default)]
    meters: Vec<MeterStatus>,
}

#[derive(Deserialize)]
struct RelayStatus {
    ison: bool,
}

#[derive(Deserialize)]
struct MeterStatus {
    power: f64,
}
