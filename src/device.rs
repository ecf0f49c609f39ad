pub mod shelly;

use async_trait::async_trait;

use crate::prelude::*;

/// Snapshot returned by a successful device poll.
#[must_use]
#[derive(Copy, Clone, Debug, Default)]
pub struct PlugReading {
    pub is_on: bool,

    /// Instantaneous draw through the plug.
    pub watt: f64,
}

/// Capability surface of one controllable plug family.
///
/// Any failure means "device unreachable": the caller marks the load offline,
/// calls [`PlugDevice::reset`] and retries on the next cycle. Nothing here is
/// allowed to take the whole decision pass down.
#[async_trait]
pub trait PlugDevice: Send + Sync {
    /// Poll the device for its current state.
    async fn poll(&mut self) -> Result<PlugReading>;

    /// Switch the relay on.
    async fn turn_on(&mut self) -> Result;

    /// Switch the relay off.
    async fn turn_off(&mut self) -> Result;

    /// Drop any cached connection so that the next poll reconnects.
    fn reset(&mut self);
}
