//! Surplus-tracking smart-plug scheduler.
//!
//! Decides in real time which controllable loads should run so that locally
//! produced energy gets consumed rather than exported, and switches them off
//! again once the surplus is gone.

pub mod cli;
pub mod config;
pub mod controller;
pub mod credit;
pub mod device;
pub mod meter;
pub mod prelude;
pub mod scheduler;
pub mod window;
