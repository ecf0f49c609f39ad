use std::{sync::Arc, time::Duration};

use clap::Parser;
use reqwest::Url;
use sparewatt::{
    cli::{Args, Command},
    config::Config,
    meter::Meter,
    prelude::*,
    scheduler::SurplusScheduler,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = Config::read_from(&args.config_path)?;
    match args.command {
        Command::CheckConfig => {
            for plug in &config.plugs {
                info!(
                    id = %plug.id,
                    expected_consumption_watt = plug.expected_consumption_watt,
                    consumer_efficiency = plug.consumer_efficiency,
                    enabled = plug.enabled,
                    "configured plug",
                );
            }
            Ok(())
        }
        Command::Run => run(config).await,
    }
}

async fn run(config: Config) -> Result {
    let meter = Meter::try_new(Url::parse(&config.meter.url)?)?;
    let mut scheduler = SurplusScheduler::new(config.scheduler.clone());
    for plug in &config.plugs {
        scheduler.push_load(plug.clone(), plug.device.build()?);
    }
    let scheduler = Arc::new(scheduler);
    info!(n_loads = config.plugs.len(), "starting");

    {
        let scheduler = Arc::clone(&scheduler);
        let period = Duration::from_secs(config.meter.base_load_reset_minutes * 60);
        tokio::spawn(async move {
            let mut ticks = tokio::time::interval(period);
            // The first tick fires immediately, before any samples arrived.
            ticks.tick().await;
            loop {
                ticks.tick().await;
                scheduler.reset_base_load();
            }
        });
    }

    let mut ticks = tokio::time::interval(Duration::from_secs(config.meter.poll_seconds));
    loop {
        ticks.tick().await;
        match meter.fetch().await {
            Ok(sample) => {
                if let Err(error) =
                    scheduler.ingest(sample.obtained(), sample.produced_power, None).await
                {
                    warn!(%error, "dropping a stale meter sample");
                }
            }
            Err(error) => warn!(%error, "failed to poll the meter"),
        }
    }
}
