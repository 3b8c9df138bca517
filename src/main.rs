//! Cache the embedding, whisper and tiktoken models named in the environment

use anyhow::Result;
use fetch_models::config::Config;
use fetch_models::provision::Provisioner;
use fetch_models::telemetry;

fn main() -> Result<()> {
    // Fail on missing variables before anything touches the network
    let config = Config::from_env()?;

    telemetry::init(config.telemetry.log_file.as_deref())?;
    tracing::info!("fetch-models starting");

    let provisioner = Provisioner::from_config(&config)?;
    let report = provisioner.run(&mut std::io::stdout().lock())?;

    tracing::info!(stages = report.stages.len(), "all models cached");

    Ok(())
}
