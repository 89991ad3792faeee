use clap::Parser;
use lunchbox::env::{Env, setup_tracing};
use lunchbox::launch;
use lunchbox::telemetry::setup_telemetry;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv_override().ok();
    let env = Env::try_parse()?;

    let telemetry_guard = match env.telemetry_config() {
        Some(config) => Some(setup_telemetry(config, &env.log_level)?),
        None => {
            setup_tracing(&env.log_level);
            None
        }
    };

    info!(
        address = %env.bind_address,
        port = env.port,
        telemetry = telemetry_guard.is_some(),
        "Starting lunchbox server"
    );

    launch(env).await
}
