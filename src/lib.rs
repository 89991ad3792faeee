use rocket::{Build, Config, Rocket};
use tokio::sync::watch;
use tracing::{error, info};

pub mod api;
pub mod cache;
pub mod cart;
pub mod cli;
pub mod context;
mod db_utils;
mod dietary;
pub mod env;
pub mod error;
pub mod kv;
pub mod menu;
pub mod notification;
pub mod order;
pub mod payment;
pub mod student;
pub mod sweeper;
pub mod telemetry;

#[cfg(test)]
pub mod test_utils;

use crate::context::AppContext;
use crate::env::Env;
use crate::sweeper::Sweeper;

pub fn build_rocket(ctx: AppContext, address: &str, port: u16) -> Rocket<Build> {
    let config = Config::figment()
        .merge(("port", port))
        .merge(("address", address));

    rocket::custom(config)
        .mount("/", api::routes())
        .register("/", api::catchers())
        .manage(ctx)
}

pub async fn launch(env: Env) -> anyhow::Result<()> {
    let pool = env.get_sqlite_pool().await?;

    sqlx::migrate!().run(&pool).await?;

    let ctx = AppContext::from_env(&env, pool).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = Sweeper::new(env.sweeper_config(), ctx.pool.clone(), ctx.store.clone());
    let sweeper_task = tokio::spawn(sweeper.run(shutdown_rx));

    let rocket = build_rocket(ctx, &env.bind_address, env.port);
    let server_task = tokio::spawn(rocket.launch());

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal, shutting down gracefully...");
        }

        result = server_task => {
            match result {
                Ok(Ok(_)) => info!("Server completed successfully"),
                Ok(Err(e)) => error!("Server failed: {e}"),
                Err(e) => error!("Server task panicked: {e}"),
            }
        }
    }

    if shutdown_tx.send(true).is_err() {
        info!("Sweeper already stopped");
    }
    if let Err(e) = sweeper_task.await {
        error!("Sweeper task panicked: {e}");
    }

    info!("Shutdown complete");
    Ok(())
}
