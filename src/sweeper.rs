use chrono::Utc;
use rand::Rng;
use sqlx::SqlitePool;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Interval, interval};
use tracing::{debug, error, info};

use crate::error::PersistenceError;
use crate::kv::{DynStore, KvError};
use crate::payment::PaymentOrder;

#[derive(Debug, Clone)]
pub struct SweeperConfig {
    pub interval: Duration,
    pub max_jitter: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            max_jitter: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SweepError {
    #[error("Key-value purge failed: {0}")]
    Store(#[from] KvError),
    #[error("Payment expiry failed: {0}")]
    Persistence(#[from] PersistenceError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub purged_entries: u64,
    pub expired_payments: u64,
}

/// Background housekeeping: drops expired key-value entries (stale carts,
/// cache copies) and expires payment orders nobody completed.
pub struct Sweeper {
    config: SweeperConfig,
    pool: SqlitePool,
    store: DynStore,
    interval: Interval,
}

impl Sweeper {
    pub fn new(config: SweeperConfig, pool: SqlitePool, store: DynStore) -> Self {
        let interval = interval(config.interval);

        Self {
            config,
            pool,
            store,
            interval,
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("Starting sweeper with interval: {:?}", self.config.interval);

        loop {
            tokio::select! {
                _ = self.interval.tick() => {}
                _ = shutdown.changed() => break,
            }

            if *shutdown.borrow() {
                break;
            }

            self.add_jittered_delay().await;

            match sweep_once(&self.pool, &self.store).await {
                Ok(report) if report != SweepReport::default() => info!(
                    purged_entries = report.purged_entries,
                    expired_payments = report.expired_payments,
                    "Sweep completed"
                ),
                Ok(_) => debug!("Sweep found nothing to do"),
                Err(e) => error!("Sweep cycle failed: {e}"),
            }
        }

        info!("Sweeper stopped");
    }

    async fn add_jittered_delay(&self) {
        if self.config.max_jitter > Duration::ZERO {
            #[allow(clippy::cast_possible_truncation)]
            let max_jitter_millis = self.config.max_jitter.as_millis() as u64;
            let jitter_millis = rand::thread_rng().gen_range(0..max_jitter_millis);
            tokio::time::sleep(Duration::from_millis(jitter_millis)).await;
        }
    }
}

pub async fn sweep_once(pool: &SqlitePool, store: &DynStore) -> Result<SweepReport, SweepError> {
    let purged_entries = store.purge_expired().await?;
    let expired_payments = PaymentOrder::expire_stale(pool, Utc::now()).await?;

    Ok(SweepReport {
        purged_entries,
        expired_payments,
    })
}
