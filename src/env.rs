use chrono_tz::Tz;
use clap::Parser;
use lunchbox_payments::{DryRunGateway, DynGateway, HttpGateway, PaymentError, PaymentGatewayEnv};
use sqlx::SqlitePool;
use sqlx::sqlite::SqliteConnectOptions;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{Level, info, warn};
use url::Url;

use crate::cache::CacheConfig;
use crate::cart::CartConfig;
use crate::kv::{DynStore, KvBackend, KvError, MemoryStore, RedisStore, SqliteStore};
use crate::notification::{NotificationEnv, NotificationError};
use crate::order::OrderPolicy;
use crate::sweeper::SweeperConfig;
use crate::telemetry::TelemetryConfig;

#[derive(clap::ValueEnum, Debug, Clone)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(log_level: LogLevel) -> Self {
        (&log_level).into()
    }
}

impl From<&LogLevel> for Level {
    fn from(log_level: &LogLevel) -> Self {
        match log_level {
            LogLevel::Trace => Self::TRACE,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EnvError {
    #[error("Unknown school time zone: {0}")]
    InvalidTimezone(String),
    #[error("--redis-url is required when the key-value backend is redis")]
    MissingRedisUrl,
    #[error("Payment gateway configuration: {0}")]
    Gateway(#[from] PaymentError),
    #[error("Notifier configuration: {0}")]
    Notifier(#[from] NotificationError),
    #[error("Key-value store: {0}")]
    Store(#[from] KvError),
    #[error("Database: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Parser, Debug, Clone)]
pub struct Env {
    #[clap(long = "db", env, default_value = "sqlite://lunchbox.db")]
    pub database_url: String,
    #[clap(long, env, default_value = "debug")]
    pub log_level: LogLevel,
    #[clap(long, env, default_value = "0.0.0.0")]
    pub bind_address: String,
    #[clap(long, env, default_value = "8080")]
    pub port: u16,
    /// IANA zone that delivery dates and times are expressed in
    #[clap(long, env, default_value = "Asia/Kolkata")]
    pub school_timezone: String,
    /// Orders close this many minutes before delivery
    #[clap(long, env, default_value = "120")]
    pub order_cutoff_minutes: u32,
    #[clap(long, env, value_enum, default_value = "sqlite")]
    pub kv_backend: KvBackend,
    #[clap(long, env)]
    pub redis_url: Option<String>,
    #[clap(long, env, default_value = "3600")]
    pub cart_ttl_secs: u64,
    #[clap(long, env, default_value = "10")]
    pub cart_max_quantity: u32,
    #[clap(long, env, default_value = "512")]
    pub menu_cache_capacity: usize,
    #[clap(long, env, default_value = "300")]
    pub menu_cache_ttl_secs: u64,
    #[clap(flatten)]
    pub gateway: PaymentGatewayEnv,
    #[clap(flatten)]
    pub notifications: NotificationEnv,
    /// OTLP/HTTP traces endpoint; telemetry export is off when unset
    #[clap(long, env)]
    pub otel_exporter_endpoint: Option<Url>,
    #[clap(long, env)]
    pub otel_api_key: Option<String>,
    #[clap(long, env, default_value = "lunchbox")]
    pub otel_service_name: String,
    #[clap(long, env, default_value = "production")]
    pub otel_deployment_environment: String,
    #[clap(long, env, default_value = "60", value_parser = clap::value_parser!(u64).range(1..))]
    pub sweeper_interval_secs: u64,
    /// Maximum random delay added to each sweep so replicas don't align
    #[clap(long, env, default_value = "5")]
    pub sweeper_max_jitter_secs: u64,
}

impl Env {
    pub async fn get_sqlite_pool(&self) -> Result<SqlitePool, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(&self.database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        SqlitePool::connect_with(options).await
    }

    pub fn order_policy(&self) -> Result<OrderPolicy, EnvError> {
        let timezone = self
            .school_timezone
            .parse::<Tz>()
            .map_err(|_| EnvError::InvalidTimezone(self.school_timezone.clone()))?;

        Ok(OrderPolicy {
            timezone,
            cutoff: chrono::Duration::minutes(i64::from(self.order_cutoff_minutes)),
            currency: self.gateway.currency.clone(),
        })
    }

    pub fn cart_config(&self) -> CartConfig {
        CartConfig {
            ttl: Duration::from_secs(self.cart_ttl_secs),
            max_quantity_per_item: self.cart_max_quantity,
            ..CartConfig::default()
        }
    }

    pub const fn menu_cache_config(&self) -> CacheConfig {
        CacheConfig {
            capacity: self.menu_cache_capacity,
            ttl: Duration::from_secs(self.menu_cache_ttl_secs),
        }
    }

    pub const fn sweeper_config(&self) -> SweeperConfig {
        SweeperConfig {
            interval: Duration::from_secs(self.sweeper_interval_secs),
            max_jitter: Duration::from_secs(self.sweeper_max_jitter_secs),
        }
    }

    pub(crate) fn get_gateway(&self) -> Result<DynGateway, EnvError> {
        if self.gateway.dry_run {
            warn!("Payments run in dry-run mode, every payment is reported captured");
            return Ok(Arc::new(DryRunGateway::new()));
        }

        Ok(Arc::new(HttpGateway::try_from_env(self.gateway.clone())?))
    }

    pub(crate) async fn get_store(&self, pool: &SqlitePool) -> Result<DynStore, EnvError> {
        let store: DynStore = match self.kv_backend {
            KvBackend::Sqlite => Arc::new(SqliteStore::new(pool.clone())),
            KvBackend::Memory => Arc::new(MemoryStore::new()),
            KvBackend::Redis => {
                let url = self.redis_url.as_deref().ok_or(EnvError::MissingRedisUrl)?;
                Arc::new(RedisStore::connect(url).await?)
            }
        };

        info!(backend = ?self.kv_backend, "Key-value store ready");
        Ok(store)
    }

    pub fn telemetry_config(&self) -> Option<TelemetryConfig> {
        Some(TelemetryConfig {
            endpoint: self.otel_exporter_endpoint.clone()?,
            api_key: self.otel_api_key.clone()?,
            service_name: self.otel_service_name.clone(),
            deployment_environment: self.otel_deployment_environment.clone(),
        })
    }
}

pub fn default_filter(log_level: &LogLevel) -> String {
    let level: Level = log_level.into();
    format!("lunchbox={level},lunchbox_payments={level},lunchbox_cli={level},server={level}")
}

pub fn setup_tracing(log_level: &LogLevel) {
    let default_filter = default_filter(log_level);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .compact()
        .init();
}
