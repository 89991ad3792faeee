use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

use crate::context::AppContext;
use crate::env::Env;
use crate::menu::MenuItem;
use crate::order::{OrderDetails, OrderStatus};
use crate::student::Student;
use crate::sweeper::sweep_once;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("Failed to read {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path} is not a JSON array of records: {source}")]
    InvalidImport {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Cancellation reason must not be empty")]
    EmptyReason,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Print an order with its lines and status history
    Show {
        #[arg(long = "order-id")]
        order_id: String,
    },
    /// Move an order to its next status (e.g. CONFIRMED, PREPARING, READY)
    Advance {
        #[arg(long = "order-id")]
        order_id: String,
        #[arg(long)]
        status: OrderStatus,
        /// Note recorded in the status history
        #[arg(long)]
        message: Option<String>,
    },
    /// Cancel an order and refund any captured payment
    Cancel {
        #[arg(long = "order-id")]
        order_id: String,
        #[arg(long)]
        reason: String,
    },
    /// Load or update menu items from a JSON array
    ImportMenu {
        #[arg(long)]
        file: PathBuf,
    },
    /// Load or update students from a JSON array
    ImportStudents {
        #[arg(long)]
        file: PathBuf,
    },
    /// Drop expired carts and expire abandoned payment orders
    Purge,
}

#[derive(Debug, Parser)]
#[command(name = "lunchbox-cli")]
#[command(about = "Operator tooling for the school lunch ordering service")]
#[command(version)]
pub struct CliEnv {
    #[clap(flatten)]
    pub env: Env,
    #[command(subcommand)]
    pub command: Commands,
}

impl CliEnv {
    pub fn parse_and_convert() -> (Env, Commands) {
        let cli_env = Self::parse();
        (cli_env.env, cli_env.command)
    }
}

pub async fn run_command(env: Env, command: Commands) -> anyhow::Result<()> {
    let pool = env.get_sqlite_pool().await?;
    sqlx::migrate!().run(&pool).await?;
    let ctx = AppContext::from_env(&env, pool).await?;

    run_command_with_writers(&ctx, command, &mut std::io::stdout()).await
}

async fn run_command_with_writers<W: Write>(
    ctx: &AppContext,
    command: Commands,
    stdout: &mut W,
) -> anyhow::Result<()> {
    match command {
        Commands::Show { order_id } => {
            let details = ctx.orders.get_order(&order_id).await?;
            print_order(&details, stdout)?;
        }
        Commands::Advance {
            order_id,
            status,
            message,
        } => {
            info!(%order_id, %status, "Advancing order");
            let order = ctx
                .orders
                .update_order_status(&order_id, status, message.as_deref())
                .await?;
            writeln!(stdout, "✅ Order {} is now {}", order.order_number, order.status)?;
        }
        Commands::Cancel { order_id, reason } => {
            if reason.trim().is_empty() {
                return Err(CliError::EmptyReason.into());
            }
            let order = ctx.orders.cancel_order(&order_id, &reason).await?;
            writeln!(stdout, "✅ Order {} cancelled", order.order_number)?;
        }
        Commands::ImportMenu { file } => {
            let items: Vec<MenuItem> = read_records(&file)?;
            for item in &items {
                ctx.menu.upsert(item).await?;
            }
            writeln!(stdout, "✅ Imported {} menu items", items.len())?;
        }
        Commands::ImportStudents { file } => {
            let students: Vec<Student> = read_records(&file)?;
            for student in &students {
                student.upsert(&ctx.pool).await?;
            }
            writeln!(stdout, "✅ Imported {} students", students.len())?;
        }
        Commands::Purge => {
            let report = sweep_once(&ctx.pool, &ctx.store).await?;
            writeln!(
                stdout,
                "🧹 Purged {} expired entries, expired {} payment orders",
                report.purged_entries, report.expired_payments
            )?;
        }
    }

    info!("CLI operation completed successfully");
    Ok(())
}

fn read_records<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>, CliError> {
    let raw = std::fs::read_to_string(path).map_err(|source| CliError::ReadFile {
        path: path.to_path_buf(),
        source,
    })?;

    serde_json::from_str(&raw).map_err(|source| CliError::InvalidImport {
        path: path.to_path_buf(),
        source,
    })
}

fn print_order<W: Write>(details: &OrderDetails, stdout: &mut W) -> std::io::Result<()> {
    let order = &details.order;
    writeln!(stdout, "Order {} ({})", order.order_number, order.id)?;
    writeln!(stdout, "   Student: {}", order.student_id)?;
    writeln!(
        stdout,
        "   Delivery: {} {}",
        order.delivery_date, order.delivery_time
    )?;
    writeln!(stdout, "   Status: {}", order.status)?;
    writeln!(
        stdout,
        "   Total: {} {}",
        format_minor_units(order.total_cents),
        order.currency
    )?;

    for item in &details.items {
        writeln!(
            stdout,
            "   - {} x{} @ {}",
            item.name,
            item.quantity,
            format_minor_units(item.unit_price_cents)
        )?;
    }

    writeln!(stdout, "   History:")?;
    for entry in &details.status_history {
        match &entry.message {
            Some(message) => writeln!(
                stdout,
                "     {} {} ({message})",
                entry.recorded_at.format("%Y-%m-%d %H:%M"),
                entry.status
            )?,
            None => writeln!(
                stdout,
                "     {} {}",
                entry.recorded_at.format("%Y-%m-%d %H:%M"),
                entry.status
            )?,
        }
    }

    Ok(())
}

fn format_minor_units(cents: u64) -> String {
    format!("{}.{:02}", cents / 100, cents % 100)
}
