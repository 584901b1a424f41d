//! huntstore CLI: operator interface to the shared store.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use huntstore::config::Config;
use huntstore::lock::LockManager;
use huntstore::migration::MigrationRunner;
use huntstore::models;
use huntstore::store::{PgStore, SharedStore, Store};
use huntstore::telemetry::{TelemetryConfig, init_telemetry};
use secrecy::ExposeSecret;

#[derive(Parser)]
#[command(name = "huntstore", about = "Hunt data store maintenance")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply pending migrations, waiting for any other runner
    Migrate,
    /// Show the migration marker and pending versions
    Status,
    /// Inspect or break named locks
    Locks {
        #[command(subcommand)]
        action: LockAction,
    },
}

#[derive(Subcommand)]
enum LockAction {
    /// List every lock record
    List,
    /// Delete a lock record regardless of holder
    Break {
        /// Lock name, e.g. "migrations" or "hunt:<id>:folder"
        name: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "huntstore".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let pg = PgStore::connect(config.database_url.expose_secret()).await?;
    pg.bootstrap().await?;
    pg.ping().await?;
    let store: SharedStore = Arc::new(pg);

    let coordination = &config.settings.coordination;
    let locks = LockManager::new(store.clone(), coordination.lock_config());
    let runner = MigrationRunner::new(
        store,
        locks.clone(),
        Arc::new(models::builtin_migrations()?),
        coordination.migration_config(),
    );

    match cli.command {
        Command::Migrate => cmd_migrate(&runner).await,
        Command::Status => cmd_status(&runner).await,
        Command::Locks { action } => match action {
            LockAction::List => cmd_locks_list(&locks).await,
            LockAction::Break { name } => cmd_locks_break(&locks, &name).await,
        },
    }
}

async fn cmd_migrate(runner: &MigrationRunner) -> anyhow::Result<()> {
    let report = runner.run().await?;
    println!(
        "Migrated: {} → {}",
        report.starting_version, report.final_version
    );
    if !report.applied.is_empty() {
        println!("Applied:  {:?}", report.applied);
    }
    if !report.skipped.is_empty() {
        println!("Skipped:  {:?} (applied by another process)", report.skipped);
    }
    Ok(())
}

async fn cmd_status(runner: &MigrationRunner) -> anyhow::Result<()> {
    let status = runner.status().await?;
    println!("Current:  {}", status.current_version);
    println!("Latest:   {}", status.latest_version);
    if status.pending.is_empty() {
        println!("Pending:  none");
    } else {
        println!("Pending:  {:?}", status.pending);
    }
    Ok(())
}

async fn cmd_locks_list(locks: &LockManager) -> anyhow::Result<()> {
    let records = locks.list().await?;
    if records.is_empty() {
        println!("No locks held.");
        return Ok(());
    }

    let now = chrono::Utc::now();
    println!(
        "{:<40}  {:<36}  {:<7}  EXPIRES",
        "NAME", "HOLDER", "STATE"
    );
    println!("{}", "-".repeat(110));
    for record in &records {
        let state = if record.is_live(now) { "live" } else { "expired" };
        println!(
            "{:<40}  {:<36}  {:<7}  {}",
            record.name,
            record.holder.to_string(),
            state,
            record.expires_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    println!("\n{} lock(s)", records.len());
    Ok(())
}

async fn cmd_locks_break(locks: &LockManager, name: &str) -> anyhow::Result<()> {
    if locks.force_release(name).await? {
        println!("Broke lock {name}. Its holder, if still running, is not stopped.");
    } else {
        println!("No lock named {name}.");
    }
    Ok(())
}
