pub mod menu;

use clap::{Parser, Subcommand};
use console::style;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use gfs_sql_backup::app::App;
use gfs_sql_backup::backup::ExecuteAllSummary;
use gfs_sql_backup::config;
use gfs_sql_backup::model::{
    BackupRecord, BackupStatus, Connection, DestinationConfig, StorageDestination,
};
use gfs_sql_backup::retention::PruneReport;
use gfs_sql_backup::Result;

#[derive(Parser, Debug)]
#[command(name = "gfs-sql-backup")]
#[command(version, about = "Scheduled MySQL, MariaDB and PostgreSQL backups with GFS retention")]
pub struct Cli {
    /// Configuration file (default: ~/.gfs_sql_backup/config.toml)
    #[arg(short, long, env = "GFS_BACKUP_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Interactive menu (default)
    Menu,
    /// Run the scheduler in the foreground until Ctrl+C
    Daemon,
    /// Back up a connection now
    Backup {
        #[arg(long)]
        connection: i64,
        /// Only this database, even if it is disabled for scheduled runs
        #[arg(long)]
        database: Option<String>,
    },
    /// Promote and prune backups according to the retention policy
    Prune,
    /// Exempt a backup from pruning
    Protect { id: i64 },
    Unprotect { id: i64 },
    /// Delete a backup and its artifact
    Delete { id: i64 },
    /// List backups, newest first
    List {
        #[arg(long)]
        connection: Option<i64>,
    },
    /// Decompress a backup and compare it with its recorded checksum
    Verify { id: i64 },
    /// Check that a connection's server answers
    Test { connection: i64 },
    /// List the databases a connection's server holds
    Discover { connection: i64 },
    /// List storage destinations with secrets masked
    Destinations,
    /// Encrypt plaintext secrets in the configuration file
    Seal,
    /// Print a new random encryption key
    GenerateKey,
}

/// Loads the configuration, seals any plaintext secrets back into the file
/// and wires the engine.
pub async fn bootstrap(path: &Path) -> Result<App> {
    let mut config = config::load_from(path)?;
    let vault = config.vault()?;
    if config.seal(&vault)? {
        config::save_to(&config, path)?;
        info!("Encrypted plaintext secrets in {:?}", path);
    }
    if config.catalog_path.is_none() {
        config.catalog_path = Some(config::default_catalog_path());
    }
    App::bootstrap(config).await
}

pub fn seal_config(path: &Path) -> Result<()> {
    let mut config = config::load_from(path)?;
    let vault = config.vault()?;
    if config.seal(&vault)? {
        config::save_to(&config, path)?;
        println!("{}", style("Secrets encrypted.").green());
    } else {
        println!("{}", style("Nothing to encrypt.").dim());
    }
    Ok(())
}

pub async fn run_command(app: &App, command: Commands, shutdown: Arc<AtomicUsize>) -> Result<()> {
    match command {
        Commands::Menu => menu::run_menu(app, shutdown).await,
        Commands::Daemon => run_daemon(app, shutdown).await,
        Commands::Backup {
            connection,
            database,
        } => {
            let summary = app.backup(connection, database.as_deref()).await?;
            print_summary(&summary);
            Ok(())
        }
        Commands::Prune => {
            let report = app.retention.prune_backups().await?;
            print_prune_report(&report);
            Ok(())
        }
        Commands::Protect { id } => {
            app.retention.protect(id).await?;
            println!("{} Backup #{} is protected", style("✓").green(), id);
            Ok(())
        }
        Commands::Unprotect { id } => {
            app.retention.unprotect(id).await?;
            println!("{} Backup #{} is no longer protected", style("✓").green(), id);
            Ok(())
        }
        Commands::Delete { id } => {
            app.retention.delete_backup(id).await?;
            println!("{} Backup #{} deleted", style("✓").green(), id);
            Ok(())
        }
        Commands::List { connection } => {
            print_backups(&app.backups(connection).await?);
            Ok(())
        }
        Commands::Verify { id } => {
            let size = app.verify(id).await?;
            println!(
                "{} Backup #{} is intact ({} uncompressed)",
                style("✓").green(),
                id,
                gfs_sql_backup::space::format_bytes(size)
            );
            Ok(())
        }
        Commands::Test { connection } => {
            print_connection_check(&app.inspector.test(connection).await?);
            Ok(())
        }
        Commands::Discover { connection } => {
            for database in app.inspector.discover(connection).await? {
                println!("{}", database);
            }
            Ok(())
        }
        Commands::Destinations => {
            print_destinations(&app.destinations().await?);
            Ok(())
        }
        Commands::Seal | Commands::GenerateKey => Ok(()),
    }
}

/// Runs the scheduler until the first Ctrl+C, then stops it and waits for
/// running backups to be cancelled.
pub async fn run_daemon(app: &App, shutdown: Arc<AtomicUsize>) -> Result<()> {
    let scheduled = app.scheduler.start().await?;
    println!(
        "{} {} connection(s) scheduled, retention daily at {}. Press Ctrl+C to stop.",
        style("Scheduler running:").green(),
        scheduled,
        app.config.retention_run_at
    );

    while shutdown.load(Ordering::Relaxed) == 0 {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    println!("{}", style("Stopping scheduler...").yellow());
    app.scheduler.stop().await;
    Ok(())
}

pub fn print_summary(summary: &ExecuteAllSummary) {
    println!("\n{}", style("=== Backup Results ===").cyan().bold());
    for result in &summary.results {
        if result.success {
            println!(
                "{} {} - {} ({}, {} sec)",
                style("✓").green(),
                result.database_name,
                style("Success").green(),
                gfs_sql_backup::space::format_bytes(result.file_size.unwrap_or(0)),
                result.duration_secs
            );
            if let Some(path) = &result.local_full_path {
                println!("    File: {}", path.display());
            }
        } else {
            println!(
                "{} {} - {} ({})",
                style("✗").red(),
                result.database_name,
                style("Failed").red(),
                result.error.as_deref().unwrap_or("Unknown error")
            );
        }
        if let Some(warning) = &result.warning {
            println!("    {} {}", style("⚠").yellow(), warning);
        }
    }
    println!(
        "\nCompleted: {}/{} databases successful",
        style(summary.successful).green(),
        summary.total_databases
    );
}

pub fn format_record(record: &BackupRecord) -> String {
    let status = match record.status {
        BackupStatus::Completed => style(record.status.to_string()).green(),
        BackupStatus::Failed => style(record.status.to_string()).red(),
        BackupStatus::Cancelled => style(record.status.to_string()).yellow(),
        _ => style(record.status.to_string()).cyan(),
    };
    format!(
        "#{:<5} {:<20} {:<10} {:<8} {:>10}  {}{}",
        record.id,
        record.database_name,
        status,
        record.retention,
        record.formatted_size(),
        record.created_at.format("%Y-%m-%d %H:%M"),
        if record.protected { " [protected]" } else { "" }
    )
}

pub fn print_backups(records: &[BackupRecord]) {
    if records.is_empty() {
        println!("{}", style("No backups recorded").dim());
        return;
    }
    for record in records {
        println!("{}", format_record(record));
        if let Some(error) = &record.error_message {
            println!("        {}", style(error).dim());
        }
    }
}

pub fn print_prune_report(report: &PruneReport) {
    println!(
        "Retention: {} deleted, {} promoted, {} protected",
        style(report.deleted).cyan(),
        style(report.promoted).cyan(),
        style(report.protected).cyan()
    );
    for error in &report.errors {
        println!("  {} {}", style("⚠").yellow(), error);
    }
}

pub fn print_connection_check((connection, version): &(Connection, Option<String>)) {
    match version {
        Some(version) => println!(
            "{} {} is reachable: {}",
            style("✓").green(),
            connection.name,
            version
        ),
        None => println!(
            "{} {} failed: {}",
            style("✗").red(),
            connection.name,
            connection.last_error.as_deref().unwrap_or("Unknown error")
        ),
    }
}

pub fn print_destinations(destinations: &[(StorageDestination, DestinationConfig)]) {
    if destinations.is_empty() {
        println!("{}", style("No storage destinations, backups stay local").dim());
        return;
    }
    for (destination, settings) in destinations {
        println!(
            "#{:<3} {:<20} {:<10} {:?}{}",
            destination.id,
            destination.name,
            destination.kind.to_string(),
            destination.status,
            if destination.is_default { " [default]" } else { "" }
        );
        match serde_json::to_string(settings) {
            Ok(json) => println!("     {}", style(json).dim()),
            Err(e) => println!("     {}: {}", style("Unreadable settings").red(), e),
        }
    }
}
