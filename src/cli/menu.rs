use console::style;
use dialoguer::{Confirm, Select};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use gfs_sql_backup::app::App;
use gfs_sql_backup::model::{BackupRecord, Connection};
use gfs_sql_backup::repository::DestinationRepository;
use gfs_sql_backup::space::format_bytes;
use gfs_sql_backup::Result;

use super::{
    format_record, print_backups, print_connection_check, print_destinations, print_prune_report,
    print_summary,
};

const RECENT_BACKUPS: usize = 30;

#[derive(Debug, Clone, Copy, PartialEq)]
enum MenuOption {
    RunBackupNow,
    SchedulerMenu,
    ListBackups,
    ManageBackup,
    ApplyRetention,
    CheckConnection,
    ListDestinations,
    Quit,
}

impl MenuOption {
    fn display(&self, scheduler_running: bool) -> String {
        match self {
            MenuOption::RunBackupNow => "Run backup now".to_string(),
            MenuOption::SchedulerMenu => {
                if scheduler_running {
                    format!("Scheduler [{}]", style("RUNNING").green())
                } else {
                    format!("Scheduler [{}]", style("STOPPED").dim())
                }
            }
            MenuOption::ListBackups => "List backups".to_string(),
            MenuOption::ManageBackup => "Protect, verify or delete a backup".to_string(),
            MenuOption::ApplyRetention => "Apply retention policy now".to_string(),
            MenuOption::CheckConnection => "Test a connection".to_string(),
            MenuOption::ListDestinations => "Show storage destinations".to_string(),
            MenuOption::Quit => "Quit".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum SchedulerOption {
    Start,
    Stop,
    ViewJobs,
    Back,
}

impl std::fmt::Display for SchedulerOption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedulerOption::Start => write!(f, "Start scheduler"),
            SchedulerOption::Stop => write!(f, "Stop scheduler"),
            SchedulerOption::ViewJobs => write!(f, "View scheduled jobs"),
            SchedulerOption::Back => write!(f, "Back to main menu"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BackupAction {
    Protect,
    Unprotect,
    Verify,
    Delete,
    Back,
}

impl std::fmt::Display for BackupAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackupAction::Protect => write!(f, "Protect from pruning"),
            BackupAction::Unprotect => write!(f, "Remove protection"),
            BackupAction::Verify => write!(f, "Verify checksum"),
            BackupAction::Delete => write!(f, "Delete"),
            BackupAction::Back => write!(f, "Back to main menu"),
        }
    }
}

fn display_header() {
    println!();
    println!("{}", style("╔════════════════════════════════════════╗").cyan());
    println!("{}", style("║        GFS SQL Backup Manager          ║").cyan());
    println!("{}", style("╚════════════════════════════════════════╝").cyan());
    println!();
}

async fn display_summary(app: &App) {
    let connection_count = app.connections().await.map(|c| c.len()).unwrap_or(0);
    let destination_count = app.store.list_destinations().await.map(|d| d.len()).unwrap_or(0);

    println!("{}", style("Current Configuration:").bold());
    println!(
        "  Database connections: {}",
        if connection_count > 0 {
            style(connection_count.to_string()).green()
        } else {
            style("None".to_string()).red()
        }
    );
    println!(
        "  Storage destinations: {}",
        if destination_count > 0 {
            style(destination_count.to_string()).green()
        } else {
            style("Local only".to_string()).yellow()
        }
    );
    println!(
        "  Scheduler: {}",
        if app.scheduler.is_running() {
            style("Running").green()
        } else {
            style("Stopped").dim()
        }
    );
    let policy = app.retention.policy();
    println!(
        "  Retention: {} daily, {} weekly, {} monthly, {} yearly",
        policy.daily, policy.weekly, policy.monthly, policy.yearly
    );
    println!(
        "  Backup directory: {}",
        style(app.config.local_backup_dir.display()).cyan()
    );
    if let Some(space) = app.space_info() {
        let free = format!(
            "{} free ({:.1}%)",
            format_bytes(space.free_bytes),
            space.free_percent
        );
        println!(
            "  Disk space: {}",
            if space.is_low_space {
                style(free).red()
            } else {
                style(free).green()
            }
        );
    }
    println!();
}

fn wait_for_enter() {
    println!("\nPress Enter to continue...");
    let _ = std::io::stdin().read_line(&mut String::new());
}

pub async fn run_menu(app: &App, shutdown: Arc<AtomicUsize>) -> Result<()> {
    loop {
        if shutdown.load(Ordering::Relaxed) > 0 {
            if app.scheduler.is_running() {
                app.scheduler.stop().await;
            }
            break;
        }

        display_header();
        display_summary(app).await;

        let menu_items = vec![
            MenuOption::RunBackupNow,
            MenuOption::SchedulerMenu,
            MenuOption::ListBackups,
            MenuOption::ManageBackup,
            MenuOption::ApplyRetention,
            MenuOption::CheckConnection,
            MenuOption::ListDestinations,
            MenuOption::Quit,
        ];

        let display_items: Vec<String> = menu_items
            .iter()
            .map(|m| m.display(app.scheduler.is_running()))
            .collect();

        let selection = match Select::new()
            .with_prompt("Select an option")
            .items(&display_items)
            .default(0)
            .interact_opt()
        {
            Ok(Some(s)) => s,
            Ok(None) | Err(_) => break,
        };

        match menu_items[selection] {
            MenuOption::RunBackupNow => run_backup_now(app).await,
            MenuOption::SchedulerMenu => scheduler_menu(app).await,
            MenuOption::ListBackups => {
                match app.backups(None).await {
                    Ok(records) => print_backups(&records),
                    Err(e) => println!("{}: {}", style("Error").red(), e),
                }
                wait_for_enter();
            }
            MenuOption::ManageBackup => manage_backup(app).await,
            MenuOption::ApplyRetention => {
                println!("\n{}", style("Applying retention policy...").yellow());
                match app.retention.prune_backups().await {
                    Ok(report) => print_prune_report(&report),
                    Err(e) => println!("{}: {}", style("Retention failed").red(), e),
                }
                wait_for_enter();
            }
            MenuOption::CheckConnection => check_connection(app).await,
            MenuOption::ListDestinations => {
                match app.destinations().await {
                    Ok(destinations) => print_destinations(&destinations),
                    Err(e) => println!("{}: {}", style("Error").red(), e),
                }
                wait_for_enter();
            }
            MenuOption::Quit => {
                if app.scheduler.is_running() {
                    println!("{}", style("Stopping scheduler...").yellow());
                    app.scheduler.stop().await;
                }
                println!("{}", style("Goodbye!").green());
                break;
            }
        }
    }

    Ok(())
}

fn select_connection(connections: &[Connection]) -> Option<&Connection> {
    let items: Vec<String> = connections
        .iter()
        .map(|c| format!("{} ({}, {}:{}) [{:?}]", c.name, c.engine, c.host, c.port, c.status))
        .collect();

    let selection = Select::new()
        .with_prompt("Select a connection")
        .items(&items)
        .default(0)
        .interact_opt()
        .ok()
        .flatten()?;
    connections.get(selection)
}

async fn run_backup_now(app: &App) {
    let connections = match app.connections().await {
        Ok(c) => c,
        Err(e) => {
            println!("{}: {}", style("Error").red(), e);
            return;
        }
    };
    if connections.is_empty() {
        println!(
            "{}",
            style("No connections configured. Add one to the configuration file first.").red()
        );
        return;
    }

    let Some(connection) = select_connection(&connections) else {
        return;
    };

    println!(
        "\n{}",
        style(format!("Backing up {}...", connection.name)).yellow()
    );
    match app.backup(connection.id, None).await {
        Ok(summary) if summary.total_databases == 0 => {
            println!("{}", style("No enabled databases on this connection.").yellow())
        }
        Ok(summary) => print_summary(&summary),
        Err(e) => println!("{}: {}", style("Backup failed").red(), e),
    }

    wait_for_enter();
}

async fn check_connection(app: &App) {
    let connections = match app.connections().await {
        Ok(c) => c,
        Err(e) => {
            println!("{}: {}", style("Error").red(), e);
            return;
        }
    };
    if connections.is_empty() {
        println!("{}", style("No connections configured.").red());
        return;
    }
    let Some(connection) = select_connection(&connections) else {
        return;
    };

    println!("\n{}", style(format!("Testing {}...", connection.name)).yellow());
    match app.inspector.test(connection.id).await {
        Ok(check) => print_connection_check(&check),
        Err(e) => println!("{}: {}", style("Error").red(), e),
    }
    match app.inspector.discover(connection.id).await {
        Ok(databases) if !databases.is_empty() => {
            println!("\n{}", style("Databases on this server:").cyan());
            for database in databases {
                let configured = connection.targets.iter().any(|t| t.name == database);
                println!(
                    "  {}{}",
                    database,
                    if configured { "" } else { " (not configured)" }
                );
            }
        }
        Ok(_) => {}
        Err(e) => println!("{}: {}", style("Could not list databases").yellow(), e),
    }

    wait_for_enter();
}

async fn scheduler_menu(app: &App) {
    loop {
        println!("\n{}", style("=== Scheduler ===").cyan().bold());

        let is_running = app.scheduler.is_running();
        println!(
            "Status: {}",
            if is_running {
                style("Running").green()
            } else {
                style("Stopped").dim()
            }
        );

        let options = vec![
            SchedulerOption::Start,
            SchedulerOption::Stop,
            SchedulerOption::ViewJobs,
            SchedulerOption::Back,
        ];

        let selection = match Select::new()
            .with_prompt("Select action")
            .items(&options)
            .default(0)
            .interact_opt()
        {
            Ok(Some(s)) => s,
            Ok(None) | Err(_) => break,
        };

        match options[selection] {
            SchedulerOption::Start => {
                if is_running {
                    println!("{}", style("Scheduler is already running!").yellow());
                } else {
                    match app.scheduler.start().await {
                        Ok(0) => println!(
                            "{}",
                            style("Scheduler started, but no connection has an enabled schedule.")
                                .yellow()
                        ),
                        Ok(count) => println!(
                            "{}",
                            style(format!("Scheduler started with {} connection(s)!", count))
                                .green()
                        ),
                        Err(e) => println!("{}: {}", style("Error").red(), e),
                    }
                }
            }
            SchedulerOption::Stop => {
                if !is_running {
                    println!("{}", style("Scheduler is not running.").yellow());
                } else {
                    app.scheduler.stop().await;
                    println!("{}", style("Scheduler stopped!").green());
                }
            }
            SchedulerOption::ViewJobs => {
                let stats = app.scheduler.stats().await;
                println!("\n{}", style("Scheduled jobs:").cyan());
                if stats.jobs.is_empty() {
                    println!("  {}", style("None").dim());
                }
                for job in &stats.jobs {
                    println!(
                        "  Connection #{} - {} - next run {}{}",
                        job.connection_id,
                        job.frequency,
                        style(job.next_fire.format("%Y-%m-%d %H:%M")).cyan(),
                        if job.in_flight {
                            format!(" [{}]", style("backing up").yellow())
                        } else {
                            String::new()
                        }
                    );
                }
                println!("\n  Retention: daily at {}", stats.retention_at);
                if let Some(next) = stats.next_retention_run {
                    println!("  Next retention run: {}", style(next.format("%Y-%m-%d %H:%M")).cyan());
                }
                wait_for_enter();
            }
            SchedulerOption::Back => break,
        }
    }
}

fn select_backup(records: &[BackupRecord]) -> Option<&BackupRecord> {
    let items: Vec<String> = records.iter().take(RECENT_BACKUPS).map(format_record).collect();
    let selection = Select::new()
        .with_prompt("Select a backup")
        .items(&items)
        .default(0)
        .interact_opt()
        .ok()
        .flatten()?;
    records.get(selection)
}

async fn manage_backup(app: &App) {
    let records = match app.backups(None).await {
        Ok(r) => r,
        Err(e) => {
            println!("{}: {}", style("Error").red(), e);
            return;
        }
    };
    if records.is_empty() {
        println!("{}", style("No backups recorded yet.").yellow());
        return;
    }

    let Some(record) = select_backup(&records) else {
        return;
    };
    let id = record.id;

    let actions = vec![
        if record.protected {
            BackupAction::Unprotect
        } else {
            BackupAction::Protect
        },
        BackupAction::Verify,
        BackupAction::Delete,
        BackupAction::Back,
    ];
    let selection = match Select::new()
        .with_prompt(format!("Backup #{}", id))
        .items(&actions)
        .default(0)
        .interact_opt()
    {
        Ok(Some(s)) => s,
        Ok(None) | Err(_) => return,
    };

    let outcome = match actions[selection] {
        BackupAction::Protect => app
            .retention
            .protect(id)
            .await
            .map(|_| format!("Backup #{} is protected", id)),
        BackupAction::Unprotect => app
            .retention
            .unprotect(id)
            .await
            .map(|_| format!("Backup #{} is no longer protected", id)),
        BackupAction::Verify => app
            .verify(id)
            .await
            .map(|size| format!("Backup #{} is intact ({} uncompressed)", id, format_bytes(size))),
        BackupAction::Delete => {
            let confirmed = Confirm::new()
                .with_prompt(format!("Delete backup #{} and its file?", id))
                .default(false)
                .interact()
                .unwrap_or(false);
            if !confirmed {
                return;
            }
            app.retention
                .delete_backup(id)
                .await
                .map(|_| format!("Backup #{} deleted", id))
        }
        BackupAction::Back => return,
    };

    match outcome {
        Ok(message) => println!("{} {}", style("✓").green(), message),
        Err(e) => println!("{} {}", style("✗").red(), e),
    }
    wait_for_enter();
}
