mod cli;

use clap::Parser;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use cli::{Cli, Commands};
use gfs_sql_backup::crypto::CredentialVault;
use gfs_sql_backup::{config, log, Result};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    log::init();

    info!("GFS SQL Backup starting...");

    let ctrl_c_count = Arc::new(AtomicUsize::new(0));
    let ctrl_c_count_clone = ctrl_c_count.clone();

    if let Err(e) = ctrlc::set_handler(move || {
        let count = ctrl_c_count_clone.fetch_add(1, Ordering::SeqCst);

        if count == 0 {
            println!("\n\nShutdown signal received. Press Ctrl+C again to force exit...");
        } else {
            println!("\nForce exiting...");
            std::process::exit(130);
        }
    }) {
        warn!("Could not install Ctrl+C handler: {}", e);
    }

    match run(cli, ctrl_c_count).await {
        Ok(_) => {
            info!("Application exited normally");
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli, shutdown: Arc<AtomicUsize>) -> Result<()> {
    let path = cli.config.unwrap_or_else(config::config_path);

    match cli.command.unwrap_or(Commands::Menu) {
        Commands::GenerateKey => {
            println!("{}", CredentialVault::generate_key_hex());
            Ok(())
        }
        Commands::Seal => cli::seal_config(&path),
        command => {
            let app = cli::bootstrap(&path).await?;
            cli::run_command(&app, command, shutdown).await
        }
    }
}
