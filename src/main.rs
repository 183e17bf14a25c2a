//! shellcache daemon - offline cache for the field web app
//!
//! Intercepts the app's requests over a local socket, serving the application
//! shell and viewed map tiles from disk when the network is unavailable.

mod cache;
mod config;
mod ipc;
mod origin;
mod worker;

use anyhow::{anyhow, Result};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use config::WorkerConfig;
use ipc::IpcServer;
use origin::FetchRequest;
use worker::WorkerController;

/// CLI command
#[derive(Debug)]
enum Command {
    /// Run the daemon (default)
    Serve,
    /// Install and activate the configured version, then exit
    Install,
    /// Route one GET request through the active version
    Fetch { url: String },
    /// List cache namespaces
    Caches,
    /// Show help
    Help,
}

fn print_help() {
    eprintln!(
        r#"shellcache-daemon - Offline cache for the field web app

USAGE:
    shellcache-daemon [--config <path>]              # Run the daemon (default)
    shellcache-daemon serve [--config <path>]
    shellcache-daemon install [--config <path>]
    shellcache-daemon fetch <url> [--config <path>]
    shellcache-daemon caches [--config <path>]
    shellcache-daemon help

COMMANDS:
    serve    Install/activate the configured version if needed, then
             serve client pages on the Unix socket until Ctrl+C
    install  Fetch the shell into a fresh static cache and activate it
    fetch    Route a single GET through the active version and print
             where the response came from
    caches   List cache namespaces
    help     Show this help message

OPTIONS:
    --config <path>  JSON config file (defaults are built in)

ENVIRONMENT:
    RUST_LOG         Log level (trace, debug, info, warn, error)
"#
    );
}

fn parse_args(args: &[String]) -> Result<(Command, Option<PathBuf>)> {
    let mut config_path = None;
    let mut positional = Vec::new();

    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        if arg == "--config" {
            let path = iter
                .next()
                .ok_or_else(|| anyhow!("--config requires a path"))?;
            config_path = Some(PathBuf::from(path));
        } else {
            positional.push(arg.as_str());
        }
    }

    let command = match positional.as_slice() {
        [] | ["serve"] => Command::Serve,
        ["install"] => Command::Install,
        ["fetch", url] => Command::Fetch {
            url: url.to_string(),
        },
        ["fetch", ..] => return Err(anyhow!("Usage: shellcache-daemon fetch <url>")),
        ["caches"] => Command::Caches,
        ["help"] | ["--help"] | ["-h"] => Command::Help,
        [other, ..] => {
            eprintln!("Unknown command: {}", other);
            Command::Help
        }
    };

    Ok((command, config_path))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let log_level = env::var("RUST_LOG")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(Level::INFO);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Parse command
    let args: Vec<String> = env::args().collect();
    let (command, config_path) = match parse_args(&args) {
        Ok(parsed) => parsed,
        Err(e) => {
            eprintln!("Error: {}", e);
            print_help();
            std::process::exit(1);
        }
    };

    if let Command::Help = command {
        print_help();
        return Ok(());
    }

    let config = WorkerConfig::load(config_path.as_deref())?;
    let socket_path = config.socket_path.clone();
    let controller = Arc::new(WorkerController::new(config)?);

    match command {
        Command::Serve => {
            info!("Starting shellcache daemon");

            if let Err(e) = controller.start().await {
                // Keep serving: clients stay uncontrolled (or on the last active version)
                error!(error = %e, "Configured version did not activate");
            }

            let mut ipc_server = IpcServer::new(Arc::clone(&controller), socket_path);
            if let Err(e) = ipc_server.start().await {
                error!(error = %e, "Failed to start IPC server");
                return Err(e);
            }

            info!("Daemon ready. Waiting for client pages...");

            let ipc_server = Arc::new(ipc_server);
            let runner = Arc::clone(&ipc_server);
            let ipc_handle = tokio::spawn(async move {
                if let Err(e) = runner.run().await {
                    error!(error = %e, "IPC server error");
                }
            });

            // Wait for Ctrl+C
            tokio::signal::ctrl_c().await?;

            info!("Received shutdown signal");
            ipc_handle.abort();
            ipc_server.stop()?;

            info!("Shutdown complete.");
        }
        Command::Install => {
            controller.install_and_activate().await?;
            println!(
                "Installed and activated {}",
                controller.config().static_cache
            );
        }
        Command::Fetch { url } => {
            controller.resume().await?;
            let client = controller.connect_client().await;
            let request = FetchRequest::get(controller.config().resolve(&url)?);

            match controller.fetch(client, request).await {
                Ok(routed) => {
                    println!(
                        "{} {} ({}, {} bytes) via {}",
                        routed.response.status,
                        routed.response.url,
                        routed.source.as_str(),
                        routed.response.body.len(),
                        routed.route.map_or("uncontrolled", |route| route.as_str()),
                    );
                    if let Some(content_type) = routed.response.header("content-type") {
                        println!("  content-type: {}", content_type);
                    }
                }
                Err(e) => {
                    error!(error = %e, "Fetch failed");
                    return Err(e.into());
                }
            }
            controller.disconnect_client(client).await;
        }
        Command::Caches => {
            let names = controller.storage().keys();
            if names.is_empty() {
                println!("No cache namespaces.");
            } else {
                println!("Cache namespaces:");
                for name in names {
                    let entries = controller.storage().get(&name).map_or(0, |ns| ns.len());
                    println!("  {} ({} entries)", name, entries);
                }
            }
        }
        Command::Help => print_help(),
    }

    Ok(())
}
