use clap::Parser;
use env_logger::Env;
use log::{error, info, warn};
use soe_server::{DaemonConfig, LoggingDispatcher, Server, ServerConfig, ServerError};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;

/// Runs every SOE server named in the daemon configuration until Ctrl+C.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Command line arguments
    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// JSON file mapping server names to their options
        #[clap(short, long, default_value = "daemon.cfg")]
        config: PathBuf,
        /// Log per-packet activity
        #[clap(short, long)]
        verbose: bool,
    }

    let args = Args::parse();

    let level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(level)).init();

    let daemon = match DaemonConfig::load(&args.config) {
        Ok(daemon) => daemon,
        Err(ServerError::Io(e)) if e.kind() == ErrorKind::NotFound => {
            warn!(
                "{} not found, running a single server with default options",
                args.config.display()
            );
            let mut daemon = DaemonConfig::default();
            let config = ServerConfig::default();
            daemon.servers.insert(config.name.clone(), config);
            daemon
        }
        Err(e) => return Err(e.into()),
    };

    let mut handles = Vec::new();
    let mut tasks = Vec::new();
    for (name, config) in daemon.servers {
        let server = Server::bind(config, Arc::new(LoggingDispatcher)).await?;
        handles.push(server.handle());
        tasks.push((name, tokio::spawn(server.run())));
    }

    info!("Daemon started with {} servers", tasks.len());

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down gracefully...");

    for handle in &handles {
        handle.stop();
    }

    for (name, task) in tasks {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("{} failed: {}", name, e),
            Err(e) => error!("{} task panicked: {}", name, e),
        }
    }

    Ok(())
}
