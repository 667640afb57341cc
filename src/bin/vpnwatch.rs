//! vpnwatch command-line tool
//!
//! Reports whether traffic is currently routed through a VPN, and can keep
//! watching for changes.

use futures::StreamExt;
use log::{debug, error, info, warn};
use std::env;
use std::path::Path;
use std::process;
use tokio::signal;
use vpnwatch::{Config, Result, VpnWatcher, WatchError};

const USAGE: &str = "Usage: vpnwatch [--config <path>] [status|info|watch]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Status,
    Info,
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let (config_path, command) = match parse_args(&args) {
        Ok(parsed) => parsed,
        Err(e) => {
            eprintln!("{e}\n{USAGE}");
            process::exit(2);
        }
    };

    let config = load_config(config_path.as_deref())?;

    // Initialize logging; RUST_LOG overrides the configured level
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.logging.level.as_str()),
    )
    .init();
    debug!("vpnwatch v{}", vpnwatch::VERSION);

    let watcher = VpnWatcher::new(config)?;

    match command {
        Command::Status => {
            let active = watcher.is_vpn_active();
            println!("{}", vpnwatch::ConnectionState::from_active(active));
            process::exit(if active { 0 } else { 1 });
        }
        Command::Info => {
            print!("{}", watcher.get_vpn_info().to_toml()?);
        }
        Command::Watch => watch(&watcher).await?,
    }

    Ok(())
}

fn parse_args(args: &[String]) -> std::result::Result<(Option<String>, Command), String> {
    let mut config_path = None;
    let mut command = Command::Status;
    let mut iter = args.iter();

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" | "-c" => match iter.next() {
                Some(path) => config_path = Some(path.clone()),
                None => return Err("--config requires a path".to_string()),
            },
            "status" => command = Command::Status,
            "info" => command = Command::Info,
            "watch" => command = Command::Watch,
            other => return Err(format!("Unknown argument '{other}'")),
        }
    }

    Ok((config_path, command))
}

/// Load configuration from file, falling back to defaults
fn load_config(config_path: Option<&str>) -> Result<Config> {
    let Some(path) = config_path else {
        return Ok(Config::default());
    };
    if !Path::new(path).exists() {
        return Err(WatchError::Config(format!("Config file '{path}' not found")));
    }
    let config = Config::from_file(path)?;
    config.validate()?;
    Ok(config)
}

/// Print each transition until interrupted
async fn watch(watcher: &VpnWatcher) -> Result<()> {
    let mut states = watcher.connection_state_stream()?;
    info!("Watching for VPN changes. Press Ctrl+C to stop.");

    let shutdown = setup_shutdown_handler();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown signal received");
                break;
            }
            state = states.next() => match state {
                Some(state) => println!("{state}"),
                None => {
                    warn!("State stream ended");
                    break;
                }
            }
        }
    }

    states.cancel();
    watcher.dispose();
    Ok(())
}

/// Setup signal handlers for graceful shutdown
async fn setup_shutdown_handler() {
    tokio::select! {
        _ = signal::ctrl_c() => {
            debug!("Received Ctrl+C");
        }
        _ = async {
            #[cfg(unix)]
            {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut sigterm) => {
                        sigterm.recv().await;
                        debug!("Received SIGTERM");
                    }
                    Err(e) => {
                        error!("Failed to install SIGTERM handler: {e}");
                        futures::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                futures::future::pending::<()>().await;
            }
        } => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_args() {
        assert_eq!(parse_args(&[]).unwrap(), (None, Command::Status));
        assert_eq!(
            parse_args(&args(&["--config", "watch.toml", "watch"])).unwrap(),
            (Some("watch.toml".to_string()), Command::Watch)
        );
        assert_eq!(parse_args(&args(&["info"])).unwrap().1, Command::Info);
        assert!(parse_args(&args(&["--config"])).is_err());
        assert!(parse_args(&args(&["connect"])).is_err());
    }

    #[test]
    fn test_missing_config_file() {
        assert!(load_config(Some("/nonexistent/vpnwatch.toml")).is_err());
        assert_eq!(load_config(None).unwrap(), Config::default());
    }
}
