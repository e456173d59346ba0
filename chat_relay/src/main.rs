// CLI entry point for the chat relay.
//
// Starts a standalone relay that chat clients connect to, then waits for
// `/quit` on stdin or Ctrl+C and shuts down with the configured linger so
// queued goodbye traffic can flush. See `server.rs` for the loop and
// `tcp_transport.rs` for the networking.
//
// Usage:
//   relay [PORT] [OPTIONS]
//     --port <PORT>          Listen port (default: 45700)
//     --bind <ADDR>          Bind address (default: 0.0.0.0)
//     --config <FILE>        JSON config file; flags override its values,
//                            and it overrides the defaults above
//     --linger-ms <MS>       Shutdown linger (default: 500)
//     --log-level <FILTER>   tracing filter (default: $RUST_LOG or "info")

use std::io::BufRead;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use chat_relay::{RelayConfig, start_relay};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Chat relay server
#[derive(Parser, Debug)]
#[command(name = "relay")]
#[command(version)]
struct Args {
    /// Listen port (same as --port)
    #[arg(value_name = "PORT", conflicts_with = "port")]
    port_positional: Option<u16>,

    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address
    #[arg(short, long)]
    bind: Option<IpAddr>,

    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Milliseconds to wait for queued messages to flush on shutdown
    #[arg(long)]
    linger_ms: Option<u64>,

    /// Log filter (trace, debug, info, warn, error, or a full directive)
    #[arg(long)]
    log_level: Option<String>,
}

fn init_logging(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info")),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// CLI defaults, then file values, then CLI flags on top.
fn build_config(args: &Args) -> Result<RelayConfig, Box<dyn std::error::Error>> {
    let cli_defaults = RelayConfig {
        bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        ..RelayConfig::default()
    };
    let mut config = match &args.config {
        Some(path) => RelayConfig::from_file_over(path, &cli_defaults)?,
        None => cli_defaults,
    };
    if let Some(port) = args.port.or(args.port_positional) {
        config.port = port;
    }
    if let Some(bind) = args.bind {
        config.bind_address = bind;
    }
    if let Some(linger_ms) = args.linger_ms {
        config.linger_ms = linger_ms;
    }
    config.validate()?;
    Ok(config)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_logging(args.log_level.as_deref());

    let config = build_config(&args)?;
    let linger = config.linger();

    let (handle, addr) = start_relay(config)?;
    println!("Relay listening on {addr}");
    println!("Type /quit or press Ctrl+C to stop.");

    let (quit_tx, quit_rx) = mpsc::channel::<&'static str>();

    let ctrlc_tx = quit_tx.clone();
    ctrlc::set_handler(move || {
        let _ = ctrlc_tx.send("Ctrl+C");
    })?;

    thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if line.trim() == "/quit" {
                let _ = quit_tx.send("/quit");
                break;
            }
        }
    });

    loop {
        match quit_rx.recv_timeout(Duration::from_millis(100)) {
            Ok(source) => {
                info!("Shutdown requested ({source})");
                break;
            }
            Err(mpsc::RecvTimeoutError::Timeout) if handle.is_finished() => {
                error!("Relay loop exited unexpectedly");
                break;
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    handle.stop(linger)?;
    println!("Relay stopped.");
    Ok(())
}
