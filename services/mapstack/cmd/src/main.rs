//! Serial MAP node binary.
//!
//! Reads framed packets from stdin, routes them through the node's address
//! graph and writes framed replies and forwarded packets to stdout. Logs go
//! to stderr.

use clap::Parser;
use std::path::PathBuf;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod logging;
mod node;

use config::NodeConfig;
use logging::NodeLogFormatter;
use node::Node;

const READ_CHUNK: usize = 256;

/// Serial MAP node
#[derive(Parser, Debug)]
#[command(name = "mapstack", version, about = "Serial MAP/MEP node on stdin/stdout")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "mapstack.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// MEP control prefix, e.g. `<` or 0x3c
    #[arg(long, value_parser = config::parse_control_prefix)]
    control_prefix: Option<u8>,

    /// EEPROM image holding the edge table
    #[arg(long)]
    eeprom: Option<PathBuf>,

    /// Scheduler tick, e.g. 10ms
    #[arg(long)]
    tick: Option<humantime::Duration>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("mapstack={}", args.log_level).parse()?)
        .add_directive(format!("mapstack_wire={}", args.log_level).parse()?)
        .add_directive(format!("mapstack_storage={}", args.log_level).parse()?)
        .add_directive(format!("mapstack_routing={}", args.log_level).parse()?)
        .add_directive(format!("mapstack_server={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .event_format(NodeLogFormatter::new("mapstack"))
        .init();

    info!("Starting mapstack node v{}", env!("CARGO_PKG_VERSION"));

    let mut node_config = NodeConfig::load_from_file(&args.config)?;
    if let Some(prefix) = args.control_prefix {
        node_config.control_prefix = prefix;
    }
    if let Some(path) = args.eeprom {
        node_config.eeprom.path = Some(path);
    }
    if let Some(tick) = args.tick {
        node_config.tick_interval = tick.to_string();
    }
    node_config.validate()?;

    let mut node = Node::open(&node_config)?;
    let tick = node_config.tick_interval()?;
    component_info!(
        "io",
        "Node ready: framing={:?} prefix={:#04x} tick={:?}",
        node_config.framing,
        node_config.control_prefix,
        tick
    );

    let mut stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let mut ticker = tokio::time::interval(tick);
    let mut chunk = [0u8; READ_CHUNK];
    let mut pending: Vec<u8> = Vec::new();
    let mut transmit: Vec<u8> = Vec::new();
    let mut eof = false;

    loop {
        tokio::select! {
            read = stdin.read(&mut chunk), if !eof && pending.is_empty() => {
                match read {
                    Ok(0) => {
                        component_info!("io", "Input closed, draining");
                        eof = true;
                    }
                    Ok(n) => pending.extend_from_slice(&chunk[..n]),
                    Err(e) => {
                        component_error!("io", "Serial input failed: {}", e);
                        return Err(e.into());
                    }
                }
            }
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Received interrupt, shutting down");
                break;
            }
        }

        let consumed = node.feed(&pending);
        pending.drain(..consumed);

        if node.poll(&mut transmit) > 0 {
            component_debug!("io", "Transmitting {} bytes", transmit.len());
            stdout.write_all(&transmit).await?;
            stdout.flush().await?;
            transmit.clear();
        }

        match node.persist() {
            Ok(true) => component_info!("eeprom", "Edge table saved"),
            Ok(false) => {}
            Err(e) => component_warn!("eeprom", "Edge table not saved: {}", e),
        }

        if eof && pending.is_empty() && node.is_idle() {
            break;
        }
    }

    if let Err(e) = node.persist() {
        warn!("Final edge table save failed: {}", e);
    }
    info!("mapstack node stopped");
    Ok(())
}
