//! Manual bench-test harness: opens a real COBS/CRC-framed serial port and
//! runs a [`ReplayServer`] against it, so a client implementation can be
//! exercised against actual serial hardware (a loopback cable, a USB-CAN
//! bridge, or a second machine) instead of only the in-process fixture.

use std::path::PathBuf;

use clap::Parser;
use log::info;
use propcan::manifest::parse_manifest_yaml;
use propcan::model::NodeId;
use propcan_serialcan::SerialCanTransport;
use propcan_testfixture::ReplayServer;

#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    #[arg(help = "Serial device to listen on, e.g. /dev/ttyUSB0")]
    port: String,

    #[arg(long, default_value_t = 115_200, help = "Serial baud rate")]
    baud: u32,

    #[arg(long, default_value_t = 1, help = "Node id this fixture answers as")]
    node: u8,

    #[arg(long, help = "YAML manifest to serve; a minimal empty manifest is used if omitted")]
    manifest: Option<PathBuf>,

    #[arg(short, long, help = "Show debug messages")]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(if args.debug {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    let manifest = match &args.manifest {
        Some(path) => {
            let source = std::fs::read_to_string(path)?;
            parse_manifest_yaml(&source)?
        }
        None => propcan::manifest::Manifest::new("bench-fixture".to_string(), Vec::new()),
    };

    let node_id = NodeId::new(args.node)?;
    let mut server = ReplayServer::new(node_id, &manifest)?;

    let mut transport = SerialCanTransport::open(&args.port, args.baud)?;
    info!("replay fixture listening on {} as node {}", args.port, args.node);
    server.run(&mut transport).await?;

    Ok(())
}
