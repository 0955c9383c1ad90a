use std::net::TcpListener;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use trek_core::blockdev::{BlockDevice, FileBlockDevice};
use trek_core::config::BridgeConfig;
use trek_core::nbd::{ExportDescriptor, NbdServer};
use trek_core::session::DeviceSession;
use trek_core::translator::BlockIo;
use trek_core::transport::NusbTransport;

#[derive(Parser, Debug)]
#[command(author, version, about = "Trek ThumbDrive to NBD bridge (Pure Rust)", long_about = None)]
struct Args {
    /// Load settings from a TOML file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write the effective settings to a TOML file before serving
    #[arg(long)]
    save_config: Option<PathBuf>,

    /// Serve a disk image instead of the USB device
    #[arg(long)]
    file: Option<PathBuf>,

    /// Address to listen on
    #[arg(long)]
    bind: Option<String>,

    /// TCP port
    #[arg(short, long)]
    port: Option<u16>,

    /// Export read-only
    #[arg(long)]
    ro: bool,

    /// Export name
    #[arg(long)]
    export_name: Option<String>,

    /// Largest number of sectors per USB transaction
    #[arg(long)]
    max_chunk_blocks: Option<u32>,

    /// USB transfer timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// USB vendor ID (hex)
    #[arg(long, value_parser = parse_hex_u16)]
    vid: Option<u16>,

    /// USB product ID (hex)
    #[arg(long, value_parser = parse_hex_u16)]
    pid: Option<u16>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn parse_hex_u16(s: &str) -> Result<u16, String> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    u16::from_str_radix(digits, 16).map_err(|e| format!("invalid hex id '{}': {}", s, e))
}

impl Args {
    /// Command line flags override the config file.
    fn apply(&self, config: &mut BridgeConfig) {
        if let Some(path) = &self.file {
            config.image_path = Some(path.clone());
        }
        if let Some(bind) = &self.bind {
            config.bind_address = bind.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if self.ro {
            config.read_only = true;
        }
        if let Some(name) = &self.export_name {
            config.export_name = name.clone();
        }
        if let Some(blocks) = self.max_chunk_blocks {
            config.max_chunk_blocks = blocks;
        }
        if let Some(timeout) = self.timeout_ms {
            config.usb_timeout_ms = timeout;
        }
        if let Some(vid) = self.vid {
            config.vendor_id = vid;
        }
        if let Some(pid) = self.pid {
            config.product_id = pid;
        }
    }
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    info!("Starting trek-nbd (nusb backend)...");

    if let Err(e) = run(&args) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => BridgeConfig::load_from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => BridgeConfig::default(),
    };
    args.apply(&mut config);
    config.validate()?;

    if let Some(path) = &args.save_config {
        config.save_to_file(path)?;
        info!(path = %path.display(), "Configuration saved");
    }

    match &config.image_path {
        Some(path) => {
            let device = FileBlockDevice::open(path, config.read_only)
                .with_context(|| format!("opening image {}", path.display()))?;
            serve(device, &config)
        }
        None => {
            let transport = NusbTransport::open_with_ids(
                config.vendor_id,
                config.product_id,
                config.usb_timeout(),
            )?;
            let session = DeviceSession::open_with(transport, config.session_options())
                .context("initializing device")?;
            serve(session, &config)
        }
    }
}

fn serve<D: BlockDevice + 'static>(device: D, config: &BridgeConfig) -> Result<()> {
    let description = device.describe();
    info!(device = %description, "Block device ready");

    let io = BlockIo::with_chunk_blocks(device, config.max_chunk_blocks);
    let export = ExportDescriptor::new(config.export_name.clone(), io.capacity(), config.read_only)
        .with_description(description);

    let address = config.listen_address();
    let listener =
        TcpListener::bind(&address).with_context(|| format!("binding {}", address))?;
    info!(
        "Attach with: nbd-client -N {} <host> {} /dev/nbd0",
        config.export_name, config.port
    );

    NbdServer::new(io, export).serve(listener)?;
    Ok(())
}
