use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use wlcp_core::bus::MockBus;
use wlcp_core::engine::{Engine, EngineConfig};
use wlcp_core::protocol::constants::{
    CHIP_ID_SUPPORTED, IND_CTRL_DONE, INTR_INIT_COMPLETE, MEM_WORKING_BASE, REG_CHIP_ID,
    REG_CMD_MAILBOX_PTR, REG_ECPU_CONTROL, REG_EVENT_MAILBOX_PTR, REG_IND_CTRL, REG_IND_DATA,
    REG_INTERRUPT_NO_CLEAR, REG_SOFT_RESET, TOP_REG_FIXUPS,
};
use wlcp_core::protocol::DeviceInfo;

/// Chunk granularity for the dry-run download, mimicking the portions a
/// platform delivers.
const CHUNK_SIZE: usize = 32 * 1024;

#[derive(Parser, Debug)]
#[command(author, version, about = "WLAN coprocessor control-plane tool", long_about = None)]
struct Args {
    /// Path to the firmware image
    #[arg(long)]
    firmware: String,

    /// Path to a calibration (NVS) blob; built-in defaults otherwise
    #[arg(long)]
    nvs: Option<String>,

    /// Path to an engine configuration TOML file
    #[arg(long)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
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

    if let Err(e) = run(&args) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

/// Dry-run the full bring-up against the mock bus: validates the image and
/// walks every boot and download stage exactly as the hardware path would.
fn run(args: &Args) -> Result<()> {
    let config = match &args.config {
        Some(path) => EngineConfig::load_from_file(path)
            .with_context(|| format!("loading engine config from {path}"))?,
        None => EngineConfig::default(),
    };

    let firmware = std::fs::read(&args.firmware)
        .with_context(|| format!("reading firmware from {}", args.firmware))?;
    let nvs = match &args.nvs {
        Some(path) => {
            Some(std::fs::read(path).with_context(|| format!("reading NVS from {path}"))?)
        }
        None => None,
    };

    info!(
        firmware = %args.firmware,
        len = firmware.len(),
        "starting dry-run bring-up"
    );

    let mut bus = MockBus::new();
    script_healthy_device(&mut bus);
    let mut engine = Engine::new(bus, config);

    engine.boot(nvs.as_deref())?;

    let mut base = MEM_WORKING_BASE;
    let chunks: Vec<&[u8]> = firmware.chunks(CHUNK_SIZE).collect();
    let last = chunks.len().saturating_sub(1);
    for (i, chunk) in chunks.iter().enumerate() {
        engine.load_firmware(chunk, base, i == last)?;
        base += chunk.len() as u32;
    }

    let info = engine
        .store()
        .device_info()
        .context("firmware reported no static information")?;
    let mac = info
        .mac_address
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":");
    info!(%mac, version = %info.fw_version, phase = %engine.phase(), "dry run complete");
    Ok(())
}

/// Script the mock bus with the responses a healthy device gives during
/// boot and the finalize handshake.
fn script_healthy_device(bus: &mut MockBus) {
    let cmd_mbox = MEM_WORKING_BASE + 0x1000;
    let event_mbox = MEM_WORKING_BASE + 0x2000;

    bus.script_reg(REG_CHIP_ID, CHIP_ID_SUPPORTED);
    bus.script_reg(REG_SOFT_RESET, 0);
    bus.script_reg(REG_CHIP_ID, CHIP_ID_SUPPORTED);
    for _ in 0..TOP_REG_FIXUPS.len() {
        bus.script_reg(REG_IND_CTRL, IND_CTRL_DONE);
        bus.script_reg(REG_IND_DATA, 0);
        bus.script_reg(REG_IND_CTRL, IND_CTRL_DONE);
    }
    bus.script_reg(REG_ECPU_CONTROL, 0);
    bus.script_reg(REG_INTERRUPT_NO_CLEAR, INTR_INIT_COMPLETE);
    bus.script_reg(REG_CMD_MAILBOX_PTR, cmd_mbox);

    let mut static_info = vec![0u8; DeviceInfo::SIZE];
    static_info[..6].copy_from_slice(&[0x01, 0x00, 0xEF, 0xBE, 0xAD, 0xDE]);
    static_info[8..14].copy_from_slice(b"sim1.0");
    bus.script_read(cmd_mbox, static_info);
    bus.script_reg(REG_EVENT_MAILBOX_PTR, event_mbox);
}
