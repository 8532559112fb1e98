use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use color_eyre::Result;
use color_eyre::eyre::eyre;
use storxlat::io::DeviceId;
use storxlat::scsi::command as cdb;
use storxlat::scsi::response::{inquiry_response, read_capacity_10_response};
use storxlat::usb::{UsbBulkOnlyIo, device_id};
use storxlat::{CommandContext, Config, DataBuffer, DeviceSession, ProtocolCompletion};
use tracing_subscriber::EnvFilter;

/// Probe USB mass storage devices and issue a few identify commands.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Device to open, as `bus:address`. Lists devices when omitted.
    device: Option<String>,

    /// TOML configuration file.
    #[arg(short, long, env = "STORXLAT_CONFIG")]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = Config::load(args.config.as_deref())?;
    let io = Arc::new(UsbBulkOnlyIo::new()?);

    let Some(device) = args.device else {
        for info in io.list()? {
            println!(
                "{}  {:04x}:{:04x}  {}",
                device_id(&info),
                info.vendor_id(),
                info.product_id(),
                info.product_string().unwrap_or("")
            );
        }
        return Ok(());
    };

    let session = DeviceSession::open(io, &DeviceId::new(device), &config)?;
    let profile = session.profile();
    println!("family:      {:?}", profile.family());
    println!("interface:   {:?}", profile.interface());
    println!("block size:  {}", profile.block_size());
    println!("features:    {:?}", profile.features());
    println!(
        "dialects:    {}",
        profile
            .transports()
            .iter()
            .map(|d| d.dialect.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );

    let mut buf = [0u8; 36];
    let completion = session.execute(&mut CommandContext::scsi(
        cdb::inquiry(36),
        DataBuffer::In(&mut buf),
    ))?;
    ensure_success(&completion)?;
    let inquiry = inquiry_response(&buf)?;
    println!("vendor:      {}", inquiry.vendor);
    println!("product:     {}", inquiry.product);

    let mut buf = [0u8; 8];
    let completion = session.execute(&mut CommandContext::scsi(
        cdb::read_capacity_10(),
        DataBuffer::In(&mut buf),
    ))?;
    ensure_success(&completion)?;
    let capacity = read_capacity_10_response(&buf)?;
    println!(
        "capacity:    {} blocks of {} bytes",
        u64::from(capacity.last_lba) + 1,
        capacity.block_length
    );
    Ok(())
}

fn ensure_success(completion: &ProtocolCompletion) -> Result<()> {
    if completion.is_success() {
        Ok(())
    } else {
        Err(eyre!("command failed: {completion:?}"))
    }
}
