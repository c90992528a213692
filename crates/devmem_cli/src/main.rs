//! devmem CLI for inspecting the handle protocol and exercising device memory.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use devmem::{fence, Device, DeviceMemory, FenceTier, MemoryConfig};

#[derive(Parser)]
#[command(name = "devmem")]
#[command(author, version)]
#[command(about = "Device memory handle diagnostics")]
#[command(long_about = "devmem: lifetime protocol for handles to native device memory.

EXAMPLES:
  # Show the process configuration and reachability fence tier
  devmem info

  # Write and read back 4 KiB on host-backed device 0
  devmem roundtrip --bytes 4096

  # Same, through the slice [128, 1152)
  devmem roundtrip --bytes 4096 --from 128 --to 1152

ENVIRONMENT:
  DEVMEM_REACHABILITY_NATIVE    Use the native-call fence when the intrinsic is unavailable")]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the process configuration and fence tier
    Info,
    /// Allocate, write a pattern, read it back and verify
    Roundtrip {
        /// Allocation size in bytes
        #[arg(long, default_value = "4096", value_name = "N")]
        bytes: u64,

        /// Device identifier
        #[arg(long, default_value = "0", value_name = "ID")]
        device: u32,

        /// Start offset of the slice to go through
        #[arg(long, value_name = "OFFSET", requires = "to")]
        from: Option<u64>,

        /// End offset (exclusive) of the slice to go through
        #[arg(long, value_name = "OFFSET", requires = "from")]
        to: Option<u64>,

        /// Use the CUDA backend
        #[arg(long, default_value = "false")]
        cuda: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::filter::LevelFilter::from_level(log_level))
        .init();

    match cli.command {
        Commands::Info => handle_info(),
        Commands::Roundtrip {
            bytes,
            device,
            from,
            to,
            cuda,
        } => handle_roundtrip(bytes, device, from.zip(to), cuda),
    }
}

fn handle_info() -> Result<()> {
    let config = MemoryConfig::global();
    let tier = FenceTier::current();

    println!("devmem {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Configuration:");
    println!("  reachability_native_call: {}", config.reachability_native_call);
    println!();
    println!("Reachability fence:");
    println!("  intrinsic compiled in:    {}", fence::intrinsic_available());
    println!(
        "  selected tier:            {} ({})",
        tier,
        if tier.is_guaranteed() { "guaranteed" } else { "mitigation only" }
    );
    println!();
    println!("Backends:");
    println!("  Host:                     available");
    print_cuda_info();

    Ok(())
}

#[cfg(feature = "cuda")]
fn print_cuda_info() {
    match devmem::CudaBackend::device_count() {
        Ok(count) => println!("  CUDA:                     {} device(s)", count),
        Err(e) => println!("  CUDA:                     unavailable ({})", e),
    }
}

#[cfg(not(feature = "cuda"))]
fn print_cuda_info() {
    println!("  CUDA:                     not compiled in");
}

fn open_device(device: u32, cuda: bool) -> Result<Device> {
    if cuda {
        return open_cuda(device);
    }
    Ok(Device::host(device))
}

#[cfg(feature = "cuda")]
fn open_cuda(device: u32) -> Result<Device> {
    Device::cuda(device).with_context(|| format!("Failed to open CUDA device {}", device))
}

#[cfg(not(feature = "cuda"))]
fn open_cuda(_device: u32) -> Result<Device> {
    bail!("--cuda requires building with the `cuda` feature")
}

fn handle_roundtrip(bytes: u64, device: u32, window: Option<(u64, u64)>, cuda: bool) -> Result<()> {
    let device = open_device(device, cuda)?;
    tracing::info!("Using {} backend on device {}", device.backend().name(), device.id());

    let memory = DeviceMemory::new(&device, bytes)
        .with_context(|| format!("Failed to allocate {} bytes", bytes))?;

    let result = roundtrip(&memory, window);
    let closed = memory.close().context("Failed to release device memory");

    let verified = result?;
    closed?;

    println!(
        "Verified {} bytes on {} device {} ({})",
        verified,
        device.backend().name(),
        device.id(),
        match window {
            Some((from, to)) => format!("slice [{}, {})", from, to),
            None => "whole region".to_string(),
        }
    );
    Ok(())
}

/// Write a pattern through `window` (or the whole region), read it back and
/// compare. Returns the number of bytes verified.
fn roundtrip(memory: &DeviceMemory, window: Option<(u64, u64)>) -> Result<usize> {
    let target = match window {
        Some((from, to)) => memory
            .slice(from, to)
            .with_context(|| format!("Failed to slice [{}, {})", from, to))?,
        None => memory.clone(),
    };

    let len = usize::try_from(target.length()).context("Region does not fit in host memory")?;
    let pattern: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();

    target
        .copy_from_host(&pattern)
        .context("Host to device transfer failed")?;

    let mut readback = vec![0u8; len];
    target
        .copy_to_host(&mut readback)
        .context("Device to host transfer failed")?;

    if let Some(index) = pattern.iter().zip(&readback).position(|(a, b)| a != b) {
        bail!(
            "Mismatch at byte {}: wrote {:#04x}, read {:#04x}",
            index,
            pattern[index],
            readback[index]
        );
    }
    Ok(len)
}
