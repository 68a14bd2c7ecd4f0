use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::info;

use abyss_link::firmware::FirmwareRelease;
use abyss_link::protocol::{Frame, crc16};

#[derive(Parser, Debug)]
#[command(author, version, about = "Abyss One link protocol tool", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Decode a captured frame from hex and print its fields
    Decode {
        /// Frame bytes as hex, e.g. 810001000512...
        hex: String,
    },
    /// Compute the CRC-16 of hex bytes (poly 0x1021, init 0xFFFF)
    Crc {
        /// Input bytes as hex
        hex: String,
    },
    /// Compare a device firmware version against a release manifest
    CheckUpdate {
        /// Version the device reported during handshake
        #[arg(long)]
        current: String,
        /// Path to a JSON release manifest from /firmware/latest
        #[arg(long)]
        manifest: String,
    },
}

fn main() -> Result<()> {
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

    match args.command {
        Command::Decode { hex } => decode_frame(&hex),
        Command::Crc { hex } => compute_crc(&hex),
        Command::CheckUpdate { current, manifest } => check_update(&current, &manifest),
    }
}

fn decode_frame(input: &str) -> Result<()> {
    let bytes = hex::decode(input.trim()).context("input is not valid hex")?;
    let Some(frame) = Frame::decode(&bytes) else {
        bail!("not a well-formed frame (short, truncated, or bad checksum)");
    };
    println!("operation : 0x{:02X}", frame.operation);
    println!("sequence  : {}", frame.sequence);
    println!("payload   : {} bytes", frame.payload.len());
    if !frame.payload.is_empty() {
        println!("          : {}", hex::encode(&frame.payload));
    }
    Ok(())
}

fn compute_crc(input: &str) -> Result<()> {
    let bytes = hex::decode(input.trim()).context("input is not valid hex")?;
    println!("0x{:04X}", crc16(&bytes));
    Ok(())
}

fn check_update(current: &str, manifest_path: &str) -> Result<()> {
    let content = std::fs::read_to_string(manifest_path)
        .with_context(|| format!("reading manifest {manifest_path}"))?;
    let release: FirmwareRelease =
        serde_json::from_str(&content).context("parsing release manifest")?;
    info!(model = %release.model, latest = %release.version, "loaded manifest");

    if release.is_newer_than(current)? {
        println!(
            "update available: {} -> {}{}",
            current,
            release.version,
            if release.mandatory { " (mandatory)" } else { "" }
        );
        println!("image: {} ({} bytes)", release.url, release.size);
        if !release.release_notes.is_empty() {
            println!("notes: {}", release.release_notes);
        }
    } else {
        println!("device firmware {current} is up to date");
    }
    Ok(())
}
