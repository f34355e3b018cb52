//! Port detection tool
//!
//! Finds the serial port an ECU (or an OBD adapter in front of it) is
//! attached to, and optionally brings the adapter up.
//!
//! Usage:
//!   cargo run --example detect -- [OPTIONS] [PORT...]
//!
//! Options:
//!   --adapter         Look for an ELM327-class adapter instead of the ECU
//!   --deadline MS     How long to wait for a winner (default: 5000)
//!   --config FILE     Load detector settings from a JSON file
//!   --start           After finding an adapter, configure it and report its voltage
//!
//! Without PORT arguments every serial port on the system is probed.
//! Set RUST_LOG=debug to see every command and frame.

use anyhow::{bail, Context, Result};
use ecu_link_core::prelude::*;
use ecu_link_core::protocol::list_ports;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().collect();

    let mut mode = DetectorMode::BinaryProtocol;
    let mut config = DetectorConfig::default();
    let mut deadline = None;
    let mut start_adapter = false;
    let mut ports = Vec::new();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--adapter" | "-a" => mode = DetectorMode::Adapter,
            "--deadline" | "-d" => {
                i += 1;
                let value = args.get(i).context("--deadline needs a value")?;
                deadline = Some(value.parse::<u64>().context("--deadline must be milliseconds")?);
            }
            "--config" | "-c" => {
                i += 1;
                let path = args.get(i).context("--config needs a file")?;
                config = DetectorConfig::from_file(path)
                    .with_context(|| format!("cannot load {}", path))?;
            }
            "--start" => start_adapter = true,
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            arg if arg.starts_with('-') => bail!("unknown option {}", arg),
            port => ports.push(port.to_string()),
        }
        i += 1;
    }
    if let Some(ms) = deadline {
        config.deadline_ms = ms;
    }

    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║                  ECU Port Detection                        ║");
    println!("╚════════════════════════════════════════════════════════════╝");
    println!();

    if ports.is_empty() {
        let available = list_ports();
        println!("Available ports:");
        for port in &available {
            match (port.vid, port.pid) {
                (Some(vid), Some(pid)) => println!(
                    "  {} [{:04x}:{:04x}] {}",
                    port.name,
                    vid,
                    pid,
                    port.product.as_deref().unwrap_or("")
                ),
                _ => println!("  {}", port.name),
            }
        }
        println!();
        ports = available.into_iter().map(|p| p.name).collect();
    }

    println!("Looking for {:?} on {} port(s)...", mode, ports.len());
    let detector = PortDetector::new(config.clone());
    let outcome = detector.detect(&ports[..], mode);

    let found = match outcome {
        ProbeOutcome::Found(found) => found,
        ProbeOutcome::NotFound => {
            println!("✗ Nothing found within {} ms", config.deadline_ms);
            std::process::exit(1);
        }
    };

    match &found.signature {
        Some(signature) => println!("✓ ECU on {}: {}", found.port, signature),
        None => println!("✓ Adapter on {}", found.port),
    }

    if start_adapter && mode == DetectorMode::Adapter {
        let mut adapter = AdapterSession::open(&SerialOpener, &found.port, config.adapter.clone())
            .with_context(|| format!("cannot open {}", found.port))?;
        let info = adapter.start().context("adapter did not accept its configuration")?;
        println!("  {}", info.version);
        if let Some(voltage) = info.voltage {
            println!("  Supply voltage: {} V", voltage);
        }
        adapter.close();
    }

    Ok(())
}

fn print_help() {
    println!("Usage: detect [OPTIONS] [PORT...]");
    println!();
    println!("Options:");
    println!("  --adapter, -a       Look for an ELM327-class adapter");
    println!("  --deadline, -d MS   Wait at most MS milliseconds (default: 5000)");
    println!("  --config, -c FILE   Load detector settings from JSON");
    println!("  --start             Configure a found adapter and report its voltage");
    println!("  --help, -h          Show this help");
}
