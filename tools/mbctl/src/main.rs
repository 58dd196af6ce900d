//! mbctl - Modbus TCP master command line
//!
//! Runs one read or write against a slave and prints the result.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use modbus_master::{ModbusAddress, ModbusClient, ModbusConfig};
use serde_json::json;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mbctl")]
#[command(about = "Modbus TCP master command line")]
#[command(long_about = "Modbus TCP master command line

Addresses use the 5-digit convention:
  00001-09999  coils
  10001-19999  discrete inputs
  30001-39999  input registers
  40001-49999  holding registers

Examples:
  mbctl --host 192.168.1.10 read-holding 40001 4
  mbctl -c plc.toml write-coil 17 on
  mbctl --unit 3 --json read-float 40101")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Connection config file (TOML, YAML or JSON); MODBUS_* env vars override it
    #[arg(short = 'c', long = "config", global = true)]
    config: Option<PathBuf>,

    /// Slave host
    #[arg(long, global = true)]
    host: Option<String>,

    /// Slave port
    #[arg(short, long, global = true)]
    port: Option<u16>,

    /// Unit id
    #[arg(short, long, global = true)]
    unit: Option<u8>,

    /// Response timeout per attempt in milliseconds
    #[arg(long = "timeout-ms", global = true)]
    timeout_ms: Option<u64>,

    /// Retries after the first attempt
    #[arg(long, global = true)]
    retries: Option<u32>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Read coils (FC01)
    ReadCoils { address: i32, count: u16 },

    /// Read discrete inputs (FC02)
    ReadDiscrete { address: i32, count: u16 },

    /// Read holding registers (FC03)
    ReadHolding { address: i32, count: u16 },

    /// Read input registers (FC04)
    ReadInput { address: i32, count: u16 },

    /// Read a float from two holding registers, high word first
    ReadFloat { address: i32 },

    /// Write a single coil (FC05): on/off, true/false or 1/0
    WriteCoil {
        address: i32,
        #[arg(action = clap::ArgAction::Set, value_parser = parse_switch)]
        value: bool,
    },

    /// Write a single holding register (FC06)
    WriteRegister { address: i32, value: u16 },

    /// Write consecutive coils (FC15), comma separated
    WriteCoils {
        address: i32,
        #[arg(value_delimiter = ',', value_parser = parse_switch, required = true)]
        values: Vec<bool>,
    },

    /// Write consecutive holding registers (FC16), comma separated
    WriteRegisters {
        address: i32,
        #[arg(value_delimiter = ',', required = true)]
        values: Vec<u16>,
    },

    /// Write a float to two holding registers, high word first
    WriteFloat {
        address: i32,
        #[arg(allow_negative_numbers = true)]
        value: f32,
    },
}

fn parse_switch(raw: &str) -> Result<bool, String> {
    match raw.to_ascii_lowercase().as_str() {
        "on" | "true" | "1" => Ok(true),
        "off" | "false" | "0" => Ok(false),
        other => Err(format!("expected on/off, got '{other}'")),
    }
}

enum Outcome {
    Bits(i32, Vec<bool>),
    Registers(i32, Vec<u16>),
    Float(i32, f32),
    Written(i32, usize),
}

fn load_config(cli: &Cli) -> Result<ModbusConfig> {
    let mut config = match &cli.config {
        Some(path) => ModbusConfig::load(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => ModbusConfig::from_env().context("Failed to load MODBUS_* environment")?,
    };

    if let Some(host) = &cli.host {
        config.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(unit) = cli.unit {
        config.unit_id = unit;
    }
    if let Some(timeout_ms) = cli.timeout_ms {
        config = config.with_timeout(Duration::from_millis(timeout_ms));
    }
    if let Some(retries) = cli.retries {
        config.retries = retries;
    }
    // One-shot tool: connect on the first request
    config.keep_alive = false;
    config.validate()?;
    Ok(config)
}

async fn run(client: &ModbusClient, command: &Commands) -> Result<Outcome> {
    let outcome = match command {
        Commands::ReadCoils { address, count } => {
            Outcome::Bits(*address, client.read_coils(*address, *count).await?)
        },
        Commands::ReadDiscrete { address, count } => {
            Outcome::Bits(*address, client.read_discrete_inputs(*address, *count).await?)
        },
        Commands::ReadHolding { address, count } => Outcome::Registers(
            *address,
            client.read_holding_registers(*address, *count).await?,
        ),
        Commands::ReadInput { address, count } => Outcome::Registers(
            *address,
            client.read_input_registers(*address, *count).await?,
        ),
        Commands::ReadFloat { address } => {
            Outcome::Float(*address, client.read_float(*address).await?)
        },
        Commands::WriteCoil { address, value } => {
            client.write_single_coil(*address, *value).await?;
            Outcome::Written(*address, 1)
        },
        Commands::WriteRegister { address, value } => {
            client.write_single_register(*address, *value).await?;
            Outcome::Written(*address, 1)
        },
        Commands::WriteCoils { address, values } => {
            client.write_multiple_coils(*address, values).await?;
            Outcome::Written(*address, values.len())
        },
        Commands::WriteRegisters { address, values } => {
            client.write_multiple_registers(*address, values).await?;
            Outcome::Written(*address, values.len())
        },
        Commands::WriteFloat { address, value } => {
            client.write_float(*address, *value).await?;
            Outcome::Written(*address, 2)
        },
    };
    Ok(outcome)
}

fn label(address: i32) -> String {
    ModbusAddress::new(address)
        .map(|a| a.to_string())
        .unwrap_or_else(|_| address.to_string())
}

fn print_outcome(outcome: &Outcome, as_json: bool) -> Result<()> {
    if as_json {
        let value = match outcome {
            Outcome::Bits(address, bits) => json!({ "address": address, "values": bits }),
            Outcome::Registers(address, values) => {
                json!({ "address": address, "values": values })
            },
            Outcome::Float(address, value) => json!({ "address": address, "value": value }),
            Outcome::Written(address, count) => json!({ "address": address, "written": count }),
        };
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    match outcome {
        Outcome::Bits(address, bits) => {
            for (i, bit) in bits.iter().enumerate() {
                let state = if *bit { "ON".green() } else { "OFF".dimmed() };
                println!("{}  {}", label(address + i as i32).bright_cyan(), state);
            }
        },
        Outcome::Registers(address, values) => {
            for (i, value) in values.iter().enumerate() {
                println!(
                    "{}  0x{:04X}  {}",
                    label(address + i as i32).bright_cyan(),
                    value,
                    value
                );
            }
        },
        Outcome::Float(address, value) => {
            println!("{}  {}", label(*address).bright_cyan(), value);
        },
        Outcome::Written(address, count) => {
            println!(
                "{} Wrote {} value(s) at {}",
                "OK".green(),
                count,
                label(*address)
            );
        },
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    // RUST_LOG wins over --verbose
    let log_level = if cli.verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(&cli)?;
    tracing::debug!("Target {} unit {}", config.endpoint(), config.unit_id);

    let client = ModbusClient::connect(config).await?;
    let result = run(&client, &cli.command).await;
    client.close().await;

    match result {
        Ok(outcome) => print_outcome(&outcome, cli.json),
        Err(e) => {
            eprintln!("{} {}", "ERROR".red(), e);
            bail!("operation failed")
        },
    }
}
