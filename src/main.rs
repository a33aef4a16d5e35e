//! `labctl`: command-line access to configured instruments.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use lab_instruments::block::{BinaryFormat, BlockDataType};
use lab_instruments::catalog::InstrumentLookup;
use lab_instruments::config::{LabConfig, DEFAULT_CONFIG_PATH};
use lab_instruments::{parse_resource_name, CommandContext, DriverManager, OpenOptions, QuantityValue};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Control lab instruments from the command line")]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log level, overriding the configuration and RUST_LOG
    #[arg(long)]
    log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print how an address string is classified
    ParseAddress { address: String },
    /// List configured instruments
    List,
    /// Read a quantity
    Get {
        instrument: String,
        quantity: String,
        #[arg(long)]
        ch: Option<i64>,
        /// Read the reply as a binary block of this type code (b B h H i I q Q f d)
        #[arg(long, value_name = "CODE", value_parser = parse_datatype)]
        binary: Option<BlockDataType>,
        /// Binary block is big-endian
        #[arg(long, requires = "binary")]
        big_endian: bool,
    },
    /// Write a quantity
    Set {
        instrument: String,
        quantity: String,
        /// JSON value (`1.5`, `true`, `[0.1, 0.2]`) or plain text
        value: String,
        #[arg(long)]
        ch: Option<i64>,
    },
    /// Apply the configured init profile
    Init { instrument: String },
    /// Drain the instrument error queue
    Errors { instrument: String },
    /// Send a raw query
    Query {
        instrument: String,
        message: String,
        #[arg(long)]
        check_errors: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Command::ParseAddress { address } = &cli.command {
        init_tracing(cli.log_level.as_deref(), "info", cli.json);
        return print_address(address);
    }

    let config = LabConfig::load_from(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    init_tracing(cli.log_level.as_deref(), &config.logging.level, cli.json);

    let mut manager = DriverManager::from_config(&config);
    let result = run(&config, &mut manager, cli.command).await;
    manager.close_all().await?;
    result
}

async fn run(config: &LabConfig, manager: &mut DriverManager, command: Command) -> Result<()> {
    match command {
        Command::ParseAddress { address } => print_address(&address)?,
        Command::List => {
            for name in config.instrument_names() {
                if let Some(record) = config.instrument_by_name(&name) {
                    println!("{:<16} {:<20} {}", record.name, record.driver, record.address);
                }
            }
        }
        Command::Get {
            instrument,
            quantity,
            ch,
            binary,
            big_endian,
        } => {
            let mut ctx = context(ch);
            if let Some(datatype) = binary {
                ctx = ctx.binary(BinaryFormat::new(datatype, big_endian));
            }
            let driver = manager.open(instrument.as_str(), OpenOptions::default()).await?;
            let mut driver = driver.lock().await;
            match driver.get_value(&quantity, &ctx).await? {
                Some(value) => {
                    let unit = driver
                        .core()
                        .quantity(&quantity)
                        .and_then(|q| q.unit.as_deref())
                        .unwrap_or_default();
                    println!("{value} {unit}");
                }
                None => bail!("{instrument} has no quantity '{quantity}'"),
            }
        }
        Command::Set {
            instrument,
            quantity,
            value,
            ch,
        } => {
            let value = parse_value(&value);
            let driver = manager.open(instrument.as_str(), OpenOptions::default()).await?;
            let mut driver = driver.lock().await;
            if !driver.core().has_quantity(&quantity) {
                bail!("{instrument} has no quantity '{quantity}'");
            }
            driver.set_value(&quantity, value, &context(ch)).await?;
            if let Some(q) = driver.core().quantity(&quantity) {
                println!("{q}");
            }
        }
        Command::Init { instrument } => {
            let driver = manager.open(instrument.as_str(), OpenOptions::default()).await?;
            let mut driver = driver.lock().await;
            driver.init(None).await?;
            for quantity in driver.core().quantities() {
                println!("{quantity}");
            }
        }
        Command::Errors { instrument } => {
            let driver = manager.open(instrument.as_str(), OpenOptions::default()).await?;
            let errors = driver.lock().await.errors().await?;
            if errors.is_empty() {
                println!("No errors");
            }
            for e in errors {
                println!("{e}");
            }
        }
        Command::Query {
            instrument,
            message,
            check_errors,
        } => {
            let driver = manager.open(instrument.as_str(), OpenOptions::default()).await?;
            let mut driver = driver.lock().await;
            match driver.query(&message, check_errors).await? {
                Some(response) => println!("{response}"),
                None => bail!("{instrument} does not accept raw queries"),
            }
        }
    }
    Ok(())
}

fn print_address(address: &str) -> Result<()> {
    let descriptor = parse_resource_name(address);
    println!("{}", serde_json::to_string_pretty(&descriptor)?);
    Ok(())
}

fn context(ch: Option<i64>) -> CommandContext {
    match ch {
        Some(ch) => CommandContext::new().with("ch", ch),
        None => CommandContext::new(),
    }
}

fn parse_datatype(code: &str) -> Result<BlockDataType, String> {
    let mut chars = code.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => {
            BlockDataType::from_code(c).ok_or_else(|| format!("unknown type code '{c}'"))
        }
        _ => Err(format!("expected a single type code, got '{code}'")),
    }
}

fn parse_value(raw: &str) -> QuantityValue {
    serde_json::from_str(raw).unwrap_or_else(|_| QuantityValue::String(raw.to_string()))
}

/// `--log-level` wins over RUST_LOG, which wins over the configured level.
fn init_tracing(explicit: Option<&str>, configured: &str, json: bool) {
    let filter = match explicit {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(configured)),
    };
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
