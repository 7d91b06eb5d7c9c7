use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use clap::Subcommand;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use hearthd_drivers::config::format_diagnostics;
use hearthd_drivers::config::Config;
use hearthd_drivers::config::LoggingConfig;
use hearthd_drivers::driver::JsonFileRecordStore;
use hearthd_drivers::driver::RecordStore;
use hearthd_drivers::schema::ConfigSchema;

#[derive(Debug, Parser)]
#[command(name = "hearthd-drivers", about = "Inspect hearthd driver configuration and records")]
struct Cli {
    /// Daemon config files, merged in order.
    #[arg(short, long = "config", global = true)]
    config: Vec<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Load and merge config files, reporting every conflict.
    CheckConfig {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Check a JSON value against a JSON-encoded config schema.
    Validate {
        #[arg(long)]
        schema: PathBuf,
        #[arg(long)]
        value: PathBuf,
    },
    /// List the drivers and devices in a record store.
    Inventory {
        /// Record file; defaults to `store.path` from the config.
        #[arg(long)]
        store: Option<PathBuf>,
    },
}

fn init_logging(logging: &LoggingConfig) {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(logging.targets())
        .init();
}

fn load_config(paths: &[PathBuf]) -> anyhow::Result<Config> {
    if paths.is_empty() {
        return Ok(Config::default());
    }
    let (config, warnings) = Config::from_files(paths).context("Failed to load configuration")?;
    if !warnings.is_empty() {
        eprint!("{}", format_diagnostics(&warnings));
    }
    Ok(config)
}

fn read_json(path: &Path) -> anyhow::Result<serde_json::Value> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read '{}'", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse '{}' as JSON", path.display()))
}

fn check_config(files: &[PathBuf]) -> anyhow::Result<()> {
    let config = load_config(files)?;
    println!("Configuration OK ({} file(s))", files.len());
    println!("  log level: {:?}", config.logging.level);
    println!(
        "  record store: {}",
        config
            .store
            .path
            .as_ref()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "in memory".to_string())
    );
    println!("  invocation timeout: {:?}", config.invocation.timeout());
    match &config.mqtt {
        Some(mqtt) => println!("  mqtt: {}:{} as {}", mqtt.host, mqtt.port, mqtt.client_id),
        None => println!("  mqtt: disabled"),
    }
    Ok(())
}

fn validate(schema: &Path, value: &Path) -> anyhow::Result<()> {
    let schema: ConfigSchema = serde_json::from_value(read_json(schema)?)
        .with_context(|| format!("'{}' is not a config schema", schema.display()))?;
    let value = read_json(value)?;
    hearthd_drivers::schema::validate(&value, &schema)?;
    println!("Value matches {}", schema.kind_name());
    Ok(())
}

async fn inventory(store: &Path) -> anyhow::Result<()> {
    let records = JsonFileRecordStore::open(store)
        .await
        .with_context(|| format!("Failed to open record store '{}'", store.display()))?;

    let drivers = records.drivers().await?;
    println!("Drivers ({}):", drivers.len());
    for driver in &drivers {
        println!("  {}  {} v{}", driver.identity, driver.name, driver.version);
    }

    let devices = records.devices().await?;
    println!("Devices ({}):", devices.len());
    for device in &devices {
        println!(
            "  {}  {} in {} via {}",
            device.id, device.name, device.room_id, device.driver
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::CheckConfig { files } => check_config(&files),
        Command::Validate { schema, value } => {
            init_logging(&load_config(&cli.config)?.logging);
            validate(&schema, &value)
        }
        Command::Inventory { store } => {
            let config = load_config(&cli.config)?;
            init_logging(&config.logging);
            let store = store
                .or(config.store.path)
                .context("No record store given; pass --store or set store.path")?;
            tracing::debug!("Opening record store {}", store.display());
            inventory(&store).await
        }
    }
}
