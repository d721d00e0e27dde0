// roampool: BLE roaming pool command-line interface
//
// Runs the roaming coordinator over host BLE adapters, manages the bonding
// database and plays a scripted roaming demo over simulated radios.

mod config;
mod radio;
mod simulate;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use roampool_core::roaming::RoamEvent;
use roampool_core::store::{BondingStore, JsonFileBackend};
use roampool_core::transport::Transport;
use roampool_core::{EndpointId, RoamingConfig, RoamingNetwork, TopologySnapshot};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Mutex;
use tracing_appender::non_blocking::WorkerGuard;

#[derive(Parser)]
#[command(name = "roampool")]
#[command(about = "BLE roaming pool: several radios, one identity", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log as JSON lines
    #[arg(long, global = true)]
    json: bool,

    /// Also write logs to a daily rolling file in this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pool over host BLE adapters
    Run {
        /// Adapter to use (repeatable); overrides the configured list
        #[arg(short, long = "transport")]
        transports: Vec<String>,
        /// Wipe stored bonds before starting
        #[arg(long)]
        delete_bonds: bool,
    },
    /// Inspect or clear the bonding database
    Bonds {
        #[command(subcommand)]
        action: BondsAction,
    },
    /// Show or change configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Scripted roaming demo over simulated radios
    Simulate {
        /// Time scale; 2.0 runs twice as fast
        #[arg(long, default_value = "1.0")]
        speed: f64,
    },
}

#[derive(Subcommand)]
enum BondsAction {
    List,
    Clear,
}

#[derive(Subcommand)]
enum ConfigAction {
    Show,
    Set { key: String, value: String },
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = init_tracing(cli.json, cli.log_dir.as_deref())?;

    match cli.command {
        Commands::Run {
            transports,
            delete_bonds,
        } => cmd_run(cli.config, transports, delete_bonds).await,
        Commands::Bonds { action } => cmd_bonds(cli.config, action),
        Commands::Config { action } => cmd_config(cli.config, action),
        Commands::Simulate { speed } => simulate::run(speed).await,
    }
}

fn init_tracing(json: bool, log_dir: Option<&std::path::Path>) -> Result<Option<WorkerGuard>> {
    use tracing_subscriber::fmt::writer::BoxMakeWriter;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (writer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "roampool.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (BoxMakeWriter::new(writer), Some(guard))
        }
        None => (BoxMakeWriter::new(std::io::stderr), None),
    };

    let layer = if json {
        fmt::layer().json().with_writer(writer).boxed()
    } else {
        fmt::layer().with_writer(writer).boxed()
    };
    tracing_subscriber::registry().with(filter).with(layer).init();
    Ok(guard)
}

fn open_bonds(config: &RoamingConfig) -> BondingStore {
    BondingStore::open_or_degraded(Arc::new(JsonFileBackend::new(&config.bonding_db_path)))
}

async fn cmd_run(config_path: Option<PathBuf>, transports: Vec<String>, delete_bonds: bool) -> Result<()> {
    let mut config = config::load(config_path.as_deref())?;
    if !transports.is_empty() {
        config.transports = transports;
    }
    config.delete_bonds_on_start |= delete_bonds;
    if config.transports.is_empty() {
        anyhow::bail!("No transports configured; pass --transport <adapter> or set \"transports\"");
    }

    println!("{}", "Starting roaming pool...".bold());
    for (n, name) in config.transports.iter().enumerate() {
        println!("  {} {} {}", "•".bright_green(), EndpointId(n as u16).to_string().bright_cyan(), name);
    }
    println!("  Bonds: {}", config.bonding_db_path.display().to_string().dimmed());
    println!();

    let bonds = open_bonds(&config);
    let radios: Vec<Box<dyn Transport>> = config
        .transports
        .iter()
        .map(|name| Box::new(radio::HostRadio::new(name.clone())) as Box<dyn Transport>)
        .collect();
    let network = RoamingNetwork::start(config, radios, bonds).context("Failed to start pool")?;

    let latest: Arc<Mutex<Option<TopologySnapshot>>> = Arc::new(Mutex::new(None));
    let mut events = network.subscribe();
    let latest_rx = latest.clone();
    let event_task = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let RoamEvent::TopologyChanged(snapshot) = &event {
                        *latest_rx.lock().await = Some(snapshot.clone());
                    }
                    print_event(&event);
                }
                Err(RecvError::Lagged(n)) => println!("{} {} events dropped", "!".yellow(), n),
                Err(RecvError::Closed) => break,
            }
        }
    });

    println!("{}", "Commands:".bold());
    println!("  {}         ", "topology".bright_green());
    println!("  {} <n>      ", "reset".bright_green());
    println!("  {}             ", "quit".bright_green());
    println!();

    let stdin_loop = async {
        use tokio::io::AsyncBufReadExt;

        let stdin = tokio::io::BufReader::new(tokio::io::stdin());
        let mut lines = stdin.lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim();
            match line.split_whitespace().collect::<Vec<_>>().as_slice() {
                [] => {}
                ["quit"] | ["exit"] => break,
                ["topology"] => match &*latest.lock().await {
                    Some(snapshot) => print_topology(snapshot),
                    None => println!("{}", "No topology yet.".dimmed()),
                },
                ["reset", n] => match n.parse::<u16>() {
                    Ok(n) => match network.reset_endpoint(EndpointId(n)) {
                        Ok(()) => println!("{} Reset requested for {}", "✓".green(), EndpointId(n)),
                        Err(e) => println!("{} {}", "✗".red(), e),
                    },
                    Err(_) => println!("{} Not an endpoint number: {}", "✗".red(), n),
                },
                _ => println!("Unknown command: {}", line),
            }
        }
    };

    tokio::select! {
        _ = stdin_loop => {}
        _ = tokio::signal::ctrl_c() => println!(),
    }

    println!("Shutting down...");
    network.stop().await.context("Failed to stop pool")?;
    event_task.abort();
    Ok(())
}

fn cmd_bonds(config_path: Option<PathBuf>, action: BondsAction) -> Result<()> {
    let config = config::load(config_path.as_deref())?;
    let path = &config.bonding_db_path;
    let mut store = BondingStore::open_file(path)
        .with_context(|| format!("Failed to open bonding database {}", path.display()))?;

    match action {
        BondsAction::List => {
            let records = store.records();
            if records.is_empty() {
                println!("{}", "No bonds stored.".dimmed());
                return Ok(());
            }
            println!("{} ({} total)", "Bonds".bold(), records.len());
            println!();
            for record in records {
                println!(
                    "  {} {} ({})",
                    "•".bright_green(),
                    record.peer_address.to_string().bright_cyan(),
                    record.address_type
                );
                let key = record.key_material.to_hex();
                println!("    Key:     {}…", &key[..key.len().min(8)]);
                println!("    Updated: {}", format_timestamp(record.last_updated).dimmed());
            }
        }
        BondsAction::Clear => {
            let count = store.len();
            store.delete_all();
            println!("{} Removed {} bond(s)", "✓".green(), count);
        }
    }
    Ok(())
}

fn cmd_config(config_path: Option<PathBuf>, action: ConfigAction) -> Result<()> {
    let file = match &config_path {
        Some(path) => path.clone(),
        None => config::config_file()?,
    };

    match action {
        ConfigAction::Show => {
            let config = config::load(config_path.as_deref())?;
            println!("{}", "Configuration".bold());
            println!();
            for (key, value) in config::list(&config)? {
                println!("  {:<24} {}", key.bright_cyan(), value);
            }
        }
        ConfigAction::Set { key, value } => {
            // Edit the stored file, not the resolved view of it
            let contents = std::fs::read_to_string(&file).unwrap_or_else(|_| "{}".to_string());
            let mut config: RoamingConfig =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            config::set(&mut config, &key, &value)?;
            config::save(&config, &file)?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }
        ConfigAction::Path => println!("{}", file.display()),
    }
    Ok(())
}

pub(crate) fn print_event(event: &RoamEvent) {
    let time = chrono::Local::now().format("%H:%M:%S%.3f").to_string().dimmed();
    match event {
        RoamEvent::TopologyChanged(snapshot) => {
            println!("{} {} {}", time, "topology".bright_blue(), snapshot)
        }
        RoamEvent::HandoffStarted { .. } => println!("{} {} {}", time, "→".bright_yellow(), event),
        RoamEvent::HandoffCompleted { .. } => println!("{} {} {}", time, "✓".green(), event),
        RoamEvent::HandoffFailed { .. } | RoamEvent::EndpointDisabled { .. } => {
            println!("{} {} {}", time, "✗".red(), event)
        }
        RoamEvent::EndpointRecovered { .. } => println!("{} {} {}", time, "✓".green(), event),
        RoamEvent::Measurement { .. } => println!("{} {} {}", time, "♥".bright_magenta(), event),
    }
}

fn print_topology(snapshot: &TopologySnapshot) {
    println!("{}", "Topology".bold());
    for (id, view) in &snapshot.endpoints {
        println!("  {} {}", id.to_string().bright_cyan(), view.state);
        for peer in &view.served_peers {
            match peer.last_rssi {
                Some(rssi) => println!("    {} {} dBm", peer.peer_address, rssi),
                None => println!("    {}", peer.peer_address),
            }
        }
    }
}

fn format_timestamp(timestamp: u64) -> String {
    use chrono::{DateTime, Local, Utc};

    let dt = DateTime::from_timestamp(timestamp as i64, 0).unwrap_or_else(Utc::now);
    let local: DateTime<Local> = dt.into();

    local.format("%Y-%m-%d %H:%M:%S").to_string()
}
