//! alumnet-realtime - realtime change watcher
//!
//! Connects to the backend's realtime endpoint, subscribes to one table and
//! prints every change as a JSON line on stdout. Status goes to stderr.

use std::path::{Path, PathBuf};
use std::time::Duration;

use alumnet_proto::{EventFilter, FilterSpec, RowFilter};
use alumnet_realtime::ws::WsTransport;
use alumnet_realtime::{
    Backoff, ClientConfig, ExhaustionPolicy, LifecycleEvent, RealtimeConfig, RealtimeManager,
};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "alumnet-realtime")]
#[command(about = "Alumnet realtime connection manager")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Subscribe to a table and print its changes
    Watch {
        /// Path to config file
        #[arg(short, long, default_value = "alumnet-realtime.json")]
        config: PathBuf,

        /// Table to watch
        #[arg(long)]
        table: String,

        /// Schema of the table
        #[arg(long, default_value = "public")]
        schema: String,

        /// Change kind: insert, update, delete or all
        #[arg(long, default_value = "all")]
        event: EventFilter,

        /// Row filter such as user_id=eq.42
        #[arg(long)]
        filter: Option<RowFilter>,

        /// Subscription name (defaults to the table name)
        #[arg(long)]
        name: Option<String>,
    },

    /// Print the reconnection schedule for a config
    Backoff {
        /// Path to config file (built-in defaults when omitted)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Generate a sample config file
    InitConfig {
        /// Path to write config
        #[arg(short, long, default_value = "alumnet-realtime.json")]
        output: PathBuf,

        /// Realtime WebSocket URL
        #[arg(long, default_value = "ws://localhost:4000/realtime/v1/websocket")]
        url: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive("alumnet=info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Watch {
            config,
            table,
            schema,
            event,
            filter,
            name,
        } => {
            let spec = build_filter(table, schema, event, filter);
            let name = name.unwrap_or_else(|| spec.table.clone());
            watch(&config, &name, spec).await?;
        }

        Commands::Backoff { config } => {
            let realtime = match config {
                Some(path) => ClientConfig::load(&path)?.realtime,
                None => RealtimeConfig::default(),
            };
            print!("{}", describe_schedule(&realtime));
        }

        Commands::InitConfig { output, url } => {
            init_config(&output, url)?;
        }
    }

    Ok(())
}

fn build_filter(
    table: String,
    schema: String,
    event: EventFilter,
    row_filter: Option<RowFilter>,
) -> FilterSpec {
    let spec = FilterSpec::table(table)
        .with_schema(schema)
        .with_event(event);
    match row_filter {
        Some(row_filter) => spec.with_row_filter(row_filter),
        None => spec,
    }
}

async fn watch(config_path: &Path, name: &str, filter: FilterSpec) -> anyhow::Result<()> {
    info!(config = %config_path.display(), "starting realtime watcher");

    let config = ClientConfig::load(config_path)?;
    filter.validate()?;
    info!(url = %config.transport.url, filter = %filter, "loaded config");

    let transport = WsTransport::new(config.transport.clone())?;
    let manager = RealtimeManager::new(transport, config.realtime.clone())?;
    let mut lifecycle = manager.lifecycle_events();
    manager.start()?;

    let handle = manager
        .subscribe(name, filter, |event| match serde_json::to_string(&event.record) {
            Ok(line) => println!("{line}"),
            Err(e) => warn!(error = %e, "failed to encode change"),
        })
        .await?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, shutting down");
                break;
            }
            event = lifecycle.recv() => match event {
                Ok(LifecycleEvent::Connected) => eprintln!("Realtime connected"),
                Ok(LifecycleEvent::Reconnecting { attempt, delay }) => {
                    eprintln!("Connection lost, retry {attempt} in {}", format_delay(delay));
                }
                Ok(LifecycleEvent::RetriesExhausted { attempts, .. }) => {
                    eprintln!("{}", exhausted_notice(config.realtime.on_exhaustion, attempts));
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
        }
    }

    handle.unsubscribe().await;
    manager.stop().await?;
    Ok(())
}

fn exhausted_notice(policy: ExhaustionPolicy, attempts: u32) -> String {
    match policy {
        ExhaustionPolicy::Degrade => format!(
            "Offline mode: realtime unavailable after {attempts} attempts, refresh manually"
        ),
        ExhaustionPolicy::StayDisconnected => {
            format!("Realtime disconnected after {attempts} attempts, restart to retry")
        }
    }
}

fn format_delay(delay: Duration) -> String {
    if delay.subsec_millis() == 0 {
        format!("{}s", delay.as_secs())
    } else {
        format!("{}ms", delay.as_millis())
    }
}

fn describe_schedule(config: &RealtimeConfig) -> String {
    let backoff = Backoff::from_config(config);
    let schedule = backoff.schedule(config.max_attempts);
    let total: Duration = schedule.iter().sum();

    let mut out = format!(
        "Reconnection schedule ({} attempts, base {}, cap {}):\n",
        config.max_attempts,
        format_delay(backoff.base),
        format_delay(backoff.cap)
    );
    for (index, delay) in schedule.iter().enumerate() {
        out.push_str(&format!("  attempt {}: {}\n", index + 1, format_delay(*delay)));
    }
    out.push_str(&format!("  total wait: {}\n", format_delay(total)));
    let outcome = match config.on_exhaustion {
        ExhaustionPolicy::Degrade => "degrade to offline mode",
        ExhaustionPolicy::StayDisconnected => "stay disconnected until restarted",
    };
    out.push_str(&format!("Then: {outcome}\n"));
    out
}

fn init_config(output: &Path, url: String) -> anyhow::Result<()> {
    let config = ClientConfig::new(url);
    config.validate()?;
    config.save(output)?;

    println!("Config written to {}", output.display());
    println!();
    println!("Edit the file to add your API key, then run:");
    println!(
        "  alumnet-realtime watch --config {} --table <table>",
        output.display()
    );

    Ok(())
}
