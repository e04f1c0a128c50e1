//! busctl - command line companion for the message bus
//!
//! Publishes envelopes, tails topics and reports health using the same
//! client the services embed.

use bus_core::config::redact_url;
use bus_core::{handler_fn, BusClient, ClientConfig, Envelope, HandlerError, PublishOptions, Qos};
use bus_core::observability::init_default_logging;
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info};

type CliResult = Result<(), Box<dyn std::error::Error>>;

/// The broker or the session failed
const EXIT_RUNTIME: i32 = 1;
/// Configuration or arguments were rejected before connecting
const EXIT_BAD_INPUT: i32 = 2;

/// Command line client for the envelope message bus
#[derive(Parser)]
#[command(name = "busctl")]
#[command(about = "Publish, listen and report health on the message bus")]
#[command(version)]
struct Cli {
    /// Configuration file path (TOML); BUS_* environment variables otherwise
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the configured client id
    #[arg(long, value_name = "ID")]
    client_id: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Publish one envelope
    Publish {
        topic: String,
        event_type: String,
        /// JSON object used as the envelope data
        #[arg(short, long, default_value = "{}")]
        data: String,
        #[arg(long)]
        correlation_id: Option<String>,
        #[arg(long, allow_negative_numbers = true)]
        seq: Option<i64>,
        #[arg(long, default_value_t = 0)]
        qos: u8,
        #[arg(long)]
        retain: bool,
    },
    /// Print envelopes arriving on the given patterns as JSON lines
    Listen {
        #[arg(required = true)]
        patterns: Vec<String>,
        #[arg(long, default_value_t = 0)]
        qos: u8,
        /// Exit after this many envelopes
        #[arg(short = 'n', long)]
        count: Option<usize>,
    },
    /// Publish a retained health status
    Health {
        /// Report a failure instead of success
        #[arg(long)]
        fail: bool,
        #[arg(long)]
        event: Option<String>,
        #[arg(long)]
        error: Option<String>,
    },
    /// Validate configuration
    Config {
        /// Print the effective configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_default_logging();

    let config = match load_configuration(&cli) {
        Ok(config) => config,
        Err(e) => exit_with(format!("Failed to load configuration: {e}")),
    };

    let result = match cli.command {
        Commands::Publish {
            topic,
            event_type,
            data,
            correlation_id,
            seq,
            qos,
            retain,
        } => {
            let data = parse_data(&data).unwrap_or_else(|e| exit_with(e));
            let options = PublishOptions {
                correlation_id,
                seq,
                qos: Qos::try_from(qos).unwrap_or_else(|e| exit_with(e)),
                retain,
            };
            run_publish(config, &topic, &event_type, data, options).await
        }
        Commands::Listen {
            patterns,
            qos,
            count,
        } => {
            let qos = Qos::try_from(qos).unwrap_or_else(|e| exit_with(e));
            run_listen(config, patterns, qos, count).await
        }
        Commands::Health { fail, event, error } => {
            run_health(config, !fail, event.as_deref(), error.as_deref()).await
        }
        Commands::Config { show } => show_config(config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(EXIT_RUNTIME);
    }
}

fn exit_with(e: impl std::fmt::Display) -> ! {
    error!("{}", e);
    process::exit(EXIT_BAD_INPUT);
}

fn load_configuration(cli: &Cli) -> Result<ClientConfig, bus_core::ConfigError> {
    let mut config = match &cli.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            ClientConfig::load_from_file(path)?
        }
        None => ClientConfig::from_env()?,
    };

    // busctl never reports its own lifecycle or Last Will
    config.enable_health = false;
    config.enable_heartbeat = false;

    if let Some(client_id) = &cli.client_id {
        config.client_id = client_id.clone();
        config.validate()?;
    }
    Ok(config)
}

fn parse_data(raw: &str) -> Result<Map<String, Value>, Box<dyn std::error::Error>> {
    match serde_json::from_str(raw)? {
        Value::Object(map) => Ok(map),
        _ => Err("--data must be a JSON object".into()),
    }
}

async fn run_publish(
    config: ClientConfig,
    topic: &str,
    event_type: &str,
    data: Map<String, Value>,
    options: PublishOptions,
) -> CliResult {
    let envelope = BusClient::scoped(config, |client| async move {
        client
            .publish_event_with(topic, event_type, &data, options)
            .await
    })
    .await?;

    println!("{}", serde_json::to_string(&envelope)?);
    Ok(())
}

async fn run_listen(
    config: ClientConfig,
    patterns: Vec<String>,
    qos: Qos,
    count: Option<usize>,
) -> CliResult {
    let client = Arc::new(BusClient::new(config)?);
    client.connect().await?;

    let (tx, mut rx) = mpsc::unbounded_channel::<(String, Envelope)>();
    for pattern in &patterns {
        let tx = tx.clone();
        let handler = handler_fn(move |topic, envelope| {
            let tx = tx.clone();
            async move {
                tx.send((topic, envelope))?;
                Ok::<(), HandlerError>(())
            }
        });
        client.subscribe(pattern, handler, qos).await?;
    }
    drop(tx);
    info!(patterns = ?patterns, "Listening");

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    let mut seen = 0usize;

    loop {
        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
                break;
            }
            received = rx.recv() => {
                let Some((topic, envelope)) = received else { break };
                println!(
                    "{}",
                    serde_json::json!({"topic": topic, "envelope": envelope})
                );
                seen += 1;
                if count.is_some_and(|limit| seen >= limit) {
                    break;
                }
            }
        }
    }

    client.shutdown().await;
    Ok(())
}

async fn run_health(
    config: ClientConfig,
    ok: bool,
    event: Option<&str>,
    error: Option<&str>,
) -> CliResult {
    let envelope = BusClient::scoped(config, |client| async move {
        client.publish_health(ok, event, error).await
    })
    .await?;

    println!("{}", serde_json::to_string(&envelope)?);
    Ok(())
}

fn show_config(mut config: ClientConfig, show: bool) -> CliResult {
    if show {
        config.url = redact_url(&config.url);
        println!("{}", toml::to_string_pretty(&config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}
