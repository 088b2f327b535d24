//! mqttplex command-line client
//!
//! Thin front end over the registry: subscribe and print, publish once, or show
//! the resolved configuration.

use base64::Engine as _;
use clap::{Parser, Subcommand};
use mqttplex::engine::rumqttc::RumqttcEngine;
use mqttplex::observability::init_default_logging;
use mqttplex::{
    AppConfig, ConnectionOptions, EventKind, Handle, QoS, Registry, RegistryConfig, TlsOptions,
};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

const DEFAULT_CONFIG_PATHS: &[&str] = &["mqttplex.toml", "config/mqttplex.toml"];

/// How long `pub` waits for the broker to acknowledge the disconnect
const DISCONNECT_GRACE: Duration = Duration::from_secs(5);

/// Multi-session MQTT client
#[derive(Parser)]
#[command(name = "mqttplex")]
#[command(about = "MQTT client built on the mqttplex session registry")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(flatten)]
    connection: ConnectionArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct ConnectionArgs {
    /// Broker address (overrides the configuration file)
    #[arg(short, long, global = true, env = "MQTTPLEX_URL")]
    url: Option<String>,

    /// MQTT client id
    #[arg(long, global = true)]
    client_id: Option<String>,

    #[arg(long, global = true, env = "MQTTPLEX_USERNAME")]
    username: Option<String>,

    #[arg(long, global = true, env = "MQTTPLEX_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// CA certificate file (PEM or DER)
    #[arg(long, global = true, value_name = "FILE")]
    ca: Option<PathBuf>,

    /// Client certificate file (PEM)
    #[arg(long, global = true, value_name = "FILE")]
    cert: Option<PathBuf>,

    /// Client private key file (PEM)
    #[arg(long, global = true, value_name = "FILE")]
    key: Option<PathBuf>,

    /// PKCS#12 bundle holding the client identity
    #[arg(long, global = true, value_name = "FILE")]
    p12: Option<PathBuf>,

    #[arg(long, global = true, env = "MQTTPLEX_P12_PASSWORD", hide_env_values = true)]
    p12_password: Option<String>,

    /// Skip server certificate verification
    #[arg(long, global = true)]
    insecure: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Subscribe and print incoming messages until interrupted
    Sub {
        #[arg(short, long, required = true)]
        topic: Vec<String>,
        #[arg(short, long, default_value_t = 0)]
        qos: u8,
    },
    /// Publish one message
    ///
    /// The PUBLISH is queued ahead of the DISCONNECT, but the broker's PUBACK or
    /// PUBCOMP is not awaited, so QoS 1 and 2 are best-effort here.
    Pub {
        #[arg(short, long)]
        topic: String,
        #[arg(short, long)]
        message: String,
        /// QoS 1 and 2 are not acknowledged before exit
        #[arg(short, long, default_value_t = 0)]
        qos: u8,
        #[arg(short, long)]
        retain: bool,
    },
    /// Validate configuration
    Config {
        /// Show resolved configuration
        #[arg(long)]
        show: bool,
    },
}

/// Broker address, options and registry settings after merging file and flags
struct Resolved {
    url: String,
    options: ConnectionOptions,
    registry: RegistryConfig,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    let resolved = match resolve(&cli) {
        Ok(resolved) => resolved,
        Err(e) => {
            error!("Failed to resolve configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Sub { topic, qos } => run_sub(resolved, topic, qos).await,
        Commands::Pub {
            topic,
            message,
            qos,
            retain,
        } => run_pub(resolved, topic, message, qos, retain).await,
        Commands::Config { show } => handle_config_command(&resolved, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn resolve(cli: &Cli) -> Result<Resolved, Box<dyn std::error::Error>> {
    let file = load_configuration(cli.config.as_deref())?;

    let (file_url, mut options, registry) = match &file {
        Some(config) => (
            Some(config.broker.url.clone()),
            config.connection_options()?,
            config.registry.clone(),
        ),
        None => (None, ConnectionOptions::default(), RegistryConfig::default()),
    };

    let args = &cli.connection;
    let url = args
        .url
        .clone()
        .or(file_url)
        .ok_or("no broker address; pass --url or provide a configuration file")?;

    if args.client_id.is_some() {
        options.client_id = args.client_id.clone();
    }
    if args.username.is_some() {
        options.username = args.username.clone();
        options.password = args.password.clone();
    }
    if args.insecure {
        options.allow_untrusted_ca = Some(true);
    }
    if let Some(tls) = tls_from_args(args)? {
        options.tls = Some(tls);
    }

    Ok(Resolved {
        url,
        options,
        registry,
    })
}

fn load_configuration(path: Option<&Path>) -> Result<Option<AppConfig>, Box<dyn std::error::Error>> {
    if let Some(path) = path {
        info!("Loading configuration from: {}", path.display());
        return Ok(Some(AppConfig::load_from_file(path)?));
    }

    for candidate in DEFAULT_CONFIG_PATHS {
        let path = Path::new(candidate);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(Some(AppConfig::load_from_file(path)?));
        }
    }

    Ok(None)
}

fn tls_from_args(args: &ConnectionArgs) -> Result<Option<TlsOptions>, std::io::Error> {
    if args.ca.is_none() && args.cert.is_none() && args.key.is_none() && args.p12.is_none() {
        return Ok(None);
    }

    let read = |path: &Option<PathBuf>| -> Result<Option<String>, std::io::Error> {
        path.as_ref()
            .map(|path| {
                std::fs::read(path).map(|bytes| base64::engine::general_purpose::STANDARD.encode(bytes))
            })
            .transpose()
    };

    Ok(Some(TlsOptions {
        ca_certificate: read(&args.ca)?,
        client_certificate: read(&args.cert)?,
        client_key: read(&args.key)?,
        p12_bundle: read(&args.p12)?,
        p12_password: args.p12_password.clone(),
    }))
}

async fn open_session(resolved: &Resolved) -> Result<(Arc<Registry>, Handle), Box<dyn std::error::Error>> {
    let registry = Registry::start(Arc::new(RumqttcEngine::new()), resolved.registry.clone());
    let handle = registry.create().await?;

    registry
        .on(&handle, EventKind::Error, |event| {
            warn!(handle = %event.handle, event = ?event.event, "Session error");
        })
        .await?;

    registry
        .connect(&handle, &resolved.url, &resolved.options)
        .await?;
    info!(broker = %resolved.url, handle = %handle, "Session connected");

    Ok((registry, handle))
}

async fn run_sub(resolved: Resolved, topics: Vec<String>, qos: u8) -> Result<(), Box<dyn std::error::Error>> {
    let qos = QoS::try_from(qos)?;
    let (registry, handle) = open_session(&resolved).await?;

    registry
        .on(&handle, EventKind::Message, |event| {
            if let mqttplex::Event::MessageReceived { topic, payload } = &event.event {
                println!("{} {}", topic, String::from_utf8_lossy(payload));
            }
        })
        .await?;
    registry
        .on(&handle, EventKind::Disconnect, |event| {
            warn!(handle = %event.handle, event = ?event.event, "Connection lost");
        })
        .await?;

    for topic in &topics {
        registry.subscribe(&handle, topic, qos).await?;
        info!(topic = %topic, ?qos, "Subscribed");
    }

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully...");
        }
    }

    shutdown(&registry, &handle).await;
    Ok(())
}

async fn run_pub(
    resolved: Resolved,
    topic: String,
    message: String,
    qos: u8,
    retain: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let qos = QoS::try_from(qos)?;
    let (registry, handle) = open_session(&resolved).await?;

    registry
        .publish(&handle, &topic, message.into_bytes(), qos, retain)
        .await?;
    info!(topic = %topic, ?qos, retain, "Published");
    if qos != QoS::AtMostOnce {
        // The disconnect follows the PUBLISH on the wire; the ack is not awaited
        info!(?qos, "Exiting without waiting for the broker acknowledgement");
    }

    shutdown(&registry, &handle).await;
    Ok(())
}

/// Disconnect, wait briefly for the broker to settle it, then close
async fn shutdown(registry: &Registry, handle: &Handle) {
    let (settled_tx, mut settled_rx) = mpsc::unbounded_channel();
    let waiter = registry
        .once(handle, EventKind::Disconnect, move |_| {
            let _ = settled_tx.send(());
        })
        .await;

    match registry.disconnect(handle).await {
        Ok(()) if waiter.is_ok() => {
            if tokio::time::timeout(DISCONNECT_GRACE, settled_rx.recv())
                .await
                .is_err()
            {
                warn!("Broker did not settle the disconnect in time");
            }
        }
        Ok(()) => {}
        Err(e) => warn!(error = %e, "Disconnect failed"),
    }

    if let Err(e) = registry.close(handle).await {
        warn!(error = %e, "Close failed");
    }
    info!("Application shutdown complete");
}

fn handle_config_command(resolved: &Resolved, show: bool) -> Result<(), Box<dyn std::error::Error>> {
    // Normalizing catches every option error the engine would see
    let config = mqttplex::normalize(&Handle::from("config-check"), &resolved.url, &resolved.options)?;
    info!("Configuration is valid");

    if show {
        println!("broker:          {}", config.broker_url());
        println!("client_id:       {}", config.client_id);
        println!("clean_session:   {}", config.clean_session);
        println!("keep_alive:      {}s", config.keep_alive.as_secs());
        println!("connect_timeout: {}s", config.connect_timeout.as_secs());
        println!("max_inflight:    {}", config.max_inflight);
        println!("auto_reconnect:  {}", config.auto_reconnect);
        println!(
            "username:        {}",
            config
                .credentials
                .as_ref()
                .map(|c| c.username.as_str())
                .unwrap_or("-")
        );
        println!("tls:             {:?}", config.tls);
        println!("allow_untrusted: {}", config.allow_untrusted_ca);
        println!(
            "max_sessions:    {}",
            resolved
                .registry
                .max_sessions
                .map(|n| n.to_string())
                .unwrap_or_else(|| "unlimited".to_string())
        );
    }

    Ok(())
}
