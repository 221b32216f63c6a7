// # proxyrotd - Proxy Rotation CLI
//
// Thin integration layer over proxyrot-core:
// 1. Reading configuration from environment variables
// 2. Registering the remote host and probe backends
// 3. Running one subcommand against the engine
// 4. Printing the result as JSON on stdout (logs go to stderr)
//
// No rotation, allocation or remote-editing logic lives here.
//
// ## Configuration
//
// ### Remote host
// - `PROXYROT_SSH_HOST`: Proxy host (required for rotate, rotate-all, verify, sync)
// - `PROXYROT_SSH_PORT`: SSH port (default 22)
// - `PROXYROT_SSH_USER`: SSH user (default root)
// - `PROXYROT_SSH_IDENTITY_FILE`: Private key (agent/default keys when unset)
// - `PROXYROT_SSH_CONNECT_TIMEOUT`: Connect timeout in seconds
// - `PROXYROT_SSH_COMMAND_TIMEOUT`: Per-command timeout in seconds
// - `PROXYROT_REMOTE_CONFIG_DIR`: Fragment directory (default /etc/squid/includes)
//
// ### Store
// - `PROXYROT_STORE_TYPE`: file or memory (default file)
// - `PROXYROT_STORE_PATH`: Path to the store file (for file store)
//
// ### Engine and verifier
// - `PROXYROT_COOLDOWN_SECS`: Minimum time between rotations of one port
// - `PROXYROT_VERIFY`: Probe the egress IP after rotating (default true)
// - `PROXYROT_VERIFIER_URL`: Endpoint returning the caller's IP as text
// - `PROXYROT_VERIFIER_ATTEMPTS`: Probe attempts
// - `PROXYROT_VERIFIER_RETRY_DELAY_SECS`: Delay between attempts
//
// ### Logging
// - `PROXYROT_LOG_LEVEL`: trace, debug, info, warn, error (default info)
//
// ## Example
//
// ```bash
// export PROXYROT_SSH_HOST=proxy.example.net
// export PROXYROT_SSH_IDENTITY_FILE=/etc/proxyrot/id_ed25519
// export PROXYROT_STORE_PATH=/var/lib/proxyrot/store.json
//
// proxyrotd seed-pool
// proxyrotd seed-ports --host proxy.example.net
// proxyrotd sync
// proxyrotd rotate --port 1007 --user 42
// ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use proxyrot_core::config::{ProxyrotConfig, StoreConfig};
use proxyrot_core::traits::{PoolStore, PortStore, ProxyStore};
use proxyrot_core::{
    BackendRegistry, OutboundVerifier, RotationEngine, RotationEvent, Synchronizer, UserId, seed,
};
use serde::Serialize;
use std::env;
use std::fmt::Display;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;

/// Exit codes for different termination scenarios
///
/// - 0: Success
/// - 1: Configuration or startup error
/// - 2: Runtime error (including a rejected rotation)
#[derive(Debug, Clone, Copy)]
enum ProxyrotExitCode {
    Success = 0,
    ConfigError = 1,
    RuntimeError = 2,
}

impl From<ProxyrotExitCode> for ExitCode {
    fn from(code: ProxyrotExitCode) -> Self {
        ExitCode::from(code as u8)
    }
}

/// Rotate the outbound IP of forward-proxy ports
#[derive(Parser)]
#[command(name = "proxyrotd")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Move one port to a new pool address
    Rotate {
        #[arg(long)]
        port: u16,
        /// Requesting user id
        #[arg(long)]
        user: u64,
    },

    /// Rotate every port a user owns
    RotateAll {
        #[arg(long)]
        user: u64,
    },

    /// Show a port's current binding
    Show {
        #[arg(long)]
        port: u16,
    },

    /// License check for the proxy's ACL helper
    Check {
        /// Raw port number; out-of-range values are blocked
        #[arg(long, allow_negative_numbers = true)]
        port: i64,
    },

    /// Probe a port's egress IP
    Verify {
        #[arg(long)]
        port: u16,
        #[arg(long)]
        user: u64,
    },

    /// Adopt owners and bindings from the remote proxy configuration
    Sync {
        /// Only print what the remote host has configured
        #[arg(long)]
        dry_run: bool,
    },

    /// Add an inclusive IPv4 range to the pool
    SeedPool {
        #[arg(long, default_value_t = seed::DEFAULT_POOL_START)]
        start: Ipv4Addr,
        #[arg(long, default_value_t = seed::DEFAULT_POOL_END)]
        end: Ipv4Addr,
    },

    /// Add a block of unowned ports
    SeedPorts {
        #[arg(long, default_value_t = seed::DEFAULT_PORT_BASE)]
        base: u16,
        #[arg(long, default_value_t = seed::DEFAULT_PORT_COUNT)]
        count: u16,
        /// Proxy host the ports live on (defaults to PROXYROT_SSH_HOST)
        #[arg(long)]
        host: Option<String>,
    },
}

impl Commands {
    /// Whether the command drives the engine (and so the remote host)
    fn needs_engine(&self) -> bool {
        matches!(
            self,
            Commands::Rotate { .. }
                | Commands::RotateAll { .. }
                | Commands::Verify { .. }
                | Commands::Sync { .. }
        )
    }
}

/// Application configuration
struct Config {
    ssh_host: String,
    ssh_port: Option<u16>,
    ssh_user: Option<String>,
    ssh_identity_file: Option<PathBuf>,
    ssh_connect_timeout: Option<u64>,
    ssh_command_timeout: Option<u64>,
    remote_config_dir: Option<String>,
    store_type: String,
    store_path: Option<PathBuf>,
    cooldown_secs: Option<u64>,
    verify: bool,
    verifier_url: Option<String>,
    verifier_attempts: Option<usize>,
    verifier_retry_delay_secs: Option<u64>,
    log_level: String,
}

/// Read and parse an optional variable; a present but malformed value is an error
fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("{} is invalid ({}): {}", name, raw, e)),
        _ => Ok(None),
    }
}

impl Config {
    /// Load configuration from environment variables
    fn from_env() -> Result<Self> {
        Ok(Self {
            ssh_host: env::var("PROXYROT_SSH_HOST").unwrap_or_default(),
            ssh_port: env_parse("PROXYROT_SSH_PORT")?,
            ssh_user: env::var("PROXYROT_SSH_USER").ok(),
            ssh_identity_file: env::var("PROXYROT_SSH_IDENTITY_FILE").ok().map(PathBuf::from),
            ssh_connect_timeout: env_parse("PROXYROT_SSH_CONNECT_TIMEOUT")?,
            ssh_command_timeout: env_parse("PROXYROT_SSH_COMMAND_TIMEOUT")?,
            remote_config_dir: env::var("PROXYROT_REMOTE_CONFIG_DIR").ok(),
            store_type: env::var("PROXYROT_STORE_TYPE").unwrap_or_else(|_| "file".to_string()),
            store_path: env::var("PROXYROT_STORE_PATH").ok().map(PathBuf::from),
            cooldown_secs: env_parse("PROXYROT_COOLDOWN_SECS")?,
            verify: env_parse("PROXYROT_VERIFY")?.unwrap_or(true),
            verifier_url: env::var("PROXYROT_VERIFIER_URL").ok(),
            verifier_attempts: env_parse("PROXYROT_VERIFIER_ATTEMPTS")?,
            verifier_retry_delay_secs: env_parse("PROXYROT_VERIFIER_RETRY_DELAY_SECS")?,
            log_level: env::var("PROXYROT_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }

    /// Validate the configuration for one command
    fn validate(&self, command: &Commands) -> Result<()> {
        if command.needs_engine() && self.ssh_host.trim().is_empty() {
            anyhow::bail!(
                "PROXYROT_SSH_HOST is required for this command. \
                Set it via: export PROXYROT_SSH_HOST=proxy.example.net"
            );
        }

        if let Some(ref identity) = self.ssh_identity_file
            && !identity.exists()
        {
            anyhow::bail!(
                "PROXYROT_SSH_IDENTITY_FILE does not exist: {}",
                identity.display()
            );
        }

        match self.store_type.as_str() {
            "file" => match self.store_path {
                Some(ref path) if !path.as_os_str().is_empty() => {}
                _ => anyhow::bail!(
                    "PROXYROT_STORE_PATH is required when PROXYROT_STORE_TYPE=file. \
                    Set it via: export PROXYROT_STORE_PATH=/var/lib/proxyrot/store.json"
                ),
            },
            "memory" => {
                if !matches!(command, Commands::Show { .. } | Commands::Check { .. }) {
                    eprintln!(
                        "WARNING: PROXYROT_STORE_TYPE=memory keeps nothing after this command exits."
                    );
                }
            }
            other => anyhow::bail!(
                "PROXYROT_STORE_TYPE '{}' is not supported. \
                Supported types: file, memory",
                other
            ),
        }

        if let Some(attempts) = self.verifier_attempts
            && !(1..=10).contains(&attempts)
        {
            anyhow::bail!(
                "PROXYROT_VERIFIER_ATTEMPTS must be between 1 and 10. Got: {}",
                attempts
            );
        }

        if let Some(delay) = self.verifier_retry_delay_secs
            && delay > 120
        {
            anyhow::bail!(
                "PROXYROT_VERIFIER_RETRY_DELAY_SECS must be at most 120 seconds. Got: {}",
                delay
            );
        }

        match self.log_level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!(
                "PROXYROT_LOG_LEVEL '{}' is not valid. \
                Valid levels: trace, debug, info, warn, error",
                self.log_level
            ),
        }

        self.core_config().validate()?;
        Ok(())
    }

    /// Core configuration with environment overrides applied
    fn core_config(&self) -> ProxyrotConfig {
        let mut config = ProxyrotConfig::new();

        config.ssh.host = self.ssh_host.trim().to_string();
        if let Some(port) = self.ssh_port {
            config.ssh.port = port;
        }
        if let Some(ref user) = self.ssh_user {
            config.ssh.user = user.clone();
        }
        config.ssh.identity_file = self.ssh_identity_file.clone();
        if let Some(secs) = self.ssh_connect_timeout {
            config.ssh.connect_timeout_secs = secs;
        }
        if let Some(secs) = self.ssh_command_timeout {
            config.ssh.command_timeout_secs = secs;
        }

        if let Some(ref dir) = self.remote_config_dir {
            config.remote.config_dir = dir.clone();
        }

        config.store = match (self.store_type.as_str(), &self.store_path) {
            ("file", Some(path)) => StoreConfig::File { path: path.clone() },
            _ => StoreConfig::Memory,
        };

        if let Some(secs) = self.cooldown_secs {
            config.engine.cooldown_secs = secs;
        }

        config.verifier.enabled = self.verify;
        if let Some(ref url) = self.verifier_url {
            config.verifier.url = url.clone();
        }
        if let Some(attempts) = self.verifier_attempts {
            config.verifier.attempts = attempts;
        }
        if let Some(delay) = self.verifier_retry_delay_secs {
            config.verifier.retry_delay_secs = delay;
        }

        config
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return ProxyrotExitCode::ConfigError.into();
        }
    };

    if let Err(e) = config.validate(&cli.command) {
        eprintln!("Configuration validation error: {}", e);
        return ProxyrotExitCode::ConfigError.into();
    }

    let log_level = match config.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    // stdout carries the JSON result
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
        return ProxyrotExitCode::ConfigError.into();
    }

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to create tokio runtime: {}", e);
            return ProxyrotExitCode::RuntimeError.into();
        }
    };

    let result = rt.block_on(async {
        match run(cli.command, config.core_config()).await {
            Ok(()) => ProxyrotExitCode::Success,
            Err(e) => {
                error!("{:#}", e);
                ProxyrotExitCode::RuntimeError
            }
        }
    });

    result.into()
}

/// Registry with every backend compiled into this binary
fn registry() -> BackendRegistry {
    let registry = BackendRegistry::new();

    #[cfg(feature = "ssh")]
    proxyrot_remote_ssh::register(&registry);

    #[cfg(feature = "http")]
    proxyrot_probe_http::register(&registry);

    debug!(
        hosts = ?registry.list_hosts(),
        probes = ?registry.list_probes(),
        "Backends registered"
    );
    registry
}

/// Run one subcommand
async fn run(command: Commands, config: ProxyrotConfig) -> Result<()> {
    let registry = registry();
    let store = registry
        .create_store(&config.store)
        .await
        .context("Failed to open store")?;

    if command.needs_engine() {
        run_engine_command(command, &registry, store.clone(), &config).await?;
    } else {
        run_store_command(command, store.as_ref(), &config).await?;
    }

    store.flush().await.context("Failed to flush store")?;
    Ok(())
}

/// Commands that only read or seed the store
async fn run_store_command(
    command: Commands,
    store: &dyn ProxyStore,
    config: &ProxyrotConfig,
) -> Result<()> {
    match command {
        Commands::Show { port } => emit(proxyrot_core::port_binding(store, port).await),
        Commands::Check { port } => emit(proxyrot_core::license_status(store, port).await),
        Commands::SeedPool { start, end } => {
            let addresses = seed::address_range(start, end)?;
            let requested = addresses.len();
            let inserted = store.insert_addresses(addresses).await?;
            info!(requested, inserted, "Pool seeded");
            print_json(&SeedReport {
                requested,
                inserted,
            })
        }
        Commands::SeedPorts { base, count, host } => {
            let host = host
                .filter(|h| !h.trim().is_empty())
                .unwrap_or_else(|| config.ssh.host.clone());
            if host.is_empty() {
                anyhow::bail!("--host or PROXYROT_SSH_HOST is required to seed ports");
            }
            let ports = seed::port_range(base, count, &host)?;
            let requested = ports.len();
            let inserted = store.insert_ports(ports).await?;
            info!(requested, inserted, host = %host, "Ports seeded");
            print_json(&SeedReport {
                requested,
                inserted,
            })
        }
        _ => anyhow::bail!("Command requires the rotation engine"),
    }
}

/// Commands that go through the rotation engine
async fn run_engine_command(
    command: Commands,
    registry: &BackendRegistry,
    store: Arc<dyn ProxyStore>,
    config: &ProxyrotConfig,
) -> Result<()> {
    let host = registry
        .create_host(&config.ssh, &config.remote)
        .context("Failed to create remote host")?;
    let synchronizer = Synchronizer::new(host, config.remote.clone());

    let verifier = if config.verifier.enabled {
        let probe = registry
            .create_probe(&config.verifier)
            .context("Failed to create egress probe")?;
        Some(OutboundVerifier::new(probe, &config.verifier))
    } else {
        None
    };

    let (engine, events) = RotationEngine::new(store, synchronizer, verifier, &config.engine)?;
    let event_logger = tokio::spawn(log_events(events));

    let result = match command {
        Commands::Rotate { port, user } => emit(engine.rotate(port, UserId(user)).await),
        Commands::RotateAll { user } => emit(engine.rotate_all(UserId(user)).await),
        Commands::Verify { port, user } => emit(engine.verify(port, UserId(user)).await),
        Commands::Sync { dry_run: true } => emit(engine.scan_remote().await),
        Commands::Sync { dry_run: false } => emit(engine.sync_remote().await),
        _ => Err(anyhow::anyhow!("Command does not use the rotation engine")),
    };

    // Dropping the engine closes the event channel and ends the logger
    drop(engine);
    if let Err(e) = event_logger.await {
        warn!("Event logger stopped abnormally: {}", e);
    }

    result
}

/// Log every rotation event until the engine goes away
async fn log_events(events: mpsc::Receiver<RotationEvent>) {
    let mut stream = ReceiverStream::new(events);
    while let Some(event) = stream.next().await {
        match &event {
            RotationEvent::RotationFailed { .. } => warn!(?event, "Rotation event"),
            _ => info!(?event, "Rotation event"),
        }
    }
}

#[derive(Serialize)]
struct SeedReport {
    requested: usize,
    inserted: usize,
}

/// Failure body printed on stdout for callers that parse the output
#[derive(Serialize)]
struct ErrorBody {
    error: proxyrot_core::ErrorKind,
    status: u16,
    message: String,
}

/// Print a core result as JSON; failures also become the command's error
fn emit<T: Serialize>(result: proxyrot_core::Result<T>) -> Result<()> {
    match result {
        Ok(value) => print_json(&value),
        Err(e) => {
            let kind = e.kind();
            print_json(&ErrorBody {
                error: kind,
                status: kind.status_code(),
                message: e.to_string(),
            })?;
            Err(e.into())
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialize result")?;
    println!("{}", json);
    Ok(())
}
