// # nodegrantd - Node Grant Daemon
//
// Thin integration layer: all reconciliation logic lives in nodegrant-core.
// Configuration is via environment variables only.
//
// The daemon is responsible for:
// 1. Reading configuration from environment variables
// 2. Initializing logging and the runtime
// 3. Building the Scaleway client and the Kubernetes feeds
// 4. Running the engine until SIGTERM/SIGINT
//
// ## Configuration
//
// ### Synchronizers (each disabled when unset or empty)
// - `REVERSE_IP_DOMAIN`: Domain (and DNS zone) for reverse pointers
// - `DATABASE_IDS`: Comma-separated database instances (`id` or `region/id`)
// - `REDIS_IDS`: Comma-separated redis clusters (`id` or `zone/id`)
// - `RESERVED_IPS_POOL`: Comma-separated reserved addresses
// - `SECURITY_GROUP_IDS`: Comma-separated security groups (`id` or `zone/id`)
//
// ### Engine
// - `NUMBER_RETRIES`: Requeues before a key is abandoned (default 30)
// - `NODES_IP_SOURCE`: `kubernetes` or `instance` (default instance)
// - `NODEGRANT_NODE_WORKERS`, `NODEGRANT_SERVICE_WORKERS`: Worker counts
// - `NODEGRANT_LOG_LEVEL`: trace, debug, info, warn, error
// - `NODEGRANT_MODE`: `dry-run` to log mutations instead of sending them
//
// ### Scaleway
// - `SCW_SECRET_KEY` (required), `SCW_ACCESS_KEY`
// - `SCW_DEFAULT_ZONE`, `SCW_DEFAULT_REGION`, `SCW_API_URL`
//
// Kubernetes credentials come from the in-cluster service account or the
// local kubeconfig.
//
// ## Example
//
// ```bash
// export SCW_SECRET_KEY=11111111-2222-3333-4444-555555555555
// export RESERVED_IPS_POOL=51.15.9.9,51.15.9.10
// export SECURITY_GROUP_IDS=fr-par-1/6e1ab9f2-0000-0000-0000-000000000000
//
// nodegrantd
// ```

use anyhow::Result;
use nodegrant_core::config::{AddressSource, ControllerConfig};
use nodegrant_core::{ControllerEvent, NodegrantEngine};
use nodegrant_provider_scaleway::{ScalewayConfig, ScalewayProvider};
use nodegrant_source_kube::{KubeLabeler, KubeSource};
use std::env;
use std::fmt::Display;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

/// Time the engine gets to drain its queues after a shutdown signal
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(60);

/// Upper bound for worker counts
const MAX_WORKERS: usize = 64;

/// Exit codes for different termination scenarios
///
/// These codes follow systemd conventions:
/// - 0: Clean shutdown
/// - 1: Configuration or startup error
/// - 2: Runtime error (unexpected)
#[derive(Debug, Clone, Copy)]
enum NodegrantExitCode {
    /// Clean shutdown (normal exit)
    CleanShutdown = 0,
    /// Configuration error or startup failure
    ConfigError = 1,
    /// Runtime error (unexpected failure)
    RuntimeError = 2,
}

impl From<NodegrantExitCode> for ExitCode {
    fn from(code: NodegrantExitCode) -> Self {
        ExitCode::from(code as u8)
    }
}

/// Application configuration
#[derive(Debug)]
struct Config {
    controller: ControllerConfig,
    scaleway: ScalewayConfig,
    log_level: String,
    /// Problems found while reading the environment, logged once tracing is up
    warnings: Vec<String>,
}

impl Config {
    /// Load configuration from environment variables
    fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through `lookup`
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut warnings = Vec::new();
        let mut controller = ControllerConfig::new();

        controller.reverse_ip_domain = lookup("REVERSE_IP_DOMAIN").filter(|d| !d.is_empty());
        controller.database_ids = split_list(lookup("DATABASE_IDS"));
        controller.redis_ids = split_list(lookup("REDIS_IDS"));
        controller.reserved_ips = split_list(lookup("RESERVED_IPS_POOL"));
        controller.security_group_ids = split_list(lookup("SECURITY_GROUP_IDS"));
        controller.nodes_ip_source = lookup("NODES_IP_SOURCE")
            .map(|s| AddressSource::from_setting(&s))
            .unwrap_or_default();

        controller.engine.number_retries = parse_number(
            "NUMBER_RETRIES",
            lookup("NUMBER_RETRIES"),
            controller.engine.number_retries,
            controller.engine.number_retries,
            &mut warnings,
        );
        controller.engine.node_workers = parse_number(
            "NODEGRANT_NODE_WORKERS",
            lookup("NODEGRANT_NODE_WORKERS"),
            controller.engine.node_workers,
            1,
            &mut warnings,
        );
        controller.engine.service_workers = parse_number(
            "NODEGRANT_SERVICE_WORKERS",
            lookup("NODEGRANT_SERVICE_WORKERS"),
            controller.engine.service_workers,
            1,
            &mut warnings,
        );

        Ok(Self {
            controller,
            scaleway: ScalewayConfig::from_lookup(&lookup)?,
            log_level: lookup("NODEGRANT_LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            warnings,
        })
    }

    /// Validate the configuration
    ///
    /// Malformed resource identifiers are reported by the synchronizers at
    /// runtime; this only rejects settings the daemon cannot start with.
    fn validate(&self) -> Result<()> {
        if let Some(ref domain) = self.controller.reverse_ip_domain {
            validate_domain_name(domain)?;
        }

        for (name, workers) in [
            ("NODEGRANT_NODE_WORKERS", self.controller.engine.node_workers),
            ("NODEGRANT_SERVICE_WORKERS", self.controller.engine.service_workers),
        ] {
            if workers == 0 || workers > MAX_WORKERS {
                anyhow::bail!(
                    "{} must be between 1 and {}. Got: {}",
                    name,
                    MAX_WORKERS,
                    workers
                );
            }
        }

        // Validate log level
        match self.log_level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!(
                "NODEGRANT_LOG_LEVEL '{}' is not valid. \
                Valid levels: trace, debug, info, warn, error",
                self.log_level
            ),
        }

        self.controller.validate()?;
        Ok(())
    }
}

/// Parse a numeric setting
///
/// An absent setting keeps `default`; an unparsable one falls back to
/// `fallback` and records a warning.
fn parse_number<T>(
    name: &str,
    raw: Option<String>,
    default: T,
    fallback: T,
    warnings: &mut Vec<String>,
) -> T
where
    T: FromStr + Display,
    T::Err: Display,
{
    let Some(raw) = raw else {
        return default;
    };
    match raw.trim().parse() {
        Ok(value) => value,
        Err(e) => {
            warnings.push(format!(
                "{} '{}' is not a number ({}), using {}",
                name, raw, e, fallback
            ));
            fallback
        }
    }
}

/// Split a comma-separated setting, dropping empty entries
fn split_list(raw: Option<String>) -> Vec<String> {
    raw.unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Validate that a string is a valid domain name
///
/// Basic RFC 1035 checks; catches common mistakes only.
fn validate_domain_name(domain: &str) -> Result<()> {
    if domain.len() > 253 {
        anyhow::bail!(
            "Domain name too long: {} chars (max 253). Got: {}",
            domain.len(),
            domain
        );
    }

    for label in domain.split('.') {
        if label.is_empty() {
            anyhow::bail!("Domain name has empty label: '{}'", domain);
        }

        if label.len() > 63 {
            anyhow::bail!(
                "Domain label too long: {} chars (max 63). Label: '{}'",
                label.len(),
                label
            );
        }

        if !label.chars().all(|c| c.is_alphanumeric() || c == '-') {
            anyhow::bail!(
                "Domain label contains invalid characters. Label: '{}'. \
                Valid: alphanumeric and hyphen only.",
                label
            );
        }

        if label.starts_with('-') || label.ends_with('-') {
            anyhow::bail!(
                "Domain label cannot start or end with hyphen. Label: '{}'",
                label
            );
        }
    }

    Ok(())
}

fn main() -> ExitCode {
    // Load configuration from environment
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return NodegrantExitCode::ConfigError.into();
        }
    };

    if let Err(e) = config.validate() {
        eprintln!("Configuration validation error: {}", e);
        return NodegrantExitCode::ConfigError.into();
    }

    let log_level = match config.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
        return NodegrantExitCode::ConfigError.into();
    }

    info!("Starting nodegrantd daemon");
    for warning in &config.warnings {
        warn!("{}", warning);
    }

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to create tokio runtime: {}", e);
            return NodegrantExitCode::RuntimeError.into();
        }
    };

    let result = rt.block_on(async {
        if let Err(e) = run_daemon(config).await {
            error!("Daemon error: {}", e);
            NodegrantExitCode::RuntimeError
        } else {
            NodegrantExitCode::CleanShutdown
        }
    });

    result.into()
}

/// Run the daemon
async fn run_daemon(config: Config) -> Result<()> {
    log_enabled_synchronizers(&config.controller);

    let provider = ScalewayProvider::new(config.scaleway)?;
    let client = kube::Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    let (engine, events) = NodegrantEngine::new(
        config.controller,
        Arc::new(provider),
        Arc::new(KubeLabeler::new(client.clone())),
        Box::new(KubeSource::nodes(client.clone())),
        Box::new(KubeSource::services(client)),
    )?;
    let event_logger = tokio::spawn(log_events(events));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let result = {
        let run = engine.run_with_shutdown(shutdown_rx);
        tokio::pin!(run);

        tokio::select! {
            result = &mut run => result.map_err(anyhow::Error::from),
            signal = wait_for_shutdown_signal() => {
                let signal = signal?;
                info!("Received shutdown signal: {}", signal);
                shutdown_tx.send_replace(true);

                match tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut run).await {
                    Ok(result) => result.map_err(anyhow::Error::from),
                    Err(_) => Err(anyhow::anyhow!("Shutdown timeout after {:?}", SHUTDOWN_TIMEOUT)),
                }
            }
        }
    };

    // closes the event channel
    drop(engine);
    let _ = event_logger.await;

    if result.is_ok() {
        info!("Shutting down daemon");
    }
    result
}

fn log_enabled_synchronizers(config: &ControllerConfig) {
    if let Some(ref domain) = config.reverse_ip_domain {
        info!("Reverse DNS enabled for {}", domain);
    }
    if !config.reserved_ips.is_empty() {
        info!("Reserved IP pool: {} address(es)", config.reserved_ips.len());
    }
    if !config.database_ids.is_empty() || !config.redis_ids.is_empty() {
        info!(
            "Data-store ACLs: {} database(s), {} redis cluster(s), address source {:?}",
            config.database_ids.len(),
            config.redis_ids.len(),
            config.nodes_ip_source
        );
    }
    if !config.security_group_ids.is_empty() {
        info!("Security groups: {}", config.security_group_ids.join(", "));
    }
}

/// Log controller events until every controller dropped its sender
async fn log_events(mut events: mpsc::Receiver<ControllerEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            ControllerEvent::Started { controller, workers } => {
                info!(controller, workers, "Controller started");
            }
            ControllerEvent::PassSucceeded { controller, key } => {
                debug!(controller, key = %key, "Reconciled");
            }
            ControllerEvent::PassFailed {
                controller,
                key,
                error,
                retry_count,
            } => {
                warn!(controller, key = %key, retry_count, "Reconciliation failed, requeued: {}", error);
            }
            ControllerEvent::Abandoned {
                controller,
                key,
                error,
            } => {
                error!(controller, key = %key, "Dropping key out of the queue: {}", error);
            }
            ControllerEvent::Stopped { controller, reason } => {
                info!(controller, "Controller stopped: {}", reason);
            }
        }
    }
}

/// Wait for shutdown signals (SIGTERM, SIGINT)
///
/// Returns the name of the signal received.
#[cfg(unix)]
async fn wait_for_shutdown_signal() -> Result<&'static str> {
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGTERM handler: {}", e))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGINT handler: {}", e))?;

    Ok(tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    })
}

/// Wait for shutdown signals (SIGINT only)
///
/// Fallback implementation for non-Unix platforms.
#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> Result<&'static str> {
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to wait for CTRL-C: {}", e))?;
    Ok("SIGINT")
}
