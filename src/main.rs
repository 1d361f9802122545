//! autovpa - a Kubernetes operator managing VerticalPodAutoscalers from
//! named profiles.
//!
//! This is the main entry point that:
//! - Parses options and initializes structured logging
//! - Loads and validates the profile library (fatal on error)
//! - Creates the Kubernetes client and checks the VPA CRD is installed
//! - Runs leader election (required for HA deployments)
//! - Starts the controllers and the health server

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use kube::Client;
use kube_leader_election::{LeaseLock, LeaseLockParams};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use autovpa::options::{ARGO_TRACKING_ANNOTATION, LogFormat, Options};
use autovpa::{Context, HealthState, MetaConfig, config, health, run_controllers, vpa};

/// Lease configuration
const LEASE_NAME: &str = "autovpa-leader";
const LEASE_TTL_SECS: u64 = 15;
const LEASE_RENEW_INTERVAL_SECS: u64 = 5;

/// Grace period for in-flight reconciliations to complete during shutdown
const SHUTDOWN_GRACE_PERIOD_SECS: u64 = 5;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let options = Options::parse();

    init_logging(&options)?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting autovpa");

    // Startup exclusivity checks: anything only fixable by restarting with
    // different configuration fails here, never mid-operation.
    if let Err(e) = options.validate_keys() {
        return Err(format!("keys must be unique: {e}").into());
    }

    let profiles = config::load(&options.config)?.validate(&options.vpa_name_template)?;
    info!(
        profiles = profiles.profiles.len(),
        default_profile = %profiles.default_profile,
        "Loaded profile library"
    );

    // Create Kubernetes client
    let client = Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    if !options.disable_crd_check {
        if !vpa::crd_installed(&client).await? {
            return Err("verticalpodautoscaler CRD not installed".into());
        }
        info!("VerticalPodAutoscaler CRD present");
    }

    // Shared health state; the probe server runs regardless of leadership.
    let health_state = Arc::new(HealthState::new());
    let health_handle = {
        let health_state = health_state.clone();
        let probe_addr = options.probe_addr;
        let metrics_enabled = options.metrics_enabled;
        tokio::spawn(async move {
            if let Err(e) = health::run_health_server(health_state, probe_addr, metrics_enabled).await
            {
                error!("Health server error: {}", e);
            }
        })
    };

    // Leadership: acquire before starting controllers, then keep renewing in
    // the background. Losing the lease exits the process so Kubernetes
    // restarts us back into the election.
    let lease_renewal_handle = if options.leader_election {
        Some(acquire_leadership(client.clone()).await)
    } else {
        info!("Leader election disabled");
        None
    };

    let ctx = Arc::new(Context::new(
        client,
        MetaConfig {
            profile_key: options.profile_annotation.clone(),
            managed_label: options.managed_label.clone(),
            argo_managed: options.argo_managed,
            argo_tracking_annotation: ARGO_TRACKING_ANNOTATION.to_string(),
        },
        profiles,
        health_state.clone(),
    ));

    let controller_handle = {
        let ctx = ctx.clone();
        let namespaces = options.watch_namespaces.clone();
        tokio::spawn(async move {
            run_controllers(ctx, &namespaces).await;
        })
    };

    // Wait for any task to complete (or fail), or shutdown signal
    tokio::select! {
        result = controller_handle => {
            if let Err(e) = result {
                error!("Controller task panicked: {}", e);
            }
        }
        result = health_handle => {
            if let Err(e) = result {
                error!("Health server task panicked: {}", e);
            }
        }
        // Lease renewal task only exits via process::exit() or panic
        result = async {
            match lease_renewal_handle {
                Some(handle) => handle.await,
                None => std::future::pending().await,
            }
        } => {
            if let Err(e) = result {
                error!("Lease renewal task panicked: {}", e);
            }
        }
        // Handle graceful shutdown on SIGTERM or SIGINT
        _ = shutdown_signal() => {
            info!("Received shutdown signal, initiating graceful shutdown...");

            // Mark as not ready to stop receiving new work
            health_state.set_ready(false).await;

            // Give in-flight reconciliations time to complete
            info!(
                "Waiting {}s for in-flight reconciliations to complete...",
                SHUTDOWN_GRACE_PERIOD_SECS
            );
            tokio::time::sleep(Duration::from_secs(SHUTDOWN_GRACE_PERIOD_SECS)).await;

            info!("Grace period complete, shutting down");
        }
    }

    info!("Operator stopped");
    Ok(())
}

/// Initialize the tracing subscriber per the configured log format.
fn init_logging(options: &Options) -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::from_default_env()
        .add_directive("autovpa=info".parse()?)
        .add_directive("kube=info".parse()?)
        .add_directive("kube_leader_election=info".parse()?);

    match options.log_format {
        LogFormat::Json => tracing_subscriber::fmt().with_env_filter(filter).json().init(),
        LogFormat::Console => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
    Ok(())
}

/// Block until this instance holds the leadership lease, then spawn the
/// renewal loop.
async fn acquire_leadership(client: Client) -> tokio::task::JoinHandle<()> {
    // Get pod identity for leader election
    let pod_name = std::env::var("POD_NAME").unwrap_or_else(|_| {
        warn!("POD_NAME not set, using hostname");
        hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string())
    });
    let namespace = std::env::var("POD_NAMESPACE").unwrap_or_else(|_| {
        warn!("POD_NAMESPACE not set, using 'default'");
        "default".to_string()
    });

    info!(
        holder_id = %pod_name,
        namespace = %namespace,
        lease_name = LEASE_NAME,
        "Initializing leader election"
    );

    let lease_params = || LeaseLockParams {
        holder_id: pod_name.clone(),
        lease_name: LEASE_NAME.to_string(),
        lease_ttl: Duration::from_secs(LEASE_TTL_SECS),
    };

    let lease_lock = LeaseLock::new(client.clone(), &namespace, lease_params());

    info!("Waiting to acquire leadership...");
    loop {
        match lease_lock.try_acquire_or_renew().await {
            Ok(result) => {
                if result.acquired_lease {
                    info!("Acquired leadership");
                    break;
                }
                info!("Another instance is leader, waiting...");
            }
            Err(e) => {
                warn!("Failed to acquire lease: {}, retrying...", e);
            }
        }
        tokio::time::sleep(Duration::from_secs(LEASE_RENEW_INTERVAL_SECS)).await;
    }

    let lease_lock = LeaseLock::new(client, &namespace, lease_params());

    #[allow(clippy::exit)]
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(LEASE_RENEW_INTERVAL_SECS)).await;

            match lease_lock.try_acquire_or_renew().await {
                Ok(result) => {
                    if !result.acquired_lease {
                        error!("Lost leadership! Shutting down...");
                        // Exit so Kubernetes restarts us and we re-enter election
                        std::process::exit(1);
                    }
                }
                Err(e) => {
                    error!("Failed to renew lease: {}. Shutting down...", e);
                    std::process::exit(1);
                }
            }
        }
    })
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
///
/// Note: Signal handler setup failures are fatal - the operator cannot shut
/// down gracefully without them. Using expect() here is intentional.
#[allow(clippy::expect_used)]
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
