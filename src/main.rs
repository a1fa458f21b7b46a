use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use kube_leader_election::{LeaseLock, LeaseLockParams};
use tokio::signal;
use tracing::{error, info, warn};

use mongodb_operator::health::{HealthState, run_health_server};
use mongodb_operator::run_controller_scoped;

const LEASE_NAME: &str = "mongodb-operator-leader";
const LEASE_TTL: Duration = Duration::from_secs(15);
const LEASE_RENEW_INTERVAL: Duration = Duration::from_secs(5);

/// Time given to passes in flight once a shutdown signal arrived
const DRAIN_PERIOD: Duration = Duration::from_secs(5);

/// Who this operator replica is, and what it watches
struct Identity {
    holder: String,
    namespace: String,
    /// Restrict the controller to one namespace; cluster-wide when unset
    watch_namespace: Option<String>,
}

impl Identity {
    fn from_env() -> Self {
        let holder = std::env::var("POD_NAME").unwrap_or_else(|_| {
            let host = hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string());
            warn!(holder = %host, "POD_NAME not set, holding the lease under the hostname");
            host
        });
        let namespace = std::env::var("POD_NAMESPACE").unwrap_or_else(|_| {
            warn!("POD_NAMESPACE not set, keeping the lease in 'default'");
            "default".to_string()
        });
        let watch_namespace = std::env::var("WATCH_NAMESPACE").ok().filter(|ns| !ns.is_empty());
        Self {
            holder,
            namespace,
            watch_namespace,
        }
    }

    fn lease(&self, client: &Client) -> LeaseLock {
        LeaseLock::new(
            client.clone(),
            &self.namespace,
            LeaseLockParams {
                holder_id: self.holder.clone(),
                lease_name: LEASE_NAME.to_string(),
                lease_ttl: LEASE_TTL,
            },
        )
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    install_crypto_provider()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("mongodb_operator=info".parse()?)
                .add_directive("kube=info".parse()?)
                .add_directive("kube_leader_election=info".parse()?),
        )
        .init();

    let identity = Identity::from_env();
    info!(
        holder = %identity.holder,
        namespace = %identity.namespace,
        scope = identity.watch_namespace.as_deref().unwrap_or("cluster-wide"),
        "Starting mongodb-operator"
    );

    let client = Client::try_default().await?;
    let health_state = Arc::new(HealthState::new());

    // Liveness and metrics are served by standby replicas too
    let health_task = {
        let health_state = health_state.clone();
        tokio::spawn(async move {
            if let Err(e) = run_health_server(health_state).await {
                error!(error = %e, "Health server stopped");
            }
        })
    };

    acquire_leadership(&identity.lease(&client)).await;
    let lease_task = tokio::spawn(hold_leadership(identity.lease(&client)));

    let controller_task = {
        let health_state = health_state.clone();
        let client = client.clone();
        let scope = identity.watch_namespace.clone();
        tokio::spawn(async move {
            run_controller_scoped(client, Some(health_state), scope.as_deref()).await;
        })
    };

    tokio::select! {
        result = controller_task => match result {
            Ok(()) => error!("Controller stopped"),
            Err(e) => error!(error = %e, "Controller task panicked"),
        },
        result = health_task => match result {
            Ok(()) => error!("Health server task ended"),
            Err(e) => error!(error = %e, "Health server task panicked"),
        },
        // Only a panic ends the lease task; losing the lease exits the process
        Err(e) = lease_task => error!(error = %e, "Lease task panicked"),
        _ = shutdown_signal() => {
            info!("Shutdown signal received, draining");
            health_state.set_ready(false).await;
            tokio::time::sleep(DRAIN_PERIOD).await;
        }
    }

    info!("Operator stopped");
    Ok(())
}

/// A second installation attempt fails; that is fine as long as some provider is in place
fn install_crypto_provider() -> Result<(), Box<dyn std::error::Error>> {
    let installed = rustls::crypto::aws_lc_rs::default_provider().install_default().is_ok();
    if installed || rustls::crypto::CryptoProvider::get_default().is_some() {
        Ok(())
    } else {
        Err("no rustls crypto provider could be installed".into())
    }
}

/// Block until this replica holds the lease
async fn acquire_leadership(lease: &LeaseLock) {
    info!(lease = LEASE_NAME, "Waiting for leadership");
    loop {
        match lease.try_acquire_or_renew().await {
            Ok(result) if result.acquired_lease => {
                info!("Leadership acquired");
                return;
            }
            Ok(_) => info!("Lease held by another replica"),
            Err(e) => warn!(error = %e, "Lease acquisition failed, retrying"),
        }
        tokio::time::sleep(LEASE_RENEW_INTERVAL).await;
    }
}

/// Renew the lease until it is lost, then exit so the pod restarts as a standby.
/// Two leaders must never reconcile the same cluster.
async fn hold_leadership(lease: LeaseLock) {
    loop {
        tokio::time::sleep(LEASE_RENEW_INTERVAL).await;
        match lease.try_acquire_or_renew().await {
            Ok(result) if result.acquired_lease => {}
            Ok(_) => {
                error!("Leadership lost, exiting");
                std::process::exit(1);
            }
            Err(e) => {
                error!(error = %e, "Lease renewal failed, exiting");
                std::process::exit(1);
            }
        }
    }
}

/// Resolves on SIGTERM or Ctrl+C. A handler that cannot be installed never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Ctrl+C handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
