//! Health server for Kubernetes probes and Prometheus metrics
//!
//! Provides HTTP endpoints for:
//! - `/healthz` - Liveness probe (is the process alive?)
//! - `/readyz` - Readiness probe (is the operator ready to serve?)
//! - `/metrics` - Prometheus metrics: pass counts and durations, cluster phase,
//!   member readiness per replica set, rollout mutations and backup counts

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use tokio::net::TcpListener;
use tokio::sync::RwLock;

/// Labels identifying one cluster
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct ClusterLabels {
    pub namespace: String,
    pub name: String,
}

impl ClusterLabels {
    fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl prometheus_client::encoding::EncodeLabelSet for ClusterLabels {
    fn encode(
        &self,
        mut encoder: prometheus_client::encoding::LabelSetEncoder<'_>,
    ) -> Result<(), std::fmt::Error> {
        use prometheus_client::encoding::EncodeLabel;
        ("namespace", self.namespace.as_str()).encode(encoder.encode_label())?;
        ("name", self.name.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Cluster labels plus one extra dimension (phase, replica set, backup state)
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct DetailLabels {
    pub namespace: String,
    pub name: String,
    pub key: &'static str,
    pub value: String,
}

impl DetailLabels {
    fn new(namespace: &str, name: &str, key: &'static str, value: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            key,
            value: value.to_string(),
        }
    }
}

impl prometheus_client::encoding::EncodeLabelSet for DetailLabels {
    fn encode(
        &self,
        mut encoder: prometheus_client::encoding::LabelSetEncoder<'_>,
    ) -> Result<(), std::fmt::Error> {
        use prometheus_client::encoding::EncodeLabel;
        ("namespace", self.namespace.as_str()).encode(encoder.encode_label())?;
        ("name", self.name.as_str()).encode(encoder.encode_label())?;
        (self.key, self.value.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

const PHASES: [&str; 4] = ["Initializing", "Ready", "Error", "Stopping"];
const BACKUP_STATES: [&str; 5] = ["Requested", "Starting", "Running", "Completed", "Failed"];

/// Shared metrics state
pub struct Metrics {
    pub reconciliations_total: Family<ClusterLabels, Counter>,
    pub reconciliation_errors_total: Family<ClusterLabels, Counter>,
    pub reconcile_duration_seconds: Family<ClusterLabels, Histogram>,

    /// 1 for the current phase of each cluster, 0 for the others
    pub cluster_phase: Family<DetailLabels, Gauge>,
    pub replica_set_members_desired: Family<DetailLabels, Gauge>,
    /// Members reporting Healthy
    pub replica_set_members_ready: Family<DetailLabels, Gauge>,
    /// Single-member rollout actions issued
    pub rollout_mutations_total: Family<DetailLabels, Counter>,
    /// Catalog records by backup state
    pub backups: Family<DetailLabels, Gauge>,

    registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let reconciliations_total = Family::<ClusterLabels, Counter>::default();
        registry.register(
            "mongodb_operator_reconciliations",
            "Total number of reconcile passes",
            reconciliations_total.clone(),
        );

        let reconciliation_errors_total = Family::<ClusterLabels, Counter>::default();
        registry.register(
            "mongodb_operator_reconciliation_errors",
            "Total number of reconcile passes that ended in an error",
            reconciliation_errors_total.clone(),
        );

        let reconcile_duration_seconds =
            Family::<ClusterLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.001, 2.0, 15))
            });
        registry.register(
            "mongodb_operator_reconcile_duration_seconds",
            "Duration of reconcile passes in seconds",
            reconcile_duration_seconds.clone(),
        );

        let cluster_phase = Family::<DetailLabels, Gauge>::default();
        registry.register(
            "mongodb_operator_cluster_phase",
            "Current phase of each MongoDB cluster",
            cluster_phase.clone(),
        );

        let replica_set_members_desired = Family::<DetailLabels, Gauge>::default();
        registry.register(
            "mongodb_operator_replica_set_members_desired",
            "Desired members of each replica set",
            replica_set_members_desired.clone(),
        );

        let replica_set_members_ready = Family::<DetailLabels, Gauge>::default();
        registry.register(
            "mongodb_operator_replica_set_members_ready",
            "Healthy members of each replica set",
            replica_set_members_ready.clone(),
        );

        let rollout_mutations_total = Family::<DetailLabels, Counter>::default();
        registry.register(
            "mongodb_operator_rollout_mutations",
            "Single-member rollout actions issued",
            rollout_mutations_total.clone(),
        );

        let backups = Family::<DetailLabels, Gauge>::default();
        registry.register(
            "mongodb_operator_backups",
            "Backup catalog records by state",
            backups.clone(),
        );

        Self {
            reconciliations_total,
            reconciliation_errors_total,
            reconcile_duration_seconds,
            cluster_phase,
            replica_set_members_desired,
            replica_set_members_ready,
            rollout_mutations_total,
            backups,
            registry,
        }
    }

    /// Record a finished reconcile pass
    pub fn record_reconcile(&self, namespace: &str, name: &str, duration_secs: f64) {
        let labels = ClusterLabels::new(namespace, name);
        self.reconciliations_total.get_or_create(&labels).inc();
        self.reconcile_duration_seconds
            .get_or_create(&labels)
            .observe(duration_secs);
    }

    pub fn record_error(&self, namespace: &str, name: &str) {
        self.reconciliation_errors_total
            .get_or_create(&ClusterLabels::new(namespace, name))
            .inc();
    }

    pub fn set_cluster_phase(&self, namespace: &str, name: &str, phase: &str) {
        for candidate in PHASES {
            let labels = DetailLabels::new(namespace, name, "phase", candidate);
            self.cluster_phase
                .get_or_create(&labels)
                .set(i64::from(candidate == phase));
        }
    }

    pub fn set_replica_set_members(&self, namespace: &str, name: &str, replset: &str, desired: i64, ready: i64) {
        let labels = DetailLabels::new(namespace, name, "replset", replset);
        self.replica_set_members_desired
            .get_or_create(&labels)
            .set(desired);
        self.replica_set_members_ready
            .get_or_create(&labels)
            .set(ready);
    }

    pub fn record_rollout_mutation(&self, namespace: &str, name: &str, replset: &str) {
        self.rollout_mutations_total
            .get_or_create(&DetailLabels::new(namespace, name, "replset", replset))
            .inc();
    }

    /// Set the backup counts of a cluster; states without records read 0
    pub fn set_backups(&self, namespace: &str, name: &str, counts: &[(&str, i64)]) {
        for state in BACKUP_STATES {
            let count = counts
                .iter()
                .find(|(s, _)| *s == state)
                .map_or(0, |(_, c)| *c);
            self.backups
                .get_or_create(&DetailLabels::new(namespace, name, "state", state))
                .set(count);
        }
    }

    /// Drop every series of a deleted cluster
    pub fn forget_cluster(&self, namespace: &str, name: &str) {
        let labels = ClusterLabels::new(namespace, name);
        self.reconciliations_total.remove(&labels);
        self.reconciliation_errors_total.remove(&labels);
        self.reconcile_duration_seconds.remove(&labels);
        for phase in PHASES {
            self.cluster_phase
                .remove(&DetailLabels::new(namespace, name, "phase", phase));
        }
        for state in BACKUP_STATES {
            self.backups
                .remove(&DetailLabels::new(namespace, name, "state", state));
        }
    }

    /// Encode metrics to Prometheus text format
    ///
    /// Returns an empty string if encoding fails (should never happen with valid metrics).
    fn encode(&self) -> String {
        let mut buffer = String::new();
        if let Err(e) = encode(&mut buffer, &self.registry) {
            tracing::error!("Failed to encode metrics: {}", e);
            return String::new();
        }
        buffer
    }
}

/// Shared state for the health server
pub struct HealthState {
    /// Whether the operator is ready (connected to K8s API)
    pub ready: RwLock<bool>,
    /// Metrics registry
    pub metrics: Metrics,
    /// Last successful reconcile timestamp
    pub last_reconcile: AtomicU64,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    pub fn new() -> Self {
        Self {
            ready: RwLock::new(false),
            metrics: Metrics::new(),
            last_reconcile: AtomicU64::new(0),
        }
    }

    /// Mark the operator as ready
    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    /// Check if the operator is ready
    pub async fn is_ready(&self) -> bool {
        *self.ready.read().await
    }
}

/// Liveness probe handler
///
/// Returns 200 OK if the process is alive.
/// This is a simple check - if we can respond, we're alive.
async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness probe handler
///
/// Returns 200 OK if the operator is ready to serve.
/// Returns 503 Service Unavailable if not ready.
async fn readyz(State(state): State<Arc<HealthState>>) -> Response {
    if state.is_ready().await {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

/// Metrics handler
///
/// Returns Prometheus-formatted metrics.
async fn metrics(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let body = state.metrics.encode();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

/// Create the health server router
pub fn create_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Run the health server
///
/// Binds to 0.0.0.0:8080 and serves health/metrics endpoints.
pub async fn run_health_server(state: Arc<HealthState>) -> Result<(), std::io::Error> {
    let app = create_router(state);

    let listener = TcpListener::bind("0.0.0.0:8080").await?;
    tracing::info!("Health server listening on 0.0.0.0:8080");

    axum::serve(listener, app).await
}
