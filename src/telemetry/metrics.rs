//! Prometheus metrics for the dpo operator.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;
use tokio::net::TcpListener;
use tracing::info;

use crate::crd::DataPlanePhase;

/// Labels for reconcile metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcileLabels {
    pub kind: String,
    pub result: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct KindLabels {
    pub kind: String,
}

/// Labels for phase metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PhaseLabels {
    pub dataplane: String,
    pub phase: String,
}

/// Labels for provider create calls.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ResourceLabels {
    pub resource: String,
}

/// All Prometheus metrics for the operator.
pub struct Metrics {
    pub reconcile_total: Family<ReconcileLabels, Counter>,
    pub reconcile_duration_seconds: Family<KindLabels, Histogram>,
    pub dataplane_phase_info: Family<PhaseLabels, Gauge>,
    pub provider_create_total: Family<ResourceLabels, Counter>,
}

/// Passes that block on chart installs can run for minutes.
const RECONCILE_BUCKETS: &[f64] = &[
    0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0, 900.0,
];

const PHASES: [DataPlanePhase; 6] = [
    DataPlanePhase::Pending,
    DataPlanePhase::Creating,
    DataPlanePhase::Active,
    DataPlanePhase::Updating,
    DataPlanePhase::Failed,
    DataPlanePhase::Terminating,
];

impl Metrics {
    /// Create and register all metrics with the given registry.
    pub fn new(registry: &mut Registry) -> Self {
        let reconcile_total = Family::<ReconcileLabels, Counter>::default();
        registry.register(
            "dpo_reconcile",
            "Total number of reconcile calls",
            reconcile_total.clone(),
        );

        let reconcile_duration_seconds =
            Family::<KindLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(RECONCILE_BUCKETS.iter().copied())
            });
        registry.register(
            "dpo_reconcile_duration_seconds",
            "Duration of reconcile calls in seconds",
            reconcile_duration_seconds.clone(),
        );

        let dataplane_phase_info = Family::<PhaseLabels, Gauge>::default();
        registry.register(
            "dpo_dataplane_phase_info",
            "Current dataplane phase (1=current, 0=other)",
            dataplane_phase_info.clone(),
        );

        let provider_create_total = Family::<ResourceLabels, Counter>::default();
        registry.register(
            "dpo_provider_create",
            "Total number of accepted cloud provider create calls",
            provider_create_total.clone(),
        );

        Self {
            reconcile_total,
            reconcile_duration_seconds,
            dataplane_phase_info,
            provider_create_total,
        }
    }

    pub fn record_reconcile(&self, kind: &str, result: &str, elapsed: Duration) {
        self.reconcile_total
            .get_or_create(&ReconcileLabels {
                kind: kind.to_string(),
                result: result.to_string(),
            })
            .inc();
        self.reconcile_duration_seconds
            .get_or_create(&KindLabels {
                kind: kind.to_string(),
            })
            .observe(elapsed.as_secs_f64());
    }

    /// Set the phase gauge to 1 for `phase` and 0 for every other phase.
    pub fn set_phase(&self, dataplane: &str, phase: DataPlanePhase) {
        for candidate in PHASES {
            self.dataplane_phase_info
                .get_or_create(&PhaseLabels {
                    dataplane: dataplane.to_string(),
                    phase: candidate.to_string(),
                })
                .set(i64::from(candidate == phase));
        }
    }

    /// Drop every phase series of a dataplane whose record is gone.
    pub fn forget_dataplane(&self, dataplane: &str) {
        for candidate in PHASES {
            self.dataplane_phase_info.remove(&PhaseLabels {
                dataplane: dataplane.to_string(),
                phase: candidate.to_string(),
            });
        }
    }

    pub fn record_create(&self, resource: &str) {
        self.provider_create_total
            .get_or_create(&ResourceLabels {
                resource: resource.to_string(),
            })
            .inc();
    }
}

/// Axum handler that encodes the registry as OpenMetrics text.
async fn metrics_handler(State(registry): State<Arc<Registry>>) -> impl IntoResponse {
    let mut buf = String::new();
    if encode(&mut buf, &registry).is_err() {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to encode metrics".to_string(),
        );
    }
    (StatusCode::OK, buf)
}

pub async fn serve(port: u16, registry: Arc<Registry>) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(registry);

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    let listener = TcpListener::bind(addr).await?;
    info!("Metrics server listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}
