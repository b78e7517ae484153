//! dpo - DataPlane Operator.
//!
//! Watches `DataPlane`, `TenantInfra` and `Tenant` resources and converges each customer
//! dataplane: network, EKS control plane, node pools, add-ons and chart workloads, plus
//! the tenant pools layered on top. Deletion tears everything down in reverse order.

mod aws;
mod cloud;
mod config;
mod controller;
mod crd;
mod ec2;
mod eks;
mod error;
mod helm;
mod iam;
mod phases;
mod reconciler;
mod status;
mod store;
mod telemetry;
mod tenant;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use anyhow::Result;
use futures::StreamExt;
use kube::runtime::Controller;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Api, CustomResourceExt, Resource};
use tracing::{error, info};

use crate::aws::AwsConnector;
use crate::cloud::CloudRegistry;
use crate::config::{Command, Config};
use crate::controller::Context;
use crate::crd::{CloudKind, DataPlane, Tenant, TenantInfra};
use crate::helm::HelmFactory;
use crate::reconciler::Engine;
use crate::status::KubeStore;
use crate::store::InFlightStore;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const COMMIT: &str = match option_env!("BUILD_COMMIT") {
    Some(commit) => commit,
    None => "unknown",
};
pub const BUILD_DATE: &str = match option_env!("BUILD_DATE") {
    Some(date) => date,
    None => "unknown",
};

#[tokio::main]
async fn main() {
    let config = Config::from_args();

    if config.command() == Command::Crd {
        if let Err(e) = print_crds() {
            eprintln!("Failed to render CRDs: {e}");
            std::process::exit(1);
        }
        return;
    }

    telemetry::logging::init(&config.log_format, &config.log_level);
    info!(
        "Starting dpo v{} (commit: {}, build: {})",
        VERSION, COMMIT, BUILD_DATE
    );
    config.display();

    if let Err(e) = run(config).await {
        error!("Operator failed: {:#}", e);
        std::process::exit(1);
    }
}

/// Print every CRD manifest as a multi-document YAML stream.
fn print_crds() -> Result<()> {
    for crd in [DataPlane::crd(), TenantInfra::crd(), Tenant::crd()] {
        print!("---\n{}", serde_yaml::to_string(&crd)?);
    }
    Ok(())
}

/// Main operator loop.
async fn run(config: Config) -> Result<()> {
    let client = kube::Client::try_default().await?;
    info!("Connected to Kubernetes API server");

    let mut registry = prometheus_client::registry::Registry::default();
    let metrics = Arc::new(telemetry::metrics::Metrics::new(&mut registry));
    let registry = Arc::new(registry);

    let health_state = telemetry::health::HealthState::new();
    let health_state_clone = health_state.clone();
    let health_port = config.health_port;
    tokio::spawn(async move {
        if let Err(e) = telemetry::health::serve(health_port, health_state_clone).await {
            error!("Health server failed: {}", e);
        }
    });

    let metrics_port = config.metrics_port;
    tokio::spawn(async move {
        if let Err(e) = telemetry::metrics::serve(metrics_port, registry).await {
            error!("Metrics server failed: {}", e);
        }
    });

    let connectors = CloudRegistry::new().with(
        CloudKind::Aws,
        Arc::new(AwsConnector::new(config.provider_timeout())),
    );

    let ctx = Arc::new(Context {
        kube_client: client.clone(),
        engine: Engine {
            store: Arc::new(KubeStore::<DataPlane>::new(client.clone())),
            connector: Arc::new(connectors),
            charts: Arc::new(HelmFactory::new(config.helm_binary.clone())),
            inflight: Arc::new(InFlightStore::new()),
            settings: config.settings(),
            metrics: Some(metrics),
        },
        infra_store: Arc::new(KubeStore::<TenantInfra>::new(client.clone())),
        tenant_store: Arc::new(KubeStore::<Tenant>::new(client.clone())),
    });

    health_state.set_ready(true);

    info!("Starting DataPlane, TenantInfra and Tenant controllers");
    let dataplanes = Controller::new(Api::<DataPlane>::all(client.clone()), WatcherConfig::default())
        .shutdown_on_signal()
        .run(controller::reconcile, controller::error_policy, ctx.clone())
        .for_each(|res| async move { log_result::<DataPlane>(res) });

    let infras = Controller::new(Api::<TenantInfra>::all(client.clone()), WatcherConfig::default())
        .shutdown_on_signal()
        .run(controller::reconcile_infra, controller::error_policy, ctx.clone())
        .for_each(|res| async move { log_result::<TenantInfra>(res) });

    let tenants = Controller::new(Api::<Tenant>::all(client), WatcherConfig::default())
        .shutdown_on_signal()
        .run(controller::reconcile_binding, controller::error_policy, ctx)
        .for_each(|res| async move { log_result::<Tenant>(res) });

    futures::join!(dataplanes, infras, tenants);
    health_state.set_ready(false);
    info!("Controllers stopped");
    Ok(())
}

fn log_result<K: Resource<DynamicType = ()>>(
    res: Result<
        (kube::runtime::reflector::ObjectRef<K>, kube::runtime::controller::Action),
        impl std::fmt::Debug,
    >,
) {
    match res {
        Ok((obj, _)) => tracing::debug!("Reconciled {} {}", K::kind(&()), obj.name),
        Err(e) => error!("Reconcile failed: {:?}", e),
    }
}
