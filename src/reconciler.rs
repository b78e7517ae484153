//! `DataPlane` reconcile orchestration.
//!
//! One pass runs the components in dependency order, folds the outcome into a
//! [`PhaseEvent`] and applies it through [`DataPlanePhase::next`]. Failures mark the record
//! `Failed` with a `Ready=False` condition and surface to the caller, which requeues.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use kube::ResourceExt;
use tracing::{debug, error, info, warn};

use crate::cloud::{CloudConnector, STATUS_ACTIVE};
use crate::config::ReconcileSettings;
use crate::crd::{DataPlane, DataPlanePhase, DataPlaneStatus, PhaseEvent};
use crate::error::{DpoError, reason_of};
use crate::helm::ChartDeployerFactory;
use crate::phases::{Pass, Step, addons, applications, cluster, deletion, network, nodegroups};
use crate::status::{
    self, EventRecorder, RecordStore, add_finalizer, has_finalizer, remove_finalizer, set_condition,
};
use crate::store::InFlightStore;
use crate::telemetry::metrics::Metrics;

/// Deletion guard of every `DataPlane`.
pub const FINALIZER: &str = "dpo.io/cleanup";

pub const CONDITION_READY: &str = "Ready";

/// Everything a pass needs besides the record itself.
pub struct Engine {
    pub store: Arc<dyn RecordStore<DataPlane>>,
    pub connector: Arc<dyn CloudConnector>,
    pub charts: Arc<dyn ChartDeployerFactory>,
    pub inflight: Arc<InFlightStore>,
    pub settings: ReconcileSettings,
    pub metrics: Option<Arc<Metrics>>,
}

/// Aggregate event once the control plane is up: active iff every node pool and add-on is.
pub fn aggregate_event(status: &DataPlaneStatus) -> PhaseEvent {
    let all_active = |map: &std::collections::BTreeMap<String, String>| {
        !map.is_empty() && map.values().all(|s| s == STATUS_ACTIVE)
    };
    if all_active(&status.nodegroup_status) && all_active(&status.addon_status) {
        PhaseEvent::ComponentsReady
    } else {
        PhaseEvent::Provisioning
    }
}

/// Reconcile one `DataPlane`. Returns the requeue interval.
///
/// On error the record has already been marked `Failed`; the caller only logs and requeues.
pub async fn reconcile_dataplane(
    engine: &Engine,
    record: &DataPlane,
    recorder: &EventRecorder,
) -> Result<Duration> {
    let name = record.name_any();
    let limit = engine.settings.reconcile_timeout;

    let result = match tokio::time::timeout(limit, run(engine, record, recorder)).await {
        Ok(result) => result,
        Err(_) => Err(DpoError::Timeout(limit.as_secs()).into()),
    };

    if let Err(e) = &result {
        record_failure(engine, &name, e, recorder).await;
    }
    result
}

async fn run(engine: &Engine, record: &DataPlane, recorder: &EventRecorder) -> Result<Duration> {
    let name = record.name_any();

    if record.metadata.deletion_timestamp.is_some() {
        return teardown(engine, record, recorder).await;
    }

    record.spec.validate(engine.settings.required_azs)?;

    if !has_finalizer(record, FINALIZER) {
        debug!("Adding finalizer to {}", name);
        add_finalizer::<DataPlane, _>(engine.store.as_ref(), &name, FINALIZER).await?;
    }
    let (record, _) = status::patch_status::<DataPlane, _, _>(engine.store.as_ref(), &name, |s| {
        s.phase.get_or_insert(DataPlanePhase::Pending);
    })
    .await?;

    let cloud = engine.connector.connect(&name, &record.spec).await?;
    let mut pass = Pass::new(engine, cloud, &record, recorder);
    let before = pass.status().phase();

    let (event, settled) = provision(&mut pass).await?;

    let generation = record.metadata.generation.unwrap_or_default();
    pass.patch(|s| {
        s.phase = Some(s.phase().next(event));
        s.observed_generation = generation;
        s.message = None;
        if event == PhaseEvent::ComponentsReady {
            set_condition(
                &mut s.conditions,
                CONDITION_READY,
                true,
                "DataPlaneActive",
                "All node pools and add-ons are active",
            );
        } else {
            set_condition(
                &mut s.conditions,
                CONDITION_READY,
                false,
                "Provisioning",
                "Waiting for provider resources",
            );
        }
    })
    .await?;

    let phase = pass.status().phase();
    if let Some(metrics) = &engine.metrics {
        metrics.set_phase(&name, phase);
    }
    if phase != before {
        info!("DataPlane {} moved from {} to {}", name, before, phase);
    }
    if phase == DataPlanePhase::Active && before != DataPlanePhase::Active {
        pass.recorder
            .publish(
                "DataPlaneActive",
                &format!("Cluster {} and its components are active", pass.cluster_name()),
            )
            .await;
    }

    Ok(if phase == DataPlanePhase::Active && settled {
        engine.settings.long_requeue
    } else {
        engine.settings.short_requeue
    })
}

/// Run the components in order. Returns the phase event and whether every component settled.
///
/// Network and control plane gate everything after them. From node pools on, a waiting
/// component still skips the rest, but the phase follows the aggregate of the status maps.
async fn provision(pass: &mut Pass<'_>) -> Result<(PhaseEvent, bool)> {
    if network::reconcile(pass).await? == Step::Pending {
        return Ok((PhaseEvent::Provisioning, false));
    }
    if cluster::reconcile(pass).await? == Step::Pending {
        return Ok((PhaseEvent::Provisioning, false));
    }

    let settled = nodegroups::reconcile(pass).await? == Step::Ready
        && addons::reconcile(pass).await? == Step::Ready
        && applications::reconcile(pass).await? == Step::Ready;

    Ok((aggregate_event(pass.status()), settled))
}

async fn teardown(
    engine: &Engine,
    record: &DataPlane,
    recorder: &EventRecorder,
) -> Result<Duration> {
    let name = record.name_any();
    if !has_finalizer(record, FINALIZER) {
        debug!("{} is being deleted and holds no finalizer of ours", name);
        return Ok(engine.settings.long_requeue);
    }

    let cloud = engine.connector.connect(&name, &record.spec).await?;
    let mut pass = Pass::new(engine, cloud, record, recorder);
    if let Some(metrics) = &engine.metrics {
        metrics.set_phase(&name, DataPlanePhase::Terminating);
    }

    match deletion::reconcile(&mut pass).await? {
        Step::Pending => Ok(engine.settings.short_requeue),
        Step::Ready => {
            remove_finalizer::<DataPlane, _>(engine.store.as_ref(), &name, FINALIZER).await?;
            if let Some(metrics) = &engine.metrics {
                metrics.forget_dataplane(&name);
            }
            info!("DataPlane {} torn down, finalizer removed", name);
            Ok(engine.settings.long_requeue)
        }
    }
}

async fn record_failure(
    engine: &Engine,
    name: &str,
    err: &anyhow::Error,
    recorder: &EventRecorder,
) {
    error!("Reconcile of {} failed: {}", name, err);
    let reason = reason_of(err);
    let message = err.to_string();

    let patched = status::patch_status::<DataPlane, _, _>(engine.store.as_ref(), name, |s| {
        s.phase = Some(s.phase().next(PhaseEvent::Errored));
        s.message = Some(message.clone());
        set_condition(&mut s.conditions, CONDITION_READY, false, reason, message.clone());
    })
    .await;

    match patched {
        Ok((record, _)) => {
            if let Some(metrics) = &engine.metrics {
                let phase = record.status.unwrap_or_default().phase();
                metrics.set_phase(name, phase);
            }
        }
        Err(e) => warn!("Failed to record failure of {}: {}", name, e),
    }
    recorder.publish_warning("ReconcileFailed", &message).await;
}
