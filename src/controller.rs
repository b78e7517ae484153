//! Controller wiring - reconcile dispatch and error policy for the three dpo kinds.

use std::sync::Arc;
use std::time::{Duration, Instant};

use kube::{Resource, ResourceExt};
use kube::runtime::controller::Action;
use tracing::{error, info, warn};

use crate::crd::{DataPlane, Tenant, TenantInfra};
use crate::error::DpoError;
use crate::reconciler::{Engine, reconcile_dataplane};
use crate::status::{EventRecorder, RecordStore};
use crate::tenant::{reconcile_tenant, reconcile_tenant_infra};

/// Shared context for the controllers.
pub struct Context {
    pub kube_client: kube::Client,
    pub engine: Engine,
    pub infra_store: Arc<dyn RecordStore<TenantInfra>>,
    pub tenant_store: Arc<dyn RecordStore<Tenant>>,
}

impl Context {
    fn observe(&self, kind: &str, started: Instant, ok: bool) {
        if let Some(metrics) = &self.engine.metrics {
            let result = if ok { "success" } else { "error" };
            metrics.record_reconcile(kind, result, started.elapsed());
        }
    }

    /// Requeue after an error. The record has already been marked.
    fn retry(&self) -> Action {
        Action::requeue(self.engine.settings.short_requeue)
    }
}

/// Reconcile a `DataPlane` resource.
///
/// Errors never reach the controller runtime: the pass records them on the status and the
/// record is requeued on the short interval.
pub async fn reconcile(obj: Arc<DataPlane>, ctx: Arc<Context>) -> Result<Action, kube::Error> {
    let name = obj.name_any();
    let started = Instant::now();
    info!("Reconciling DataPlane {}", name);

    let recorder = EventRecorder::new(ctx.kube_client.clone(), &*obj);
    let result = reconcile_dataplane(&ctx.engine, &obj, &recorder).await;
    ctx.observe("DataPlane", started, result.is_ok());

    match result {
        Ok(requeue) => Ok(Action::requeue(requeue)),
        Err(e) if e.downcast_ref::<DpoError>().is_some_and(DpoError::is_transient) => {
            warn!("Transient error for DataPlane {}, will retry: {:#}", name, e);
            Ok(ctx.retry())
        }
        Err(e) => {
            error!("Reconcile error for DataPlane {}: {:#}", name, e);
            Ok(ctx.retry())
        }
    }
}

/// Reconcile a `TenantInfra` resource.
pub async fn reconcile_infra(
    obj: Arc<TenantInfra>,
    ctx: Arc<Context>,
) -> Result<Action, kube::Error> {
    let name = obj.name_any();
    let started = Instant::now();
    info!("Reconciling TenantInfra {}", name);

    let result = reconcile_tenant_infra(&ctx.engine, ctx.infra_store.as_ref(), &obj).await;
    ctx.observe("TenantInfra", started, result.is_ok());

    match result {
        Ok(requeue) => Ok(Action::requeue(requeue)),
        Err(e) => {
            error!("Reconcile error for TenantInfra {}: {:#}", name, e);
            let recorder = EventRecorder::new(ctx.kube_client.clone(), &*obj);
            recorder
                .publish_warning("ReconcileFailed", &e.to_string())
                .await;
            Ok(ctx.retry())
        }
    }
}

/// Reconcile a `Tenant` resource.
pub async fn reconcile_binding(obj: Arc<Tenant>, ctx: Arc<Context>) -> Result<Action, kube::Error> {
    let name = obj.name_any();
    let started = Instant::now();

    let result = reconcile_tenant(
        ctx.infra_store.as_ref(),
        ctx.tenant_store.as_ref(),
        &obj,
        &ctx.engine.settings,
    )
    .await;
    ctx.observe("Tenant", started, result.is_ok());

    match result {
        Ok(requeue) => Ok(Action::requeue(requeue)),
        Err(e) => {
            warn!("Reconcile error for Tenant {}: {:#}", name, e);
            Ok(ctx.retry())
        }
    }
}

/// Error policy shared by every controller.
pub fn error_policy<K: Resource>(obj: Arc<K>, err: &kube::Error, _ctx: Arc<Context>) -> Action {
    error!("Controller error for {}: {}", obj.name_any(), err);
    Action::requeue(Duration::from_secs(30))
}
