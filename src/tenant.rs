//! `TenantInfra` and `Tenant` reconciliation.
//!
//! A `TenantInfra` turns each of its machine-pool sizes into a dedicated node pool named
//! `<dataplane>-tenant-<size>` on the cluster of an active `DataPlane`. A `Tenant` binds to
//! the pool offering its size once that pool is active.

use std::time::Duration;

use anyhow::Result;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use crate::cloud::{STATUS_ACTIVE, STATUS_DELETED, STATUS_DELETING};
use crate::config::ReconcileSettings;
use crate::crd::{
    DataPlanePhase, Tenant, TenantInfra, TenantInfraPhase, TenantInfraStatus, TenantPhase,
    TenantStatus,
};
use crate::phases::nodegroups::{LABEL_TENANT_SIZE, PoolPlan, check_pool_failed, ensure_pool};
use crate::reconciler::Engine;
use crate::status::{
    RecordStore, add_finalizer, has_finalizer, patch_status, remove_finalizer, set_condition,
};

/// Deletion guard of every `TenantInfra`.
pub const TENANT_INFRA_FINALIZER: &str = "dpo.io/tenant-infra-cleanup";

const CONDITION_POOLS_READY: &str = "NodePoolsReady";

/// Recorded for a pool left in place because another `TenantInfra` still offers it.
pub const STATUS_RELEASED: &str = "RELEASED";

pub fn tenant_pool_name(dataplane: &str, size: &str) -> String {
    format!("{dataplane}-tenant-{size}")
}

fn plans(infra: &TenantInfra) -> Vec<PoolPlan> {
    infra
        .spec
        .machine_pools
        .iter()
        .map(|pool| {
            PoolPlan::dedicated(
                tenant_pool_name(&infra.spec.data_plane, &pool.name),
                "tenant",
                pool,
                [(LABEL_TENANT_SIZE.to_string(), pool.name.clone())],
            )
        })
        .collect()
}

async fn patch_infra<F>(store: &dyn RecordStore<TenantInfra>, name: &str, mutate: F) -> Result<()>
where
    F: FnMut(&mut TenantInfraStatus) + Send,
{
    patch_status::<TenantInfra, _, _>(store, name, mutate).await?;
    Ok(())
}

/// Reconcile one `TenantInfra`. Returns the requeue interval.
pub async fn reconcile_tenant_infra(
    engine: &Engine,
    store: &dyn RecordStore<TenantInfra>,
    infra: &TenantInfra,
) -> Result<Duration> {
    let name = infra.name_any();

    if infra.metadata.deletion_timestamp.is_some() {
        return teardown(engine, store, infra).await;
    }

    if !has_finalizer(infra, TENANT_INFRA_FINALIZER) {
        add_finalizer::<TenantInfra, _>(store, &name, TENANT_INFRA_FINALIZER).await?;
    }

    let dataplane = engine.store.get(&infra.spec.data_plane).await?;
    let Some(dataplane) = dataplane.filter(|dp| {
        dp.status
            .as_ref()
            .is_some_and(|s| s.phase() == DataPlanePhase::Active)
    }) else {
        debug!("{} waits for DataPlane {}", name, infra.spec.data_plane);
        let message = format!("Waiting for DataPlane {} to become Active", infra.spec.data_plane);
        patch_infra(store, &name, |s| {
            s.phase = Some(TenantInfraPhase::Pending);
            s.message = Some(message.clone());
        })
        .await?;
        return Ok(engine.settings.short_requeue);
    };

    let cloud = engine
        .connector
        .connect(&dataplane.name_any(), &dataplane.spec)
        .await?;
    let cluster = dataplane.spec.cluster.name.clone();
    let dp_status = dataplane.status.clone().unwrap_or_default();
    let subnet_ids = dp_status.cloud_infra_status.subnet_ids;
    let policy_arn = dp_status.cloud_infra_status.eks_status.autoscaler_policy_arn;

    let mut observed = Vec::new();
    for plan in plans(infra) {
        let (pool, created) =
            ensure_pool(&cloud, &cluster, &plan, &subnet_ids, policy_arn.as_deref()).await?;
        if created {
            if let Some(metrics) = &engine.metrics {
                metrics.record_create("nodegroup");
            }
            info!("Requested tenant pool {} for {}", plan.name, name);
        }
        engine.inflight.register(&cluster, &plan.name);
        observed.push(pool);
    }

    let failure = observed.iter().find_map(|pool| check_pool_failed(pool).err());
    let all_active = observed.iter().all(|pool| pool.status == STATUS_ACTIVE);
    let failure_message = failure.as_ref().map(ToString::to_string);

    patch_infra(store, &name, |s| {
        for pool in &observed {
            s.nodegroup_status
                .insert(pool.name.clone(), pool.status.clone());
        }
        if let Some(message) = &failure_message {
            s.phase = Some(TenantInfraPhase::Failed);
            s.message = Some(message.clone());
            set_condition(
                &mut s.conditions,
                CONDITION_POOLS_READY,
                false,
                "ResourceFailed",
                message.clone(),
            );
        } else if all_active {
            s.phase = Some(TenantInfraPhase::Ready);
            s.message = None;
            set_condition(
                &mut s.conditions,
                CONDITION_POOLS_READY,
                true,
                "AllActive",
                format!("{} node pools active", observed.len()),
            );
        } else {
            s.phase = Some(TenantInfraPhase::Provisioning);
            s.message = None;
            set_condition(
                &mut s.conditions,
                CONDITION_POOLS_READY,
                false,
                "Provisioning",
                "Waiting for node pools",
            );
        }
    })
    .await?;

    if let Some(e) = failure {
        return Err(e.into());
    }
    Ok(if all_active {
        engine.settings.long_requeue
    } else {
        engine.settings.short_requeue
    })
}

async fn teardown(
    engine: &Engine,
    store: &dyn RecordStore<TenantInfra>,
    infra: &TenantInfra,
) -> Result<Duration> {
    let name = infra.name_any();
    if !has_finalizer(infra, TENANT_INFRA_FINALIZER) {
        return Ok(engine.settings.long_requeue);
    }

    patch_infra(store, &name, |s| s.phase = Some(TenantInfraPhase::Terminating)).await?;

    // Without its DataPlane there is no cluster left to hold the pools.
    let Some(dataplane) = engine.store.get(&infra.spec.data_plane).await? else {
        warn!(
            "DataPlane {} of {} is gone, releasing the finalizer",
            infra.spec.data_plane, name
        );
        remove_finalizer::<TenantInfra, _>(store, &name, TENANT_INFRA_FINALIZER).await?;
        return Ok(engine.settings.long_requeue);
    };

    let cloud = engine
        .connector
        .connect(&dataplane.name_any(), &dataplane.spec)
        .await?;
    let cluster = dataplane.spec.cluster.name.clone();

    let mut candidates: Vec<String> = plans(infra).into_iter().map(|p| p.name).collect();
    if let Some(status) = &infra.status {
        candidates.extend(status.nodegroup_status.keys().cloned());
    }
    candidates.sort();
    candidates.dedup();

    // Pools are shared by size; one still offered by a live record stays.
    let claimed: Vec<String> = store
        .list()
        .await?
        .iter()
        .filter(|other| {
            other.name_any() != name
                && other.metadata.deletion_timestamp.is_none()
                && other.spec.data_plane == infra.spec.data_plane
        })
        .flat_map(|other| plans(other).into_iter().map(|p| p.name))
        .collect();

    let mut observed = Vec::new();
    for pool in candidates {
        if claimed.contains(&pool) {
            debug!("Tenant pool {} is still offered elsewhere, releasing it", pool);
            observed.push((pool, STATUS_RELEASED.to_string()));
            continue;
        }
        match cloud.nodegroups.describe_nodegroup(&cluster, &pool).await? {
            None => {
                engine.inflight.remove(&cluster, &pool);
                observed.push((pool, STATUS_DELETED.to_string()));
            }
            Some(info) => {
                if info.status != STATUS_DELETING {
                    cloud.nodegroups.delete_nodegroup(&cluster, &pool).await?;
                    info!("Requested deletion of tenant pool {}", pool);
                }
                observed.push((pool, STATUS_DELETING.to_string()));
            }
        }
    }

    let remaining = observed
        .iter()
        .filter(|(_, status)| status == STATUS_DELETING)
        .count();
    patch_infra(store, &name, |s| {
        for (pool, status) in &observed {
            s.nodegroup_status.insert(pool.clone(), status.clone());
        }
    })
    .await?;

    if remaining > 0 {
        debug!("{} tenant pools of {} still present", remaining, name);
        return Ok(engine.settings.short_requeue);
    }

    remove_finalizer::<TenantInfra, _>(store, &name, TENANT_INFRA_FINALIZER).await?;
    info!("TenantInfra {} torn down", name);
    Ok(engine.settings.long_requeue)
}

/// Bind a `Tenant` to the active pool offering its size.
pub async fn reconcile_tenant(
    infra_store: &dyn RecordStore<TenantInfra>,
    store: &dyn RecordStore<Tenant>,
    tenant: &Tenant,
    settings: &ReconcileSettings,
) -> Result<Duration> {
    let name = tenant.name_any();
    let spec = &tenant.spec;
    let pool = tenant_pool_name(&spec.data_plane, &spec.size);

    let offering = infra_store.list().await?.into_iter().find(|infra| {
        infra.metadata.deletion_timestamp.is_none()
            && infra.spec.data_plane == spec.data_plane
            && infra.spec.machine_pools.iter().any(|p| p.name == spec.size)
    });

    let (phase, message) = match offering {
        None => (
            TenantPhase::Pending,
            Some(format!(
                "No TenantInfra of DataPlane {} offers size {}",
                spec.data_plane, spec.size
            )),
        ),
        Some(infra) => {
            let status = infra
                .status
                .as_ref()
                .and_then(|s| s.nodegroup_status.get(&pool).cloned());
            match status.as_deref() {
                Some(STATUS_ACTIVE) => (TenantPhase::Bound, None),
                other => (
                    TenantPhase::Pending,
                    Some(format!(
                        "Node pool {} is {}",
                        pool,
                        other.unwrap_or("not created yet")
                    )),
                ),
            }
        }
    };

    let bound = phase == TenantPhase::Bound;
    patch_status::<Tenant, _, _>(store, &name, |s: &mut TenantStatus| {
        s.phase = Some(phase);
        s.node_pool = bound.then(|| pool.clone());
        s.message = message.clone();
    })
    .await?;

    if bound {
        debug!("Tenant {} bound to {}", name, pool);
        Ok(settings.long_requeue)
    } else {
        Ok(settings.short_requeue)
    }
}
