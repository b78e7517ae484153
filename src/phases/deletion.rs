//! Teardown in reverse dependency order.
//!
//! Workloads, then node pools, then the OIDC provider, then the control plane. Every step
//! is re-derived from fresh describe calls and returns [`Step::Pending`] until the
//! provider confirms it; only a [`Step::Ready`] lets the caller release the finalizer.

use std::collections::BTreeSet;

use anyhow::Result;
use tracing::{debug, info};

use super::{Pass, Step, applications, expected_pool_names};
use crate::cloud::{STATUS_ACTIVE, STATUS_DELETED, STATUS_DELETING};
use crate::crd::PhaseEvent;
use crate::status::set_condition;

use super::cluster::CONDITION_OIDC_READY;

const REASON_PROVIDER_DELETED: &str = "ProviderDeleted";

pub async fn reconcile(pass: &mut Pass<'_>) -> Result<Step> {
    let changed = pass
        .patch(|s| s.phase = Some(s.phase().next(PhaseEvent::DeletionRequested)))
        .await?;
    if changed {
        info!("Tearing down dataplane {}", pass.name());
        pass.recorder
            .publish(
                "DeletionStarted",
                &format!("Tearing down cluster {}", pass.cluster_name()),
            )
            .await;
    }

    let cluster_name = pass.cluster_name().to_string();
    let cluster = pass.cloud.cluster.describe_cluster(&cluster_name).await?;

    if cluster.as_ref().is_some_and(|c| c.status == STATUS_ACTIVE) {
        applications::uninstall_all(pass).await?;
    }

    if delete_node_pools(pass, &cluster_name, cluster.is_some()).await? == Step::Pending {
        return Ok(Step::Pending);
    }

    delete_oidc_provider(pass).await?;

    if let Some(cluster) = cluster {
        if cluster.status == STATUS_DELETING {
            debug!("Cluster {} is still deleting", cluster_name);
        } else {
            pass.cloud.cluster.delete_cluster(&cluster_name).await?;
            info!("Requested deletion of cluster {}", cluster_name);
        }
        pass.patch(|s| {
            s.cloud_infra_status.eks_status.status = Some(STATUS_DELETING.to_string());
        })
        .await?;
        return Ok(Step::Pending);
    }

    pass.engine.inflight.forget(&cluster_name);
    pass.patch(|s| {
        s.cloud_infra_status.eks_status.status = Some(STATUS_DELETED.to_string());
    })
    .await?;
    info!("Cluster {} is gone", cluster_name);
    Ok(Step::Ready)
}

/// Candidate pools come from the in-flight store, the status map, the names the spec
/// implies and, while the cluster exists, the provider's own listing.
async fn delete_node_pools(
    pass: &mut Pass<'_>,
    cluster_name: &str,
    cluster_exists: bool,
) -> Result<Step> {
    let mut candidates: BTreeSet<String> = pass.engine.inflight.get(cluster_name);
    candidates.extend(pass.status().nodegroup_status.keys().cloned());
    candidates.extend(expected_pool_names(pass.name(), pass.spec()));
    if cluster_exists {
        candidates.extend(pass.cloud.nodegroups.list_nodegroups(cluster_name).await?);
    }

    let mut remaining = 0;
    for pool in candidates {
        let observed = pass
            .cloud
            .nodegroups
            .describe_nodegroup(cluster_name, &pool)
            .await?;

        let Some(info) = observed else {
            pass.engine.inflight.remove(cluster_name, &pool);
            pass.patch(|s| {
                if let Some(status) = s.nodegroup_status.get_mut(&pool) {
                    *status = STATUS_DELETED.to_string();
                }
            })
            .await?;
            continue;
        };

        remaining += 1;
        if info.status == STATUS_DELETING {
            debug!("Node pool {} is still deleting", pool);
        } else {
            pass.cloud
                .nodegroups
                .delete_nodegroup(cluster_name, &pool)
                .await?;
            info!("Requested deletion of node pool {}", pool);
        }
        pass.patch(|s| {
            s.nodegroup_status
                .insert(pool.clone(), STATUS_DELETING.to_string());
        })
        .await?;
    }

    if remaining > 0 {
        debug!(
            "{} node pools of {} still present",
            remaining, cluster_name
        );
        return Ok(Step::Pending);
    }
    Ok(Step::Ready)
}

async fn delete_oidc_provider(pass: &mut Pass<'_>) -> Result<()> {
    let status = pass.status();
    let Some(arn) = status.cloud_infra_status.eks_status.oidc_provider_arn.clone() else {
        return Ok(());
    };
    if status
        .condition(CONDITION_OIDC_READY)
        .is_some_and(|c| c.reason == REASON_PROVIDER_DELETED)
    {
        return Ok(());
    }

    pass.cloud.identity.delete_oidc_provider(&arn).await?;
    info!("Deleted OIDC provider {}", arn);
    pass.patch(|s| {
        set_condition(
            &mut s.conditions,
            CONDITION_OIDC_READY,
            false,
            REASON_PROVIDER_DELETED,
            arn.clone(),
        );
    })
    .await?;
    Ok(())
}
