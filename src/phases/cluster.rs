//! Control plane lifecycle and OIDC provider registration.
//!
//! A missing cluster is created and the pass stops there; creation is never awaited in
//! place. An active cluster is checked for version drift, then its identity provider is
//! registered.

use anyhow::Result;
use tracing::{debug, info, warn};

use super::{Pass, Step};
use crate::cloud::{ClusterInfo, ClusterRequest, RoleRequest, STATUS_ACTIVE};
use crate::crd::PhaseEvent;
use crate::eks::version::next_update_step;
use crate::error::DpoError;
use crate::iam::role::{CLUSTER_POLICY_ARN, service_trust_policy};
use crate::status::set_condition;

pub const CONDITION_CREATE_INITIATED: &str = "ControlPlaneCreateInitiated";
pub const CONDITION_UPDATE_INITIATED: &str = "ControlPlaneUpdateInitiated";
pub const CONDITION_READY: &str = "ControlPlaneReady";
pub const CONDITION_OIDC_READY: &str = "OidcProviderReady";

const STATUS_FAILED: &str = "FAILED";

pub async fn reconcile(pass: &mut Pass<'_>) -> Result<Step> {
    let cluster_name = pass.cluster_name().to_string();
    let Some(cluster) = pass.cloud.cluster.describe_cluster(&cluster_name).await? else {
        create(pass).await?;
        return Ok(Step::Pending);
    };
    debug!(
        "Cluster {} is {} at version {}",
        cluster_name, cluster.status, cluster.version
    );

    let observed = cluster.clone();
    pass.patch(|s| {
        let eks = &mut s.cloud_infra_status.eks_status;
        eks.status = Some(observed.status.clone());
        eks.version = Some(observed.version.clone());
        if let Some(arn) = &observed.arn {
            eks.cluster_id.get_or_insert_with(|| arn.clone());
        }
    })
    .await?;

    match cluster.status.as_str() {
        STATUS_ACTIVE => {}
        STATUS_FAILED => {
            return Err(DpoError::ResourceFailed(
                "cluster".to_string(),
                cluster_name,
                cluster.status,
            )
            .into());
        }
        other => {
            let reason = transitional_reason(other);
            pass.patch(|s| {
                set_condition(
                    &mut s.conditions,
                    CONDITION_READY,
                    false,
                    reason,
                    format!("Control plane status is {other}"),
                );
            })
            .await?;
            return Ok(Step::Pending);
        }
    }

    if let Some(target) = next_update_step(&cluster.version, &pass.spec().cluster.version)? {
        request_update(pass, &cluster, &target).await?;
        return Ok(Step::Pending);
    }

    pass.patch(|s| {
        set_condition(
            &mut s.conditions,
            CONDITION_READY,
            true,
            "ClusterActive",
            format!("Control plane is active at version {}", cluster.version),
        );
    })
    .await?;

    ensure_oidc_provider(pass, &cluster).await?;
    Ok(Step::Ready)
}

fn transitional_reason(status: &str) -> &'static str {
    match status {
        "CREATING" => "ControlPlaneCreating",
        "UPDATING" => "ControlPlaneUpdating",
        "DELETING" => "ControlPlaneDeleting",
        _ => "ControlPlanePending",
    }
}

async fn create(pass: &mut Pass<'_>) -> Result<()> {
    let cluster_name = pass.cluster_name().to_string();
    let version = pass.spec().cluster.version.clone();

    let infra = &pass.status().cloud_infra_status;
    if infra.subnet_ids.is_empty() {
        return Err(DpoError::missing("cluster", "subnets for the control plane").into());
    }
    let subnet_ids = infra.subnet_ids.clone();
    let security_group_ids = infra.security_group_ids.clone();

    let role_arn = pass
        .cloud
        .identity
        .ensure_role(&RoleRequest {
            name: format!("{cluster_name}-cluster-role"),
            trust_policy: service_trust_policy("eks.amazonaws.com"),
            managed_policy_arns: vec![CLUSTER_POLICY_ARN.to_string()],
        })
        .await?;

    let arn = pass
        .cloud
        .cluster
        .create_cluster(&ClusterRequest {
            name: cluster_name.clone(),
            version: version.clone(),
            role_arn,
            subnet_ids,
            security_group_ids,
        })
        .await?;
    pass.record_create("cluster");
    info!(
        "Requested control plane {} at version {} ({})",
        cluster_name, version, arn
    );

    let message = format!("Requested control plane {cluster_name} at version {version}");
    pass.patch(|s| {
        s.phase = Some(s.phase().next(PhaseEvent::Provisioning));
        let eks = &mut s.cloud_infra_status.eks_status;
        eks.cluster_id.get_or_insert_with(|| arn.clone());
        eks.status = Some("CREATING".to_string());
        set_condition(
            &mut s.conditions,
            CONDITION_CREATE_INITIATED,
            true,
            "CreateClusterAccepted",
            message.clone(),
        );
    })
    .await?;
    pass.recorder
        .publish(CONDITION_CREATE_INITIATED, &message)
        .await;
    Ok(())
}

async fn request_update(pass: &mut Pass<'_>, cluster: &ClusterInfo, target: &str) -> Result<()> {
    let update_id = pass
        .cloud
        .cluster
        .update_cluster_version(&cluster.name, target)
        .await?;
    info!(
        "Requested control plane update of {} from {} to {} (update {})",
        cluster.name, cluster.version, target, update_id
    );

    let message = format!(
        "Updating control plane from {} to {} (update {update_id})",
        cluster.version, target
    );
    pass.patch(|s| {
        s.phase = Some(s.phase().next(PhaseEvent::UpgradeStarted));
        s.cloud_infra_status.eks_status.status = Some("UPDATING".to_string());
        set_condition(
            &mut s.conditions,
            CONDITION_UPDATE_INITIATED,
            true,
            "UpdateClusterVersionAccepted",
            message.clone(),
        );
    })
    .await?;
    pass.recorder
        .publish(CONDITION_UPDATE_INITIATED, &message)
        .await;
    Ok(())
}

/// Register the cluster's OIDC issuer as an identity provider and record its ARN.
async fn ensure_oidc_provider(pass: &mut Pass<'_>, cluster: &ClusterInfo) -> Result<()> {
    if let Some(arn) = pass
        .status()
        .cloud_infra_status
        .eks_status
        .oidc_provider_arn
        .clone()
    {
        if pass.cloud.identity.oidc_provider_exists(&arn).await? {
            return Ok(());
        }
        warn!(
            "OIDC provider {} recorded for {} is gone, registering again",
            arn,
            pass.name()
        );
    }

    let issuer = cluster
        .oidc_issuer
        .as_deref()
        .ok_or_else(|| DpoError::missing("cluster", "identity.oidc.issuer"))?;

    let arn = match pass.cloud.identity.find_oidc_provider(issuer).await? {
        Some(arn) => {
            info!("Found existing OIDC provider {} for {}", arn, issuer);
            arn
        }
        None => {
            let thumbprint = pass.cloud.identity.issuer_thumbprint(issuer).await?;
            let arn = pass
                .cloud
                .identity
                .create_oidc_provider(issuer, &thumbprint)
                .await?;
            pass.record_create("oidc-provider");
            info!("Registered OIDC provider {} for {}", arn, issuer);
            arn
        }
    };

    pass.patch(|s| {
        s.cloud_infra_status.eks_status.oidc_provider_arn = Some(arn.clone());
        set_condition(
            &mut s.conditions,
            CONDITION_OIDC_READY,
            true,
            "ProviderRegistered",
            issuer,
        );
    })
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::DataPlanePhase;
    use crate::testing::{Harness, dataplane, networked};

    #[tokio::test]
    async fn test_missing_cluster_is_created_once() {
        let harness = Harness::new(vec![networked(dataplane("demo"))]);

        let step = reconcile(&mut harness.pass("demo")).await.unwrap();
        assert_eq!(step, Step::Pending);
        assert_eq!(harness.cloud.calls("create_cluster"), 1);
        assert_eq!(harness.cloud.calls("ensure_role"), 1);

        let status = harness.status("demo");
        assert_eq!(status.phase, Some(DataPlanePhase::Creating));
        assert_eq!(
            status.cloud_infra_status.eks_status.status.as_deref(),
            Some("CREATING")
        );
        let condition = status.condition(CONDITION_CREATE_INITIATED).unwrap();
        assert_eq!(condition.status, "True");
        assert_eq!(condition.reason, "CreateClusterAccepted");

        // The describe now finds the cluster still creating.
        let step = reconcile(&mut harness.pass("demo")).await.unwrap();
        assert_eq!(step, Step::Pending);
        assert_eq!(harness.cloud.calls("create_cluster"), 1);
        let condition = harness.status("demo").condition(CONDITION_READY).cloned().unwrap();
        assert_eq!(condition.status, "False");
        assert_eq!(condition.reason, "ControlPlaneCreating");
    }

    #[tokio::test]
    async fn test_create_requires_subnets() {
        let harness = Harness::new(vec![dataplane("demo")]);
        assert!(reconcile(&mut harness.pass("demo")).await.is_err());
        assert_eq!(harness.cloud.calls("create_cluster"), 0);
    }

    #[tokio::test]
    async fn test_active_cluster_registers_oidc_once() {
        let harness = Harness::new(vec![networked(dataplane("demo"))]);
        harness.cloud.put_cluster("demo", "ACTIVE", "1.28");

        let step = reconcile(&mut harness.pass("demo")).await.unwrap();
        assert_eq!(step, Step::Ready);
        let status = harness.status("demo");
        assert!(status.cloud_infra_status.eks_status.oidc_provider_arn.is_some());
        assert_eq!(status.condition(CONDITION_READY).unwrap().status, "True");
        assert_eq!(harness.cloud.calls("create_oidc_provider"), 1);

        let before = harness.status("demo");
        reconcile(&mut harness.pass("demo")).await.unwrap();
        assert_eq!(harness.cloud.calls("create_oidc_provider"), 1);
        assert_eq!(harness.status("demo"), before);
    }

    #[tokio::test]
    async fn test_version_drift_requests_one_minor_step() {
        let mut record = networked(dataplane("demo"));
        record.spec.cluster.version = "1.29".to_string();
        record.status.get_or_insert_with(Default::default).phase = Some(DataPlanePhase::Active);
        let harness = Harness::new(vec![record]);
        harness.cloud.put_cluster("demo", "ACTIVE", "1.27");

        let step = reconcile(&mut harness.pass("demo")).await.unwrap();
        assert_eq!(step, Step::Pending);
        assert_eq!(harness.cloud.version_updates(), vec!["1.28"]);

        let status = harness.status("demo");
        assert_eq!(status.phase, Some(DataPlanePhase::Updating));
        assert!(status.condition(CONDITION_UPDATE_INITIATED).is_some());
        assert_eq!(harness.cloud.calls("create_oidc_provider"), 0);
    }

    #[tokio::test]
    async fn test_failed_cluster_is_an_error() {
        let harness = Harness::new(vec![networked(dataplane("demo"))]);
        harness.cloud.put_cluster("demo", "FAILED", "1.28");

        let err = reconcile(&mut harness.pass("demo")).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DpoError>(),
            Some(DpoError::ResourceFailed(_, _, _))
        ));
    }

    #[tokio::test]
    async fn test_existing_provider_is_adopted() {
        let harness = Harness::new(vec![networked(dataplane("demo"))]);
        harness.cloud.put_cluster("demo", "ACTIVE", "1.28");
        harness.cloud.put_oidc_provider("arn:aws:iam::123456789012:oidc-provider/existing");

        reconcile(&mut harness.pass("demo")).await.unwrap();
        assert_eq!(harness.cloud.calls("create_oidc_provider"), 0);
        assert_eq!(
            harness
                .status("demo")
                .cloud_infra_status
                .eks_status
                .oidc_provider_arn
                .as_deref(),
            Some("arn:aws:iam::123456789012:oidc-provider/existing")
        );
    }
}
