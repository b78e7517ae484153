//! Cluster add-ons and the cluster autoscaler.
//!
//! Add-ons that need AWS permissions get an IRSA role trusted through the cluster's
//! OIDC provider, so nothing here runs before that provider is recorded.

use std::collections::BTreeMap;

use anyhow::Result;
use tracing::{debug, info, warn};

use super::{Pass, Step, system_pool_name};
use crate::cloud::{AddonInfo, RoleRequest, STATUS_ACTIVE};
use crate::crd::{AppPhase, ChartSpec};
use crate::error::DpoError;
use crate::iam::oidc::issuer_of_provider;
use crate::iam::role::{
    CNI_POLICY_ARN, EBS_CSI_POLICY_ARN, autoscaler_policy_document, service_account_trust_policy,
};

/// Service account an add-on's IRSA role is bound to.
struct ServiceAccount {
    namespace: &'static str,
    name: &'static str,
    policy_arn: &'static str,
}

struct AddonPlan {
    name: &'static str,
    service_account: ServiceAccount,
}

static ADDONS: [AddonPlan; 2] = [
    AddonPlan {
        name: "vpc-cni",
        service_account: ServiceAccount {
            namespace: "kube-system",
            name: "aws-node",
            policy_arn: CNI_POLICY_ARN,
        },
    },
    AddonPlan {
        name: "aws-ebs-csi-driver",
        service_account: ServiceAccount {
            namespace: "kube-system",
            name: "ebs-csi-controller-sa",
            policy_arn: EBS_CSI_POLICY_ARN,
        },
    },
];

pub const AUTOSCALER_RELEASE: &str = "cluster-autoscaler";
pub const AUTOSCALER_NAMESPACE: &str = "kube-system";
const AUTOSCALER_SERVICE_ACCOUNT: &str = "cluster-autoscaler";
const AUTOSCALER_REPOSITORY: &str = "https://kubernetes.github.io/autoscaler";
const AUTOSCALER_CHART_VERSION: &str = "9.37.0";

const STATUS_CREATE_FAILED: &str = "CREATE_FAILED";

pub async fn reconcile(pass: &mut Pass<'_>) -> Result<Step> {
    let Some(provider_arn) = pass
        .status()
        .cloud_infra_status
        .eks_status
        .oidc_provider_arn
        .clone()
    else {
        debug!("Add-ons of {} wait for the OIDC provider", pass.name());
        return Ok(Step::Pending);
    };
    let issuer = issuer_of_provider(&provider_arn)
        .ok_or_else(|| DpoError::missing("addons", "issuer in the OIDC provider ARN"))?;
    let cluster = pass.cluster_name().to_string();

    let mut all_active = true;
    for plan in &ADDONS {
        let info = ensure_addon(pass, &cluster, plan, &provider_arn, &issuer).await?;
        pass.patch(|s| {
            s.addon_status.insert(info.name.clone(), info.status.clone());
        })
        .await?;
        if info.status == STATUS_CREATE_FAILED {
            return Err(DpoError::ResourceFailed(
                "add-on".to_string(),
                info.name,
                info.status,
            )
            .into());
        }
        all_active &= info.status == STATUS_ACTIVE;
    }

    let policy_arn = ensure_autoscaler_policy(pass, &cluster).await?;
    let role_arn =
        ensure_autoscaler_role(pass, &cluster, &provider_arn, &issuer, &policy_arn).await?;
    let autoscaler_deployed = ensure_autoscaler_chart(pass, &cluster, &role_arn).await?;

    Ok(if all_active && autoscaler_deployed {
        Step::Ready
    } else {
        Step::Pending
    })
}

async fn ensure_addon(
    pass: &Pass<'_>,
    cluster: &str,
    plan: &AddonPlan,
    provider_arn: &str,
    issuer: &str,
) -> Result<AddonInfo> {
    if let Some(existing) = pass.cloud.addons.describe_addon(cluster, plan.name).await? {
        debug!("Add-on {} is {}", plan.name, existing.status);
        return Ok(existing);
    }

    let sa = &plan.service_account;
    let role_arn = pass
        .cloud
        .identity
        .ensure_role(&RoleRequest {
            name: format!("{cluster}-{}-role", plan.name),
            trust_policy: service_account_trust_policy(provider_arn, issuer, sa.namespace, sa.name),
            managed_policy_arns: vec![sa.policy_arn.to_string()],
        })
        .await?;

    let created = pass
        .cloud
        .addons
        .create_addon(cluster, plan.name, Some(&role_arn))
        .await?;
    pass.record_create("addon");
    info!("Requested add-on {} on {}", plan.name, cluster);
    Ok(created)
}

/// Create the scoped autoscaling policy once and attach it to every known node role.
///
/// Pools created later receive the policy with their role.
async fn ensure_autoscaler_policy(pass: &mut Pass<'_>, cluster: &str) -> Result<String> {
    if let Some(arn) = pass
        .status()
        .cloud_infra_status
        .eks_status
        .autoscaler_policy_arn
        .clone()
    {
        return Ok(arn);
    }

    let policy_arn = pass
        .cloud
        .identity
        .ensure_policy(
            &format!("{cluster}-cluster-autoscaler"),
            &autoscaler_policy_document(),
        )
        .await?;
    info!("Autoscaler policy for {} is {}", cluster, policy_arn);

    let pools: Vec<String> = pass.status().nodegroup_status.keys().cloned().collect();
    for pool in pools {
        pass.cloud
            .identity
            .attach_role_policy(&format!("{pool}-node-role"), &policy_arn)
            .await?;
    }

    pass.patch(|s| {
        s.cloud_infra_status.eks_status.autoscaler_policy_arn = Some(policy_arn.clone());
    })
    .await?;
    Ok(policy_arn)
}

/// IRSA role the autoscaler's service account assumes, carrying the scoped policy.
async fn ensure_autoscaler_role(
    pass: &mut Pass<'_>,
    cluster: &str,
    provider_arn: &str,
    issuer: &str,
    policy_arn: &str,
) -> Result<String> {
    if let Some(arn) = pass
        .status()
        .cloud_infra_status
        .eks_status
        .autoscaler_role_arn
        .clone()
    {
        return Ok(arn);
    }

    let role_arn = pass
        .cloud
        .identity
        .ensure_role(&RoleRequest {
            name: format!("{cluster}-cluster-autoscaler-role"),
            trust_policy: service_account_trust_policy(
                provider_arn,
                issuer,
                AUTOSCALER_NAMESPACE,
                AUTOSCALER_SERVICE_ACCOUNT,
            ),
            managed_policy_arns: vec![policy_arn.to_string()],
        })
        .await?;
    info!("Autoscaler role for {} is {}", cluster, role_arn);

    pass.patch(|s| {
        s.cloud_infra_status
            .eks_status
            .autoscaler_role_arn
            .get_or_insert_with(|| role_arn.clone());
    })
    .await?;
    Ok(role_arn)
}

fn autoscaler_chart(cluster: &str, region: &str, role_arn: &str) -> ChartSpec {
    ChartSpec {
        repository: AUTOSCALER_REPOSITORY.to_string(),
        name: "cluster-autoscaler".to_string(),
        version: AUTOSCALER_CHART_VERSION.to_string(),
        values: BTreeMap::from([
            ("autoDiscovery.clusterName".to_string(), cluster.to_string()),
            ("awsRegion".to_string(), region.to_string()),
            (
                "rbac.serviceAccount.name".to_string(),
                AUTOSCALER_SERVICE_ACCOUNT.to_string(),
            ),
            (
                r"rbac.serviceAccount.annotations.eks\.amazonaws\.com/role-arn".to_string(),
                role_arn.to_string(),
            ),
        ]),
    }
}

/// Install the autoscaler chart once the system pool can host it. Returns true when deployed.
async fn ensure_autoscaler_chart(
    pass: &mut Pass<'_>,
    cluster: &str,
    role_arn: &str,
) -> Result<bool> {
    if pass.status().cloud_infra_status.eks_status.autoscaler_phase == Some(AppPhase::Deployed) {
        return Ok(true);
    }

    let system_pool = system_pool_name(pass.name());
    if pass.status().nodegroup_status.get(&system_pool).map(String::as_str) != Some(STATUS_ACTIVE)
    {
        debug!("Autoscaler of {} waits for {}", pass.name(), system_pool);
        return Ok(false);
    }

    let chart = autoscaler_chart(cluster, &pass.spec().region, role_arn);
    let deployer = pass.deployer().await?;
    let existing = deployer
        .status(AUTOSCALER_RELEASE, AUTOSCALER_NAMESPACE)
        .await?;

    match existing {
        Some(release) if release.is_deployed() => {}
        Some(release) if release.is_pending() => {
            debug!("Autoscaler release on {} is {}", cluster, release.status);
            return Ok(false);
        }
        existing => {
            pass.patch(|s| {
                s.cloud_infra_status.eks_status.autoscaler_phase = Some(AppPhase::Installing);
            })
            .await?;

            let result = if existing.is_some() {
                deployer
                    .upgrade(AUTOSCALER_RELEASE, AUTOSCALER_NAMESPACE, &chart)
                    .await
            } else {
                deployer
                    .install(AUTOSCALER_RELEASE, AUTOSCALER_NAMESPACE, &chart)
                    .await
            };
            if let Err(e) = result {
                warn!("Autoscaler install on {} failed: {}", cluster, e);
                pass.patch(|s| {
                    s.cloud_infra_status.eks_status.autoscaler_phase = Some(AppPhase::Failed);
                })
                .await?;
                return Err(e);
            }
            pass.record_create("chart");
            info!("Installed cluster autoscaler on {}", cluster);
        }
    }

    pass.patch(|s| {
        s.cloud_infra_status.eks_status.autoscaler_phase = Some(AppPhase::Deployed);
    })
    .await?;
    Ok(true)
}
