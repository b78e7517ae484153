//! Node pool provisioning.
//!
//! Pools are created once and never updated in place; a sizing change shows up as a new
//! pool name. Each pass mirrors the provider's status of every pool into the status map
//! and registers the pool in the in-flight store for teardown.

use std::collections::BTreeMap;

use anyhow::Result;
use tracing::{debug, info};

use super::{Pass, Step};
use crate::cloud::{
    Cloud, NodeGroupInfo, NodeGroupRequest, NodeTaint, RoleRequest, STATUS_ACTIVE,
};
use crate::crd::{DataPlaneSpec, MachinePoolSpec, SystemPoolSpec};
use crate::error::DpoError;
use crate::iam::role::{
    CNI_POLICY_ARN, ECR_READ_ONLY_POLICY_ARN, WORKER_NODE_POLICY_ARN, service_trust_policy,
};

pub const LABEL_POOL_ROLE: &str = "dpo.io/pool-role";
pub const LABEL_WORKLOAD: &str = "dpo.io/workload";
pub const LABEL_TENANT_SIZE: &str = "dpo.io/tenant-size";
/// Taint key of dedicated pools; the value is the pool name.
pub const TAINT_DEDICATED: &str = "dpo.io/dedicated";

const STATUS_CREATE_FAILED: &str = "CREATE_FAILED";

/// One node pool the desired state calls for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolPlan {
    pub name: String,
    pub instance_type: String,
    pub min_size: i32,
    pub max_size: i32,
    pub desired_size: i32,
    pub labels: BTreeMap<String, String>,
    pub taint: Option<NodeTaint>,
}

impl PoolPlan {
    pub fn system(name: String, spec: &SystemPoolSpec) -> Self {
        Self {
            name,
            instance_type: spec.instance_type.clone(),
            min_size: spec.min_size,
            max_size: spec.max_size,
            desired_size: spec.desired_size,
            labels: BTreeMap::from([(LABEL_POOL_ROLE.to_string(), "system".to_string())]),
            taint: None,
        }
    }

    /// A pool tainted so only workloads tolerating `dpo.io/dedicated=<name>` land on it.
    pub fn dedicated(
        name: String,
        role: &str,
        pool: &MachinePoolSpec,
        extra_labels: impl IntoIterator<Item = (String, String)>,
    ) -> Self {
        let mut labels = pool.labels.clone();
        labels.insert(LABEL_POOL_ROLE.to_string(), role.to_string());
        labels.extend(extra_labels);
        Self {
            taint: Some(NodeTaint {
                key: TAINT_DEDICATED.to_string(),
                value: name.clone(),
            }),
            name,
            instance_type: pool.instance_type.clone(),
            min_size: pool.min_size,
            max_size: pool.max_size,
            desired_size: pool.desired_size,
            labels,
        }
    }

    /// Name of the IAM role the pool's nodes run as.
    pub fn role_name(&self) -> String {
        format!("{}-node-role", self.name)
    }
}

/// Pools a `DataPlane` requires: the system pool, then one pool per sized workload.
pub fn desired_pools(dataplane: &str, spec: &DataPlaneSpec) -> Vec<PoolPlan> {
    let mut pools = vec![PoolPlan::system(
        super::system_pool_name(dataplane),
        &spec.system_pool,
    )];
    for app in &spec.applications {
        let Some(pool) = app.size.as_deref().and_then(|size| spec.machine_pool(size)) else {
            continue;
        };
        pools.push(PoolPlan::dedicated(
            super::workload_pool_name(dataplane, &app.name, &pool.name),
            "workload",
            pool,
            [(LABEL_WORKLOAD.to_string(), app.name.clone())],
        ));
    }
    pools
}

/// Describe a pool and create it with its node role when absent.
///
/// Returns the observed pool and whether a create call was issued.
pub async fn ensure_pool(
    cloud: &Cloud,
    cluster: &str,
    plan: &PoolPlan,
    subnet_ids: &[String],
    autoscaler_policy_arn: Option<&str>,
) -> Result<(NodeGroupInfo, bool)> {
    if let Some(existing) = cloud.nodegroups.describe_nodegroup(cluster, &plan.name).await? {
        debug!("Node pool {} is {}", plan.name, existing.status);
        return Ok((existing, false));
    }

    let mut policies = vec![
        WORKER_NODE_POLICY_ARN.to_string(),
        CNI_POLICY_ARN.to_string(),
        ECR_READ_ONLY_POLICY_ARN.to_string(),
    ];
    policies.extend(autoscaler_policy_arn.map(str::to_string));
    let role_arn = cloud
        .identity
        .ensure_role(&RoleRequest {
            name: plan.role_name(),
            trust_policy: service_trust_policy("ec2.amazonaws.com"),
            managed_policy_arns: policies,
        })
        .await?;

    let created = cloud
        .nodegroups
        .create_nodegroup(&NodeGroupRequest {
            cluster_name: cluster.to_string(),
            name: plan.name.clone(),
            role_arn,
            subnet_ids: subnet_ids.to_vec(),
            instance_type: plan.instance_type.clone(),
            min_size: plan.min_size,
            max_size: plan.max_size,
            desired_size: plan.desired_size,
            labels: plan.labels.clone(),
            taint: plan.taint.clone(),
        })
        .await?;
    info!(
        "Requested node pool {} ({} x{}) on {}",
        plan.name, plan.instance_type, plan.desired_size, cluster
    );
    Ok((created, true))
}

/// A pool that can never become active.
pub fn check_pool_failed(info: &NodeGroupInfo) -> Result<(), DpoError> {
    if info.status == STATUS_CREATE_FAILED {
        return Err(DpoError::ResourceFailed(
            "node pool".to_string(),
            info.name.clone(),
            info.status.clone(),
        ));
    }
    Ok(())
}

pub async fn reconcile(pass: &mut Pass<'_>) -> Result<Step> {
    let cluster = pass.cluster_name().to_string();
    let subnet_ids = pass.status().cloud_infra_status.subnet_ids.clone();
    let policy_arn = pass
        .status()
        .cloud_infra_status
        .eks_status
        .autoscaler_policy_arn
        .clone();

    let mut all_active = true;
    for plan in desired_pools(pass.name(), pass.spec()) {
        let (info, created) = ensure_pool(
            &pass.cloud,
            &cluster,
            &plan,
            &subnet_ids,
            policy_arn.as_deref(),
        )
        .await?;
        if created {
            pass.record_create("nodegroup");
        }
        pass.engine.inflight.register(&cluster, &plan.name);

        pass.patch(|s| {
            s.nodegroup_status
                .insert(plan.name.clone(), info.status.clone());
        })
        .await?;
        check_pool_failed(&info)?;
        all_active &= info.status == STATUS_ACTIVE;
    }

    Ok(if all_active { Step::Ready } else { Step::Pending })
}
