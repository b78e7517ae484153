//! `DataPlane` status types.
//!
//! The status only grows: ids are set once the provider accepted the create call and
//! map entries are overwritten, never dropped. Fields therefore skip serialization when
//! empty and a JSON Merge Patch never has to remove anything.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{AppPhase, DataPlanePhase};

/// Managed cluster sub-status.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EksStatus {
    /// Cluster ARN returned by the create call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<String>,

    /// Mirror of the provider's control plane status (e.g., "CREATING", "ACTIVE").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,

    /// Kubernetes version last observed on the control plane.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oidc_provider_arn: Option<String>,

    /// Scoped autoscaling policy attached to every node pool role.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autoscaler_policy_arn: Option<String>,

    /// IRSA role of the autoscaler's service account.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autoscaler_role_arn: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autoscaler_phase: Option<AppPhase>,
}

/// Network and cluster sub-status.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CloudInfraStatus {
    /// VPC id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vpc: Option<String>,

    /// CIDR block the VPC was created with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vpc_cidr: Option<String>,

    /// Subnet ids in creation order. Never longer than the targeted AZ count.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subnet_ids: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub security_group_ids: Vec<String>,

    /// DNS hostnames were enabled on the VPC.
    #[serde(default)]
    pub dns_hostnames_enabled: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internet_gateway_id: Option<String>,

    #[serde(default)]
    pub internet_gateway_attached: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_route_table_id: Option<String>,

    /// Default route of the public route table points at the internet gateway.
    #[serde(default)]
    pub public_route_added: bool,

    /// Public subnets that map public IPs and joined the public route table.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub public_subnets_configured: Vec<String>,

    /// Elastic IP allocated for the NAT gateway.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nat_allocation_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nat_gateway_id: Option<String>,

    /// NAT gateway is the default route of every private route table.
    #[serde(default)]
    pub nat_attached: bool,

    /// Intra-VPC inbound rule was added to the security group.
    #[serde(default)]
    pub inbound_rule_added: bool,

    #[serde(default)]
    pub eks_status: EksStatus,
}

/// Condition on a dpo resource.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub r#type: String,
    pub status: String,
    pub reason: String,
    #[serde(default)]
    pub message: String,
    pub last_update_time: DateTime<Utc>,
    pub last_transition_time: DateTime<Utc>,
}

/// `DataPlane` status defines the observed state of the dataplane.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DataPlaneStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<DataPlanePhase>,

    #[serde(default)]
    pub cloud_infra_status: CloudInfraStatus,

    /// Node pool name -> last observed provider status.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub nodegroup_status: BTreeMap<String, String>,

    /// Add-on name -> last observed provider status.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub addon_status: BTreeMap<String, String>,

    /// Workload name -> deployment phase.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub app_status: BTreeMap<String, AppPhase>,

    /// Workload name -> last applied chart version.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub app_versions: BTreeMap<String, String>,

    /// Workload name -> namespace it was installed into, kept for uninstall.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub app_namespaces: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Last observed generation of the spec.
    #[serde(default)]
    pub observed_generation: i64,

    /// Last error message, if the dataplane is Failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl DataPlaneStatus {
    pub fn phase(&self) -> DataPlanePhase {
        self.phase.unwrap_or_default()
    }

    pub fn condition(&self, condition_type: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.r#type == condition_type)
    }
}
