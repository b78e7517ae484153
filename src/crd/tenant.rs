//! `Tenant` and `TenantInfra` CRDs layered on a `DataPlane`.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::spec::MachinePoolSpec;
use super::status::Condition;

/// `TenantInfra` declares named machine pools provisioned on a dataplane's cluster.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "dpo.io",
    version = "v1alpha1",
    kind = "TenantInfra",
    status = "TenantInfraStatus",
    printcolumn = r#"{"name":"DATAPLANE","type":"string","jsonPath":".spec.dataPlane"}"#,
    printcolumn = r#"{"name":"PHASE","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"AGE","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct TenantInfraSpec {
    /// Name of the `DataPlane` whose cluster hosts the pools.
    pub data_plane: String,

    /// Machine pools keyed by size name.
    pub machine_pools: Vec<MachinePoolSpec>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum TenantInfraPhase {
    #[default]
    Pending,
    Provisioning,
    Ready,
    Failed,
    Terminating,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TenantInfraStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<TenantInfraPhase>,

    /// Node pool name -> last observed provider status.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub nodegroup_status: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// `Tenant` binds one customer tenant to a machine-pool size of its dataplane.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "dpo.io",
    version = "v1alpha1",
    kind = "Tenant",
    status = "TenantStatus",
    printcolumn = r#"{"name":"DATAPLANE","type":"string","jsonPath":".spec.dataPlane"}"#,
    printcolumn = r#"{"name":"SIZE","type":"string","jsonPath":".spec.size"}"#,
    printcolumn = r#"{"name":"PHASE","type":"string","jsonPath":".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct TenantSpec {
    pub data_plane: String,

    /// Machine-pool size name defined by a `TenantInfra` of the same dataplane.
    pub size: String,

    /// Namespace reserved for the tenant's workloads.
    pub namespace: String,

    /// Deny traffic from other tenants' namespaces.
    #[serde(default = "default_isolate")]
    pub isolate_network: bool,
}

const fn default_isolate() -> bool {
    true
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum TenantPhase {
    #[default]
    Pending,
    Bound,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TenantStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<TenantPhase>,

    /// Node pool the tenant's workloads are scheduled onto.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_pool: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}
