//! `DataPlane` spec types.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::status::DataPlaneStatus;
use super::types::{CloudKind, NetworkMode};
use crate::error::DpoError;

/// `DataPlane` spec defines the desired state of one customer dataplane.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "dpo.io",
    version = "v1alpha1",
    kind = "DataPlane",
    status = "DataPlaneStatus",
    printcolumn = r#"{"name":"CLUSTER","type":"string","jsonPath":".spec.cluster.name"}"#,
    printcolumn = r#"{"name":"VERSION","type":"string","jsonPath":".spec.cluster.version"}"#,
    printcolumn = r#"{"name":"REGION","type":"string","jsonPath":".spec.region"}"#,
    printcolumn = r#"{"name":"PHASE","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"AGE","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DataPlaneSpec {
    /// Cloud backend hosting the dataplane.
    #[serde(default)]
    pub cloud: CloudKind,

    /// Region where every dataplane resource is created.
    pub region: String,

    /// IAM Role ARN to assume in the customer account.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assume_role_arn: Option<String>,

    /// Managed cluster settings.
    pub cluster: ClusterSpec,

    /// Network settings.
    #[serde(default)]
    pub network: NetworkSpec,

    /// Sizing of the always-present system node pool.
    #[serde(default)]
    pub system_pool: SystemPoolSpec,

    /// Named machine-pool sizes that workloads can request for dedicated compute.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub machine_pools: Vec<MachinePoolSpec>,

    /// Chart-based workloads deployed onto the cluster.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub applications: Vec<ApplicationSpec>,
}

/// Managed cluster settings.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Name of the managed cluster.
    pub name: String,

    /// Target Kubernetes version (e.g., "1.28").
    pub version: String,
}

/// Network settings.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSpec {
    #[serde(default)]
    pub mode: NetworkMode,

    /// VPC CIDR for self-provisioned networks. A random 10.x.0.0/16 block is used when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cidr: Option<String>,

    /// Existing subnet IDs (bring-your-own mode).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subnet_ids: Vec<String>,

    /// Existing security group IDs (bring-your-own mode).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub security_group_ids: Vec<String>,
}

/// System node pool sizing.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SystemPoolSpec {
    #[serde(default = "default_instance_type")]
    pub instance_type: String,
    #[serde(default = "default_min_size")]
    pub min_size: i32,
    #[serde(default = "default_max_size")]
    pub max_size: i32,
    #[serde(default = "default_desired_size")]
    pub desired_size: i32,
}

impl Default for SystemPoolSpec {
    fn default() -> Self {
        Self {
            instance_type: default_instance_type(),
            min_size: default_min_size(),
            max_size: default_max_size(),
            desired_size: default_desired_size(),
        }
    }
}

fn default_instance_type() -> String {
    "m5.large".to_string()
}
const fn default_min_size() -> i32 {
    2
}
const fn default_max_size() -> i32 {
    4
}
const fn default_desired_size() -> i32 {
    2
}

/// A named machine-pool size.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MachinePoolSpec {
    /// Size name referenced by workloads and tenants (e.g., "small").
    pub name: String,
    pub instance_type: String,
    pub min_size: i32,
    pub max_size: i32,
    pub desired_size: i32,
    /// Extra node labels.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// A chart-based workload.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSpec {
    /// Release name.
    pub name: String,
    /// Namespace the release is installed into.
    pub namespace: String,
    pub chart: ChartSpec,
    /// Machine-pool size for a dedicated node pool. Shared system pool when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
}

/// Chart coordinates.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChartSpec {
    /// Chart repository URL.
    pub repository: String,
    /// Chart name within the repository.
    pub name: String,
    pub version: String,
    /// Values passed as `--set key=value`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub values: BTreeMap<String, String>,
}

impl DataPlaneSpec {
    /// Look up a machine-pool size by name.
    pub fn machine_pool(&self, size: &str) -> Option<&MachinePoolSpec> {
        self.machine_pools.iter().find(|p| p.name == size)
    }

    /// Reject specs that can never converge. `required_azs` is the number of subnets a
    /// self-provisioned network is carved into.
    pub fn validate(&self, required_azs: usize) -> Result<(), DpoError> {
        crate::eks::version::parse_k8s_version(&self.cluster.version)
            .map_err(|e| DpoError::InvalidSpec(e.to_string()))?;

        if self.network.mode == NetworkMode::BringYourOwn && self.network.subnet_ids.is_empty() {
            return Err(DpoError::InvalidSpec(
                "network.subnetIds is required in BringYourOwn mode".to_string(),
            ));
        }

        if let Some(cidr) = &self.network.cidr {
            let block = crate::ec2::cidr::Ipv4Block::parse(cidr)?;
            if block.prefix() < 16 {
                return Err(DpoError::InvalidSpec(format!(
                    "network.cidr {block} is wider than the /16 a VPC allows"
                )));
            }
            if block.subnet(required_azs.saturating_sub(1)).is_none() {
                return Err(DpoError::InvalidSpec(format!(
                    "network.cidr {block} cannot hold {required_azs} /{} subnets",
                    crate::ec2::cidr::SUBNET_PREFIX
                )));
            }
        }

        for app in &self.applications {
            if let Some(size) = &app.size
                && self.machine_pool(size).is_none()
            {
                return Err(DpoError::InvalidSpec(format!(
                    "application {} references unknown machine pool size {}",
                    app.name, size
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> DataPlaneSpec {
        serde_json::from_value(serde_json::json!({
            "region": "us-east-1",
            "cluster": {"name": "demo", "version": "1.28"}
        }))
        .unwrap()
    }

    #[test]
    fn test_serde_defaults() {
        let spec = spec();
        assert_eq!(spec.cloud, CloudKind::Aws);
        assert_eq!(spec.network.mode, NetworkMode::SelfProvisioned);
        assert_eq!(spec.system_pool.instance_type, "m5.large");
        assert_eq!(spec.system_pool.min_size, 2);
        assert_eq!(spec.system_pool.max_size, 4);
        assert!(spec.applications.is_empty());
    }

    #[test]
    fn test_validate_ok() {
        assert!(spec().validate(4).is_ok());
    }

    #[test]
    fn test_validate_byo_requires_subnets() {
        let mut spec = spec();
        spec.network.mode = NetworkMode::BringYourOwn;
        assert!(spec.validate(4).is_err());
        spec.network.subnet_ids = vec!["subnet-1".to_string()];
        assert!(spec.validate(4).is_ok());
    }

    #[test]
    fn test_validate_unknown_size() {
        let mut spec = spec();
        spec.applications.push(ApplicationSpec {
            name: "nginx".to_string(),
            namespace: "web".to_string(),
            chart: ChartSpec {
                repository: "https://charts.bitnami.com/bitnami".to_string(),
                name: "nginx".to_string(),
                version: "15.0.0".to_string(),
                values: BTreeMap::new(),
            },
            size: Some("large".to_string()),
        });
        assert!(spec.validate(4).is_err());
    }

    #[test]
    fn test_validate_bad_version() {
        let mut spec = spec();
        spec.cluster.version = "latest".to_string();
        assert!(spec.validate(4).is_err());
    }

    #[test]
    fn test_validate_cidr_must_hold_every_subnet() {
        let mut spec = spec();
        spec.network.cidr = Some("10.1.0.0/24".to_string());
        assert!(spec.validate(4).is_err());
        spec.network.cidr = Some("10.1.0.0/19".to_string());
        assert!(spec.validate(4).is_err());
        assert!(spec.validate(2).is_ok());
        spec.network.cidr = Some("10.1.0.0/18".to_string());
        assert!(spec.validate(4).is_ok());
        spec.network.cidr = Some("10.0.0.0/8".to_string());
        assert!(spec.validate(4).is_err());
    }
}
