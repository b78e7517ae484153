//! Provider-agnostic cloud capabilities.
//!
//! Every reconcile component talks to the cloud only through these traits. Describe
//! calls map "resource does not exist" to `Ok(None)`; every other provider failure is
//! an error. One implementation per supported cloud is selected from the spec's
//! `cloud` field by a [`CloudConnector`].

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use secrecy::SecretString;

use crate::crd::{CloudKind, DataPlaneSpec};
use crate::error::DpoError;

/// Provider status value for a resource that finished creating.
pub const STATUS_ACTIVE: &str = "ACTIVE";
/// Provider status value for a resource being torn down.
pub const STATUS_DELETING: &str = "DELETING";
/// Recorded once a describe call confirms the resource is gone.
pub const STATUS_DELETED: &str = "DELETED";

/// One subnet to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubnetRequest {
    pub name: String,
    pub vpc_id: String,
    pub cidr: String,
    pub availability_zone: String,
    /// Public subnets are tagged for internet-facing load balancers.
    pub public: bool,
    /// Cluster the subnet is shared with (load balancer discovery tags).
    pub cluster_name: String,
}

/// Control plane creation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterRequest {
    pub name: String,
    pub version: String,
    pub role_arn: String,
    pub subnet_ids: Vec<String>,
    pub security_group_ids: Vec<String>,
}

/// Observed control plane.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterInfo {
    pub name: String,
    pub arn: Option<String>,
    pub status: String,
    pub version: String,
    pub endpoint: Option<String>,
    /// Base64 PEM bundle of the cluster CA.
    pub ca_data: Option<String>,
    pub oidc_issuer: Option<String>,
}

/// Scheduling taint that dedicates a node pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeTaint {
    pub key: String,
    pub value: String,
}

/// Node pool creation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeGroupRequest {
    pub cluster_name: String,
    pub name: String,
    pub role_arn: String,
    pub subnet_ids: Vec<String>,
    pub instance_type: String,
    pub min_size: i32,
    pub max_size: i32,
    pub desired_size: i32,
    pub labels: BTreeMap<String, String>,
    pub taint: Option<NodeTaint>,
}

/// Observed node pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeGroupInfo {
    pub name: String,
    pub status: String,
}

/// Observed cluster add-on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddonInfo {
    pub name: String,
    pub status: String,
}

/// IAM role with a trust policy and managed policy attachments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleRequest {
    pub name: String,
    pub trust_policy: String,
    pub managed_policy_arns: Vec<String>,
}

/// Network operations. Every create issues exactly one provider call so the caller can
/// persist the id before any follow-up; follow-ups must tolerate having already run.
#[async_trait]
pub trait NetworkApi: Send + Sync {
    async fn create_vpc(&self, name: &str, cidr: &str) -> Result<String>;

    async fn enable_dns_hostnames(&self, vpc_id: &str) -> Result<()>;

    async fn create_internet_gateway(&self, name: &str) -> Result<String>;

    async fn attach_internet_gateway(&self, internet_gateway_id: &str, vpc_id: &str)
    -> Result<()>;

    async fn create_route_table(&self, name: &str, vpc_id: &str) -> Result<String>;

    /// Default route of `route_table_id` through the internet gateway.
    async fn add_internet_route(&self, route_table_id: &str, internet_gateway_id: &str)
    -> Result<()>;

    async fn availability_zones(&self) -> Result<Vec<String>>;

    async fn create_subnet(&self, request: &SubnetRequest) -> Result<String>;

    /// Auto-assign public IPs and join the public route table.
    async fn configure_public_subnet(&self, subnet_id: &str, route_table_id: &str) -> Result<()>;

    async fn create_security_group(&self, name: &str, vpc_id: &str) -> Result<String>;

    /// Allow all inbound traffic from `cidr`. Must tolerate the rule already existing.
    async fn authorize_ingress(&self, security_group_id: &str, cidr: &str) -> Result<()>;

    /// Allocate an elastic IP. Returns the allocation id.
    async fn allocate_address(&self, name: &str) -> Result<String>;

    async fn create_nat_gateway(
        &self,
        name: &str,
        subnet_id: &str,
        allocation_id: &str,
    ) -> Result<String>;

    /// Point the default route of every non-public route table of the VPC at the NAT gateway.
    /// Returns the number of route tables updated.
    async fn route_private_tables_via_nat(
        &self,
        vpc_id: &str,
        public_route_table_id: &str,
        nat_gateway_id: &str,
    ) -> Result<usize>;
}

#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn describe_cluster(&self, name: &str) -> Result<Option<ClusterInfo>>;

    /// Request control plane creation. Returns the cluster ARN.
    async fn create_cluster(&self, request: &ClusterRequest) -> Result<String>;

    /// Request a control plane version update. Returns the update id.
    async fn update_cluster_version(&self, name: &str, version: &str) -> Result<String>;

    /// Request control plane deletion. Succeeds when the cluster is already gone.
    async fn delete_cluster(&self, name: &str) -> Result<()>;

    /// Short-lived bearer token for the cluster's API server.
    async fn access_token(&self, name: &str) -> Result<SecretString>;
}

#[async_trait]
pub trait NodeGroupApi: Send + Sync {
    async fn describe_nodegroup(&self, cluster: &str, name: &str)
    -> Result<Option<NodeGroupInfo>>;

    async fn list_nodegroups(&self, cluster: &str) -> Result<Vec<String>>;

    async fn create_nodegroup(&self, request: &NodeGroupRequest) -> Result<NodeGroupInfo>;

    /// Request node pool deletion. Succeeds when the pool is already gone.
    async fn delete_nodegroup(&self, cluster: &str, name: &str) -> Result<()>;
}

#[async_trait]
pub trait AddonApi: Send + Sync {
    async fn describe_addon(&self, cluster: &str, name: &str) -> Result<Option<AddonInfo>>;

    /// Install an add-on, overwriting conflicting fields.
    async fn create_addon(
        &self,
        cluster: &str,
        name: &str,
        service_account_role_arn: Option<&str>,
    ) -> Result<AddonInfo>;
}

#[async_trait]
pub trait IdentityApi: Send + Sync {
    /// Get-or-create a role and attach its managed policies. Returns the role ARN.
    async fn ensure_role(&self, request: &RoleRequest) -> Result<String>;

    /// Get-or-create a customer-managed policy. Returns the policy ARN.
    async fn ensure_policy(&self, name: &str, document: &str) -> Result<String>;

    async fn attach_role_policy(&self, role_name: &str, policy_arn: &str) -> Result<()>;

    async fn oidc_provider_exists(&self, arn: &str) -> Result<bool>;

    /// Find a registered identity provider for the issuer URL.
    async fn find_oidc_provider(&self, issuer_url: &str) -> Result<Option<String>>;

    async fn create_oidc_provider(&self, issuer_url: &str, thumbprint: &str) -> Result<String>;

    /// Succeeds when the provider is already gone.
    async fn delete_oidc_provider(&self, arn: &str) -> Result<()>;

    /// SHA-1 fingerprint of the root certificate served by the issuer host.
    async fn issuer_thumbprint(&self, issuer_url: &str) -> Result<String>;
}

/// Capability set of one cloud backend.
#[derive(Clone)]
pub struct Cloud {
    pub network: Arc<dyn NetworkApi>,
    pub cluster: Arc<dyn ClusterApi>,
    pub nodegroups: Arc<dyn NodeGroupApi>,
    pub addons: Arc<dyn AddonApi>,
    pub identity: Arc<dyn IdentityApi>,
}

impl Cloud {
    /// Bundle one backend that implements every capability.
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: NetworkApi + ClusterApi + NodeGroupApi + AddonApi + IdentityApi + 'static,
    {
        Self {
            network: backend.clone(),
            cluster: backend.clone(),
            nodegroups: backend.clone(),
            addons: backend.clone(),
            identity: backend,
        }
    }
}

/// Builds the capability set for a dataplane's cloud, region and credentials.
///
/// Resources created through the returned capabilities carry [`resource_tags`] for `dataplane`.
#[async_trait]
pub trait CloudConnector: Send + Sync {
    async fn connect(&self, dataplane: &str, spec: &DataPlaneSpec) -> Result<Cloud>;
}

/// Connectors keyed by the cloud they serve.
#[derive(Clone, Default)]
pub struct CloudRegistry {
    connectors: BTreeMap<CloudKind, Arc<dyn CloudConnector>>,
}

impl CloudRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, kind: CloudKind, connector: Arc<dyn CloudConnector>) -> Self {
        self.connectors.insert(kind, connector);
        self
    }
}

#[async_trait]
impl CloudConnector for CloudRegistry {
    async fn connect(&self, dataplane: &str, spec: &DataPlaneSpec) -> Result<Cloud> {
        let connector = self
            .connectors
            .get(&spec.cloud)
            .ok_or_else(|| DpoError::UnsupportedCloud(spec.cloud.to_string()))?;
        connector.connect(dataplane, spec).await
    }
}

/// Tags stamped on every resource created for a dataplane.
pub fn resource_tags(dataplane: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("dpo.io/dataplane".to_string(), dataplane.to_string()),
        ("dpo.io/managed-by".to_string(), "dpo".to_string()),
    ])
}
