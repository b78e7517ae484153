//! AWS implementation of the cloud capability traits.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use secrecy::SecretString;
use tokio::sync::Mutex;

use super::client::ClientKey;
use super::{AwsClients, token};
use crate::cloud::{
    AddonApi, AddonInfo, Cloud, CloudConnector, ClusterApi, ClusterInfo, ClusterRequest,
    IdentityApi, NetworkApi, NodeGroupApi, NodeGroupInfo, NodeGroupRequest, RoleRequest,
    SubnetRequest, resource_tags,
};
use crate::crd::DataPlaneSpec;
use crate::ec2::network;
use crate::eks::{EksClient, addon, nodegroup};
use crate::iam::{oidc, role, thumbprint};

/// One dataplane's view of an AWS account and region.
pub struct AwsCloud {
    clients: AwsClients,
    eks: EksClient,
    tags: HashMap<String, String>,
}

impl AwsCloud {
    pub fn new(clients: AwsClients, dataplane: &str) -> Self {
        let tags: HashMap<String, String> = resource_tags(dataplane).into_iter().collect();
        Self {
            eks: EksClient::new(clients.eks.clone(), tags.clone()),
            clients,
            tags,
        }
    }
}

#[async_trait]
impl NetworkApi for AwsCloud {
    async fn create_vpc(&self, name: &str, cidr: &str) -> Result<String> {
        network::create_vpc(&self.clients.ec2, name, cidr, &self.tags).await
    }

    async fn enable_dns_hostnames(&self, vpc_id: &str) -> Result<()> {
        network::enable_dns_hostnames(&self.clients.ec2, vpc_id).await
    }

    async fn create_internet_gateway(&self, name: &str) -> Result<String> {
        network::create_internet_gateway(&self.clients.ec2, name, &self.tags).await
    }

    async fn attach_internet_gateway(
        &self,
        internet_gateway_id: &str,
        vpc_id: &str,
    ) -> Result<()> {
        network::attach_internet_gateway(&self.clients.ec2, internet_gateway_id, vpc_id).await
    }

    async fn create_route_table(&self, name: &str, vpc_id: &str) -> Result<String> {
        network::create_route_table(&self.clients.ec2, name, vpc_id, &self.tags).await
    }

    async fn add_internet_route(
        &self,
        route_table_id: &str,
        internet_gateway_id: &str,
    ) -> Result<()> {
        network::add_internet_route(&self.clients.ec2, route_table_id, internet_gateway_id).await
    }

    async fn availability_zones(&self) -> Result<Vec<String>> {
        network::availability_zones(&self.clients.ec2).await
    }

    async fn create_subnet(&self, request: &SubnetRequest) -> Result<String> {
        network::create_subnet(&self.clients.ec2, request, &self.tags).await
    }

    async fn configure_public_subnet(&self, subnet_id: &str, route_table_id: &str) -> Result<()> {
        network::configure_public_subnet(&self.clients.ec2, subnet_id, route_table_id).await
    }

    async fn create_security_group(&self, name: &str, vpc_id: &str) -> Result<String> {
        network::create_security_group(&self.clients.ec2, name, vpc_id, &self.tags).await
    }

    async fn authorize_ingress(&self, security_group_id: &str, cidr: &str) -> Result<()> {
        network::authorize_ingress(&self.clients.ec2, security_group_id, cidr).await
    }

    async fn allocate_address(&self, name: &str) -> Result<String> {
        network::allocate_address(&self.clients.ec2, name, &self.tags).await
    }

    async fn create_nat_gateway(
        &self,
        name: &str,
        subnet_id: &str,
        allocation_id: &str,
    ) -> Result<String> {
        network::create_nat_gateway(&self.clients.ec2, name, subnet_id, allocation_id, &self.tags)
            .await
    }

    async fn route_private_tables_via_nat(
        &self,
        vpc_id: &str,
        public_route_table_id: &str,
        nat_gateway_id: &str,
    ) -> Result<usize> {
        network::route_private_tables_via_nat(
            &self.clients.ec2,
            vpc_id,
            public_route_table_id,
            nat_gateway_id,
        )
        .await
    }
}

#[async_trait]
impl ClusterApi for AwsCloud {
    async fn describe_cluster(&self, name: &str) -> Result<Option<ClusterInfo>> {
        self.eks.describe_cluster(name).await
    }

    async fn create_cluster(&self, request: &ClusterRequest) -> Result<String> {
        self.eks.create_cluster(request).await
    }

    async fn update_cluster_version(&self, name: &str, version: &str) -> Result<String> {
        self.eks.update_cluster_version(name, version).await
    }

    async fn delete_cluster(&self, name: &str) -> Result<()> {
        self.eks.delete_cluster(name).await
    }

    async fn access_token(&self, name: &str) -> Result<SecretString> {
        token::eks_token(&self.clients, name).await
    }
}

#[async_trait]
impl NodeGroupApi for AwsCloud {
    async fn describe_nodegroup(
        &self,
        cluster: &str,
        name: &str,
    ) -> Result<Option<NodeGroupInfo>> {
        nodegroup::describe_nodegroup(self.eks.inner(), cluster, name).await
    }

    async fn list_nodegroups(&self, cluster: &str) -> Result<Vec<String>> {
        nodegroup::list_nodegroups(self.eks.inner(), cluster).await
    }

    async fn create_nodegroup(&self, request: &NodeGroupRequest) -> Result<NodeGroupInfo> {
        nodegroup::create_nodegroup(self.eks.inner(), request, self.eks.tags()).await
    }

    async fn delete_nodegroup(&self, cluster: &str, name: &str) -> Result<()> {
        nodegroup::delete_nodegroup(self.eks.inner(), cluster, name).await
    }
}

#[async_trait]
impl AddonApi for AwsCloud {
    async fn describe_addon(&self, cluster: &str, name: &str) -> Result<Option<AddonInfo>> {
        addon::describe_addon(self.eks.inner(), cluster, name).await
    }

    async fn create_addon(
        &self,
        cluster: &str,
        name: &str,
        service_account_role_arn: Option<&str>,
    ) -> Result<AddonInfo> {
        addon::create_addon(
            self.eks.inner(),
            cluster,
            name,
            service_account_role_arn,
            self.eks.tags(),
        )
        .await
    }
}

#[async_trait]
impl IdentityApi for AwsCloud {
    async fn ensure_role(&self, request: &RoleRequest) -> Result<String> {
        role::ensure_role(&self.clients.iam, request, &self.tags).await
    }

    async fn ensure_policy(&self, name: &str, document: &str) -> Result<String> {
        role::ensure_policy(&self.clients.iam, name, document, &self.tags).await
    }

    async fn attach_role_policy(&self, role_name: &str, policy_arn: &str) -> Result<()> {
        role::attach_role_policy(&self.clients.iam, role_name, policy_arn).await
    }

    async fn oidc_provider_exists(&self, arn: &str) -> Result<bool> {
        oidc::provider_exists(&self.clients.iam, arn).await
    }

    async fn find_oidc_provider(&self, issuer_url: &str) -> Result<Option<String>> {
        oidc::find_provider(&self.clients.iam, issuer_url).await
    }

    async fn create_oidc_provider(&self, issuer_url: &str, thumbprint: &str) -> Result<String> {
        oidc::create_provider(&self.clients.iam, issuer_url, thumbprint, &self.tags).await
    }

    async fn delete_oidc_provider(&self, arn: &str) -> Result<()> {
        oidc::delete_provider(&self.clients.iam, arn).await
    }

    async fn issuer_thumbprint(&self, issuer_url: &str) -> Result<String> {
        thumbprint::issuer_thumbprint(issuer_url).await
    }
}

/// Builds an [`AwsCloud`] per dataplane from its region and assumed role.
///
/// SDK clients are cached per account and region; only the tags differ between
/// dataplanes sharing them.
pub struct AwsConnector {
    operation_timeout: Duration,
    clients: Mutex<HashMap<ClientKey, AwsClients>>,
}

impl AwsConnector {
    pub fn new(operation_timeout: Duration) -> Self {
        Self {
            operation_timeout,
            clients: Mutex::new(HashMap::new()),
        }
    }

    async fn clients(&self, key: ClientKey) -> AwsClients {
        if let Some(cached) = self.clients.lock().await.get(&key) {
            return cached.clone();
        }
        let clients = AwsClients::new(&key, self.operation_timeout).await;
        self.clients.lock().await.insert(key, clients.clone());
        clients
    }
}

#[async_trait]
impl CloudConnector for AwsConnector {
    async fn connect(&self, dataplane: &str, spec: &DataPlaneSpec) -> Result<Cloud> {
        let clients = self
            .clients(ClientKey {
                region: spec.region.clone(),
                assume_role_arn: spec.assume_role_arn.clone(),
            })
            .await;
        Ok(Cloud::from_backend(Arc::new(AwsCloud::new(clients, dataplane))))
    }
}
