//! AWS EKS SDK client wrapper for control plane operations.

use std::collections::HashMap;

use anyhow::Result;
use aws_sdk_eks::Client;
use aws_sdk_eks::types::{AuthenticationMode, CreateAccessConfigRequest, VpcConfigRequest};
use tracing::{debug, info};

use crate::cloud::{ClusterInfo, ClusterRequest};
use crate::error::DpoError;

/// EKS client wrapper for cluster operations.
#[derive(Clone)]
pub struct EksClient {
    client: Client,
    tags: HashMap<String, String>,
}

impl EksClient {
    /// Create a new EKS client. `tags` are stamped on every created resource.
    pub const fn new(client: Client, tags: HashMap<String, String>) -> Self {
        Self { client, tags }
    }

    /// Get the underlying AWS SDK EKS client.
    pub const fn inner(&self) -> &Client {
        &self.client
    }

    pub const fn tags(&self) -> &HashMap<String, String> {
        &self.tags
    }

    /// Describe a specific cluster. Returns `None` when it does not exist.
    pub async fn describe_cluster(&self, cluster_name: &str) -> Result<Option<ClusterInfo>> {
        debug!("Describing cluster: {}", cluster_name);

        let response = match self.client.describe_cluster().name(cluster_name).send().await {
            Ok(response) => response,
            Err(e)
                if e.as_service_error()
                    .is_some_and(|se| se.is_resource_not_found_exception()) =>
            {
                return Ok(None);
            }
            Err(e) => return Err(DpoError::aws(module_path!(), e).into()),
        };

        Ok(response.cluster().map(|cluster| ClusterInfo {
            name: cluster.name().unwrap_or(cluster_name).to_string(),
            arn: cluster.arn().map(str::to_string),
            status: cluster
                .status()
                .map(|s| s.as_str().to_string())
                .unwrap_or_default(),
            version: cluster.version().unwrap_or_default().to_string(),
            endpoint: cluster.endpoint().map(str::to_string),
            ca_data: cluster
                .certificate_authority()
                .and_then(|ca| ca.data())
                .map(str::to_string),
            oidc_issuer: cluster
                .identity()
                .and_then(|identity| identity.oidc())
                .and_then(|oidc| oidc.issuer())
                .map(str::to_string),
        }))
    }

    /// Request control plane creation with API and ConfigMap authentication,
    /// granting the creator admin access.
    pub async fn create_cluster(&self, request: &ClusterRequest) -> Result<String> {
        info!(
            "Creating cluster {} (version {}) in {} subnets",
            request.name,
            request.version,
            request.subnet_ids.len()
        );

        let vpc_config = VpcConfigRequest::builder()
            .set_subnet_ids(Some(request.subnet_ids.clone()))
            .set_security_group_ids(Some(request.security_group_ids.clone()))
            .endpoint_public_access(true)
            .endpoint_private_access(true)
            .build();

        let access_config = CreateAccessConfigRequest::builder()
            .authentication_mode(AuthenticationMode::ApiAndConfigMap)
            .bootstrap_cluster_creator_admin_permissions(true)
            .build();

        let response = self
            .client
            .create_cluster()
            .name(&request.name)
            .version(&request.version)
            .role_arn(&request.role_arn)
            .resources_vpc_config(vpc_config)
            .access_config(access_config)
            .set_tags(Some(self.tags.clone()))
            .send()
            .await;

        match response {
            Ok(response) => response
                .cluster()
                .and_then(|c| c.arn())
                .map(str::to_string)
                .ok_or_else(|| DpoError::missing(module_path!(), "cluster.arn").into()),
            Err(e)
                if e.as_service_error()
                    .is_some_and(|se| se.is_resource_in_use_exception()) =>
            {
                debug!("Cluster {} already exists", request.name);
                self.describe_cluster(&request.name)
                    .await?
                    .and_then(|c| c.arn)
                    .ok_or_else(|| DpoError::missing(module_path!(), "cluster.arn").into())
            }
            Err(e) => Err(DpoError::aws(module_path!(), e).into()),
        }
    }

    /// Update cluster version (control plane upgrade).
    pub async fn update_cluster_version(
        &self,
        cluster_name: &str,
        target_version: &str,
    ) -> Result<String> {
        info!(
            "Updating cluster {} control plane to version {}",
            cluster_name, target_version
        );

        let response = self
            .client
            .update_cluster_version()
            .name(cluster_name)
            .version(target_version)
            .send()
            .await
            .map_err(|e| DpoError::aws(module_path!(), e))?;

        let update_id = response
            .update()
            .and_then(|u| u.id())
            .map(str::to_string)
            .unwrap_or_default();

        debug!("Control plane update initiated: {}", update_id);
        Ok(update_id)
    }

    /// Request cluster deletion. A missing cluster counts as deleted.
    pub async fn delete_cluster(&self, cluster_name: &str) -> Result<()> {
        info!("Deleting cluster {}", cluster_name);

        match self.client.delete_cluster().name(cluster_name).send().await {
            Ok(_) => Ok(()),
            Err(e)
                if e.as_service_error()
                    .is_some_and(|se| se.is_resource_not_found_exception()) =>
            {
                debug!("Cluster {} already gone", cluster_name);
                Ok(())
            }
            Err(e) => Err(DpoError::aws(module_path!(), e).into()),
        }
    }
}
