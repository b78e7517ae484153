//! EKS Managed Node Group operations.

use std::collections::HashMap;

use anyhow::Result;
use aws_sdk_eks::Client;
use aws_sdk_eks::types::{NodegroupScalingConfig, Taint, TaintEffect};
use tracing::{debug, info};

use crate::cloud::{NodeGroupInfo, NodeGroupRequest};
use crate::error::DpoError;

/// List the names of all managed node groups in a cluster.
pub async fn list_nodegroups(client: &Client, cluster_name: &str) -> Result<Vec<String>> {
    debug!("Listing managed node groups for cluster: {}", cluster_name);

    let mut names = Vec::new();
    let mut next_token: Option<String> = None;
    loop {
        let response = client
            .list_nodegroups()
            .cluster_name(cluster_name)
            .set_next_token(next_token.take())
            .send()
            .await
            .map_err(|e| DpoError::aws(module_path!(), e))?;

        names.extend(response.nodegroups().iter().cloned());
        match response.next_token() {
            Some(token) if !token.is_empty() => next_token = Some(token.to_string()),
            _ => break,
        }
    }

    debug!("Found {} managed node groups", names.len());
    Ok(names)
}

/// Describe a specific managed node group. Returns `None` when it does not exist.
pub async fn describe_nodegroup(
    client: &Client,
    cluster_name: &str,
    nodegroup_name: &str,
) -> Result<Option<NodeGroupInfo>> {
    debug!("Describing managed node group: {}", nodegroup_name);

    let response = match client
        .describe_nodegroup()
        .cluster_name(cluster_name)
        .nodegroup_name(nodegroup_name)
        .send()
        .await
    {
        Ok(response) => response,
        Err(e)
            if e.as_service_error()
                .is_some_and(|se| se.is_resource_not_found_exception()) =>
        {
            return Ok(None);
        }
        Err(e) => return Err(DpoError::aws(module_path!(), e).into()),
    };

    Ok(response.nodegroup().map(|ng| NodeGroupInfo {
        name: ng.nodegroup_name().unwrap_or(nodegroup_name).to_string(),
        status: ng
            .status()
            .map(|s| s.as_str().to_string())
            .unwrap_or_default(),
    }))
}

/// Create a managed node group.
pub async fn create_nodegroup(
    client: &Client,
    request: &NodeGroupRequest,
    tags: &HashMap<String, String>,
) -> Result<NodeGroupInfo> {
    info!(
        "Creating managed node group {} ({} x{}..{})",
        request.name, request.instance_type, request.min_size, request.max_size
    );

    let scaling = NodegroupScalingConfig::builder()
        .min_size(request.min_size)
        .max_size(request.max_size)
        .desired_size(request.desired_size)
        .build();

    let labels: HashMap<String, String> = request
        .labels
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    let taints = request.taint.as_ref().map(|taint| {
        vec![
            Taint::builder()
                .key(&taint.key)
                .value(&taint.value)
                .effect(TaintEffect::NoSchedule)
                .build(),
        ]
    });

    let response = client
        .create_nodegroup()
        .cluster_name(&request.cluster_name)
        .nodegroup_name(&request.name)
        .node_role(&request.role_arn)
        .set_subnets(Some(request.subnet_ids.clone()))
        .instance_types(&request.instance_type)
        .scaling_config(scaling)
        .set_labels(Some(labels))
        .set_taints(taints)
        .set_tags(Some(tags.clone()))
        .send()
        .await;

    match response {
        Ok(response) => Ok(NodeGroupInfo {
            name: request.name.clone(),
            status: response
                .nodegroup()
                .and_then(|ng| ng.status())
                .map_or_else(|| "CREATING".to_string(), |s| s.as_str().to_string()),
        }),
        Err(e)
            if e.as_service_error()
                .is_some_and(|se| se.is_resource_in_use_exception()) =>
        {
            debug!("Managed node group {} already exists", request.name);
            describe_nodegroup(client, &request.cluster_name, &request.name)
                .await?
                .ok_or_else(|| DpoError::missing(module_path!(), "nodegroup").into())
        }
        Err(e) => Err(DpoError::aws(module_path!(), e).into()),
    }
}

/// Request node group deletion. A missing node group counts as deleted.
pub async fn delete_nodegroup(
    client: &Client,
    cluster_name: &str,
    nodegroup_name: &str,
) -> Result<()> {
    info!("Deleting managed node group {}", nodegroup_name);

    match client
        .delete_nodegroup()
        .cluster_name(cluster_name)
        .nodegroup_name(nodegroup_name)
        .send()
        .await
    {
        Ok(_) => Ok(()),
        Err(e)
            if e.as_service_error()
                .is_some_and(|se| se.is_resource_not_found_exception()) =>
        {
            debug!("Managed node group {} already gone", nodegroup_name);
            Ok(())
        }
        Err(e) => Err(DpoError::aws(module_path!(), e).into()),
    }
}
