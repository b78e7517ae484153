//! IAM roles, customer-managed policies and trust documents.

use anyhow::Result;
use aws_sdk_iam::Client;
use aws_sdk_iam::types::{PolicyScopeType, Tag};
use serde_json::json;
use tracing::{debug, info};

use crate::cloud::RoleRequest;
use crate::error::DpoError;

pub const CLUSTER_POLICY_ARN: &str = "arn:aws:iam::aws:policy/AmazonEKSClusterPolicy";
pub const WORKER_NODE_POLICY_ARN: &str = "arn:aws:iam::aws:policy/AmazonEKSWorkerNodePolicy";
pub const CNI_POLICY_ARN: &str = "arn:aws:iam::aws:policy/AmazonEKS_CNI_Policy";
pub const ECR_READ_ONLY_POLICY_ARN: &str =
    "arn:aws:iam::aws:policy/AmazonEC2ContainerRegistryReadOnly";
pub const EBS_CSI_POLICY_ARN: &str =
    "arn:aws:iam::aws:policy/service-role/AmazonEBSCSIDriverPolicy";

/// Trust policy letting an AWS service (e.g. `eks.amazonaws.com`) assume the role.
pub fn service_trust_policy(service: &str) -> String {
    json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Effect": "Allow",
            "Principal": { "Service": service },
            "Action": "sts:AssumeRole"
        }]
    })
    .to_string()
}

/// Trust policy letting one Kubernetes service account assume the role through the
/// cluster's OIDC provider.
pub fn service_account_trust_policy(
    provider_arn: &str,
    issuer_url: &str,
    namespace: &str,
    service_account: &str,
) -> String {
    let issuer = issuer_url.trim_start_matches("https://");
    json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Effect": "Allow",
            "Principal": { "Federated": provider_arn },
            "Action": "sts:AssumeRoleWithWebIdentity",
            "Condition": {
                "StringEquals": {
                    format!("{issuer}:sub"): format!("system:serviceaccount:{namespace}:{service_account}"),
                    format!("{issuer}:aud"): "sts.amazonaws.com"
                }
            }
        }]
    })
    .to_string()
}

/// Permissions the cluster autoscaler needs to resize node group ASGs.
pub fn autoscaler_policy_document() -> String {
    json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Effect": "Allow",
            "Action": [
                "autoscaling:DescribeAutoScalingGroups",
                "autoscaling:DescribeAutoScalingInstances",
                "autoscaling:DescribeLaunchConfigurations",
                "autoscaling:DescribeScalingActivities",
                "autoscaling:DescribeTags",
                "autoscaling:SetDesiredCapacity",
                "autoscaling:TerminateInstanceInAutoScalingGroup",
                "ec2:DescribeImages",
                "ec2:DescribeInstanceTypes",
                "ec2:DescribeLaunchTemplateVersions",
                "ec2:GetInstanceTypesFromInstanceRequirements",
                "eks:DescribeNodegroup"
            ],
            "Resource": "*"
        }]
    })
    .to_string()
}

pub(crate) fn iam_tags(tags: &std::collections::HashMap<String, String>) -> Result<Vec<Tag>> {
    tags.iter()
        .map(|(k, v)| {
            Tag::builder()
                .key(k)
                .value(v)
                .build()
                .map_err(|e| DpoError::aws(module_path!(), e).into())
        })
        .collect()
}

/// Get-or-create a role, then attach its managed policies. Returns the role ARN.
pub async fn ensure_role(
    client: &Client,
    request: &RoleRequest,
    tags: &std::collections::HashMap<String, String>,
) -> Result<String> {
    let arn = match client.get_role().role_name(&request.name).send().await {
        Ok(response) => response
            .role()
            .map(|role| role.arn().to_string())
            .ok_or_else(|| DpoError::missing(module_path!(), "role.arn"))?,
        Err(e)
            if e.as_service_error()
                .is_some_and(|se| se.is_no_such_entity_exception()) =>
        {
            info!("Creating IAM role {}", request.name);
            let response = client
                .create_role()
                .role_name(&request.name)
                .assume_role_policy_document(&request.trust_policy)
                .set_tags(Some(iam_tags(tags)?))
                .send()
                .await
                .map_err(|e| DpoError::aws(module_path!(), e))?;
            response
                .role()
                .map(|role| role.arn().to_string())
                .ok_or_else(|| DpoError::missing(module_path!(), "role.arn"))?
        }
        Err(e) => return Err(DpoError::aws(module_path!(), e).into()),
    };

    for policy_arn in &request.managed_policy_arns {
        attach_role_policy(client, &request.name, policy_arn).await?;
    }

    Ok(arn)
}

/// Attach a managed policy. Attaching twice is a no-op on the IAM side.
pub async fn attach_role_policy(client: &Client, role_name: &str, policy_arn: &str) -> Result<()> {
    debug!("Attaching {} to {}", policy_arn, role_name);
    client
        .attach_role_policy()
        .role_name(role_name)
        .policy_arn(policy_arn)
        .send()
        .await
        .map_err(|e| DpoError::aws(module_path!(), e))?;
    Ok(())
}

/// Get-or-create a customer-managed policy by name. Returns the policy ARN.
pub async fn ensure_policy(
    client: &Client,
    name: &str,
    document: &str,
    tags: &std::collections::HashMap<String, String>,
) -> Result<String> {
    if let Some(arn) = find_local_policy(client, name).await? {
        return Ok(arn);
    }

    info!("Creating IAM policy {}", name);
    let response = client
        .create_policy()
        .policy_name(name)
        .policy_document(document)
        .set_tags(Some(iam_tags(tags)?))
        .send()
        .await
        .map_err(|e| DpoError::aws(module_path!(), e))?;

    response
        .policy()
        .and_then(|p| p.arn())
        .map(str::to_string)
        .ok_or_else(|| DpoError::missing(module_path!(), "policy.arn").into())
}

async fn find_local_policy(client: &Client, name: &str) -> Result<Option<String>> {
    let mut marker: Option<String> = None;
    loop {
        let response = client
            .list_policies()
            .scope(PolicyScopeType::Local)
            .set_marker(marker.take())
            .send()
            .await
            .map_err(|e| DpoError::aws(module_path!(), e))?;

        if let Some(arn) = response
            .policies()
            .iter()
            .find(|p| p.policy_name() == Some(name))
            .and_then(|p| p.arn())
        {
            return Ok(Some(arn.to_string()));
        }

        if !response.is_truncated() {
            return Ok(None);
        }
        marker = response.marker().map(str::to_string);
        if marker.is_none() {
            return Ok(None);
        }
    }
}
