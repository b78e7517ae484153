//! EKS Add-on operations.

use std::collections::HashMap;

use anyhow::Result;
use aws_sdk_eks::Client;
use aws_sdk_eks::types::ResolveConflicts;
use tracing::{debug, info};

use crate::cloud::AddonInfo;
use crate::error::DpoError;

/// Describe a specific add-on. Returns `None` when it is not installed.
pub async fn describe_addon(
    client: &Client,
    cluster_name: &str,
    addon_name: &str,
) -> Result<Option<AddonInfo>> {
    debug!("Describing add-on: {}", addon_name);

    let response = match client
        .describe_addon()
        .cluster_name(cluster_name)
        .addon_name(addon_name)
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

    Ok(response.addon().map(|addon| AddonInfo {
        name: addon.addon_name().unwrap_or(addon_name).to_string(),
        status: addon
            .status()
            .map(|s| s.as_str().to_string())
            .unwrap_or_default(),
    }))
}

/// Install an add-on at its default version, overwriting conflicting fields.
pub async fn create_addon(
    client: &Client,
    cluster_name: &str,
    addon_name: &str,
    service_account_role_arn: Option<&str>,
    tags: &HashMap<String, String>,
) -> Result<AddonInfo> {
    info!("Installing add-on {} on {}", addon_name, cluster_name);

    let response = client
        .create_addon()
        .cluster_name(cluster_name)
        .addon_name(addon_name)
        .set_service_account_role_arn(service_account_role_arn.map(str::to_string))
        .resolve_conflicts(ResolveConflicts::Overwrite)
        .set_tags(Some(tags.clone()))
        .send()
        .await;

    match response {
        Ok(response) => Ok(AddonInfo {
            name: addon_name.to_string(),
            status: response
                .addon()
                .and_then(|a| a.status())
                .map_or_else(|| "CREATING".to_string(), |s| s.as_str().to_string()),
        }),
        Err(e)
            if e.as_service_error()
                .is_some_and(|se| se.is_resource_in_use_exception()) =>
        {
            debug!("Add-on {} already installed", addon_name);
            describe_addon(client, cluster_name, addon_name)
                .await?
                .ok_or_else(|| DpoError::missing(module_path!(), "addon").into())
        }
        Err(e) => Err(DpoError::aws(module_path!(), e).into()),
    }
}
