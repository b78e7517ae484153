//! IAM OpenID Connect identity providers for cluster service accounts.

use std::collections::HashMap;

use anyhow::Result;
use aws_sdk_iam::Client;
use tracing::{debug, info};

use super::role::iam_tags;
use crate::error::DpoError;

/// Audience EKS service account tokens are minted for.
pub const STS_AUDIENCE: &str = "sts.amazonaws.com";

/// True when `arn` is the provider ARN registered for `issuer_url`.
pub fn provider_matches_issuer(arn: &str, issuer_url: &str) -> bool {
    let issuer = issuer_url.trim_start_matches("https://");
    arn.ends_with(&format!("oidc-provider/{issuer}"))
}

/// Issuer URL a provider ARN was registered for.
pub fn issuer_of_provider(arn: &str) -> Option<String> {
    arn.split_once(":oidc-provider/")
        .map(|(_, issuer)| format!("https://{issuer}"))
}

pub async fn provider_exists(client: &Client, arn: &str) -> Result<bool> {
    match client
        .get_open_id_connect_provider()
        .open_id_connect_provider_arn(arn)
        .send()
        .await
    {
        Ok(_) => Ok(true),
        Err(e)
            if e.as_service_error()
                .is_some_and(|se| se.is_no_such_entity_exception()) =>
        {
            Ok(false)
        }
        Err(e) => Err(DpoError::aws(module_path!(), e).into()),
    }
}

pub async fn find_provider(client: &Client, issuer_url: &str) -> Result<Option<String>> {
    let response = client
        .list_open_id_connect_providers()
        .send()
        .await
        .map_err(|e| DpoError::aws(module_path!(), e))?;

    Ok(response
        .open_id_connect_provider_list()
        .iter()
        .filter_map(|p| p.arn())
        .find(|arn| provider_matches_issuer(arn, issuer_url))
        .map(str::to_string))
}

pub async fn create_provider(
    client: &Client,
    issuer_url: &str,
    thumbprint: &str,
    tags: &HashMap<String, String>,
) -> Result<String> {
    info!("Registering OIDC provider for {}", issuer_url);

    let response = client
        .create_open_id_connect_provider()
        .url(issuer_url)
        .client_id_list(STS_AUDIENCE)
        .thumbprint_list(thumbprint)
        .set_tags(Some(iam_tags(tags)?))
        .send()
        .await;

    match response {
        Ok(response) => response
            .open_id_connect_provider_arn()
            .map(str::to_string)
            .ok_or_else(|| DpoError::missing(module_path!(), "open_id_connect_provider_arn").into()),
        Err(e)
            if e.as_service_error()
                .is_some_and(|se| se.is_entity_already_exists_exception()) =>
        {
            debug!("OIDC provider for {} already registered", issuer_url);
            find_provider(client, issuer_url)
                .await?
                .ok_or_else(|| DpoError::missing(module_path!(), "open_id_connect_provider_arn").into())
        }
        Err(e) => Err(DpoError::aws(module_path!(), e).into()),
    }
}

/// Delete the provider. A missing provider counts as deleted.
pub async fn delete_provider(client: &Client, arn: &str) -> Result<()> {
    info!("Deleting OIDC provider {}", arn);

    match client
        .delete_open_id_connect_provider()
        .open_id_connect_provider_arn(arn)
        .send()
        .await
    {
        Ok(_) => Ok(()),
        Err(e)
            if e.as_service_error()
                .is_some_and(|se| se.is_no_such_entity_exception()) =>
        {
            debug!("OIDC provider {} already gone", arn);
            Ok(())
        }
        Err(e) => Err(DpoError::aws(module_path!(), e).into()),
    }
}
