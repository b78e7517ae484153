//! Control plane version drift.

use anyhow::Result;

use crate::error::DpoError;

/// `major.minor` of a Kubernetes version string. A patch component is ignored.
pub fn parse_k8s_version(version: &str) -> Result<(u32, u32)> {
    let invalid = || DpoError::InvalidVersion(version.to_string());
    let (major, rest) = version.split_once('.').ok_or_else(invalid)?;
    let minor = rest.split('.').next().unwrap_or(rest);
    Ok((
        major.parse().map_err(|_| invalid())?,
        minor.parse().map_err(|_| invalid())?,
    ))
}

/// Version the control plane should be updated to next, if it drifted from `desired`.
///
/// EKS moves one minor version per update, so a multi-minor drift closes over several
/// passes. Downgrades and major version changes are rejected.
pub fn next_update_step(observed: &str, desired: &str) -> Result<Option<String>> {
    let (observed_major, observed_minor) = parse_k8s_version(observed)?;
    let (desired_major, desired_minor) = parse_k8s_version(desired)?;

    if observed_major != desired_major {
        return Err(DpoError::InvalidSpec(format!(
            "cannot move the control plane from {observed} to {desired} across major versions"
        ))
        .into());
    }
    if desired_minor < observed_minor {
        return Err(DpoError::InvalidSpec(format!(
            "cluster runs {observed}, downgrade to {desired} is not supported"
        ))
        .into());
    }
    if desired_minor == observed_minor {
        return Ok(None);
    }
    Ok(Some(format!("{observed_major}.{}", observed_minor + 1)))
}
