//! Chart deployment onto a dataplane cluster through the `helm` CLI.

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tempfile::NamedTempFile;
use tokio::process::Command;
use tracing::{debug, info};

use crate::crd::ChartSpec;
use crate::error::DpoError;

/// How long helm waits for an install or upgrade to become ready.
const HELM_WAIT_TIMEOUT: &str = "5m0s";

/// Installed release as reported by the deployer.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReleaseStatus {
    pub name: String,
    pub status: String,
    /// `<chart>-<version>`.
    pub chart: String,
}

impl ReleaseStatus {
    pub fn is_deployed(&self) -> bool {
        self.status == "deployed"
    }

    /// An install, upgrade or rollback is still running.
    pub fn is_pending(&self) -> bool {
        self.status.starts_with("pending")
    }

    /// Chart version of the release, given the chart name.
    pub fn chart_version(&self, chart_name: &str) -> Option<&str> {
        self.chart
            .strip_prefix(chart_name)
            .and_then(|rest| rest.strip_prefix('-'))
    }
}

/// Install state and lifecycle of chart releases on one cluster.
#[async_trait]
pub trait ChartDeployer: Send + Sync {
    async fn status(&self, release: &str, namespace: &str) -> Result<Option<ReleaseStatus>>;

    async fn install(&self, release: &str, namespace: &str, chart: &ChartSpec) -> Result<()>;

    async fn upgrade(&self, release: &str, namespace: &str, chart: &ChartSpec) -> Result<()>;

    /// Uninstall a release. A missing release counts as uninstalled.
    async fn uninstall(&self, release: &str, namespace: &str) -> Result<()>;
}

/// Connection details for a cluster's API server.
pub struct ClusterAccess {
    pub endpoint: String,
    /// Base64 PEM bundle as returned by the provider.
    pub ca_data: String,
    pub token: SecretString,
}

/// Binds a [`ChartDeployer`] to one cluster.
#[async_trait]
pub trait ChartDeployerFactory: Send + Sync {
    async fn for_cluster(&self, access: ClusterAccess) -> Result<Arc<dyn ChartDeployer>>;
}

/// Runs the `helm` binary.
pub struct HelmFactory {
    binary: String,
}

impl HelmFactory {
    pub const fn new(binary: String) -> Self {
        Self { binary }
    }
}

/// Single-context kubeconfig for `access`. The bearer token stays off the helm command line.
fn kubeconfig(access: &ClusterAccess) -> Result<String> {
    STANDARD
        .decode(access.ca_data.trim())
        .context("Failed to decode cluster CA certificate from base64")?;

    let document = serde_json::json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{
            "name": "dataplane",
            "cluster": {
                "server": access.endpoint,
                "certificate-authority-data": access.ca_data.trim(),
            },
        }],
        "users": [{
            "name": "dpo",
            "user": { "token": access.token.expose_secret() },
        }],
        "contexts": [{
            "name": "dataplane",
            "context": { "cluster": "dataplane", "user": "dpo" },
        }],
        "current-context": "dataplane",
    });
    serde_yaml::to_string(&document).context("Failed to render kubeconfig")
}

#[async_trait]
impl ChartDeployerFactory for HelmFactory {
    async fn for_cluster(&self, access: ClusterAccess) -> Result<Arc<dyn ChartDeployer>> {
        let rendered = kubeconfig(&access)?;

        // Created with owner-only permissions.
        let mut kubeconfig_file = NamedTempFile::new().context("Failed to create kubeconfig")?;
        kubeconfig_file
            .write_all(rendered.as_bytes())
            .context("Failed to write kubeconfig")?;

        Ok(Arc::new(HelmCli {
            binary: self.binary.clone(),
            kubeconfig: kubeconfig_file,
        }))
    }
}

/// `helm` bound to one cluster. The kubeconfig lives as long as this value.
pub struct HelmCli {
    binary: String,
    kubeconfig: NamedTempFile,
}

impl HelmCli {
    fn connection_args(&self) -> Vec<String> {
        vec![
            "--kubeconfig".to_string(),
            self.kubeconfig.path().display().to_string(),
        ]
    }

    async fn run(&self, args: Vec<String>) -> Result<String> {
        debug!(
            "Running {} {}",
            self.binary,
            args.first().map_or("", String::as_str)
        );

        let output = Command::new(&self.binary)
            .args(&args)
            .args(self.connection_args())
            .output()
            .await
            .map_err(|e| DpoError::Chart(format!("failed to run {}: {e}", self.binary)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DpoError::Chart(stderr.trim().to_string()).into());
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl ChartDeployer for HelmCli {
    async fn status(&self, release: &str, namespace: &str) -> Result<Option<ReleaseStatus>> {
        let stdout = self.run(list_args(release, namespace)).await?;
        parse_release_list(&stdout, release)
    }

    async fn install(&self, release: &str, namespace: &str, chart: &ChartSpec) -> Result<()> {
        info!(
            "Installing release {} ({} {}) into {}",
            release, chart.name, chart.version, namespace
        );
        self.run(release_args("install", release, namespace, chart))
            .await?;
        Ok(())
    }

    async fn upgrade(&self, release: &str, namespace: &str, chart: &ChartSpec) -> Result<()> {
        info!(
            "Upgrading release {} to {} {}",
            release, chart.name, chart.version
        );
        self.run(release_args("upgrade", release, namespace, chart))
            .await?;
        Ok(())
    }

    async fn uninstall(&self, release: &str, namespace: &str) -> Result<()> {
        info!("Uninstalling release {} from {}", release, namespace);
        let args = vec![
            "uninstall".to_string(),
            release.to_string(),
            "--namespace".to_string(),
            namespace.to_string(),
            "--wait".to_string(),
        ];
        match self.run(args).await {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("not found") => {
                debug!("Release {} already gone", release);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

fn list_args(release: &str, namespace: &str) -> Vec<String> {
    vec![
        "list".to_string(),
        "--filter".to_string(),
        format!("^{release}$"),
        "--namespace".to_string(),
        namespace.to_string(),
        "--all".to_string(),
        "--output".to_string(),
        "json".to_string(),
    ]
}

/// Arguments for `helm install` or `helm upgrade`.
fn release_args(verb: &str, release: &str, namespace: &str, chart: &ChartSpec) -> Vec<String> {
    let mut args = vec![verb.to_string(), release.to_string()];

    if chart.repository.starts_with("oci://") {
        args.push(format!(
            "{}/{}",
            chart.repository.trim_end_matches('/'),
            chart.name
        ));
    } else {
        args.push(chart.name.clone());
        args.push("--repo".to_string());
        args.push(chart.repository.clone());
    }

    args.extend([
        "--version".to_string(),
        chart.version.clone(),
        "--namespace".to_string(),
        namespace.to_string(),
    ]);
    if verb == "install" {
        args.push("--create-namespace".to_string());
    }
    for (key, value) in &chart.values {
        args.push("--set".to_string());
        args.push(format!("{key}={value}"));
    }
    args.extend([
        "--wait".to_string(),
        "--timeout".to_string(),
        HELM_WAIT_TIMEOUT.to_string(),
    ]);
    args
}

fn parse_release_list(stdout: &str, release: &str) -> Result<Option<ReleaseStatus>> {
    if stdout.trim().is_empty() {
        return Ok(None);
    }
    let releases: Vec<ReleaseStatus> = serde_json::from_str(stdout)
        .map_err(|e| DpoError::Chart(format!("unexpected helm list output: {e}")))?;
    Ok(releases.into_iter().find(|r| r.name == release))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn chart(repository: &str) -> ChartSpec {
        ChartSpec {
            repository: repository.to_string(),
            name: "nginx".to_string(),
            version: "15.1.0".to_string(),
            values: BTreeMap::from([("replicaCount".to_string(), "2".to_string())]),
        }
    }

    #[test]
    fn test_parse_release_list() {
        let stdout = r#"[{"name":"web","namespace":"apps","revision":"1","updated":"2024-01-01","status":"deployed","chart":"nginx-15.1.0","app_version":"1.25"}]"#;
        let release = parse_release_list(stdout, "web").unwrap().unwrap();
        assert!(release.is_deployed());
        assert!(!release.is_pending());
        assert_eq!(release.chart_version("nginx"), Some("15.1.0"));
        assert_eq!(release.chart_version("redis"), None);
    }

    #[test]
    fn test_parse_release_list_empty() {
        assert!(parse_release_list("[]", "web").unwrap().is_none());
        assert!(parse_release_list("", "web").unwrap().is_none());
    }

    #[test]
    fn test_parse_release_list_garbage() {
        assert!(parse_release_list("Error: boom", "web").is_err());
    }

    #[test]
    fn test_pending_status() {
        let release = ReleaseStatus {
            name: "web".to_string(),
            status: "pending-install".to_string(),
            chart: "nginx-15.1.0".to_string(),
        };
        assert!(release.is_pending());
        assert!(!release.is_deployed());
    }

    #[test]
    fn test_install_args_with_repo() {
        let args = release_args("install", "web", "apps", &chart("https://charts.example.com"));
        assert_eq!(&args[..5], &["install", "web", "nginx", "--repo", "https://charts.example.com"]);
        assert!(args.contains(&"--create-namespace".to_string()));
        assert!(args.contains(&"replicaCount=2".to_string()));
        assert!(args.windows(2).any(|w| w[0] == "--version" && w[1] == "15.1.0"));
    }

    #[test]
    fn test_upgrade_args_with_oci() {
        let args = release_args("upgrade", "web", "apps", &chart("oci://registry.example.com/charts/"));
        assert_eq!(args[2], "oci://registry.example.com/charts/nginx");
        assert!(!args.contains(&"--repo".to_string()));
        assert!(!args.contains(&"--create-namespace".to_string()));
    }

    fn access() -> ClusterAccess {
        ClusterAccess {
            endpoint: "https://demo.eks.example.com".to_string(),
            ca_data: "LS0tLS1CRUdJTiBDRVJUSUZJQ0FURS0tLS0tCg==".to_string(),
            token: SecretString::from("k8s-aws-v1.secret"),
        }
    }

    #[test]
    fn test_kubeconfig_carries_token() {
        let rendered = kubeconfig(&access()).unwrap();
        let parsed: serde_json::Value = serde_yaml::from_str(&rendered).unwrap();
        assert_eq!(parsed["current-context"], "dataplane");
        assert_eq!(parsed["clusters"][0]["cluster"]["server"], "https://demo.eks.example.com");
        assert_eq!(parsed["users"][0]["user"]["token"], "k8s-aws-v1.secret");
    }

    #[test]
    fn test_kubeconfig_rejects_bad_ca() {
        let mut access = access();
        access.ca_data = "not base64!".to_string();
        assert!(kubeconfig(&access).is_err());
    }

    #[test]
    fn test_token_stays_off_the_command_line() {
        let deployer = HelmCli {
            binary: "helm".to_string(),
            kubeconfig: NamedTempFile::new().unwrap(),
        };
        let args = deployer.connection_args();
        assert_eq!(args[0], "--kubeconfig");
        assert!(args.iter().all(|a| !a.contains("k8s-aws-v1")));
    }

    #[test]
    fn test_list_args_anchor_release_name() {
        let args = list_args("web", "apps");
        assert!(args.contains(&"^web$".to_string()));
        assert!(args.contains(&"json".to_string()));
    }
}
