//! Chart-based workload deployment.
//!
//! Pending installs and upgrades of one pass run concurrently. Every launched workload is
//! marked `Installing` or `Upgrading` before the launch, and the pass waits for exactly
//! the launched set before writing all final phases in one status patch.

use std::sync::Arc;

use anyhow::Result;
use futures::future::join_all;
use tracing::{debug, error, info, warn};

use super::{Pass, Step};
use crate::crd::{AppPhase, ApplicationSpec, ChartSpec};
use crate::error::DpoError;
use crate::helm::ChartDeployer;
use crate::status::set_condition;

pub const CONDITION_APPLICATIONS_READY: &str = "ApplicationsReady";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Install,
    Upgrade,
}

impl Operation {
    const fn phase(self) -> AppPhase {
        match self {
            Self::Install => AppPhase::Installing,
            Self::Upgrade => AppPhase::Upgrading,
        }
    }
}

/// One workload to hand to the deployer this pass.
#[derive(Debug, Clone)]
struct Launch {
    name: String,
    namespace: String,
    chart: ChartSpec,
    operation: Operation,
}

/// Final outcome of one launched workload.
struct Outcome {
    name: String,
    version: String,
    error: Option<String>,
}

pub async fn reconcile(pass: &mut Pass<'_>) -> Result<Step> {
    uninstall_removed(pass).await?;

    let candidates: Vec<ApplicationSpec> = pass
        .spec()
        .applications
        .iter()
        .filter(|app| !is_current(pass, app))
        .cloned()
        .collect();
    if candidates.is_empty() {
        mark_ready(pass).await?;
        return Ok(Step::Ready);
    }

    let deployer = pass.deployer().await?;
    let mut launches = Vec::new();
    let mut settled = Vec::new();
    let mut in_progress = false;
    for app in candidates {
        match deployer.status(&app.name, &app.namespace).await? {
            None => launches.push(launch(&app, Operation::Install)),
            Some(release) if release.is_pending() => {
                debug!("Release {} is {}, leaving it alone", app.name, release.status);
                in_progress = true;
            }
            Some(release)
                if release.is_deployed()
                    && release.chart_version(&app.chart.name) == Some(app.chart.version.as_str()) =>
            {
                settled.push((app.name.clone(), app.chart.version.clone()));
            }
            Some(_) => launches.push(launch(&app, Operation::Upgrade)),
        }
    }

    pass.patch(|s| {
        for launch in &launches {
            s.app_status
                .insert(launch.name.clone(), launch.operation.phase());
            s.app_namespaces
                .insert(launch.name.clone(), launch.namespace.clone());
        }
        for (name, version) in &settled {
            s.app_status.insert(name.clone(), AppPhase::Deployed);
            s.app_versions.insert(name.clone(), version.clone());
        }
    })
    .await?;

    let outcomes = run_concurrently(pass, &deployer, launches).await;
    let failures: Vec<String> = outcomes
        .iter()
        .filter_map(|o| o.error.as_ref().map(|e| format!("{}: {e}", o.name)))
        .collect();

    pass.patch(|s| {
        for outcome in &outcomes {
            if outcome.error.is_some() {
                s.app_status.insert(outcome.name.clone(), AppPhase::Failed);
            } else {
                s.app_status.insert(outcome.name.clone(), AppPhase::Deployed);
                s.app_versions
                    .insert(outcome.name.clone(), outcome.version.clone());
            }
        }
        if !failures.is_empty() {
            set_condition(
                &mut s.conditions,
                CONDITION_APPLICATIONS_READY,
                false,
                "ChartFailed",
                failures.join("; "),
            );
        }
    })
    .await?;

    if !failures.is_empty() {
        return Err(DpoError::Chart(format!(
            "{} of {} workloads failed: {}",
            failures.len(),
            outcomes.len(),
            failures.join("; ")
        ))
        .into());
    }

    if in_progress {
        return Ok(Step::Pending);
    }
    mark_ready(pass).await?;
    Ok(Step::Ready)
}

fn launch(app: &ApplicationSpec, operation: Operation) -> Launch {
    Launch {
        name: app.name.clone(),
        namespace: app.namespace.clone(),
        chart: app.chart.clone(),
        operation,
    }
}

/// Deployed at the desired chart version according to the status.
fn is_current(pass: &Pass<'_>, app: &ApplicationSpec) -> bool {
    let status = pass.status();
    status.app_status.get(&app.name) == Some(&AppPhase::Deployed)
        && status.app_versions.get(&app.name) == Some(&app.chart.version)
}

async fn mark_ready(pass: &mut Pass<'_>) -> Result<()> {
    let count = pass.spec().applications.len();
    pass.patch(|s| {
        set_condition(
            &mut s.conditions,
            CONDITION_APPLICATIONS_READY,
            true,
            "AllDeployed",
            format!("{count} workloads deployed"),
        );
    })
    .await?;
    Ok(())
}

/// Launch every install or upgrade as its own task and wait for all of them.
async fn run_concurrently(
    pass: &Pass<'_>,
    deployer: &Arc<dyn ChartDeployer>,
    launches: Vec<Launch>,
) -> Vec<Outcome> {
    if launches.is_empty() {
        return Vec::new();
    }
    info!(
        "Deploying {} workloads on {}",
        launches.len(),
        pass.cluster_name()
    );

    let handles: Vec<_> = launches
        .iter()
        .cloned()
        .map(|launch| {
            let deployer = deployer.clone();
            tokio::spawn(async move {
                match launch.operation {
                    Operation::Install => {
                        deployer
                            .install(&launch.name, &launch.namespace, &launch.chart)
                            .await
                    }
                    Operation::Upgrade => {
                        deployer
                            .upgrade(&launch.name, &launch.namespace, &launch.chart)
                            .await
                    }
                }
            })
        })
        .collect();

    let results = join_all(handles).await;

    launches
        .into_iter()
        .zip(results)
        .map(|(launch, joined)| {
            let error = match joined {
                Ok(Ok(())) => {
                    pass.record_create("chart");
                    info!(
                        "Workload {} deployed at {} {}",
                        launch.name, launch.chart.name, launch.chart.version
                    );
                    None
                }
                Ok(Err(e)) => {
                    warn!("Workload {} failed: {}", launch.name, e);
                    Some(e.to_string())
                }
                Err(e) => {
                    error!("Deploy task for {} did not complete: {}", launch.name, e);
                    Some(e.to_string())
                }
            };
            Outcome {
                name: launch.name,
                version: launch.chart.version,
                error,
            }
        })
        .collect()
}

/// Uninstall workloads that left the spec, one at a time.
async fn uninstall_removed(pass: &mut Pass<'_>) -> Result<()> {
    let removed: Vec<String> = pass
        .status()
        .app_status
        .iter()
        .filter(|(name, phase)| {
            **phase != AppPhase::Uninstalled
                && !pass.spec().applications.iter().any(|a| &a.name == *name)
        })
        .map(|(name, _)| name.clone())
        .collect();
    uninstall(pass, removed).await
}

/// Uninstall every workload that is not already uninstalled.
pub async fn uninstall_all(pass: &mut Pass<'_>) -> Result<()> {
    let installed: Vec<String> = pass
        .status()
        .app_status
        .iter()
        .filter(|(_, phase)| **phase != AppPhase::Uninstalled)
        .map(|(name, _)| name.clone())
        .collect();
    uninstall(pass, installed).await
}

/// Synchronous per workload: `Uninstalling` is persisted before the deployer is called.
async fn uninstall(pass: &mut Pass<'_>, names: Vec<String>) -> Result<()> {
    if names.is_empty() {
        return Ok(());
    }
    let deployer = pass.deployer().await?;

    for name in names {
        let Some(namespace) = pass.status().app_namespaces.get(&name).cloned() else {
            warn!("No namespace recorded for workload {}, marking it uninstalled", name);
            pass.patch(|s| {
                s.app_status.insert(name.clone(), AppPhase::Uninstalled);
            })
            .await?;
            continue;
        };

        pass.patch(|s| {
            s.app_status.insert(name.clone(), AppPhase::Uninstalling);
        })
        .await?;
        deployer.uninstall(&name, &namespace).await?;
        info!("Uninstalled workload {} from {}", name, namespace);
        pass.patch(|s| {
            s.app_status.insert(name.clone(), AppPhase::Uninstalled);
            s.app_versions.remove(&name);
        })
        .await?;
    }
    Ok(())
}
