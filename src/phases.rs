//! Provisioning and teardown components of a `DataPlane` reconcile pass.
//!
//! Components run in dependency order and each returns a [`Step`]. Every mutation goes
//! through [`Pass::patch`], so a component can be re-entered at any point and resumes from
//! whatever the status already holds.

pub mod addons;
pub mod applications;
pub mod cluster;
pub mod deletion;
pub mod network;
pub mod nodegroups;

use std::sync::Arc;

use anyhow::Result;

use crate::cloud::Cloud;
use crate::crd::{DataPlane, DataPlaneSpec, DataPlaneStatus};
use crate::error::DpoError;
use crate::helm::{ChartDeployer, ClusterAccess};
use crate::reconciler::Engine;
use crate::status::{self, EventRecorder};

/// Outcome of one component within a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Converged; later components may run.
    Ready,
    /// Waiting on the provider; later components are skipped this pass.
    Pending,
}

/// Working state of one reconcile pass over one `DataPlane`.
pub struct Pass<'a> {
    pub engine: &'a Engine,
    pub cloud: Cloud,
    pub recorder: &'a EventRecorder,
    name: String,
    spec: DataPlaneSpec,
    status: DataPlaneStatus,
    deployer: Option<Arc<dyn ChartDeployer>>,
}

impl<'a> Pass<'a> {
    pub fn new(
        engine: &'a Engine,
        cloud: Cloud,
        record: &DataPlane,
        recorder: &'a EventRecorder,
    ) -> Self {
        Self {
            engine,
            cloud,
            recorder,
            name: record.metadata.name.clone().unwrap_or_default(),
            spec: record.spec.clone(),
            status: record.status.clone().unwrap_or_default(),
            deployer: None,
        }
    }

    /// Record name, also used as the prefix of every resource name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Desired state, fixed for the whole pass.
    pub const fn spec(&self) -> &DataPlaneSpec {
        &self.spec
    }

    /// Status as of the last persisted write.
    pub const fn status(&self) -> &DataPlaneStatus {
        &self.status
    }

    pub fn cluster_name(&self) -> &str {
        &self.spec.cluster.name
    }

    /// Apply `mutate` to the persisted status and adopt the result.
    ///
    /// `mutate` may run several times against fresher copies and must only set the
    /// fields it owns.
    pub async fn patch<F>(&mut self, mutate: F) -> Result<bool>
    where
        F: FnMut(&mut DataPlaneStatus) + Send,
    {
        let (record, changed) =
            status::patch_status::<DataPlane, _, _>(self.engine.store.as_ref(), &self.name, mutate)
                .await?;
        self.status = record.status.unwrap_or_default();
        Ok(changed)
    }

    /// Count an accepted provider create call.
    pub fn record_create(&self, resource: &str) {
        if let Some(metrics) = &self.engine.metrics {
            metrics.record_create(resource);
        }
    }

    /// Chart deployer bound to this dataplane's cluster, built once per pass.
    pub async fn deployer(&mut self) -> Result<Arc<dyn ChartDeployer>> {
        if let Some(deployer) = &self.deployer {
            return Ok(deployer.clone());
        }

        let cluster = self
            .cloud
            .cluster
            .describe_cluster(&self.spec.cluster.name)
            .await?
            .ok_or_else(|| DpoError::RecordNotFound(self.spec.cluster.name.clone()))?;
        let endpoint = cluster
            .endpoint
            .ok_or_else(|| DpoError::missing("cluster", "endpoint"))?;
        let ca_data = cluster
            .ca_data
            .ok_or_else(|| DpoError::missing("cluster", "certificateAuthority"))?;
        let token = self
            .cloud
            .cluster
            .access_token(&self.spec.cluster.name)
            .await?;

        let deployer = self
            .engine
            .charts
            .for_cluster(ClusterAccess {
                endpoint,
                ca_data,
                token,
            })
            .await?;
        self.deployer = Some(deployer.clone());
        Ok(deployer)
    }
}

/// Name of the always-present system node pool.
pub fn system_pool_name(dataplane: &str) -> String {
    format!("{dataplane}-system")
}

/// Name of the node pool dedicated to one workload at one machine-pool size.
///
/// Pools are immutable, so a workload moving to another size gets a new pool.
pub fn workload_pool_name(dataplane: &str, workload: &str, size: &str) -> String {
    format!("{dataplane}-workload-{workload}-{size}")
}

/// Node pool names the spec implies, system pool first.
pub fn expected_pool_names(dataplane: &str, spec: &DataPlaneSpec) -> Vec<String> {
    nodegroups::desired_pools(dataplane, spec)
        .into_iter()
        .map(|pool| pool.name)
        .collect()
}
