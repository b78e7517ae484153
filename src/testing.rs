//! In-memory fakes and record builders shared by unit tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use kube::Resource;
use secrecy::SecretString;

use crate::cloud::{
    AddonApi, AddonInfo, Cloud, CloudConnector, ClusterApi, ClusterInfo, ClusterRequest,
    IdentityApi, NetworkApi, NodeGroupApi, NodeGroupInfo, NodeGroupRequest, RoleRequest,
    STATUS_ACTIVE, SubnetRequest,
};
use crate::config::ReconcileSettings;
use crate::crd::{
    AppPhase, ApplicationSpec, ChartSpec, DataPlane, DataPlanePhase, DataPlaneSpec,
    DataPlaneStatus, MachinePoolSpec,
};
use crate::error::DpoError;
use crate::helm::{ChartDeployer, ChartDeployerFactory, ClusterAccess, ReleaseStatus};
use crate::phases::{Pass, expected_pool_names};
use crate::reconciler::Engine;
use crate::status::{EventRecorder, RecordStore, StatusRecord};
use crate::store::InFlightStore;

pub const ACCOUNT_ID: &str = "123456789012";
pub const OIDC_ISSUER: &str = "https://oidc.eks.us-east-1.amazonaws.com/id/EXAMPLED539D4633E53DE1B71EXAMPLE";

pub fn oidc_provider_arn() -> String {
    format!(
        "arn:aws:iam::{ACCOUNT_ID}:oidc-provider/{}",
        OIDC_ISSUER.trim_start_matches("https://")
    )
}

// ---------------------------------------------------------------------------
// Record store
// ---------------------------------------------------------------------------

struct MemoryState<K> {
    records: BTreeMap<String, K>,
    revision: u64,
    status_writes: usize,
    pending_conflicts: usize,
    write_delay: Duration,
}

/// Versioned record store. Writes carrying a stale `resourceVersion` fail with a conflict.
pub struct MemoryStore<K> {
    state: Mutex<MemoryState<K>>,
}

impl<K: StatusRecord> MemoryStore<K> {
    pub fn with(records: Vec<K>) -> Self {
        let mut state = MemoryState {
            records: BTreeMap::new(),
            revision: 0,
            status_writes: 0,
            pending_conflicts: 0,
            write_delay: Duration::ZERO,
        };
        for mut record in records {
            state.revision += 1;
            record.meta_mut().resource_version = Some(state.revision.to_string());
            let name = record.meta().name.clone().unwrap_or_default();
            state.records.insert(name, record);
        }
        Self {
            state: Mutex::new(state),
        }
    }

    /// Successful status writes so far.
    pub fn status_writes(&self) -> usize {
        self.state.lock().unwrap().status_writes
    }

    /// Fail the next `count` writes with a conflict.
    pub fn inject_conflicts(&self, count: usize) {
        self.state.lock().unwrap().pending_conflicts = count;
    }

    /// Sleep before every write so concurrent writers interleave.
    pub fn set_write_delay(&self, delay: Duration) {
        self.state.lock().unwrap().write_delay = delay;
    }

    pub fn snapshot(&self, name: &str) -> Option<K> {
        self.state.lock().unwrap().records.get(name).cloned()
    }

    /// Edit a stored record the way a user edits the spec.
    pub fn update(&self, name: &str, edit: impl FnOnce(&mut K)) {
        let mut state = self.state.lock().unwrap();
        state.revision += 1;
        let revision = state.revision.to_string();
        let record = state.records.get_mut(name).unwrap();
        edit(record);
        record.meta_mut().resource_version = Some(revision);
    }

    fn delay(&self) -> Duration {
        self.state.lock().unwrap().write_delay
    }

    /// Run `write` against the stored copy when `record` is not stale.
    fn commit(&self, record: &K, write: impl FnOnce(&mut K)) -> Result<K> {
        let name = record.meta().name.clone().unwrap_or_default();
        let mut state = self.state.lock().unwrap();
        if state.pending_conflicts > 0 {
            state.pending_conflicts -= 1;
            return Err(DpoError::Conflict(name).into());
        }

        state.revision += 1;
        let revision = state.revision.to_string();
        let stored = state
            .records
            .get_mut(&name)
            .ok_or_else(|| DpoError::RecordNotFound(name.clone()))?;
        if stored.meta().resource_version != record.meta().resource_version {
            return Err(DpoError::Conflict(name).into());
        }
        write(stored);
        stored.meta_mut().resource_version = Some(revision);
        Ok(stored.clone())
    }
}

#[async_trait]
impl<K: StatusRecord> RecordStore<K> for MemoryStore<K> {
    async fn get(&self, name: &str) -> Result<Option<K>> {
        Ok(self.snapshot(name))
    }

    async fn list(&self) -> Result<Vec<K>> {
        Ok(self.state.lock().unwrap().records.values().cloned().collect())
    }

    async fn write_status(&self, record: &K) -> Result<K> {
        let delay = self.delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let status = record.status().cloned().unwrap_or_default();
        let updated = self.commit(record, |stored| *stored.status_mut() = status)?;
        self.state.lock().unwrap().status_writes += 1;
        Ok(updated)
    }

    async fn set_finalizers(&self, record: &K, finalizers: Vec<String>) -> Result<K> {
        let updated = self.commit(record, |stored| {
            stored.meta_mut().finalizers = Some(finalizers);
        })?;

        // A deleted record without finalizers is purged.
        if updated.meta().deletion_timestamp.is_some()
            && updated.meta().finalizers.as_ref().is_none_or(Vec::is_empty)
        {
            let name = updated.meta().name.clone().unwrap_or_default();
            self.state.lock().unwrap().records.remove(&name);
        }
        Ok(updated)
    }
}

// ---------------------------------------------------------------------------
// Cloud
// ---------------------------------------------------------------------------

#[derive(Default)]
struct CloudState {
    calls: Vec<String>,
    fail_after: HashMap<String, usize>,
    next_id: u64,
    subnets: Vec<SubnetRequest>,
    nat_subnet: Option<String>,
    clusters: BTreeMap<String, ClusterInfo>,
    nodegroups: BTreeMap<String, NodeGroupRequest>,
    nodegroup_status: BTreeMap<String, String>,
    addons: BTreeMap<String, String>,
    roles: BTreeMap<String, RoleRequest>,
    attachments: Vec<(String, String)>,
    oidc_providers: BTreeMap<String, String>,
    version_updates: Vec<String>,
    cluster_deleted_with_pools: bool,
}

/// A single-account cloud that remembers every call.
#[derive(Default)]
pub struct FakeCloud {
    state: Mutex<CloudState>,
}

impl FakeCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log `op` and hand out a fresh id, or fail when the op's budget is spent.
    fn call(&self, op: &str) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        if let Some(remaining) = state.fail_after.get_mut(op) {
            if *remaining == 0 {
                return Err(DpoError::AwsSdk(op.to_string(), "injected failure".to_string()).into());
            }
            *remaining -= 1;
        }
        state.calls.push(op.to_string());
        state.next_id += 1;
        Ok(state.next_id)
    }

    /// Successful calls of `op`.
    pub fn calls(&self, op: &str) -> usize {
        self.state.lock().unwrap().calls.iter().filter(|c| *c == op).count()
    }

    pub fn total_creates(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| c.starts_with("create_"))
            .count()
    }

    /// Let `op` succeed `successes` more times, then fail.
    pub fn fail_after(&self, op: &str, successes: usize) {
        self.state
            .lock()
            .unwrap()
            .fail_after
            .insert(op.to_string(), successes);
    }

    pub fn clear_failures(&self) {
        self.state.lock().unwrap().fail_after.clear();
    }

    pub fn subnet_cidrs(&self) -> Vec<String> {
        self.state.lock().unwrap().subnets.iter().map(|s| s.cidr.clone()).collect()
    }

    pub fn public_subnets(&self) -> Vec<bool> {
        self.state.lock().unwrap().subnets.iter().map(|s| s.public).collect()
    }

    pub fn nat_subnet(&self) -> Option<String> {
        self.state.lock().unwrap().nat_subnet.clone()
    }

    pub fn put_cluster(&self, name: &str, status: &str, version: &str) {
        self.state
            .lock()
            .unwrap()
            .clusters
            .insert(name.to_string(), cluster_info(name, status, version));
    }

    pub fn remove_cluster(&self) {
        self.state.lock().unwrap().clusters.clear();
    }

    pub fn cluster_status(&self, name: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .clusters
            .get(name)
            .map(|c| c.status.clone())
    }

    pub fn version_updates(&self) -> Vec<String> {
        self.state.lock().unwrap().version_updates.clone()
    }

    /// Register a provider for the issuer every fake cluster reports.
    pub fn put_oidc_provider(&self, arn: &str) {
        self.state
            .lock()
            .unwrap()
            .oidc_providers
            .insert(arn.to_string(), OIDC_ISSUER.to_string());
    }

    pub fn set_nodegroup_status(&self, name: &str, status: &str) {
        self.state
            .lock()
            .unwrap()
            .nodegroup_status
            .insert(name.to_string(), status.to_string());
    }

    pub fn remove_nodegroup(&self, name: &str) {
        let mut state = self.state.lock().unwrap();
        state.nodegroup_status.remove(name);
        state.nodegroups.remove(name);
    }

    pub fn nodegroup(&self, name: &str) -> Option<NodeGroupRequest> {
        self.state.lock().unwrap().nodegroups.get(name).cloned()
    }

    pub fn set_addon_status(&self, name: &str, status: &str) {
        self.state
            .lock()
            .unwrap()
            .addons
            .insert(name.to_string(), status.to_string());
    }

    pub fn role(&self, name: &str) -> Option<RoleRequest> {
        self.state.lock().unwrap().roles.get(name).cloned()
    }

    pub fn attachments(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().attachments.clone()
    }

    /// True if a cluster delete was ever issued while a node pool still existed.
    pub fn cluster_deleted_with_pools(&self) -> bool {
        self.state.lock().unwrap().cluster_deleted_with_pools
    }
}

fn cluster_info(name: &str, status: &str, version: &str) -> ClusterInfo {
    ClusterInfo {
        name: name.to_string(),
        arn: Some(format!("arn:aws:eks:us-east-1:{ACCOUNT_ID}:cluster/{name}")),
        status: status.to_string(),
        version: version.to_string(),
        endpoint: Some(format!("https://{name}.eks.example.com")),
        ca_data: Some("LS0tLS1CRUdJTiBDRVJUSUZJQ0FURS0tLS0tCg==".to_string()),
        oidc_issuer: Some(OIDC_ISSUER.to_string()),
    }
}

#[async_trait]
impl NetworkApi for FakeCloud {
    async fn create_vpc(&self, _name: &str, _cidr: &str) -> Result<String> {
        Ok(format!("vpc-{}", self.call("create_vpc")?))
    }

    async fn enable_dns_hostnames(&self, _vpc_id: &str) -> Result<()> {
        self.call("enable_dns_hostnames")?;
        Ok(())
    }

    async fn create_internet_gateway(&self, _name: &str) -> Result<String> {
        Ok(format!("igw-{}", self.call("create_internet_gateway")?))
    }

    async fn attach_internet_gateway(
        &self,
        _internet_gateway_id: &str,
        _vpc_id: &str,
    ) -> Result<()> {
        self.call("attach_internet_gateway")?;
        Ok(())
    }

    async fn create_route_table(&self, _name: &str, _vpc_id: &str) -> Result<String> {
        Ok(format!("rtb-{}", self.call("create_route_table")?))
    }

    async fn add_internet_route(
        &self,
        _route_table_id: &str,
        _internet_gateway_id: &str,
    ) -> Result<()> {
        self.call("add_internet_route")?;
        Ok(())
    }

    async fn availability_zones(&self) -> Result<Vec<String>> {
        self.call("availability_zones")?;
        Ok(vec![
            "us-east-1a".to_string(),
            "us-east-1b".to_string(),
            "us-east-1c".to_string(),
        ])
    }

    async fn create_subnet(&self, request: &SubnetRequest) -> Result<String> {
        let id = format!("subnet-{}", self.call("create_subnet")?);
        self.state.lock().unwrap().subnets.push(request.clone());
        Ok(id)
    }

    async fn configure_public_subnet(&self, _subnet_id: &str, _route_table_id: &str) -> Result<()> {
        self.call("configure_public_subnet")?;
        Ok(())
    }

    async fn create_security_group(&self, _name: &str, _vpc_id: &str) -> Result<String> {
        Ok(format!("sg-{}", self.call("create_security_group")?))
    }

    async fn authorize_ingress(&self, _security_group_id: &str, _cidr: &str) -> Result<()> {
        self.call("authorize_ingress")?;
        Ok(())
    }

    async fn allocate_address(&self, _name: &str) -> Result<String> {
        Ok(format!("eipalloc-{}", self.call("allocate_address")?))
    }

    async fn create_nat_gateway(
        &self,
        _name: &str,
        subnet_id: &str,
        _allocation_id: &str,
    ) -> Result<String> {
        let id = format!("nat-{}", self.call("create_nat_gateway")?);
        self.state.lock().unwrap().nat_subnet = Some(subnet_id.to_string());
        Ok(id)
    }

    async fn route_private_tables_via_nat(
        &self,
        _vpc_id: &str,
        _public_route_table_id: &str,
        _nat_gateway_id: &str,
    ) -> Result<usize> {
        self.call("route_private_tables_via_nat")?;
        Ok(1)
    }
}

#[async_trait]
impl ClusterApi for FakeCloud {
    async fn describe_cluster(&self, name: &str) -> Result<Option<ClusterInfo>> {
        self.call("describe_cluster")?;
        Ok(self.state.lock().unwrap().clusters.get(name).cloned())
    }

    async fn create_cluster(&self, request: &ClusterRequest) -> Result<String> {
        self.call("create_cluster")?;
        let info = cluster_info(&request.name, "CREATING", &request.version);
        let arn = info.arn.clone().unwrap_or_default();
        self.state
            .lock()
            .unwrap()
            .clusters
            .insert(request.name.clone(), info);
        Ok(arn)
    }

    async fn update_cluster_version(&self, name: &str, version: &str) -> Result<String> {
        let id = self.call("update_cluster_version")?;
        let mut state = self.state.lock().unwrap();
        state.version_updates.push(version.to_string());
        if let Some(cluster) = state.clusters.get_mut(name) {
            cluster.status = "UPDATING".to_string();
        }
        Ok(format!("update-{id}"))
    }

    async fn delete_cluster(&self, name: &str) -> Result<()> {
        self.call("delete_cluster")?;
        let mut state = self.state.lock().unwrap();
        if !state.nodegroup_status.is_empty() {
            state.cluster_deleted_with_pools = true;
        }
        if let Some(cluster) = state.clusters.get_mut(name) {
            cluster.status = "DELETING".to_string();
        }
        Ok(())
    }

    async fn access_token(&self, _name: &str) -> Result<SecretString> {
        self.call("access_token")?;
        Ok(SecretString::from("k8s-aws-v1.fake"))
    }
}

#[async_trait]
impl NodeGroupApi for FakeCloud {
    async fn describe_nodegroup(
        &self,
        _cluster: &str,
        name: &str,
    ) -> Result<Option<NodeGroupInfo>> {
        self.call("describe_nodegroup")?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .nodegroup_status
            .get(name)
            .map(|status| NodeGroupInfo {
                name: name.to_string(),
                status: status.clone(),
            }))
    }

    async fn list_nodegroups(&self, _cluster: &str) -> Result<Vec<String>> {
        self.call("list_nodegroups")?;
        Ok(self.state.lock().unwrap().nodegroup_status.keys().cloned().collect())
    }

    async fn create_nodegroup(&self, request: &NodeGroupRequest) -> Result<NodeGroupInfo> {
        self.call("create_nodegroup")?;
        let mut state = self.state.lock().unwrap();
        state
            .nodegroups
            .insert(request.name.clone(), request.clone());
        state
            .nodegroup_status
            .insert(request.name.clone(), "CREATING".to_string());
        Ok(NodeGroupInfo {
            name: request.name.clone(),
            status: "CREATING".to_string(),
        })
    }

    async fn delete_nodegroup(&self, _cluster: &str, name: &str) -> Result<()> {
        self.call("delete_nodegroup")?;
        if let Some(status) = self.state.lock().unwrap().nodegroup_status.get_mut(name) {
            *status = "DELETING".to_string();
        }
        Ok(())
    }
}

#[async_trait]
impl AddonApi for FakeCloud {
    async fn describe_addon(&self, _cluster: &str, name: &str) -> Result<Option<AddonInfo>> {
        self.call("describe_addon")?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .addons
            .get(name)
            .map(|status| AddonInfo {
                name: name.to_string(),
                status: status.clone(),
            }))
    }

    async fn create_addon(
        &self,
        _cluster: &str,
        name: &str,
        _service_account_role_arn: Option<&str>,
    ) -> Result<AddonInfo> {
        self.call("create_addon")?;
        self.state
            .lock()
            .unwrap()
            .addons
            .insert(name.to_string(), "CREATING".to_string());
        Ok(AddonInfo {
            name: name.to_string(),
            status: "CREATING".to_string(),
        })
    }
}

#[async_trait]
impl IdentityApi for FakeCloud {
    async fn ensure_role(&self, request: &RoleRequest) -> Result<String> {
        self.call("ensure_role")?;
        self.state
            .lock()
            .unwrap()
            .roles
            .insert(request.name.clone(), request.clone());
        Ok(format!("arn:aws:iam::{ACCOUNT_ID}:role/{}", request.name))
    }

    async fn ensure_policy(&self, name: &str, _document: &str) -> Result<String> {
        self.call("ensure_policy")?;
        Ok(format!("arn:aws:iam::{ACCOUNT_ID}:policy/{name}"))
    }

    async fn attach_role_policy(&self, role_name: &str, policy_arn: &str) -> Result<()> {
        self.call("attach_role_policy")?;
        self.state
            .lock()
            .unwrap()
            .attachments
            .push((role_name.to_string(), policy_arn.to_string()));
        Ok(())
    }

    async fn oidc_provider_exists(&self, arn: &str) -> Result<bool> {
        self.call("oidc_provider_exists")?;
        Ok(self.state.lock().unwrap().oidc_providers.contains_key(arn))
    }

    async fn find_oidc_provider(&self, issuer_url: &str) -> Result<Option<String>> {
        self.call("find_oidc_provider")?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .oidc_providers
            .iter()
            .find(|(_, issuer)| *issuer == issuer_url)
            .map(|(arn, _)| arn.clone()))
    }

    async fn create_oidc_provider(&self, issuer_url: &str, _thumbprint: &str) -> Result<String> {
        self.call("create_oidc_provider")?;
        let arn = format!(
            "arn:aws:iam::{ACCOUNT_ID}:oidc-provider/{}",
            issuer_url.trim_start_matches("https://")
        );
        self.state
            .lock()
            .unwrap()
            .oidc_providers
            .insert(arn.clone(), issuer_url.to_string());
        Ok(arn)
    }

    async fn delete_oidc_provider(&self, arn: &str) -> Result<()> {
        self.call("delete_oidc_provider")?;
        self.state.lock().unwrap().oidc_providers.remove(arn);
        Ok(())
    }

    async fn issuer_thumbprint(&self, _issuer_url: &str) -> Result<String> {
        self.call("issuer_thumbprint")?;
        Ok("9e99a48a9960b14926bb7f3b02e22da2b0ab7280".to_string())
    }
}

/// Connects every dataplane to the same [`FakeCloud`].
pub struct FakeConnector(pub Arc<FakeCloud>);

#[async_trait]
impl CloudConnector for FakeConnector {
    async fn connect(&self, _dataplane: &str, _spec: &DataPlaneSpec) -> Result<Cloud> {
        Ok(Cloud::from_backend(self.0.clone()))
    }
}

// ---------------------------------------------------------------------------
// Charts
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ChartState {
    releases: BTreeMap<String, ReleaseStatus>,
    calls: Vec<String>,
    latency: HashMap<String, Duration>,
    failing: HashSet<String>,
    in_flight: usize,
    max_in_flight: usize,
}

/// Chart deployer with per-release latency and outcome knobs.
///
/// Doubles as its own factory; every cluster shares the same releases.
#[derive(Clone, Default)]
pub struct FakeCharts {
    state: Arc<Mutex<ChartState>>,
}

impl FakeCharts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mutating calls in order, e.g. `install api`.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn set_latency(&self, release: &str, latency: Duration) {
        self.state
            .lock()
            .unwrap()
            .latency
            .insert(release.to_string(), latency);
    }

    pub fn fail_release(&self, release: &str) {
        self.state
            .lock()
            .unwrap()
            .failing
            .insert(release.to_string());
    }

    /// Highest number of install or upgrade calls running at once.
    pub fn max_in_flight(&self) -> usize {
        self.state.lock().unwrap().max_in_flight
    }

    pub fn put_release(&self, release: &str, status: &str, chart: &str) {
        self.state.lock().unwrap().releases.insert(
            release.to_string(),
            ReleaseStatus {
                name: release.to_string(),
                status: status.to_string(),
                chart: chart.to_string(),
            },
        );
    }

    async fn apply(&self, op: &str, release: &str, chart: &ChartSpec) -> Result<()> {
        let latency = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(format!("{op} {release}"));
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
            state.latency.get(release).copied().unwrap_or_default()
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.lock().unwrap();
        state.in_flight -= 1;
        let failed = state.failing.contains(release);
        state.releases.insert(
            release.to_string(),
            ReleaseStatus {
                name: release.to_string(),
                status: if failed { "failed" } else { "deployed" }.to_string(),
                chart: format!("{}-{}", chart.name, chart.version),
            },
        );
        if failed {
            return Err(DpoError::Chart(format!("{op} {release} failed")).into());
        }
        Ok(())
    }
}

#[async_trait]
impl ChartDeployer for FakeCharts {
    async fn status(&self, release: &str, _namespace: &str) -> Result<Option<ReleaseStatus>> {
        Ok(self.state.lock().unwrap().releases.get(release).cloned())
    }

    async fn install(&self, release: &str, _namespace: &str, chart: &ChartSpec) -> Result<()> {
        self.apply("install", release, chart).await
    }

    async fn upgrade(&self, release: &str, _namespace: &str, chart: &ChartSpec) -> Result<()> {
        self.apply("upgrade", release, chart).await
    }

    async fn uninstall(&self, release: &str, _namespace: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("uninstall {release}"));
        state.releases.remove(release);
        Ok(())
    }
}

#[async_trait]
impl ChartDeployerFactory for FakeCharts {
    async fn for_cluster(&self, _access: ClusterAccess) -> Result<Arc<dyn ChartDeployer>> {
        Ok(Arc::new(self.clone()))
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// An [`Engine`] wired to in-memory fakes.
pub struct Harness {
    pub store: Arc<MemoryStore<DataPlane>>,
    pub cloud: Arc<FakeCloud>,
    pub charts: Arc<FakeCharts>,
    pub inflight: Arc<InFlightStore>,
    pub engine: Engine,
    pub recorder: EventRecorder,
}

impl Harness {
    /// Records whose status says the cluster is active get a matching fake cluster.
    pub fn new(records: Vec<DataPlane>) -> Self {
        let cloud = Arc::new(FakeCloud::new());
        for record in &records {
            let eks = record
                .status
                .as_ref()
                .map(|s| s.cloud_infra_status.eks_status.clone())
                .unwrap_or_default();
            if eks.status.as_deref() == Some(STATUS_ACTIVE) {
                cloud.put_cluster(
                    &record.spec.cluster.name,
                    STATUS_ACTIVE,
                    eks.version.as_deref().unwrap_or(&record.spec.cluster.version),
                );
            }
        }

        let store = Arc::new(MemoryStore::with(records));
        let charts = Arc::new(FakeCharts::new());
        let inflight = Arc::new(InFlightStore::new());
        let engine = Engine {
            store: store.clone(),
            connector: Arc::new(FakeConnector(cloud.clone())),
            charts: charts.clone(),
            inflight: inflight.clone(),
            settings: ReconcileSettings::default(),
            metrics: None,
        };

        Self {
            store,
            cloud,
            charts,
            inflight,
            engine,
            recorder: EventRecorder::disabled(&dataplane("harness")),
        }
    }

    /// A pass over the stored record as it is right now.
    pub fn pass(&self, name: &str) -> Pass<'_> {
        let record = self.record(name);
        Pass::new(
            &self.engine,
            Cloud::from_backend(self.cloud.clone()),
            &record,
            &self.recorder,
        )
    }

    pub fn record(&self, name: &str) -> DataPlane {
        self.store.snapshot(name).unwrap()
    }

    pub fn status(&self, name: &str) -> DataPlaneStatus {
        self.record(name).status.unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

/// Self-provisioned dataplane in us-east-1 at 1.28 whose cluster shares its name.
pub fn dataplane(name: &str) -> DataPlane {
    let spec: DataPlaneSpec = serde_json::from_value(serde_json::json!({
        "region": "us-east-1",
        "cluster": { "name": name, "version": "1.28" }
    }))
    .unwrap();
    DataPlane::new(name, spec)
}

/// Dataplane with one machine-pool size (`small`) and the given `(workload, size)` pairs.
pub fn dataplane_with_apps(name: &str, apps: &[(&str, Option<&str>)]) -> DataPlane {
    let mut record = dataplane(name);
    record.spec.machine_pools = vec![MachinePoolSpec {
        name: "small".to_string(),
        instance_type: "t3.large".to_string(),
        min_size: 1,
        max_size: 3,
        desired_size: 1,
        labels: BTreeMap::new(),
    }];
    record.spec.applications = apps
        .iter()
        .map(|(app, size)| ApplicationSpec {
            name: (*app).to_string(),
            namespace: "apps".to_string(),
            chart: ChartSpec {
                repository: "https://charts.bitnami.com/bitnami".to_string(),
                name: "nginx".to_string(),
                version: "15.1.0".to_string(),
                values: BTreeMap::new(),
            },
            size: size.map(str::to_string),
        })
        .collect();
    record
}

fn status_of(record: &mut DataPlane) -> &mut DataPlaneStatus {
    record.status.get_or_insert_with(Default::default)
}

/// Network fully provisioned.
pub fn networked(mut record: DataPlane) -> DataPlane {
    let infra = &mut status_of(&mut record).cloud_infra_status;
    infra.vpc = Some("vpc-test".to_string());
    infra.vpc_cidr = Some("10.0.0.0/16".to_string());
    infra.dns_hostnames_enabled = true;
    infra.internet_gateway_id = Some("igw-test".to_string());
    infra.internet_gateway_attached = true;
    infra.public_route_table_id = Some("rtb-test".to_string());
    infra.public_route_added = true;
    infra.subnet_ids = (0..4).map(|i| format!("subnet-test{i}")).collect();
    infra.public_subnets_configured = vec!["subnet-test1".to_string(), "subnet-test3".to_string()];
    infra.nat_allocation_id = Some("eipalloc-test".to_string());
    infra.security_group_ids = vec!["sg-test".to_string()];
    infra.inbound_rule_added = true;
    infra.nat_gateway_id = Some("nat-test".to_string());
    infra.nat_attached = true;
    record
}

/// Network done and the control plane recorded as active.
pub fn active_cluster(record: DataPlane) -> DataPlane {
    let mut record = networked(record);
    let name = record.spec.cluster.name.clone();
    let version = record.spec.cluster.version.clone();
    let status = status_of(&mut record);
    status.phase = Some(DataPlanePhase::Creating);
    let eks = &mut status.cloud_infra_status.eks_status;
    eks.cluster_id = Some(format!("arn:aws:eks:us-east-1:{ACCOUNT_ID}:cluster/{name}"));
    eks.status = Some(STATUS_ACTIVE.to_string());
    eks.version = Some(version);
    record
}

/// OIDC provider recorded.
pub fn with_oidc(mut record: DataPlane) -> DataPlane {
    status_of(&mut record)
        .cloud_infra_status
        .eks_status
        .oidc_provider_arn = Some(oidc_provider_arn());
    record
}

/// Everything below the workloads converged.
pub fn ready_for_apps(record: DataPlane) -> DataPlane {
    let mut record = with_oidc(active_cluster(record));
    let pools = expected_pool_names(
        record.metadata.name.as_deref().unwrap_or_default(),
        &record.spec,
    );
    let policy_arn = format!(
        "arn:aws:iam::{ACCOUNT_ID}:policy/{}-cluster-autoscaler",
        record.spec.cluster.name
    );
    let role_arn = format!(
        "arn:aws:iam::{ACCOUNT_ID}:role/{}-cluster-autoscaler-role",
        record.spec.cluster.name
    );
    let status = status_of(&mut record);
    for pool in pools {
        status.nodegroup_status.insert(pool, STATUS_ACTIVE.to_string());
    }
    for addon in ["vpc-cni", "aws-ebs-csi-driver"] {
        status
            .addon_status
            .insert(addon.to_string(), STATUS_ACTIVE.to_string());
    }
    let eks = &mut status.cloud_infra_status.eks_status;
    eks.autoscaler_policy_arn = Some(policy_arn);
    eks.autoscaler_role_arn = Some(role_arn);
    eks.autoscaler_phase = Some(AppPhase::Deployed);
    record
}

/// Set the deletion timestamp, as the API server does on delete.
pub fn mark_deleted<K: Resource>(record: &mut K) {
    record.meta_mut().deletion_timestamp =
        Some(serde_json::from_value(serde_json::json!("2026-01-01T00:00:00Z")).unwrap());
}
