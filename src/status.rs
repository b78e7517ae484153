//! Status persistence with compare-and-retry, condition builders, and event recording.

use std::fmt::Debug;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::api::{Patch, PatchParams};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Api, Resource};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::crd::{
    Condition, DataPlane, DataPlaneStatus, Tenant, TenantInfra, TenantInfraStatus, TenantStatus,
};
use crate::error::DpoError;

/// Field manager and event reporter name.
pub const MANAGER: &str = "dpo";

/// Attempts a status write gets before a persistent conflict is surfaced.
pub const MAX_PATCH_ATTEMPTS: u32 = 5;

/// A custom resource with a status subresource.
pub trait StatusRecord:
    Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    type Status: Clone + Debug + Default + PartialEq + Serialize + Send + Sync;

    fn status(&self) -> Option<&Self::Status>;
    fn status_mut(&mut self) -> &mut Self::Status;
}

impl StatusRecord for DataPlane {
    type Status = DataPlaneStatus;

    fn status(&self) -> Option<&DataPlaneStatus> {
        self.status.as_ref()
    }

    fn status_mut(&mut self) -> &mut DataPlaneStatus {
        self.status.get_or_insert_with(Default::default)
    }
}

impl StatusRecord for TenantInfra {
    type Status = TenantInfraStatus;

    fn status(&self) -> Option<&TenantInfraStatus> {
        self.status.as_ref()
    }

    fn status_mut(&mut self) -> &mut TenantInfraStatus {
        self.status.get_or_insert_with(Default::default)
    }
}

impl StatusRecord for Tenant {
    type Status = TenantStatus;

    fn status(&self) -> Option<&TenantStatus> {
        self.status.as_ref()
    }

    fn status_mut(&mut self) -> &mut TenantStatus {
        self.status.get_or_insert_with(Default::default)
    }
}

/// Desired-state store for one resource kind.
///
/// `write_status` and `set_finalizers` carry the record's `resourceVersion` and fail with
/// [`DpoError::Conflict`] when the stored record moved on.
#[async_trait]
pub trait RecordStore<K: StatusRecord>: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<K>>;

    async fn list(&self) -> Result<Vec<K>>;

    /// Write the status subresource only.
    async fn write_status(&self, record: &K) -> Result<K>;

    async fn set_finalizers(&self, record: &K, finalizers: Vec<String>) -> Result<K>;
}

fn is_conflict(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<DpoError>(), Some(DpoError::Conflict(_)))
}

/// Re-read `name`, apply `mutate` to its status and write it back.
///
/// A write conflict re-runs the read and the mutation, up to [`MAX_PATCH_ATTEMPTS`] times.
/// Returns the persisted record and whether the status changed. Callers must continue
/// from the returned record; their previous copy is stale.
pub async fn patch_status<K, S, F>(store: &S, name: &str, mut mutate: F) -> Result<(K, bool)>
where
    K: StatusRecord,
    S: RecordStore<K> + ?Sized,
    F: FnMut(&mut K::Status) + Send,
{
    for attempt in 1..=MAX_PATCH_ATTEMPTS {
        let mut record = store
            .get(name)
            .await?
            .ok_or_else(|| DpoError::RecordNotFound(name.to_string()))?;

        let before = record.status().cloned().unwrap_or_default();
        mutate(record.status_mut());
        if record.status() == Some(&before) {
            return Ok((record, false));
        }

        match store.write_status(&record).await {
            Ok(updated) => return Ok((updated, true)),
            Err(e) if is_conflict(&e) => {
                debug!(
                    "Status write conflict on {} (attempt {}/{})",
                    name, attempt, MAX_PATCH_ATTEMPTS
                );
            }
            Err(e) => return Err(e),
        }
    }

    Err(DpoError::ConflictRetriesExhausted(name.to_string(), MAX_PATCH_ATTEMPTS).into())
}

/// Add `finalizer` to the record if absent. Retries on conflict like [`patch_status`].
pub async fn add_finalizer<K, S>(store: &S, name: &str, finalizer: &str) -> Result<K>
where
    K: StatusRecord,
    S: RecordStore<K> + ?Sized,
{
    update_finalizers(store, name, |finalizers| {
        if !finalizers.iter().any(|f| f == finalizer) {
            finalizers.push(finalizer.to_string());
        }
    })
    .await
}

/// Remove `finalizer` from the record. A record that is already gone counts as done.
pub async fn remove_finalizer<K, S>(store: &S, name: &str, finalizer: &str) -> Result<Option<K>>
where
    K: StatusRecord,
    S: RecordStore<K> + ?Sized,
{
    match update_finalizers(store, name, |finalizers| finalizers.retain(|f| f != finalizer)).await
    {
        Ok(record) => Ok(Some(record)),
        Err(e) if matches!(e.downcast_ref::<DpoError>(), Some(DpoError::RecordNotFound(_))) => {
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

async fn update_finalizers<K, S, F>(store: &S, name: &str, mut edit: F) -> Result<K>
where
    K: StatusRecord,
    S: RecordStore<K> + ?Sized,
    F: FnMut(&mut Vec<String>) + Send,
{
    for _ in 0..MAX_PATCH_ATTEMPTS {
        let record = store
            .get(name)
            .await?
            .ok_or_else(|| DpoError::RecordNotFound(name.to_string()))?;

        let current = record.meta().finalizers.clone().unwrap_or_default();
        let mut finalizers = current.clone();
        edit(&mut finalizers);
        if finalizers == current {
            return Ok(record);
        }

        match store.set_finalizers(&record, finalizers).await {
            Ok(updated) => return Ok(updated),
            Err(e) if is_conflict(&e) => {}
            Err(e) => return Err(e),
        }
    }

    Err(DpoError::ConflictRetriesExhausted(name.to_string(), MAX_PATCH_ATTEMPTS).into())
}

pub fn has_finalizer<K: Resource>(record: &K, finalizer: &str) -> bool {
    record
        .meta()
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|x| x == finalizer))
}

/// [`RecordStore`] backed by the Kubernetes API of cluster-scoped resources.
pub struct KubeStore<K> {
    api: Api<K>,
}

impl<K: StatusRecord> KubeStore<K> {
    pub fn new(client: kube::Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

fn kube_error(name: &str, err: kube::Error) -> anyhow::Error {
    match err {
        kube::Error::Api(ae) if ae.code == 409 => DpoError::Conflict(name.to_string()).into(),
        kube::Error::Api(ae) if ae.code == 404 => DpoError::RecordNotFound(name.to_string()).into(),
        other => DpoError::KubernetesApi(other.to_string()).into(),
    }
}

#[async_trait]
impl<K: StatusRecord> RecordStore<K> for KubeStore<K> {
    async fn get(&self, name: &str) -> Result<Option<K>> {
        self.api
            .get_opt(name)
            .await
            .map_err(|e| kube_error(name, e))
    }

    async fn list(&self) -> Result<Vec<K>> {
        let list = self
            .api
            .list(&kube::api::ListParams::default())
            .await
            .map_err(|e| DpoError::KubernetesApi(e.to_string()))?;
        Ok(list.items)
    }

    async fn write_status(&self, record: &K) -> Result<K> {
        let name = record.meta().name.clone().unwrap_or_default();
        debug!("Patching status for {}", name);

        // A merge patch carrying resourceVersion is rejected with 409 when stale.
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": record.meta().resource_version },
            "status": record.status(),
        });
        self.api
            .patch_status(&name, &PatchParams::apply(MANAGER), &Patch::Merge(&patch))
            .await
            .map_err(|e| kube_error(&name, e))
    }

    async fn set_finalizers(&self, record: &K, finalizers: Vec<String>) -> Result<K> {
        let name = record.meta().name.clone().unwrap_or_default();
        debug!("Setting finalizers on {}: {:?}", name, finalizers);

        let patch = serde_json::json!({
            "metadata": {
                "resourceVersion": record.meta().resource_version,
                "finalizers": finalizers,
            }
        });
        self.api
            .patch(&name, &PatchParams::apply(MANAGER), &Patch::Merge(&patch))
            .await
            .map_err(|e| kube_error(&name, e))
    }
}

/// Set a condition, last write wins per type.
///
/// The transition time moves only when the condition's status flips. Re-setting an
/// identical condition leaves it untouched so steady-state passes write nothing.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    condition_type: &str,
    status: bool,
    reason: &str,
    message: impl Into<String>,
) {
    let now = Utc::now();
    let status = if status { "True" } else { "False" }.to_string();
    let message = message.into();

    if conditions.iter().any(|c| {
        c.r#type == condition_type && c.status == status && c.reason == reason && c.message == message
    }) {
        return;
    }

    let last_transition_time = conditions
        .iter()
        .find(|c| c.r#type == condition_type)
        .filter(|c| c.status == status)
        .map_or(now, |c| c.last_transition_time);

    conditions.retain(|c| c.r#type != condition_type);
    conditions.push(Condition {
        r#type: condition_type.to_string(),
        status,
        reason: reason.to_string(),
        message,
        last_update_time: now,
        last_transition_time,
    });
}

/// Event recorder bundled with its target `ObjectReference`.
pub struct EventRecorder {
    recorder: Option<Recorder>,
    obj_ref: ObjectReference,
}

impl EventRecorder {
    /// Create an event recorder for the given resource.
    pub fn new<K: Resource<DynamicType = ()>>(client: kube::Client, obj: &K) -> Self {
        let reporter = Reporter {
            controller: MANAGER.into(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Some(Recorder::new(client, reporter)),
            obj_ref: obj.object_ref(&()),
        }
    }

    /// A recorder that drops every event.
    #[cfg(test)]
    pub fn disabled<K: Resource<DynamicType = ()>>(obj: &K) -> Self {
        Self {
            recorder: None,
            obj_ref: obj.object_ref(&()),
        }
    }

    /// Publish a Normal event.
    pub async fn publish(&self, reason: &str, message: &str) {
        self.send(EventType::Normal, reason, message).await;
    }

    /// Publish a Warning event.
    pub async fn publish_warning(&self, reason: &str, message: &str) {
        self.send(EventType::Warning, reason, message).await;
    }

    async fn send(&self, type_: EventType, reason: &str, message: &str) {
        let Some(recorder) = &self.recorder else {
            return;
        };
        recorder
            .publish(
                &Event {
                    type_,
                    reason: reason.into(),
                    note: Some(message.into()),
                    action: reason.into(),
                    secondary: None,
                },
                &self.obj_ref,
            )
            .await
            .unwrap_or_else(|e| warn!("Failed to publish event {}: {}", reason, e));
    }
}
