//! Reconciliation passes over a single pod

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use k8s_openapi::api::core::v1::Pod;
use tracing::{debug, info, instrument};

use crate::client::ClusterApi;

use super::annotations::AnnotationKeys;
use super::apply::{self, Mutation};
use super::change::{create_delta, delete_delta, retract_delta};
use super::state::{self, pod_namespace, Resolution, SkipReason};
use super::{Endpoint, EndpointError};

/// Result of one pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Skipped(SkipReason),
    Reconciled { created: Mutation, deleted: Mutation },
}

impl Outcome {
    /// Whether the pass wrote to the cluster
    pub fn mutated(&self) -> bool {
        match self {
            Outcome::Skipped(_) => false,
            Outcome::Reconciled { created, deleted } => {
                *created != Mutation::None || *deleted != Mutation::None
            }
        }
    }
}

/// `namespace/name` of a pod
pub fn pod_key(pod: &Pod) -> Result<String, EndpointError> {
    let name = pod
        .metadata
        .name
        .as_deref()
        .ok_or_else(|| EndpointError::WrongType("pod has no metadata.name".to_string()))?;
    Ok(format!("{}/{}", pod_namespace(pod), name))
}

/// Pod-driven management of service `Endpoints`
///
/// Apply passes only ever add addresses, so pods sharing a service
/// accumulate. The one exception is a pod whose annotations changed: the
/// addresses it declared before are retracted.
pub struct ReconcileResource<C: ClusterApi> {
    client: Arc<C>,
    keys: AnnotationKeys,
    /// Last endpoint each pod successfully registered, keyed by `namespace/name`
    declared: Mutex<HashMap<String, Endpoint>>,
}

impl<C: ClusterApi> ReconcileResource<C> {
    pub const NAME: &'static str = "endpoint";

    pub fn new(client: Arc<C>, keys: AnnotationKeys) -> Self {
        Self {
            client,
            keys,
            declared: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        Self::NAME
    }

    pub fn keys(&self) -> &AnnotationKeys {
        &self.keys
    }

    pub fn client(&self) -> &Arc<C> {
        &self.client
    }

    pub async fn current_state(&self, pod: &Pod) -> Result<Resolution, EndpointError> {
        state::current_state(self.client.as_ref(), pod, &self.keys).await
    }

    pub fn desired_state(&self, pod: &Pod) -> Result<Endpoint, EndpointError> {
        state::desired_state(pod, &self.keys)
    }

    /// `None` when the union adds nothing to `current` or is empty
    pub fn new_create_patch(&self, current: Option<&Endpoint>, desired: &Endpoint) -> Option<Endpoint> {
        let delta = create_delta(current, desired);
        if delta.is_empty() || current.is_some_and(|c| c.ips == delta.ips) {
            return None;
        }
        Some(delta)
    }

    /// `None` without a current state or when nothing needs removing
    pub fn new_delete_patch(&self, current: Option<&Endpoint>, desired: &Endpoint) -> Option<Endpoint> {
        let delta = delete_delta(current?, desired);
        (!delta.is_empty()).then_some(delta)
    }

    /// Addresses `previous` held that `desired` no longer declares
    ///
    /// Carries the coordinates of `previous`, so a pod that moved to another
    /// service retracts from the old one.
    pub fn new_stale_patch(&self, previous: &Endpoint, desired: &Endpoint) -> Option<Endpoint> {
        let same_service = previous.service_name == desired.service_name
            && previous.service_namespace == desired.service_namespace;
        let stale = if same_service {
            delete_delta(previous, desired)
        } else {
            previous.clone()
        };
        (!stale.is_empty()).then_some(stale)
    }

    fn declared(&self, key: &str) -> Option<Endpoint> {
        let declared = self.declared.lock().unwrap_or_else(PoisonError::into_inner);
        declared.get(key).cloned()
    }

    fn remember(&self, key: String, endpoint: Endpoint) {
        let mut declared = self.declared.lock().unwrap_or_else(PoisonError::into_inner);
        declared.insert(key, endpoint);
    }

    fn forget(&self, key: &str) {
        let mut declared = self.declared.lock().unwrap_or_else(PoisonError::into_inner);
        declared.remove(key);
    }

    pub async fn apply_create(&self, delta: &Endpoint) -> Result<Mutation, EndpointError> {
        apply::apply_create(self.client.as_ref(), delta).await
    }

    pub async fn apply_delete(&self, delta: &Endpoint) -> Result<Mutation, EndpointError> {
        apply::apply_delete(self.client.as_ref(), delta).await
    }

    /// Pass for a pod that was added, updated or re-listed
    #[instrument(skip(self, pod), fields(
        resource = Self::NAME,
        namespace = %pod_namespace(pod),
        name = %pod.metadata.name.as_deref().unwrap_or("unknown"),
    ))]
    pub async fn reconcile_apply(&self, pod: &Pod) -> Result<Outcome, EndpointError> {
        let key = pod_key(pod)?;
        let current = match self.current_state(pod).await? {
            Resolution::Resolved(current) => current,
            Resolution::Skip(reason) => return Ok(Outcome::Skipped(reason)),
        };
        let desired = self.desired_state(pod)?;

        let created = match self.new_create_patch(current.as_ref(), &desired) {
            Some(patch) => self.apply_create(&patch).await?,
            None => {
                debug!("No addresses to register");
                Mutation::None
            }
        };

        let stale = self
            .declared(&key)
            .and_then(|previous| self.new_stale_patch(&previous, &desired));
        let deleted = match stale {
            Some(patch) => self.apply_delete(&patch).await?,
            None => {
                debug!("No previously declared addresses to retract");
                Mutation::None
            }
        };
        self.remember(key, desired);

        let outcome = Outcome::Reconciled { created, deleted };
        if outcome.mutated() {
            info!(?created, ?deleted, "Reconciled Endpoints");
        }
        Ok(outcome)
    }

    /// Pass for a pod that was removed from the cluster
    #[instrument(skip(self, pod), fields(
        resource = Self::NAME,
        namespace = %pod_namespace(pod),
        name = %pod.metadata.name.as_deref().unwrap_or("unknown"),
    ))]
    pub async fn reconcile_delete(&self, pod: &Pod) -> Result<Outcome, EndpointError> {
        self.forget(&pod_key(pod)?);
        let current = match self.current_state(pod).await? {
            Resolution::Resolved(current) => current,
            Resolution::Skip(reason) => return Ok(Outcome::Skipped(reason)),
        };
        let desired = self.desired_state(pod)?;

        let deleted = match current {
            Some(current) => {
                let delta = retract_delta(&current, &desired);
                if delta.is_empty() {
                    debug!("Pod address is not registered");
                    Mutation::None
                } else {
                    self.apply_delete(&delta).await?
                }
            }
            None => {
                debug!("No Endpoints object to retract from");
                Mutation::None
            }
        };

        if deleted != Mutation::None {
            info!(?deleted, "Retracted pod address from Endpoints");
        }
        Ok(Outcome::Reconciled {
            created: Mutation::None,
            deleted,
        })
    }
}
