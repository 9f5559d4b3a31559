//! Current and desired [`Endpoint`] derivation

use std::collections::BTreeSet;

use k8s_openapi::api::core::v1::{Endpoints, Pod};
use tracing::debug;

use crate::client::ClusterApi;

use super::annotations::{read_annotations, should_skip, AnnotationKeys};
use super::{Endpoint, EndpointError};

/// Namespace assumed for pods that carry none
pub const DEFAULT_NAMESPACE: &str = "default";

/// Why a pass ended before touching the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The pod does not declare both an IP and a service
    MissingAnnotation,
    /// The pod carries the skip label
    Label,
}

/// Result of reading the current state for a pod
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// `None` when the service has no `Endpoints` object yet
    Resolved(Option<Endpoint>),
    Skip(SkipReason),
}

pub(crate) fn pod_namespace(pod: &Pod) -> &str {
    pod.metadata.namespace.as_deref().unwrap_or(DEFAULT_NAMESPACE)
}

/// Flatten the addresses of every subset into one set
pub(crate) fn endpoint_ips(endpoints: &Endpoints) -> BTreeSet<String> {
    endpoints
        .subsets
        .iter()
        .flatten()
        .flat_map(|subset| subset.addresses.iter().flatten())
        .map(|address| address.ip.clone())
        .collect()
}

/// Read the live membership of the service the pod points at
pub async fn current_state<C: ClusterApi + ?Sized>(
    client: &C,
    pod: &Pod,
    keys: &AnnotationKeys,
) -> Result<Resolution, EndpointError> {
    let service = match read_annotations(pod, keys) {
        Ok((_, service)) => service,
        Err(EndpointError::MissingAnnotation(key)) => {
            debug!(annotation = %key, "Pod does not declare an endpoint, skipping");
            return Ok(Resolution::Skip(SkipReason::MissingAnnotation));
        }
        Err(e) => return Err(e),
    };

    if should_skip(pod, keys) {
        debug!(label = %keys.skip_label, "Pod carries skip label, skipping");
        return Ok(Resolution::Skip(SkipReason::Label));
    }

    let namespace = pod_namespace(pod);
    let endpoints = client
        .get_endpoints(namespace, &service)
        .await
        .map_err(EndpointError::cluster("get", namespace, &service))?;

    let Some(endpoints) = endpoints else {
        debug!(namespace, service = %service, "No Endpoints object yet");
        return Ok(Resolution::Resolved(None));
    };

    Ok(Resolution::Resolved(Some(Endpoint {
        service_name: service,
        service_namespace: namespace.to_string(),
        ips: endpoint_ips(&endpoints),
    })))
}

/// The single-address membership the pod declares
pub fn desired_state(pod: &Pod, keys: &AnnotationKeys) -> Result<Endpoint, EndpointError> {
    let (ip, service) = read_annotations(pod, keys)?;
    Ok(Endpoint::new(&service, pod_namespace(pod), [ip]))
}
