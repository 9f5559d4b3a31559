//! Reconciliation of pod-declared IPs into service `Endpoints`
//!
//! A pod opts in by carrying both the IP annotation and the service
//! annotation. Each pass derives two [`Endpoint`] values, the current one read
//! from the live `Endpoints` object and the desired one read from the pod, and
//! moves the live object towards the desired one with set operations on IPs.
//!
//! ```text
//! pod event ─▶ state (current, desired) ─▶ change (create, delete) ─▶ apply ─▶ API
//! ```

pub mod annotations;
pub mod apply;
pub mod change;
pub mod resource;
pub mod state;

use std::collections::BTreeSet;

use thiserror::Error;

use crate::client::ClusterError;

pub use annotations::AnnotationKeys;
pub use apply::Mutation;
pub use resource::{Outcome, ReconcileResource};
pub use state::{Resolution, SkipReason};

/// IP membership of one service's `Endpoints`
///
/// Built fresh for every derived state of a pass. Equality is set equality of
/// `ips` plus exact equality of the service coordinates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Endpoint {
    pub service_name: String,
    pub service_namespace: String,
    pub ips: BTreeSet<String>,
}

impl Endpoint {
    pub fn new<I, S>(service_name: &str, service_namespace: &str, ips: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            service_name: service_name.to_string(),
            service_namespace: service_namespace.to_string(),
            ips: ips.into_iter().map(Into::into).collect(),
        }
    }

    /// Same service coordinates, different IP set
    pub fn with_ips(&self, ips: BTreeSet<String>) -> Self {
        Self {
            service_name: self.service_name.clone(),
            service_namespace: self.service_namespace.clone(),
            ips,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ips.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("Missing required annotation: {0}")]
    MissingAnnotation(String),
    #[error("Unexpected object shape: {0}")]
    WrongType(String),
    #[error("Failed to look up Service {namespace}/{name}: {source}")]
    ServiceLookupFailed {
        namespace: String,
        name: String,
        #[source]
        source: ClusterError,
    },
    #[error("Kubernetes API {operation} failed for Endpoints {namespace}/{name}: {source}")]
    ClusterApi {
        operation: &'static str,
        namespace: String,
        name: String,
        #[source]
        source: ClusterError,
    },
}

impl EndpointError {
    /// Wrap a cluster error with the operation and object it came from
    pub(crate) fn cluster(
        operation: &'static str,
        namespace: &str,
        name: &str,
    ) -> impl FnOnce(ClusterError) -> Self {
        let namespace = namespace.to_string();
        let name = name.to_string();
        move |source| EndpointError::ClusterApi {
            operation,
            namespace,
            name,
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_dedups_ips() {
        let endpoint = Endpoint::new("web", "default", ["1.1.1.1", "1.1.1.1", "2.2.2.2"]);
        assert_eq!(endpoint.ips.len(), 2);
    }

    #[test]
    fn test_endpoint_equality_ignores_order() {
        let a = Endpoint::new("web", "default", ["1.1.1.1", "2.2.2.2"]);
        let b = Endpoint::new("web", "default", ["2.2.2.2", "1.1.1.1"]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_endpoint_equality_requires_same_service() {
        let a = Endpoint::new("web", "default", ["1.1.1.1"]);
        let b = Endpoint::new("api", "default", ["1.1.1.1"]);
        let c = Endpoint::new("web", "other", ["1.1.1.1"]);
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_with_ips_keeps_coordinates() {
        let endpoint = Endpoint::new("web", "default", ["1.1.1.1"]);
        let other = endpoint.with_ips(BTreeSet::from(["9.9.9.9".to_string()]));
        assert_eq!(other.service_name, "web");
        assert_eq!(other.service_namespace, "default");
        assert!(other.ips.contains("9.9.9.9"));
        assert!(!other.ips.contains("1.1.1.1"));
    }

    #[test]
    fn test_cluster_error_context() {
        let wrap = EndpointError::cluster("update", "prod", "web");
        let err = wrap(ClusterError::Api {
            code: 409,
            message: "conflict".to_string(),
        });
        assert_eq!(
            err.to_string(),
            "Kubernetes API update failed for Endpoints prod/web: Kubernetes API returned 409: conflict"
        );
    }

    #[test]
    fn test_default_endpoint_is_empty() {
        assert!(Endpoint::default().is_empty());
    }
}
