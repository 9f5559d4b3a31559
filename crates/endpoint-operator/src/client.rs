//! Kubernetes API access for the reconciler
//!
//! The reconciler only reads and writes `Endpoints` objects and reads their
//! sibling `Service`. Everything it needs from the API server sits behind
//! [`ClusterApi`] so passes can run against mocks in tests.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Endpoints, Service};
use kube::api::{DeleteParams, PostParams};
use kube::{Api, Client, ResourceExt};
use thiserror::Error;
use tracing::{debug, instrument};

/// Cluster API operations consumed by the reconciler
///
/// This trait allows for mocking in tests while keeping the concrete
/// implementation for production use.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Fetch an `Endpoints` object, `Ok(None)` if it does not exist
    async fn get_endpoints(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Endpoints>, ClusterError>;

    /// Fetch a `Service` object
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service, ClusterError>;

    /// Create a new `Endpoints` object
    async fn create_endpoints(
        &self,
        namespace: &str,
        endpoints: &Endpoints,
    ) -> Result<(), ClusterError>;

    /// Replace an existing `Endpoints` object
    ///
    /// The object carries the resource version it was read at, so a
    /// concurrent writer surfaces as a conflict.
    async fn update_endpoints(
        &self,
        namespace: &str,
        endpoints: &Endpoints,
    ) -> Result<(), ClusterError>;

    /// Delete an `Endpoints` object
    async fn delete_endpoints(&self, namespace: &str, name: &str) -> Result<(), ClusterError>;

    /// Check API server reachability
    async fn check_readiness(&self) -> Result<bool, ClusterError>;
}

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("Kubernetes API returned {code}: {message}")]
    Api { code: u16, message: String },
    #[error("Kubernetes client error: {0}")]
    Kube(kube::Error),
    #[error("Object is missing required field: {0}")]
    MissingField(String),
}

impl ClusterError {
    /// Whether the API server answered 404
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::Api { code: 404, .. })
    }

    /// Whether the API server rejected a write due to a stale resource version
    pub fn is_conflict(&self) -> bool {
        matches!(self, ClusterError::Api { code: 409, .. })
    }

    /// Whether a fresh attempt against re-read state can succeed
    ///
    /// Conflicts, throttling, server errors and transport failures are
    /// transient. A 404 is too: the object changed under the pass and the
    /// next attempt re-reads it. Other client errors are permanent.
    pub fn is_transient(&self) -> bool {
        match self {
            ClusterError::Api { code, .. } => {
                self.is_conflict() || self.is_not_found() || *code == 429 || *code >= 500
            }
            ClusterError::Kube(_) => true,
            ClusterError::MissingField(_) => false,
        }
    }
}

impl From<kube::Error> for ClusterError {
    fn from(error: kube::Error) -> Self {
        match error {
            kube::Error::Api(response) => ClusterError::Api {
                code: response.code,
                message: response.message,
            },
            other => ClusterError::Kube(other),
        }
    }
}

/// [`ClusterApi`] backed by a live `kube::Client`
#[derive(Clone)]
pub struct KubeClusterApi {
    client: Client,
}

impl KubeClusterApi {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn endpoints(&self, namespace: &str) -> Api<Endpoints> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    #[instrument(skip(self))]
    async fn get_endpoints(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Endpoints>, ClusterError> {
        Ok(self.endpoints(namespace).get_opt(name).await?)
    }

    #[instrument(skip(self))]
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service, ClusterError> {
        let services: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        Ok(services.get(name).await?)
    }

    #[instrument(skip(self, endpoints), fields(name = %endpoints.name_any()))]
    async fn create_endpoints(
        &self,
        namespace: &str,
        endpoints: &Endpoints,
    ) -> Result<(), ClusterError> {
        let created = self
            .endpoints(namespace)
            .create(&PostParams::default(), endpoints)
            .await?;
        debug!(
            resource_version = ?created.metadata.resource_version,
            "Created Endpoints"
        );
        Ok(())
    }

    #[instrument(skip(self, endpoints), fields(name = %endpoints.name_any()))]
    async fn update_endpoints(
        &self,
        namespace: &str,
        endpoints: &Endpoints,
    ) -> Result<(), ClusterError> {
        let name = endpoints
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| ClusterError::MissingField("metadata.name".to_string()))?;

        let updated = self
            .endpoints(namespace)
            .replace(name, &PostParams::default(), endpoints)
            .await?;
        debug!(
            resource_version = ?updated.metadata.resource_version,
            "Updated Endpoints"
        );
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_endpoints(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        self.endpoints(namespace)
            .delete(name, &DeleteParams::default())
            .await?;
        debug!("Deleted Endpoints");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn check_readiness(&self) -> Result<bool, ClusterError> {
        let version = self.client.apiserver_version().await?;
        debug!(git_version = %version.git_version, "API server readiness check: OK");
        Ok(true)
    }
}

/// Implement trait for Arc-wrapped clients to support shared ownership
#[async_trait]
impl<T: ClusterApi + ?Sized> ClusterApi for Arc<T> {
    async fn get_endpoints(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Endpoints>, ClusterError> {
        (**self).get_endpoints(namespace, name).await
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service, ClusterError> {
        (**self).get_service(namespace, name).await
    }

    async fn create_endpoints(
        &self,
        namespace: &str,
        endpoints: &Endpoints,
    ) -> Result<(), ClusterError> {
        (**self).create_endpoints(namespace, endpoints).await
    }

    async fn update_endpoints(
        &self,
        namespace: &str,
        endpoints: &Endpoints,
    ) -> Result<(), ClusterError> {
        (**self).update_endpoints(namespace, endpoints).await
    }

    async fn delete_endpoints(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        (**self).delete_endpoints(namespace, name).await
    }

    async fn check_readiness(&self) -> Result<bool, ClusterError> {
        (**self).check_readiness().await
    }
}
