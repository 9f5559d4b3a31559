//! Test utilities shared by the reconciler and controller tests.
//!
//! Pod/Endpoints/Service builders plus an in-memory [`ClusterApi`] that keeps
//! objects in a map and counts mutations.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    EndpointAddress, EndpointPort, EndpointSubset, Endpoints, Pod, Service, ServicePort,
    ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::client::{ClusterApi, ClusterError};
use crate::config::{annotations, labels};

/// Pod declaring `ip` for `service` with the default annotation keys
pub fn annotated_pod(name: &str, namespace: &str, ip: &str, service: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            annotations: Some(BTreeMap::from([
                (annotations::IP.to_string(), ip.to_string()),
                (annotations::SERVICE.to_string(), service.to_string()),
            ])),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Add the default skip label to a pod
pub fn skip_labelled(mut pod: Pod) -> Pod {
    pod.metadata
        .labels
        .get_or_insert_with(BTreeMap::new)
        .insert(labels::POD_WATCHER.to_string(), "true".to_string());
    pod
}

/// Endpoints with one subset per entry of `subsets`, each carrying an `http` port
pub fn endpoints_with_subsets(namespace: &str, name: &str, subsets: &[&[&str]]) -> Endpoints {
    Endpoints {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            resource_version: Some("1".to_string()),
            ..Default::default()
        },
        subsets: Some(
            subsets
                .iter()
                .map(|ips| EndpointSubset {
                    addresses: Some(
                        ips.iter()
                            .map(|ip| EndpointAddress {
                                ip: ip.to_string(),
                                ..Default::default()
                            })
                            .collect(),
                    ),
                    ports: Some(vec![EndpointPort {
                        name: Some("http".to_string()),
                        port: 80,
                        protocol: Some("TCP".to_string()),
                        ..Default::default()
                    }]),
                    ..Default::default()
                })
                .collect(),
        ),
    }
}

/// Service exposing TCP `ports` as `(name, port)` pairs
pub fn service_with_ports(namespace: &str, name: &str, ports: &[(&str, i32)]) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            ports: Some(
                ports
                    .iter()
                    .map(|(port_name, port)| ServicePort {
                        name: Some(port_name.to_string()),
                        port: *port,
                        protocol: Some("TCP".to_string()),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
        ..Default::default()
    }
}

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

fn not_found(kind: &str, name: &str) -> ClusterError {
    ClusterError::Api {
        code: 404,
        message: format!("{kind} \"{name}\" not found"),
    }
}

/// [`ClusterApi`] over in-memory maps
#[derive(Default)]
pub struct InMemoryCluster {
    endpoints: Mutex<BTreeMap<Key, Endpoints>>,
    services: Mutex<BTreeMap<Key, Service>>,
    creates: AtomicUsize,
    updates: AtomicUsize,
    deletes: AtomicUsize,
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service(self, service: Service) -> Self {
        let namespace = service.metadata.namespace.clone().unwrap_or_default();
        let name = service.metadata.name.clone().unwrap_or_default();
        self.services
            .lock()
            .unwrap()
            .insert((namespace, name), service);
        self
    }

    pub fn with_endpoints(self, endpoints: Endpoints) -> Self {
        let namespace = endpoints.metadata.namespace.clone().unwrap_or_default();
        let name = endpoints.metadata.name.clone().unwrap_or_default();
        self.endpoints
            .lock()
            .unwrap()
            .insert((namespace, name), endpoints);
        self
    }

    pub fn endpoints(&self, namespace: &str, name: &str) -> Option<Endpoints> {
        self.endpoints.lock().unwrap().get(&key(namespace, name)).cloned()
    }

    /// Total create, update and delete calls seen so far
    pub fn mutations(&self) -> usize {
        self.creates() + self.updates() + self.deletes()
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn updates(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    pub fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClusterApi for InMemoryCluster {
    async fn get_endpoints(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Endpoints>, ClusterError> {
        Ok(self.endpoints(namespace, name))
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service, ClusterError> {
        self.services
            .lock()
            .unwrap()
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| not_found("services", name))
    }

    async fn create_endpoints(
        &self,
        namespace: &str,
        endpoints: &Endpoints,
    ) -> Result<(), ClusterError> {
        let name = endpoints.metadata.name.clone().unwrap_or_default();
        let mut store = self.endpoints.lock().unwrap();
        if store.contains_key(&key(namespace, &name)) {
            return Err(ClusterError::Api {
                code: 409,
                message: format!("endpoints \"{name}\" already exists"),
            });
        }
        store.insert(key(namespace, &name), endpoints.clone());
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn update_endpoints(
        &self,
        namespace: &str,
        endpoints: &Endpoints,
    ) -> Result<(), ClusterError> {
        let name = endpoints.metadata.name.clone().unwrap_or_default();
        let mut store = self.endpoints.lock().unwrap();
        let slot = store
            .get_mut(&key(namespace, &name))
            .ok_or_else(|| not_found("endpoints", &name))?;
        *slot = endpoints.clone();
        self.updates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete_endpoints(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        self.endpoints
            .lock()
            .unwrap()
            .remove(&key(namespace, name))
            .ok_or_else(|| not_found("endpoints", name))?;
        self.deletes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn check_readiness(&self) -> Result<bool, ClusterError> {
        Ok(true)
    }
}
