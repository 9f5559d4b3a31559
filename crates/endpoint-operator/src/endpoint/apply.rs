//! Read-modify-write of live `Endpoints` objects

use std::collections::BTreeSet;

use k8s_openapi::api::core::v1::{
    EndpointAddress, EndpointPort, EndpointSubset, Endpoints, Service,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::{debug, info, instrument};

use crate::client::ClusterApi;

use super::{Endpoint, EndpointError};

/// What an apply step did to the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mutation {
    #[default]
    None,
    Created,
    Updated,
    Deleted,
}

/// Register `delta.ips` as the addresses of the service's `Endpoints`
///
/// Creates the object with ports copied from the `Service` when it does not
/// exist. Otherwise every subset's addresses are overwritten; ports are left
/// alone.
#[instrument(skip(client, delta), fields(
    namespace = %delta.service_namespace,
    service = %delta.service_name,
))]
pub async fn apply_create<C: ClusterApi + ?Sized>(
    client: &C,
    delta: &Endpoint,
) -> Result<Mutation, EndpointError> {
    if delta.is_empty() {
        return Ok(Mutation::None);
    }

    let namespace = delta.service_namespace.as_str();
    let name = delta.service_name.as_str();

    let existing = client
        .get_endpoints(namespace, name)
        .await
        .map_err(EndpointError::cluster("get", namespace, name))?;

    match existing {
        None => {
            let service = client.get_service(namespace, name).await.map_err(|source| {
                EndpointError::ServiceLookupFailed {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                    source,
                }
            })?;

            let endpoints = new_endpoints(delta, &service);
            client
                .create_endpoints(namespace, &endpoints)
                .await
                .map_err(EndpointError::cluster("create", namespace, name))?;

            info!(ips = ?delta.ips, "Created Endpoints");
            Ok(Mutation::Created)
        }
        Some(mut endpoints) => {
            if !set_addresses(&mut endpoints, &delta.ips) {
                debug!("Endpoints already hold the requested addresses");
                return Ok(Mutation::None);
            }

            client
                .update_endpoints(namespace, &endpoints)
                .await
                .map_err(EndpointError::cluster("update", namespace, name))?;

            info!(ips = ?delta.ips, "Updated Endpoints addresses");
            Ok(Mutation::Updated)
        }
    }
}

/// Remove `delta.ips` from the service's `Endpoints`
///
/// The object is deleted once the removal leaves no subset with an address.
/// An object that held none of `delta.ips` is left untouched, even when it
/// is already empty.
#[instrument(skip(client, delta), fields(
    namespace = %delta.service_namespace,
    service = %delta.service_name,
))]
pub async fn apply_delete<C: ClusterApi + ?Sized>(
    client: &C,
    delta: &Endpoint,
) -> Result<Mutation, EndpointError> {
    if delta.is_empty() {
        return Ok(Mutation::None);
    }

    let namespace = delta.service_namespace.as_str();
    let name = delta.service_name.as_str();

    let Some(mut endpoints) = client
        .get_endpoints(namespace, name)
        .await
        .map_err(EndpointError::cluster("get", namespace, name))?
    else {
        debug!("Endpoints already gone");
        return Ok(Mutation::None);
    };

    if !remove_addresses(&mut endpoints, &delta.ips) {
        debug!("No requested address is registered");
        return Ok(Mutation::None);
    }

    if !has_addresses(&endpoints) {
        return match client.delete_endpoints(namespace, name).await {
            Ok(()) => {
                info!(ips = ?delta.ips, "Deleted Endpoints, no addresses left");
                Ok(Mutation::Deleted)
            }
            Err(e) if e.is_not_found() => {
                debug!("Endpoints deleted concurrently");
                Ok(Mutation::None)
            }
            Err(e) => Err(EndpointError::cluster("delete", namespace, name)(e)),
        };
    }

    client
        .update_endpoints(namespace, &endpoints)
        .await
        .map_err(EndpointError::cluster("update", namespace, name))?;

    info!(ips = ?delta.ips, "Removed addresses from Endpoints");
    Ok(Mutation::Updated)
}

fn new_endpoints(delta: &Endpoint, service: &Service) -> Endpoints {
    let ports = service
        .spec
        .as_ref()
        .and_then(|spec| spec.ports.as_ref())
        .map(|ports| {
            ports
                .iter()
                .map(|port| EndpointPort {
                    name: port.name.clone(),
                    port: port.port,
                    protocol: port.protocol.clone(),
                    ..Default::default()
                })
                .collect()
        });

    Endpoints {
        metadata: ObjectMeta {
            name: Some(delta.service_name.clone()),
            namespace: Some(delta.service_namespace.clone()),
            ..Default::default()
        },
        subsets: Some(vec![EndpointSubset {
            addresses: Some(addresses(&delta.ips, &[])),
            ports,
            ..Default::default()
        }]),
    }
}

/// Build addresses for `ips`, keeping any existing entry for a retained IP
fn addresses(ips: &BTreeSet<String>, existing: &[EndpointAddress]) -> Vec<EndpointAddress> {
    ips.iter()
        .map(|ip| {
            existing
                .iter()
                .find(|address| &address.ip == ip)
                .cloned()
                .unwrap_or_else(|| EndpointAddress {
                    ip: ip.clone(),
                    ..Default::default()
                })
        })
        .collect()
}

/// Overwrite every subset's addresses with `ips`, returns whether anything changed
fn set_addresses(endpoints: &mut Endpoints, ips: &BTreeSet<String>) -> bool {
    let subsets = endpoints.subsets.get_or_insert_with(Vec::new);
    if subsets.is_empty() {
        subsets.push(EndpointSubset::default());
    }

    let mut changed = false;
    for subset in subsets.iter_mut() {
        let current = subset.addresses.take().unwrap_or_default();
        let current_ips: BTreeSet<&String> = current.iter().map(|a| &a.ip).collect();
        if current.len() != ips.len() || !ips.iter().all(|ip| current_ips.contains(ip)) {
            changed = true;
        }
        subset.addresses = Some(addresses(ips, &current));
    }
    changed
}

/// Drop `ips` from every subset, returns whether anything was removed
fn remove_addresses(endpoints: &mut Endpoints, ips: &BTreeSet<String>) -> bool {
    let mut changed = false;
    for subset in endpoints.subsets.iter_mut().flatten() {
        if let Some(addresses) = subset.addresses.as_mut() {
            let before = addresses.len();
            addresses.retain(|address| !ips.contains(&address.ip));
            changed |= addresses.len() != before;
        }
    }
    changed
}

fn has_addresses(endpoints: &Endpoints) -> bool {
    endpoints
        .subsets
        .iter()
        .flatten()
        .any(|subset| subset.addresses.as_ref().is_some_and(|a| !a.is_empty()))
}
