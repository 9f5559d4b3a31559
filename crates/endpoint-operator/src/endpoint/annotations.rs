//! Pod annotation and label lookups

use k8s_openapi::api::core::v1::Pod;

use crate::config::{annotations, labels};

use super::EndpointError;

/// Keys the reconciler reads from pod metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotationKeys {
    pub ip: String,
    pub service: String,
    pub skip_label: String,
}

impl Default for AnnotationKeys {
    fn default() -> Self {
        Self {
            ip: annotations::IP.to_string(),
            service: annotations::SERVICE.to_string(),
            skip_label: labels::POD_WATCHER.to_string(),
        }
    }
}

/// Extract the declared `(ip, service)` pair from a pod
///
/// Both annotations must be present and non-empty.
pub fn read_annotations(pod: &Pod, keys: &AnnotationKeys) -> Result<(String, String), EndpointError> {
    let ip = annotation(pod, &keys.ip)?;
    let service = annotation(pod, &keys.service)?;
    Ok((ip, service))
}

fn annotation(pod: &Pod, key: &str) -> Result<String, EndpointError> {
    pod.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .filter(|v| !v.is_empty())
        .cloned()
        .ok_or_else(|| EndpointError::MissingAnnotation(key.to_string()))
}

/// Whether the pod opted out through the skip label, whatever its value
pub fn should_skip(pod: &Pod, keys: &AnnotationKeys) -> bool {
    pod.metadata
        .labels
        .as_ref()
        .is_some_and(|l| l.contains_key(&keys.skip_label))
}
