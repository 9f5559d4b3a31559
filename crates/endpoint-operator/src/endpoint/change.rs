//! Set arithmetic between current and desired membership

use super::Endpoint;

/// Addresses that must be registered: `current ∪ desired`
///
/// Service coordinates come from `desired`.
pub fn create_delta(current: Option<&Endpoint>, desired: &Endpoint) -> Endpoint {
    let mut ips = desired.ips.clone();
    if let Some(current) = current {
        ips.extend(current.ips.iter().cloned());
    }
    desired.with_ips(ips)
}

/// Addresses registered but not declared: `current \ desired`
///
/// Service coordinates come from `current`.
pub fn delete_delta(current: &Endpoint, desired: &Endpoint) -> Endpoint {
    current.with_ips(current.ips.difference(&desired.ips).cloned().collect())
}

/// Addresses a departing pod still has registered: `current ∩ desired`
pub fn retract_delta(current: &Endpoint, desired: &Endpoint) -> Endpoint {
    current.with_ips(current.ips.intersection(&desired.ips).cloned().collect())
}
