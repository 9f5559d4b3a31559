//! Kubernetes controllers for watched resources

pub mod pod;
pub mod retry;

use std::time::Duration;

use crate::client::ClusterApi;
use crate::endpoint::ReconcileResource;

use self::retry::RetryPolicy;

/// Default interval between full re-lists
pub const DEFAULT_RESYNC_PERIOD: Duration = Duration::from_secs(300);

/// Default number of passes running at once
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Shared state for controllers
pub struct ControllerContext<C: ClusterApi> {
    /// Reconciler for pod-declared endpoints
    pub resource: ReconcileResource<C>,
    /// Per-pass retry policy
    pub retry: RetryPolicy,
    /// Interval between full re-lists
    pub resync_period: Duration,
    /// Maximum number of passes running at once
    pub concurrency: usize,
}

impl<C: ClusterApi> ControllerContext<C> {
    pub fn new(resource: ReconcileResource<C>) -> Self {
        Self {
            resource,
            retry: RetryPolicy::default(),
            resync_period: DEFAULT_RESYNC_PERIOD,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}
