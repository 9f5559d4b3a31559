//! Pod controller
//!
//! Watches v1/Pod resources across all namespaces and runs one reconciliation
//! pass per event:
//!
//! - `Apply` / `InitApply` → [`ReconcileResource::reconcile_apply`]
//! - `Delete` → [`ReconcileResource::reconcile_delete`]
//!
//! The watcher is restarted every resync period. A restart re-lists every pod,
//! so each annotated pod gets an apply pass and missed events heal.
//!
//! [`ReconcileResource::reconcile_apply`]: crate::endpoint::ReconcileResource::reconcile_apply
//! [`ReconcileResource::reconcile_delete`]: crate::endpoint::ReconcileResource::reconcile_delete

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::ListParams;
use kube::runtime::watcher::Event;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client};
use tracing::{debug, error, info, instrument, warn};

use crate::client::{ClusterApi, ClusterError};
use crate::endpoint::resource::pod_key;
use crate::endpoint::Outcome;
use crate::operator::{BootError, WatchLoop};

use super::retry::retry_pass;
use super::ControllerContext;

/// Which pass an event calls for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    Apply,
    Delete,
}

/// Run the pass a single watch event calls for
pub(crate) async fn handle_event<C: ClusterApi>(ctx: &ControllerContext<C>, event: Event<Pod>) {
    match event {
        Event::Apply(pod) | Event::InitApply(pod) => reconcile(ctx, &pod, Pass::Apply).await,
        Event::Delete(pod) => reconcile(ctx, &pod, Pass::Delete).await,
        Event::Init => debug!("Pod watcher initializing"),
        Event::InitDone => info!("Pod watcher initial sync complete"),
    }
}

#[instrument(skip(ctx, pod), fields(
    namespace = %pod.metadata.namespace.as_deref().unwrap_or("default"),
    name = %pod.metadata.name.as_deref().unwrap_or("unknown"),
))]
async fn reconcile<C: ClusterApi>(ctx: &ControllerContext<C>, pod: &Pod, pass: Pass) {
    let key = match pod_key(pod) {
        Ok(key) => key,
        Err(e) => {
            error!(error = %e, "Rejecting pod event");
            return;
        }
    };

    let result = retry_pass(&ctx.retry, &key, || async move {
        match pass {
            Pass::Apply => ctx.resource.reconcile_apply(pod).await,
            Pass::Delete => ctx.resource.reconcile_delete(pod).await,
        }
    })
    .await;

    match result {
        Ok(Outcome::Skipped(reason)) => debug!(?reason, ?pass, "Pod skipped"),
        Ok(outcome) => debug!(?outcome, ?pass, "Pass complete"),
        // Logged by retry_pass; the next event or resync retries
        Err(_) => {}
    }
}

/// Pod watch wired into the reconciler
pub struct PodController<C: ClusterApi> {
    kube_client: Client,
    ctx: Arc<ControllerContext<C>>,
}

impl<C: ClusterApi + 'static> PodController<C> {
    pub fn new(kube_client: Client, ctx: Arc<ControllerContext<C>>) -> Self {
        Self { kube_client, ctx }
    }

    fn pods(&self) -> Api<Pod> {
        Api::all(self.kube_client.clone())
    }

    /// Consume one watcher lifetime
    async fn watch_once(&self) {
        let ctx = self.ctx.clone();
        watcher(self.pods(), watcher::Config::default())
            .default_backoff()
            .for_each_concurrent(ctx.concurrency, |event| {
                let ctx = ctx.clone();
                async move {
                    match event {
                        Ok(event) => handle_event(&ctx, event).await,
                        Err(e) => warn!(error = %e, "Pod watcher error, will retry"),
                    }
                }
            })
            .await;
    }
}

#[async_trait]
impl<C: ClusterApi + 'static> WatchLoop for PodController<C> {
    async fn start(&self) -> Result<(), BootError> {
        let ready = self
            .ctx
            .resource
            .client()
            .check_readiness()
            .await
            .map_err(BootError::Unreachable)?;
        if !ready {
            return Err(BootError::NotReady);
        }

        self.pods()
            .list(&ListParams::default().limit(1))
            .await
            .map_err(|e| BootError::ListPods(ClusterError::from(e)))?;

        info!(
            resource = self.ctx.resource.name(),
            concurrency = self.ctx.concurrency,
            resync_secs = self.ctx.resync_period.as_secs(),
            "Starting Pod controller"
        );
        Ok(())
    }

    async fn run(&self) -> Result<(), BootError> {
        loop {
            match tokio::time::timeout(self.ctx.resync_period, self.watch_once()).await {
                Ok(()) => return Err(BootError::WatchEnded),
                Err(_) => info!("Resync period elapsed, re-listing pods"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::client::MockClusterApi;
    use crate::controllers::retry::RetryPolicy;
    use crate::endpoint::{AnnotationKeys, ReconcileResource};
    use crate::test_utils::{
        annotated_pod, endpoints_with_subsets, service_with_ports, InMemoryCluster,
    };

    #[derive(Clone)]
    struct MockKubeService;

    impl tower::Service<http::Request<kube::client::Body>> for MockKubeService {
        type Response = http::Response<kube::client::Body>;
        type Error = std::convert::Infallible;
        type Future = std::future::Ready<Result<Self::Response, Self::Error>>;

        fn poll_ready(
            &mut self,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<(), Self::Error>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn call(&mut self, _req: http::Request<kube::client::Body>) -> Self::Future {
            panic!("MockKubeService should not be called in pod controller tests")
        }
    }

    fn mock_kube_client() -> Client {
        Client::new(MockKubeService, "default")
    }

    fn make_context<C: ClusterApi>(client: C) -> Arc<ControllerContext<C>> {
        let resource = ReconcileResource::new(Arc::new(client), AnnotationKeys::default());
        Arc::new(ControllerContext {
            retry: RetryPolicy::with_max_attempts(2),
            resync_period: Duration::from_secs(60),
            ..ControllerContext::new(resource)
        })
    }

    #[tokio::test]
    async fn test_apply_event_registers_address() {
        let cluster = InMemoryCluster::new()
            .with_service(service_with_ports("default", "master", &[("http", 80)]));
        let ctx = make_context(cluster);
        let pod = annotated_pod("worker-0", "default", "1.1.1.1", "master");

        handle_event(&ctx, Event::Apply(pod)).await;

        let cluster = ctx.resource.client();
        assert!(cluster.endpoints("default", "master").is_some());
        assert_eq!(cluster.creates(), 1);
    }

    #[tokio::test]
    async fn test_init_apply_event_reconciles() {
        let cluster = InMemoryCluster::new().with_endpoints(endpoints_with_subsets(
            "default",
            "master",
            &[&["1.2.3.4"]],
        ));
        let ctx = make_context(cluster);
        let pod = annotated_pod("worker-0", "default", "1.1.1.1", "master");

        handle_event(&ctx, Event::InitApply(pod)).await;

        let cluster = ctx.resource.client();
        assert_eq!(cluster.updates(), 1);
        let endpoints = cluster.endpoints("default", "master").unwrap();
        assert_eq!(
            crate::endpoint::state::endpoint_ips(&endpoints).len(),
            2,
            "re-listed pod adds its address next to the existing one"
        );
    }

    #[tokio::test]
    async fn test_delete_event_retracts_address() {
        let cluster = InMemoryCluster::new().with_endpoints(endpoints_with_subsets(
            "default",
            "master",
            &[&["1.1.1.1"]],
        ));
        let ctx = make_context(cluster);
        let pod = annotated_pod("worker-0", "default", "1.1.1.1", "master");

        handle_event(&ctx, Event::Delete(pod)).await;

        let cluster = ctx.resource.client();
        assert!(cluster.endpoints("default", "master").is_none());
        assert_eq!(cluster.deletes(), 1);
    }

    #[tokio::test]
    async fn test_init_events_make_no_calls() {
        let mut client = MockClusterApi::new();
        client.expect_get_endpoints().never();
        let ctx = make_context(client);

        handle_event(&ctx, Event::Init).await;
        handle_event(&ctx, Event::InitDone).await;
    }

    #[tokio::test]
    async fn test_unnamed_pod_is_rejected_without_calls() {
        let mut client = MockClusterApi::new();
        client.expect_get_endpoints().never();
        let ctx = make_context(client);

        let mut pod = annotated_pod("worker-0", "default", "1.1.1.1", "master");
        pod.metadata.name = None;

        handle_event(&ctx, Event::Apply(pod)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_is_retried() {
        let mut client = MockClusterApi::new();
        client.expect_get_endpoints().times(2).returning(|_, _| {
            Err(ClusterError::Api {
                code: 503,
                message: "unavailable".to_string(),
            })
        });
        let ctx = make_context(client);
        let pod = annotated_pod("worker-0", "default", "1.1.1.1", "master");

        handle_event(&ctx, Event::Apply(pod)).await;
    }

    #[tokio::test]
    async fn test_start_fails_when_api_unreachable() {
        let mut client = MockClusterApi::new();
        client.expect_check_readiness().returning(|| {
            Err(ClusterError::Api {
                code: 503,
                message: "unavailable".to_string(),
            })
        });
        let controller = PodController::new(mock_kube_client(), make_context(client));

        let err = controller.start().await.unwrap_err();
        assert!(matches!(err, BootError::Unreachable(_)));
    }

    #[tokio::test]
    async fn test_start_fails_when_api_not_ready() {
        let mut client = MockClusterApi::new();
        client.expect_check_readiness().returning(|| Ok(false));
        let controller = PodController::new(mock_kube_client(), make_context(client));

        let err = controller.start().await.unwrap_err();
        assert!(matches!(err, BootError::NotReady));
    }
}
