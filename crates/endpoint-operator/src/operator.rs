//! Process-level boot loop
//!
//! ```text
//! Idle ─▶ Starting ─▶ Watching
//!            ▲            │
//!            └── Failed ◀─┘ (backoff)
//!                  │
//!                  ▼
//!              Terminated (exit 1)
//! ```
//!
//! Startup failures and an ended watch stream both go through the same
//! jittered exponential backoff. Once the retry budget's maximum elapsed time
//! is spent the process exits and the supervisor takes over.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::client::ClusterError;

/// Boot lifecycle, shared with the health server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BootState {
    Idle = 0,
    Starting = 1,
    Watching = 2,
    Failed = 3,
    Terminated = 4,
}

impl BootState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => BootState::Starting,
            2 => BootState::Watching,
            3 => BootState::Failed,
            4 => BootState::Terminated,
            _ => BootState::Idle,
        }
    }
}

/// Atomically readable [`BootState`]
#[derive(Debug)]
pub struct BootStateCell(AtomicU8);

impl Default for BootStateCell {
    fn default() -> Self {
        Self(AtomicU8::new(BootState::Idle as u8))
    }
}

impl BootStateCell {
    pub fn get(&self) -> BootState {
        BootState::from_u8(self.0.load(Ordering::SeqCst))
    }

    pub fn set(&self, state: BootState) {
        let previous = BootState::from_u8(self.0.swap(state as u8, Ordering::SeqCst));
        if previous != state {
            debug!(from = ?previous, to = ?state, "Boot state transition");
        }
    }
}

#[derive(Debug, Error)]
pub enum BootError {
    #[error("Kubernetes API server unreachable: {0}")]
    Unreachable(#[source] ClusterError),
    #[error("Kubernetes API server reported not ready")]
    NotReady,
    #[error("Failed to list pods: {0}")]
    ListPods(#[source] ClusterError),
    #[error("Pod watch stream ended")]
    WatchEnded,
    #[error("Boot retries exhausted after {elapsed:?}: {source}")]
    Exhausted {
        elapsed: Duration,
        #[source]
        source: Box<BootError>,
    },
}

/// What the boot loop starts and keeps running
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WatchLoop: Send + Sync {
    /// Verify the cluster can be watched
    async fn start(&self) -> Result<(), BootError>;

    /// Watch until the stream fails or ends
    async fn run(&self) -> Result<(), BootError>;
}

/// Backoff settings for the boot loop
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BootConfig {
    pub initial_interval: Duration,
    pub multiplier: f64,
    pub max_interval: Duration,
    pub max_elapsed: Duration,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            multiplier: 1.5,
            max_interval: Duration::from_secs(60),
            max_elapsed: Duration::from_secs(300),
        }
    }
}

impl BootConfig {
    pub fn with_max_elapsed(max_elapsed: Duration) -> Self {
        Self {
            max_elapsed,
            ..Self::default()
        }
    }
}

/// Exponential backoff with jitter, bounded by total elapsed time
#[derive(Debug)]
struct ExponentialBackoff {
    config: BootConfig,
    current: Duration,
    started: Instant,
}

impl ExponentialBackoff {
    fn new(config: BootConfig) -> Self {
        Self {
            config,
            current: config.initial_interval,
            started: Instant::now(),
        }
    }

    fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Next delay, `None` once the elapsed budget is spent
    fn next_backoff(&mut self) -> Option<Duration> {
        if self.elapsed() >= self.config.max_elapsed {
            return None;
        }

        // Jitter: 0.5x to 1.5x of the current interval
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let delay = Duration::from_secs_f64(self.current.as_secs_f64() * jitter);

        self.current = Duration::from_secs_f64(
            (self.current.as_secs_f64() * self.config.multiplier)
                .min(self.config.max_interval.as_secs_f64()),
        );
        Some(delay)
    }

    fn reset(&mut self) {
        self.current = self.config.initial_interval;
        self.started = Instant::now();
    }
}

pub struct Operator<W: WatchLoop> {
    watch: W,
    config: BootConfig,
    state: Arc<BootStateCell>,
    booted: AtomicBool,
}

impl<W: WatchLoop> Operator<W> {
    pub fn new(watch: W, config: BootConfig) -> Self {
        Self {
            watch,
            config,
            state: Arc::new(BootStateCell::default()),
            booted: AtomicBool::new(false),
        }
    }

    /// Shared handle on the boot state
    pub fn state(&self) -> Arc<BootStateCell> {
        self.state.clone()
    }

    /// True for the first caller only
    pub fn claim_boot(&self) -> bool {
        self.booted
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Boot and watch for the life of the process
    ///
    /// Runs at most once; later calls return immediately. Exits the process
    /// with status 1 when the boot retry budget is exhausted.
    pub async fn boot(&self) {
        if !self.claim_boot() {
            debug!("Operator already booted");
            return;
        }

        let e = self.start_with_backoff().await;
        error!(error = %e, "Operator boot failed permanently, exiting");
        std::process::exit(1);
    }

    /// Run the boot loop until the retry budget is exhausted
    pub async fn start_with_backoff(&self) -> BootError {
        let mut backoff = ExponentialBackoff::new(self.config);

        loop {
            self.state.set(BootState::Starting);
            info!("Starting pod watch");

            let e = match self.watch.start().await {
                Ok(()) => {
                    self.state.set(BootState::Watching);
                    info!("Operator watching pods");
                    backoff.reset();
                    match self.watch.run().await {
                        Ok(()) => BootError::WatchEnded,
                        Err(e) => e,
                    }
                }
                Err(e) => e,
            };

            self.state.set(BootState::Failed);

            match backoff.next_backoff() {
                Some(delay) => {
                    warn!(
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Operator boot failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    self.state.set(BootState::Terminated);
                    return BootError::Exhausted {
                        elapsed: backoff.elapsed(),
                        source: Box::new(e),
                    };
                }
            }
        }
    }
}
