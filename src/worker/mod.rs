//! Background workers
//!
//! One long-running worker per direction per job kind: verify swaps into
//! the status machine, emit the signed mirror transaction, confirm it.
//! Each job starts exactly once behind a single-shot guard, so startup
//! may call the starters repeatedly. Within a worker, records are
//! processed sequentially and a failure on one record never aborts the
//! batch; between workers, coordination happens through the store's
//! conditional status updates.

pub mod stable;
pub mod swap;
pub mod verify;

use crate::bridge::BridgePair;
use crate::config::WorkerConfig;
use crate::store::{Direction, SwapStore};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

/// Interval of the latest-block cache pollers.
const HEIGHT_POLL_INTERVAL: Duration = Duration::from_secs(15);

/// Single-shot start guard
pub struct StartGuard(AtomicBool);

impl StartGuard {
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// True exactly once.
    pub fn try_start(&self) -> bool {
        !self.0.swap(true, Ordering::SeqCst)
    }
}

static SWAPIN_VERIFY_STARTER: StartGuard = StartGuard::new();
static SWAPOUT_VERIFY_STARTER: StartGuard = StartGuard::new();
static SWAPIN_SWAP_STARTER: StartGuard = StartGuard::new();
static SWAPOUT_SWAP_STARTER: StartGuard = StartGuard::new();
static SWAPIN_STABLE_STARTER: StartGuard = StartGuard::new();
static SWAPOUT_STABLE_STARTER: StartGuard = StartGuard::new();

/// Everything a worker needs, injected at startup.
pub struct WorkerContext {
    pub store: Arc<dyn SwapStore>,
    pub bridges: BridgePair,
    pub config: WorkerConfig,
}

pub fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Oldest creation time the scan loops still consider.
pub fn scan_horizon(config: &WorkerConfig) -> i64 {
    now() - config.max_verify_lifetime_secs as i64
}

/// Launch the verification workers, once per direction.
pub fn start_verify_job(ctx: &Arc<WorkerContext>) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();
    if SWAPIN_VERIFY_STARTER.try_start() {
        info!("start swapin verify job");
        handles.push(tokio::spawn(verify::run(ctx.clone(), Direction::Swapin)));
    }
    if SWAPOUT_VERIFY_STARTER.try_start() {
        info!("start swapout verify job");
        handles.push(tokio::spawn(verify::run(ctx.clone(), Direction::Swapout)));
    }
    handles
}

/// Launch the emission workers, once per direction.
pub fn start_swap_job(ctx: &Arc<WorkerContext>) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();
    if SWAPIN_SWAP_STARTER.try_start() {
        info!("start swapin swap job");
        handles.push(tokio::spawn(swap::run(ctx.clone(), Direction::Swapin)));
    }
    if SWAPOUT_SWAP_STARTER.try_start() {
        info!("start swapout swap job");
        handles.push(tokio::spawn(swap::run(ctx.clone(), Direction::Swapout)));
    }
    handles
}

/// Launch the confirmation workers, once per direction.
pub fn start_stable_job(ctx: &Arc<WorkerContext>) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();
    if SWAPIN_STABLE_STARTER.try_start() {
        info!("start swapin stable job");
        handles.push(tokio::spawn(stable::run(ctx.clone(), Direction::Swapin)));
    }
    if SWAPOUT_STABLE_STARTER.try_start() {
        info!("start swapout stable job");
        handles.push(tokio::spawn(stable::run(ctx.clone(), Direction::Swapout)));
    }
    handles
}

/// Keep each bridge's latest-block cache fresh. The cache has a single
/// writer per chain and many readers.
pub fn start_height_pollers(ctx: &Arc<WorkerContext>) -> Vec<JoinHandle<()>> {
    [ctx.bridges.src.clone(), ctx.bridges.dst.clone()]
        .into_iter()
        .map(|bridge| {
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(HEIGHT_POLL_INTERVAL).await;
                    if let Ok(latest) = bridge.get_latest_block_number().await {
                        crate::metrics::record_latest_block(bridge.is_src(), latest);
                    }
                }
            })
        })
        .collect()
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_guard_fires_once() {
        let guard = StartGuard::new();
        assert!(guard.try_start());
        assert!(!guard.try_start());
        assert!(!guard.try_start());
    }
}
