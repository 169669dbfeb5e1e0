//! Verification worker
//!
//! Polls fresh `NotStable` records, verifies each against the observing
//! chain and advances the status machine:
//!
//! | outcome          | new status     | side effect            |
//! |------------------|----------------|------------------------|
//! | ok               | `NotSwapped`   | insert initial result  |
//! | transient error  | unchanged      | retried next round     |
//! | wrong memo       | `CanRecall`    |                        |
//! | other error      | `VerifyFailed` |                        |

use super::{now, scan_horizon, WorkerContext};
use crate::bridge::{SwapValuePolicy, TxSwapInfo};
use crate::error::BridgeResult;
use crate::metrics;
use crate::store::{Direction, Swap, SwapResult, SwapStatus, SwapType};

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

pub async fn run(ctx: Arc<WorkerContext>, direction: Direction) {
    let interval = Duration::from_secs(ctx.config.verify_interval_secs);
    loop {
        match ctx
            .store
            .find_swaps_with_status(direction, SwapStatus::NotStable, scan_horizon(&ctx.config))
            .await
        {
            Ok(swaps) => {
                for swap in &swaps {
                    if let Err(e) = process_swap_verify(&ctx, direction, swap).await {
                        if e.is_transient() {
                            debug!("{} {} not yet verifiable: {e}", direction, swap.tx_id);
                        } else {
                            error!("process {} verify error for {}: {e}", direction, swap.tx_id);
                            metrics::record_worker_error("verify");
                        }
                    }
                }
            }
            Err(e) => {
                error!("find {}s to verify error: {e}", direction);
                metrics::record_worker_error("verify");
            }
        }
        tokio::time::sleep(interval).await;
    }
}

/// Verify one record and apply the outcome table. For terminal
/// verification failures the return value is the outcome of the status
/// update, not the verification error itself.
pub(crate) async fn process_swap_verify(
    ctx: &WorkerContext,
    direction: Direction,
    swap: &Swap,
) -> BridgeResult<()> {
    let (bridge, counterpart) = ctx.bridges.observer(direction);
    let outcome = bridge
        .verify_transaction(&swap.tx_id, false, counterpart.as_ref())
        .await;

    match outcome {
        Err(e) if e.is_transient() => Err(e),
        Err(ref e) if e.is_recallable() => {
            ctx.store
                .update_swap_status(
                    &swap.tx_id,
                    direction,
                    SwapStatus::NotStable,
                    SwapStatus::CanRecall,
                    now(),
                    None,
                )
                .await?;
            metrics::record_verify_outcome(direction, "recallable");
            Ok(())
        }
        Ok(info) => {
            let advanced = ctx
                .store
                .update_swap_status(
                    &swap.tx_id,
                    direction,
                    SwapStatus::NotStable,
                    SwapStatus::NotSwapped,
                    now(),
                    None,
                )
                .await?;
            // A record that already left NotStable is done here; inserting
            // a second result would break at-most-once emission.
            if advanced {
                add_initial_result(ctx, direction, &info, bridge.swap_policy()).await?;
                metrics::record_verify_outcome(direction, "passed");
            }
            Ok(())
        }
        Err(e) => {
            warn!("{} {} verify failed: {e}", direction, swap.tx_id);
            ctx.store
                .update_swap_status(
                    &swap.tx_id,
                    direction,
                    SwapStatus::NotStable,
                    SwapStatus::VerifyFailed,
                    now(),
                    Some(&e.to_string()),
                )
                .await?;
            metrics::record_verify_outcome(direction, "failed");
            Ok(())
        }
    }
}

async fn add_initial_result(
    ctx: &WorkerContext,
    direction: Direction,
    info: &TxSwapInfo,
    policy: &SwapValuePolicy,
) -> BridgeResult<()> {
    let timestamp = now();
    let result = SwapResult {
        tx_id: info.hash.clone(),
        direction,
        from: info.from.clone(),
        bind: info.bind.clone(),
        value: info.value,
        memo: None,
        swap_tx: String::new(),
        swap_height: 0,
        swap_time: 0,
        swap_value: policy.calc_swap_value(info.value),
        swap_type: match direction {
            Direction::Swapin => SwapType::Swapin,
            Direction::Swapout => SwapType::Swapout,
        },
        created_at: timestamp,
        updated_at: timestamp,
    };
    ctx.store.add_swap_result(&result).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::BridgePair;
    use crate::error::BridgeError;
    use crate::store::{MemoryStore, SwapStore};
    use crate::worker::testutil::{pending_swap, test_config, MockBridge, Scripted};

    struct Harness {
        ctx: WorkerContext,
        src: Arc<MockBridge>,
        dst: Arc<MockBridge>,
    }

    fn harness() -> Harness {
        let src = Arc::new(MockBridge::new(true));
        let dst = Arc::new(MockBridge::new(false));
        let ctx = WorkerContext {
            store: Arc::new(MemoryStore::new()),
            bridges: BridgePair {
                src: src.clone(),
                dst: dst.clone(),
            },
            config: test_config(),
        };
        Harness { ctx, src, dst }
    }

    #[tokio::test]
    async fn test_verified_swap_advances_and_records_result() {
        let h = harness();
        let swap = pending_swap("0x01", Direction::Swapin, SwapStatus::NotStable);
        h.ctx.store.add_swap(&swap).await.unwrap();
        h.src.script("0x01", Scripted::Pass(1_000_000));

        process_swap_verify(&h.ctx, Direction::Swapin, &swap).await.unwrap();

        let stored = h.ctx.store.get_swap("0x01", Direction::Swapin).await.unwrap().unwrap();
        assert_eq!(stored.status, SwapStatus::NotSwapped);

        let result = h
            .ctx
            .store
            .get_swap_result("0x01", Direction::Swapin)
            .await
            .unwrap()
            .unwrap();
        assert!(result.swap_tx.is_empty());
        assert_eq!(result.swap_type, SwapType::Swapin);
        // 1_000_000 minus the one-permille fee.
        assert_eq!(result.swap_value, ethers::types::U256::from(999_000u64));
    }

    #[tokio::test]
    async fn test_unstable_swap_left_untouched() {
        let h = harness();
        let swap = pending_swap("0x02", Direction::Swapin, SwapStatus::NotStable);
        h.ctx.store.add_swap(&swap).await.unwrap();
        h.src.script("0x02", Scripted::NotStable);

        let err = process_swap_verify(&h.ctx, Direction::Swapin, &swap).await.unwrap_err();
        assert!(matches!(err, BridgeError::TxNotStable));

        let stored = h.ctx.store.get_swap("0x02", Direction::Swapin).await.unwrap().unwrap();
        assert_eq!(stored.status, SwapStatus::NotStable);
        assert!(h.ctx.store.get_swap_result("0x02", Direction::Swapin).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_wrong_memo_parks_for_recall() {
        let h = harness();
        let swap = pending_swap("0x03", Direction::Swapout, SwapStatus::NotStable);
        h.ctx.store.add_swap(&swap).await.unwrap();
        h.dst.script("0x03", Scripted::WrongMemo);

        process_swap_verify(&h.ctx, Direction::Swapout, &swap).await.unwrap();

        let stored = h.ctx.store.get_swap("0x03", Direction::Swapout).await.unwrap().unwrap();
        assert_eq!(stored.status, SwapStatus::CanRecall);
        assert!(h.ctx.store.get_swap_result("0x03", Direction::Swapout).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_terminal_failure_reports_update_outcome() {
        let h = harness();
        let swap = pending_swap("0x04", Direction::Swapout, SwapStatus::NotStable);
        h.ctx.store.add_swap(&swap).await.unwrap();
        h.dst.script("0x04", Scripted::WrongReceiver);

        // The verification error is swallowed; the store update succeeded.
        assert!(process_swap_verify(&h.ctx, Direction::Swapout, &swap).await.is_ok());

        let stored = h.ctx.store.get_swap("0x04", Direction::Swapout).await.unwrap().unwrap();
        assert_eq!(stored.status, SwapStatus::VerifyFailed);
        assert!(h.ctx.store.get_swap_result("0x04", Direction::Swapout).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reverify_after_advance_is_noop() {
        let h = harness();
        let swap = pending_swap("0x05", Direction::Swapin, SwapStatus::NotStable);
        h.ctx.store.add_swap(&swap).await.unwrap();
        h.src.script("0x05", Scripted::Pass(1_000_000));

        process_swap_verify(&h.ctx, Direction::Swapin, &swap).await.unwrap();
        let first = h.ctx.store.get_swap_result("0x05", Direction::Swapin).await.unwrap().unwrap();

        // Second run finds the record already advanced and changes nothing.
        process_swap_verify(&h.ctx, Direction::Swapin, &swap).await.unwrap();
        let stored = h.ctx.store.get_swap("0x05", Direction::Swapin).await.unwrap().unwrap();
        assert_eq!(stored.status, SwapStatus::NotSwapped);
        let second = h.ctx.store.get_swap_result("0x05", Direction::Swapin).await.unwrap().unwrap();
        assert_eq!(first.created_at, second.created_at);
    }
}
