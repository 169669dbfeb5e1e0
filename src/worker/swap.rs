//! Emission worker
//!
//! Consumes verified `NotSwapped` records: builds the mirror transaction
//! on the emitting chain, obtains the threshold signature, records the
//! outbound hash and broadcasts. Emission is at-most-once per record —
//! the outbound hash is persisted before the broadcast, and a result
//! that already carries one is never emitted again.
//!
//! The scan also re-drives `Processing` records whose result has no
//! outbound hash yet. Those were orphaned by a transient store failure
//! between the status advance and the hash write; nothing has been
//! broadcast for them, so running them through the pipeline again is
//! safe and restores the retry-on-transient contract.

use super::{now, scan_horizon, WorkerContext};
use crate::bridge::{BuildTxArgs, TxExtra};
use crate::error::BridgeResult;
use crate::metrics;
use crate::store::{Direction, Swap, SwapStatus, SwapType};

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub async fn run(ctx: Arc<WorkerContext>, direction: Direction) {
    let interval = Duration::from_secs(ctx.config.swap_interval_secs);
    loop {
        match find_swaps_to_emit(&ctx, direction).await {
            Ok(swaps) => {
                for swap in &swaps {
                    if let Err(e) = process_swap(&ctx, direction, swap).await {
                        if e.is_transient() {
                            debug!("{} {} emission postponed: {e}", direction, swap.tx_id);
                        } else {
                            error!("process {} swap error for {}: {e}", direction, swap.tx_id);
                            metrics::record_worker_error("swap");
                        }
                    }
                }
            }
            Err(e) => {
                error!("find {}s to swap error: {e}", direction);
                metrics::record_worker_error("swap");
            }
        }
        tokio::time::sleep(interval).await;
    }
}

/// Verified records awaiting emission, plus `Processing` records to
/// re-check. The ones that already carry an outbound hash are skipped in
/// `process_swap`; the rest are orphans to re-drive.
async fn find_swaps_to_emit(ctx: &WorkerContext, direction: Direction) -> BridgeResult<Vec<Swap>> {
    let horizon = scan_horizon(&ctx.config);
    let mut swaps = ctx
        .store
        .find_swaps_with_status(direction, SwapStatus::NotSwapped, horizon)
        .await?;
    swaps.extend(
        ctx.store
            .find_swaps_with_status(direction, SwapStatus::Processing, horizon)
            .await?,
    );
    Ok(swaps)
}

/// Emit the mirror transaction for one verified record.
pub(crate) async fn process_swap(
    ctx: &WorkerContext,
    direction: Direction,
    swap: &Swap,
) -> BridgeResult<()> {
    let Some(result) = ctx.store.get_swap_result(&swap.tx_id, direction).await? else {
        warn!("{} {} has no result record, skip", direction, swap.tx_id);
        return Ok(());
    };

    if !result.swap_tx.is_empty() {
        // Already emitted (an earlier run raced or crashed after the
        // broadcast); just make sure the status reflects it.
        if swap.status == SwapStatus::NotSwapped {
            ctx.store
                .update_swap_status(
                    &swap.tx_id,
                    direction,
                    SwapStatus::NotSwapped,
                    SwapStatus::Processing,
                    now(),
                    None,
                )
                .await?;
        }
        return Ok(());
    }

    let bridge = ctx.bridges.emitter(direction);
    let mut args = BuildTxArgs {
        swap_id: swap.tx_id.clone(),
        swap_type: match direction {
            Direction::Swapin => SwapType::Swapin,
            Direction::Swapout => SwapType::Swapout,
        },
        direction,
        bind: result.bind.clone(),
        value: result.swap_value,
        memo: swap.memo.clone(),
        extra: TxExtra::default(),
    };

    let signed = async {
        let raw = bridge.build_raw_transaction(&mut args).await?;
        bridge.dcrm_sign_transaction(&raw, &mut args).await
    }
    .await;

    let (signed, swap_tx) = match signed {
        Ok(signed) => signed,
        Err(e) if e.is_transient() => return Err(e),
        Err(e) => {
            // Signing-fatal for this swap; operator intervention required.
            error!("{} {} signing failed: {e}", direction, swap.tx_id);
            mark_swap_failed(ctx, direction, swap).await?;
            metrics::record_swap_failed(direction, "sign");
            return Ok(());
        }
    };

    // A record recovered in `Processing` skips the advance; it was
    // already moved by the run that got orphaned.
    if swap.status == SwapStatus::NotSwapped
        && !ctx
            .store
            .update_swap_status(
                &swap.tx_id,
                direction,
                SwapStatus::NotSwapped,
                SwapStatus::Processing,
                now(),
                None,
            )
            .await?
    {
        // Another worker won the transition; it owns the broadcast.
        return Ok(());
    }

    if !ctx
        .store
        .update_result_swap_tx(&swap.tx_id, direction, &swap_tx, now())
        .await?
    {
        debug!("{} {} already has an outbound tx, skip broadcast", direction, swap.tx_id);
        return Ok(());
    }
    metrics::record_swap_signed(direction);

    for attempt in 1..=ctx.config.send_tx_retries {
        match bridge.send_transaction(&signed).await {
            Ok(sent) => {
                info!(
                    "{} {} mirror tx broadcast, swaptx {} reported {}",
                    direction, swap.tx_id, swap_tx, sent
                );
                metrics::record_tx_broadcast(direction);
                return Ok(());
            }
            Err(e) => {
                warn!(
                    "{} {} broadcast attempt {}/{} failed: {e}",
                    direction, swap.tx_id, attempt, ctx.config.send_tx_retries
                );
                tokio::time::sleep(Duration::from_millis(ctx.config.retry_delay_ms)).await;
            }
        }
    }

    error!("{} {} broadcast exhausted retries", direction, swap.tx_id);
    ctx.store
        .update_swap_status(
            &swap.tx_id,
            direction,
            SwapStatus::Processing,
            SwapStatus::SwapFailed,
            now(),
            Some("broadcast failed"),
        )
        .await?;
    metrics::record_swap_failed(direction, "broadcast");
    Ok(())
}

/// Fail a record wherever it stands before broadcast. The status graph
/// has no direct edge from `NotSwapped`, so fresh records step through
/// `Processing` first; if the second write fails transiently, the record
/// sits in `Processing` with no outbound hash and the next emission
/// round brings it back here.
async fn mark_swap_failed(
    ctx: &WorkerContext,
    direction: Direction,
    swap: &Swap,
) -> BridgeResult<()> {
    if swap.status == SwapStatus::NotSwapped
        && !ctx
            .store
            .update_swap_status(
                &swap.tx_id,
                direction,
                SwapStatus::NotSwapped,
                SwapStatus::Processing,
                now(),
                None,
            )
            .await?
    {
        // Another worker advanced the record; it resolves the outcome.
        return Ok(());
    }
    ctx.store
        .update_swap_status(
            &swap.tx_id,
            direction,
            SwapStatus::Processing,
            SwapStatus::SwapFailed,
            now(),
            Some("signing failed"),
        )
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::BridgePair;
    use crate::store::{MemoryStore, SwapResult, SwapStore};
    use crate::worker::testutil::{pending_swap, test_config, MockBridge, Scripted};
    use ethers::types::U256;

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

    fn initial_result(tx_id: &str, direction: Direction) -> SwapResult {
        SwapResult {
            tx_id: tx_id.to_string(),
            direction,
            from: "0x5c6a84b0f4f3a1e7e85f3fd1e0a91f3df34185b0".to_string(),
            bind: "0x5c6a84b0f4f3a1e7e85f3fd1e0a91f3df34185b0".to_string(),
            value: U256::from(1_000_000u64),
            memo: None,
            swap_tx: String::new(),
            swap_height: 0,
            swap_time: 0,
            swap_value: U256::from(999_000u64),
            swap_type: match direction {
                Direction::Swapin => SwapType::Swapin,
                Direction::Swapout => SwapType::Swapout,
            },
            created_at: now(),
            updated_at: now(),
        }
    }

    #[tokio::test]
    async fn test_happy_emission_records_then_broadcasts() {
        let h = harness();
        let swap = pending_swap("0x10", Direction::Swapin, SwapStatus::NotSwapped);
        h.ctx.store.add_swap(&swap).await.unwrap();
        h.ctx.store.add_swap_result(&initial_result("0x10", Direction::Swapin)).await.unwrap();
        h.dst.script("0x10", Scripted::Pass(0));

        process_swap(&h.ctx, Direction::Swapin, &swap).await.unwrap();

        let stored = h.ctx.store.get_swap("0x10", Direction::Swapin).await.unwrap().unwrap();
        assert_eq!(stored.status, SwapStatus::Processing);
        let result = h.ctx.store.get_swap_result("0x10", Direction::Swapin).await.unwrap().unwrap();
        assert_eq!(result.swap_tx, "0xmirror-10");
        assert_eq!(h.dst.sent_count(), 1);
    }

    #[tokio::test]
    async fn test_emission_is_at_most_once() {
        let h = harness();
        let swap = pending_swap("0x11", Direction::Swapin, SwapStatus::NotSwapped);
        h.ctx.store.add_swap(&swap).await.unwrap();
        let mut result = initial_result("0x11", Direction::Swapin);
        result.swap_tx = "0xalready".to_string();
        h.ctx.store.add_swap_result(&result).await.unwrap();
        h.dst.script("0x11", Scripted::Pass(0));

        process_swap(&h.ctx, Direction::Swapin, &swap).await.unwrap();

        // No second outbound transaction, but the status catches up.
        assert_eq!(h.dst.sent_count(), 0);
        let stored = h.ctx.store.get_swap("0x11", Direction::Swapin).await.unwrap().unwrap();
        assert_eq!(stored.status, SwapStatus::Processing);
        let result = h.ctx.store.get_swap_result("0x11", Direction::Swapin).await.unwrap().unwrap();
        assert_eq!(result.swap_tx, "0xalready");
    }

    #[tokio::test]
    async fn test_orphaned_processing_record_is_redriven() {
        // A transient store failure can leave a record in Processing
        // with no outbound hash and nothing broadcast. The scan picks it
        // up again and finishes the emission.
        let h = harness();
        let swap = pending_swap("0x14", Direction::Swapin, SwapStatus::NotSwapped);
        h.ctx.store.add_swap(&swap).await.unwrap();
        h.ctx.store
            .update_swap_status("0x14", Direction::Swapin, SwapStatus::NotSwapped, SwapStatus::Processing, now(), None)
            .await
            .unwrap();
        h.ctx.store.add_swap_result(&initial_result("0x14", Direction::Swapin)).await.unwrap();
        h.dst.script("0x14", Scripted::Pass(0));

        let orphaned = h.ctx.store.get_swap("0x14", Direction::Swapin).await.unwrap().unwrap();
        assert_eq!(orphaned.status, SwapStatus::Processing);
        let scanned = find_swaps_to_emit(&h.ctx, Direction::Swapin).await.unwrap();
        assert_eq!(scanned.len(), 1);

        process_swap(&h.ctx, Direction::Swapin, &orphaned).await.unwrap();

        let result = h.ctx.store.get_swap_result("0x14", Direction::Swapin).await.unwrap().unwrap();
        assert_eq!(result.swap_tx, "0xmirror-14");
        assert_eq!(h.dst.sent_count(), 1);
        let stored = h.ctx.store.get_swap("0x14", Direction::Swapin).await.unwrap().unwrap();
        assert_eq!(stored.status, SwapStatus::Processing);
    }

    #[tokio::test]
    async fn test_multiple_rsv_fails_swap_without_broadcast() {
        let h = harness();
        let swap = pending_swap("0x12", Direction::Swapout, SwapStatus::NotSwapped);
        h.ctx.store.add_swap(&swap).await.unwrap();
        h.ctx.store.add_swap_result(&initial_result("0x12", Direction::Swapout)).await.unwrap();
        h.src.script("0x12", Scripted::SignTooManyRsv);

        process_swap(&h.ctx, Direction::Swapout, &swap).await.unwrap();

        // Nothing was broadcast and no outbound hash was recorded.
        assert_eq!(h.src.sent_count(), 0);
        let result = h.ctx.store.get_swap_result("0x12", Direction::Swapout).await.unwrap().unwrap();
        assert!(result.swap_tx.is_empty());
        let stored = h.ctx.store.get_swap("0x12", Direction::Swapout).await.unwrap().unwrap();
        assert_eq!(stored.status, SwapStatus::SwapFailed);
    }

    #[tokio::test]
    async fn test_orphaned_record_with_fatal_signing_still_fails() {
        // The failure path can also orphan a record between its two
        // steps; the re-driven record finishes the remaining transition.
        let h = harness();
        let swap = pending_swap("0x15", Direction::Swapout, SwapStatus::NotSwapped);
        h.ctx.store.add_swap(&swap).await.unwrap();
        h.ctx.store
            .update_swap_status("0x15", Direction::Swapout, SwapStatus::NotSwapped, SwapStatus::Processing, now(), None)
            .await
            .unwrap();
        h.ctx.store.add_swap_result(&initial_result("0x15", Direction::Swapout)).await.unwrap();
        h.src.script("0x15", Scripted::SignTooManyRsv);

        let orphaned = h.ctx.store.get_swap("0x15", Direction::Swapout).await.unwrap().unwrap();
        process_swap(&h.ctx, Direction::Swapout, &orphaned).await.unwrap();

        assert_eq!(h.src.sent_count(), 0);
        let stored = h.ctx.store.get_swap("0x15", Direction::Swapout).await.unwrap().unwrap();
        assert_eq!(stored.status, SwapStatus::SwapFailed);
    }

    #[tokio::test]
    async fn test_signer_outage_leaves_record_for_retry() {
        let h = harness();
        let swap = pending_swap("0x13", Direction::Swapout, SwapStatus::NotSwapped);
        h.ctx.store.add_swap(&swap).await.unwrap();
        h.ctx.store.add_swap_result(&initial_result("0x13", Direction::Swapout)).await.unwrap();
        h.src.script("0x13", Scripted::GatewayDown);

        let err = process_swap(&h.ctx, Direction::Swapout, &swap).await.unwrap_err();
        assert!(err.is_transient());

        let stored = h.ctx.store.get_swap("0x13", Direction::Swapout).await.unwrap().unwrap();
        assert_eq!(stored.status, SwapStatus::NotSwapped);
        assert_eq!(h.src.sent_count(), 0);
    }
}
