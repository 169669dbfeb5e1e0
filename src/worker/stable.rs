//! Confirmation worker
//!
//! Watches broadcast mirror transactions until they are stable on the
//! emitting chain, then attaches the block coordinates to the result and
//! closes the swap. A reverted mirror transaction fails the swap.

use super::{now, WorkerContext};
use crate::error::BridgeResult;
use crate::metrics;
use crate::store::{Direction, SwapResult, SwapStatus};

use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

pub async fn run(ctx: Arc<WorkerContext>, direction: Direction) {
    let interval = Duration::from_secs(ctx.config.stable_interval_secs);
    loop {
        match ctx.store.find_results_to_confirm(direction).await {
            Ok(results) => {
                for result in &results {
                    if let Err(e) = process_confirm(&ctx, direction, result).await {
                        error!("process {} stable error for {}: {e}", direction, result.tx_id);
                        metrics::record_worker_error("stable");
                    }
                }
            }
            Err(e) => {
                error!("find {}s to confirm error: {e}", direction);
                metrics::record_worker_error("stable");
            }
        }
        tokio::time::sleep(interval).await;
    }
}

/// Check one broadcast mirror transaction for stability.
pub(crate) async fn process_confirm(
    ctx: &WorkerContext,
    direction: Direction,
    result: &SwapResult,
) -> BridgeResult<()> {
    let bridge = ctx.bridges.emitter(direction);
    let status = bridge.get_transaction_status(&result.swap_tx).await;

    let Some(receipt) = &status.receipt else {
        // Not mined yet; checked again next round.
        return Ok(());
    };

    if receipt.status != Some(1u64.into()) {
        warn!("{} {} mirror tx {} reverted", direction, result.tx_id, result.swap_tx);
        ctx.store
            .update_swap_status(
                &result.tx_id,
                direction,
                SwapStatus::Processing,
                SwapStatus::SwapFailed,
                now(),
                Some("mirror tx reverted"),
            )
            .await?;
        metrics::record_swap_failed(direction, "reverted");
        return Ok(());
    }

    if status.block_height == 0 || status.confirmations < bridge.token().confirmations {
        return Ok(());
    }

    ctx.store
        .update_result_confirmed(
            &result.tx_id,
            direction,
            status.block_height,
            status.block_time,
            now(),
        )
        .await?;
    ctx.store
        .update_swap_status(
            &result.tx_id,
            direction,
            SwapStatus::Processing,
            SwapStatus::Swapped,
            now(),
            None,
        )
        .await?;
    info!(
        "{} {} swapped, mirror tx {} at height {}",
        direction, result.tx_id, result.swap_tx, status.block_height
    );
    metrics::record_swap_confirmed(direction);
    Ok(())
}
