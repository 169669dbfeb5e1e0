//! Durable swap state
//!
//! Two collections back the whole pipeline: pending swap records and
//! emitted swap results, both keyed by `(tx_id, direction)`. Workers only
//! ever advance records through conditional status transitions, so racing
//! workers resolve at the store rather than with locks.

#[cfg(test)]
mod memory;
mod postgres;

#[cfg(test)]
pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use crate::error::{BridgeError, BridgeResult};

use async_trait::async_trait;
use ethers::types::U256;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Direction of a swap relative to the source chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Deposit on the source chain, mint on the destination chain.
    Swapin,
    /// Burn on the destination chain, release on the source chain.
    Swapout,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Swapin => "swapin",
            Direction::Swapout => "swapout",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Swap lifecycle status.
///
/// `NotStable` is the entry state. `VerifyFailed`, `Swapped` and
/// `SwapFailed` are terminal; `CanRecall` waits for out-of-band operator
/// action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapStatus {
    NotStable,
    NotSwapped,
    CanRecall,
    VerifyFailed,
    Processing,
    Swapped,
    SwapFailed,
}

impl SwapStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SwapStatus::NotStable => "not_stable",
            SwapStatus::NotSwapped => "not_swapped",
            SwapStatus::CanRecall => "can_recall",
            SwapStatus::VerifyFailed => "verify_failed",
            SwapStatus::Processing => "processing",
            SwapStatus::Swapped => "swapped",
            SwapStatus::SwapFailed => "swap_failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "not_stable" => SwapStatus::NotStable,
            "not_swapped" => SwapStatus::NotSwapped,
            "can_recall" => SwapStatus::CanRecall,
            "verify_failed" => SwapStatus::VerifyFailed,
            "processing" => SwapStatus::Processing,
            "swapped" => SwapStatus::Swapped,
            "swap_failed" => SwapStatus::SwapFailed,
            _ => return None,
        })
    }

    /// Legal forward edges of the status graph. No state regresses.
    pub fn can_transition_to(&self, next: SwapStatus) -> bool {
        use SwapStatus::*;
        matches!(
            (self, next),
            (NotStable, NotSwapped)
                | (NotStable, CanRecall)
                | (NotStable, VerifyFailed)
                | (NotSwapped, Processing)
                | (Processing, Swapped)
                | (Processing, SwapFailed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SwapStatus::VerifyFailed | SwapStatus::Swapped | SwapStatus::SwapFailed
        )
    }
}

impl fmt::Display for SwapStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of mirror transaction a result record tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwapType {
    Swapin,
    Swapout,
    Recall,
}

impl SwapType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SwapType::Swapin => "swapin",
            SwapType::Swapout => "swapout",
            SwapType::Recall => "recall",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "swapin" => SwapType::Swapin,
            "swapout" => SwapType::Swapout,
            "recall" => SwapType::Recall,
            _ => return None,
        })
    }
}

/// Pending swap record. Created by ingestion, advanced by workers,
/// never deleted by the core.
#[derive(Debug, Clone)]
pub struct Swap {
    pub tx_id: String,
    pub direction: Direction,
    pub from: String,
    pub bind: String,
    pub value: U256,
    pub memo: Option<String>,
    pub status: SwapStatus,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Emitted swap record. Created once when verification first passes;
/// the emission engine attaches `swap_tx`, the confirmation engine the
/// block coordinates.
#[derive(Debug, Clone)]
pub struct SwapResult {
    pub tx_id: String,
    pub direction: Direction,
    pub from: String,
    pub bind: String,
    pub value: U256,
    pub memo: Option<String>,
    pub swap_tx: String,
    pub swap_height: u64,
    pub swap_time: u64,
    pub swap_value: U256,
    pub swap_type: SwapType,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Aggregate counts for the status endpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SwapStats {
    pub not_stable: u64,
    pub not_swapped: u64,
    pub processing: u64,
    pub swapped: u64,
    pub failed: u64,
}

/// Abstract persistence for swap records.
///
/// Status updates are conditional writes keyed by the caller's expected
/// prior status: exactly one of two racing transitions wins, the loser
/// sees `Ok(false)`.
#[async_trait]
pub trait SwapStore: Send + Sync {
    async fn add_swap(&self, swap: &Swap) -> BridgeResult<()>;

    async fn get_swap(&self, tx_id: &str, direction: Direction) -> BridgeResult<Option<Swap>>;

    /// Records in `status` created at or after `after` (unix seconds).
    /// Older records have aged out of the worker scan set.
    async fn find_swaps_with_status(
        &self,
        direction: Direction,
        status: SwapStatus,
        after: i64,
    ) -> BridgeResult<Vec<Swap>>;

    /// Conditionally advance `(tx_id, direction)` from `expected` to
    /// `new`. Returns whether the transition was applied.
    async fn update_swap_status(
        &self,
        tx_id: &str,
        direction: Direction,
        expected: SwapStatus,
        new: SwapStatus,
        timestamp: i64,
        memo: Option<&str>,
    ) -> BridgeResult<bool>;

    /// Insert the initial result record. A second insert for the same
    /// identity is a no-op.
    async fn add_swap_result(&self, result: &SwapResult) -> BridgeResult<()>;

    async fn get_swap_result(
        &self,
        tx_id: &str,
        direction: Direction,
    ) -> BridgeResult<Option<SwapResult>>;

    /// Attach the outbound transaction id. Only applies while `swap_tx`
    /// is still empty, which is what makes emission at-most-once.
    async fn update_result_swap_tx(
        &self,
        tx_id: &str,
        direction: Direction,
        swap_tx: &str,
        timestamp: i64,
    ) -> BridgeResult<bool>;

    /// Attach confirmation coordinates of the outbound transaction.
    async fn update_result_confirmed(
        &self,
        tx_id: &str,
        direction: Direction,
        swap_height: u64,
        swap_time: u64,
        timestamp: i64,
    ) -> BridgeResult<bool>;

    /// Results whose outbound transaction is broadcast but not yet
    /// confirmed (`swap_tx` set, `swap_height` zero).
    async fn find_results_to_confirm(&self, direction: Direction) -> BridgeResult<Vec<SwapResult>>;

    async fn stats(&self) -> BridgeResult<SwapStats>;
}

pub(crate) fn parse_stored_value(s: &str) -> BridgeResult<U256> {
    U256::from_dec_str(s).map_err(|e| BridgeError::Internal(format!("bad stored value {s}: {e}")))
}

pub(crate) fn parse_stored_status(s: &str) -> BridgeResult<SwapStatus> {
    SwapStatus::parse(s).ok_or_else(|| BridgeError::Internal(format!("bad stored status {s}")))
}

pub(crate) fn parse_stored_swap_type(s: &str) -> BridgeResult<SwapType> {
    SwapType::parse(s).ok_or_else(|| BridgeError::Internal(format!("bad stored swap type {s}")))
}
