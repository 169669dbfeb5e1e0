//! In-memory swap store
//!
//! Backs worker and API tests; mirrors the conditional-update semantics
//! of the PostgreSQL store exactly.

use super::{Direction, Swap, SwapResult, SwapStats, SwapStatus, SwapStore};
use crate::error::{BridgeError, BridgeResult};

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

type Key = (String, Direction);

/// Swap store held entirely in memory
#[derive(Default)]
pub struct MemoryStore {
    swaps: RwLock<HashMap<Key, Swap>>,
    results: RwLock<HashMap<Key, SwapResult>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SwapStore for MemoryStore {
    async fn add_swap(&self, swap: &Swap) -> BridgeResult<()> {
        self.swaps
            .write()
            .await
            .entry((swap.tx_id.clone(), swap.direction))
            .or_insert_with(|| swap.clone());
        Ok(())
    }

    async fn get_swap(&self, tx_id: &str, direction: Direction) -> BridgeResult<Option<Swap>> {
        Ok(self
            .swaps
            .read()
            .await
            .get(&(tx_id.to_string(), direction))
            .cloned())
    }

    async fn find_swaps_with_status(
        &self,
        direction: Direction,
        status: SwapStatus,
        after: i64,
    ) -> BridgeResult<Vec<Swap>> {
        let mut found: Vec<Swap> = self
            .swaps
            .read()
            .await
            .values()
            .filter(|s| s.direction == direction && s.status == status && s.created_at >= after)
            .cloned()
            .collect();
        found.sort_by_key(|s| s.created_at);
        Ok(found)
    }

    async fn update_swap_status(
        &self,
        tx_id: &str,
        direction: Direction,
        expected: SwapStatus,
        new: SwapStatus,
        timestamp: i64,
        memo: Option<&str>,
    ) -> BridgeResult<bool> {
        if !expected.can_transition_to(new) {
            return Err(BridgeError::Internal(format!(
                "illegal status transition {expected} -> {new}"
            )));
        }

        let mut swaps = self.swaps.write().await;
        match swaps.get_mut(&(tx_id.to_string(), direction)) {
            Some(swap) if swap.status == expected => {
                swap.status = new;
                swap.updated_at = timestamp;
                if let Some(memo) = memo {
                    swap.memo = Some(memo.to_string());
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn add_swap_result(&self, result: &SwapResult) -> BridgeResult<()> {
        self.results
            .write()
            .await
            .entry((result.tx_id.clone(), result.direction))
            .or_insert_with(|| result.clone());
        Ok(())
    }

    async fn get_swap_result(
        &self,
        tx_id: &str,
        direction: Direction,
    ) -> BridgeResult<Option<SwapResult>> {
        Ok(self
            .results
            .read()
            .await
            .get(&(tx_id.to_string(), direction))
            .cloned())
    }

    async fn update_result_swap_tx(
        &self,
        tx_id: &str,
        direction: Direction,
        swap_tx: &str,
        timestamp: i64,
    ) -> BridgeResult<bool> {
        let mut results = self.results.write().await;
        match results.get_mut(&(tx_id.to_string(), direction)) {
            Some(result) if result.swap_tx.is_empty() => {
                result.swap_tx = swap_tx.to_string();
                result.updated_at = timestamp;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_result_confirmed(
        &self,
        tx_id: &str,
        direction: Direction,
        swap_height: u64,
        swap_time: u64,
        timestamp: i64,
    ) -> BridgeResult<bool> {
        let mut results = self.results.write().await;
        match results.get_mut(&(tx_id.to_string(), direction)) {
            Some(result) if result.swap_height == 0 => {
                result.swap_height = swap_height;
                result.swap_time = swap_time;
                result.updated_at = timestamp;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn find_results_to_confirm(&self, direction: Direction) -> BridgeResult<Vec<SwapResult>> {
        let mut found: Vec<SwapResult> = self
            .results
            .read()
            .await
            .values()
            .filter(|r| r.direction == direction && !r.swap_tx.is_empty() && r.swap_height == 0)
            .cloned()
            .collect();
        found.sort_by_key(|r| r.created_at);
        Ok(found)
    }

    async fn stats(&self) -> BridgeResult<SwapStats> {
        let mut stats = SwapStats::default();
        for swap in self.swaps.read().await.values() {
            match swap.status {
                SwapStatus::NotStable => stats.not_stable += 1,
                SwapStatus::NotSwapped => stats.not_swapped += 1,
                SwapStatus::Processing => stats.processing += 1,
                SwapStatus::Swapped => stats.swapped += 1,
                SwapStatus::VerifyFailed | SwapStatus::SwapFailed => stats.failed += 1,
                SwapStatus::CanRecall => {}
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::U256;

    fn swap(tx_id: &str, status: SwapStatus, created_at: i64) -> Swap {
        Swap {
            tx_id: tx_id.to_string(),
            direction: Direction::Swapin,
            from: "0xaa".to_string(),
            bind: "0xbb".to_string(),
            value: U256::from(1_000_000u64),
            memo: None,
            status,
            created_at,
            updated_at: created_at,
        }
    }

    #[tokio::test]
    async fn test_conditional_update_single_winner() {
        let store = MemoryStore::new();
        store.add_swap(&swap("0x01", SwapStatus::NotStable, 100)).await.unwrap();

        let first = store
            .update_swap_status("0x01", Direction::Swapin, SwapStatus::NotStable, SwapStatus::NotSwapped, 200, None)
            .await
            .unwrap();
        let second = store
            .update_swap_status("0x01", Direction::Swapin, SwapStatus::NotStable, SwapStatus::VerifyFailed, 201, None)
            .await
            .unwrap();

        assert!(first);
        assert!(!second, "losing transition must be a no-op");
        let stored = store.get_swap("0x01", Direction::Swapin).await.unwrap().unwrap();
        assert_eq!(stored.status, SwapStatus::NotSwapped);
    }

    #[tokio::test]
    async fn test_illegal_transition_rejected() {
        let store = MemoryStore::new();
        store.add_swap(&swap("0x02", SwapStatus::Swapped, 100)).await.unwrap();

        let err = store
            .update_swap_status("0x02", Direction::Swapin, SwapStatus::Swapped, SwapStatus::NotStable, 200, None)
            .await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_scan_age_filter() {
        let store = MemoryStore::new();
        store.add_swap(&swap("0x0a", SwapStatus::NotStable, 100)).await.unwrap();
        store.add_swap(&swap("0x0b", SwapStatus::NotStable, 900)).await.unwrap();

        let found = store
            .find_swaps_with_status(Direction::Swapin, SwapStatus::NotStable, 500)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].tx_id, "0x0b");
    }

    #[tokio::test]
    async fn test_duplicate_add_keeps_first_record() {
        let store = MemoryStore::new();
        store.add_swap(&swap("0x0c", SwapStatus::NotStable, 100)).await.unwrap();
        store.add_swap(&swap("0x0c", SwapStatus::Processing, 999)).await.unwrap();

        let stored = store.get_swap("0x0c", Direction::Swapin).await.unwrap().unwrap();
        assert_eq!(stored.status, SwapStatus::NotStable);
        assert_eq!(stored.created_at, 100);
    }

    #[tokio::test]
    async fn test_swap_tx_attach_is_at_most_once() {
        let store = MemoryStore::new();
        let result = SwapResult {
            tx_id: "0x0d".to_string(),
            direction: Direction::Swapout,
            from: "0xaa".to_string(),
            bind: "0xbb".to_string(),
            value: U256::from(5u64),
            memo: None,
            swap_tx: String::new(),
            swap_height: 0,
            swap_time: 0,
            swap_value: U256::from(4u64),
            swap_type: super::super::SwapType::Swapout,
            created_at: 100,
            updated_at: 100,
        };
        store.add_swap_result(&result).await.unwrap();

        assert!(store
            .update_result_swap_tx("0x0d", Direction::Swapout, "0xbeef", 200)
            .await
            .unwrap());
        assert!(!store
            .update_result_swap_tx("0x0d", Direction::Swapout, "0xcafe", 201)
            .await
            .unwrap());

        let pending = store.find_results_to_confirm(Direction::Swapout).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].swap_tx, "0xbeef");

        assert!(store
            .update_result_confirmed("0x0d", Direction::Swapout, 1234, 5678, 300)
            .await
            .unwrap());
        assert!(store
            .find_results_to_confirm(Direction::Swapout)
            .await
            .unwrap()
            .is_empty());
    }
}
