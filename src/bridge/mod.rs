//! Chain bridge abstraction
//!
//! `ChainBridge` is the capability set a concrete chain adapter must
//! satisfy: fetch transactions and status, validate addresses, build a
//! mirror transaction, sign it through the threshold signer, broadcast
//! it, and verify candidate inbound/outbound transactions. The same
//! worker pipeline drives any pair of implementations.

pub mod etc;
pub mod evm;
pub mod verify;

pub use etc::EtcBridge;
pub use evm::EvmBridge;

use crate::config::TokenConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::store::{Direction, SwapType};

use async_trait::async_trait;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Bytes, TransactionReceipt, H256, U256};
use ethers::utils::keccak256;
use lazy_static::lazy_static;
use serde::Serialize;
use std::sync::Arc;

/// Expected length of a DCRM signature: r (32) + s (32) + v (1).
pub const SIGNATURE_LENGTH: usize = 65;

lazy_static! {
    /// Topic of the burn event emitted by the mirror-asset contract.
    pub static ref LOG_SWAPOUT_TOPIC: H256 =
        H256::from(keccak256("LogSwapout(address,address,uint256,string)"));

    /// Topic of the standard ERC-20 transfer event.
    pub static ref ERC20_TRANSFER_TOPIC: H256 =
        H256::from(keccak256("Transfer(address,address,uint256)"));

    /// Selector of the outbound burn function on the mirror contract.
    pub static ref SWAPOUT_FUNC_HASH: [u8; 4] = selector("Swapout(uint256,string)");

    /// Selector of the mint entrypoint on the destination bridge contract.
    pub static ref SWAPIN_FUNC_HASH: [u8; 4] = selector("Swapin(bytes32,address,uint256)");

    /// Selector of the ERC-20 transfer used for source-side release.
    pub static ref ERC20_TRANSFER_FUNC_HASH: [u8; 4] = selector("transfer(address,uint256)");
}

fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

/// Case-insensitive address comparison; chains report mixed-case hex.
pub fn is_equal_ignore_case(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// Observed on-chain status of a transaction. All fields are zero when
/// the transaction is unknown; fetching status never fails.
#[derive(Debug, Clone, Default)]
pub struct TxStatus {
    pub block_height: u64,
    pub block_hash: Option<H256>,
    pub block_time: u64,
    pub confirmations: u64,
    pub receipt: Option<TransactionReceipt>,
}

/// Outcome of verifying a candidate swap transaction.
#[derive(Debug, Clone, Default)]
pub struct TxSwapInfo {
    pub hash: String,
    pub height: u64,
    pub timestamp: u64,
    pub from: String,
    pub to: String,
    pub bind: String,
    pub value: U256,
}

/// Chain-specific knobs for an outbound transaction.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TxExtra {
    pub gas_price: U256,
    pub gas_limit: u64,
    pub nonce: Option<u64>,
}

/// Arguments for building and signing a mirror transaction. Serialized
/// as the message context handed to the threshold signer.
#[derive(Debug, Clone, Serialize)]
pub struct BuildTxArgs {
    pub swap_id: String,
    pub swap_type: SwapType,
    pub direction: Direction,
    /// Recipient of the mirrored amount on the emitting chain.
    pub bind: String,
    pub value: U256,
    pub memo: Option<String>,
    pub extra: TxExtra,
}

impl TxExtra {
    /// Raise the gas price to at least `current`. Never lowers it.
    pub fn raise_gas_price_floor(&mut self, current: U256) {
        if current > self.gas_price {
            self.gas_price = current;
        }
    }
}

/// Per-token swap amount policy, parsed once at bridge construction.
#[derive(Debug, Clone)]
pub struct SwapValuePolicy {
    minimum_swap: U256,
    maximum_swap: U256,
    fee_permille: u64,
    minimum_fee: U256,
    maximum_fee: U256,
}

impl SwapValuePolicy {
    pub fn from_token(token: &TokenConfig) -> BridgeResult<Self> {
        let parse = |field: &str, raw: &str| {
            U256::from_dec_str(raw)
                .map_err(|e| BridgeError::Config(format!("invalid {field} {raw:?}: {e}")))
        };
        let policy = Self {
            minimum_swap: parse("minimum_swap", &token.minimum_swap)?,
            maximum_swap: parse("maximum_swap", &token.maximum_swap)?,
            fee_permille: token.swap_fee_permille,
            minimum_fee: parse("minimum_swap_fee", &token.minimum_swap_fee)?,
            maximum_fee: parse("maximum_swap_fee", &token.maximum_swap_fee)?,
        };
        if policy.minimum_swap > policy.maximum_swap {
            return Err(BridgeError::Config(
                "minimum_swap exceeds maximum_swap".to_string(),
            ));
        }
        Ok(policy)
    }

    /// Whether an observed deposit/burn amount is acceptable.
    pub fn check_swap_value(&self, value: U256) -> bool {
        value >= self.minimum_swap && value <= self.maximum_swap
    }

    /// Mirrored amount after the swap fee. Never larger than `value`.
    pub fn calc_swap_value(&self, value: U256) -> U256 {
        let mut fee = value * U256::from(self.fee_permille) / U256::from(1000u64);
        if fee < self.minimum_fee {
            fee = self.minimum_fee;
        }
        if fee > self.maximum_fee {
            fee = self.maximum_fee;
        }
        value.saturating_sub(fee)
    }
}

/// Capability set of a concrete chain adapter.
#[async_trait]
pub trait ChainBridge: Send + Sync {
    fn token(&self) -> &TokenConfig;

    /// Whether this bridge faces the source chain.
    fn is_src(&self) -> bool;

    /// EIP-155 chain id, fixed after startup verification.
    fn chain_id(&self) -> U256;

    /// Latest block height cache; stale by at most one poll interval.
    fn latest_cached_block(&self) -> u64;

    /// Swap amount policy of this chain's token.
    fn swap_policy(&self) -> &SwapValuePolicy;

    fn is_valid_address(&self, address: &str) -> bool;

    async fn get_transaction(&self, tx_hash: &str)
        -> BridgeResult<ethers::types::Transaction>;

    /// On-chain status of a transaction; fields zero when unknown.
    async fn get_transaction_status(&self, tx_hash: &str) -> TxStatus;

    async fn get_latest_block_number(&self) -> BridgeResult<u64>;

    /// Verify a candidate swap transaction. `counterpart` is the bridge
    /// of the opposite chain, consulted for bind address validation.
    async fn verify_transaction(
        &self,
        tx_hash: &str,
        allow_unstable: bool,
        counterpart: &dyn ChainBridge,
    ) -> BridgeResult<TxSwapInfo>;

    /// Build the raw mirror transaction for `args`, filling in nonce,
    /// gas price and gas limit.
    async fn build_raw_transaction(&self, args: &mut BuildTxArgs)
        -> BridgeResult<TypedTransaction>;

    /// Obtain a threshold signature for `raw` and attach it. Returns the
    /// RLP-encoded signed transaction and its hash.
    async fn dcrm_sign_transaction(
        &self,
        raw: &TypedTransaction,
        args: &mut BuildTxArgs,
    ) -> BridgeResult<(Bytes, String)>;

    /// Broadcast a signed transaction, returning the reported hash.
    async fn send_transaction(&self, signed: &Bytes) -> BridgeResult<String>;
}

/// Connect the adapter matching the configured chain family.
pub async fn connect_bridge(
    token: TokenConfig,
    gateway: crate::config::GatewayConfig,
    dcrm: Arc<dyn crate::dcrm::DcrmSigner>,
    is_src: bool,
) -> BridgeResult<Arc<dyn ChainBridge>> {
    match token.block_chain.to_lowercase().as_str() {
        "ethereum" => Ok(Arc::new(EvmBridge::connect(token, gateway, dcrm, is_src).await?)),
        "ethereumclassic" => Ok(Arc::new(EtcBridge::connect(token, gateway, dcrm, is_src).await?)),
        other => Err(BridgeError::Config(format!("unsupported block chain {other}"))),
    }
}

/// The two bridge handles, resolved by swap direction. Constructed once
/// at startup and injected into every worker.
#[derive(Clone)]
pub struct BridgePair {
    pub src: Arc<dyn ChainBridge>,
    pub dst: Arc<dyn ChainBridge>,
}

impl BridgePair {
    /// Bridge that observes a swap of `direction`, plus its counterpart.
    /// Swapins are deposits on the source chain; swapouts are burns on
    /// the destination chain.
    pub fn observer(&self, direction: Direction) -> (&Arc<dyn ChainBridge>, &Arc<dyn ChainBridge>) {
        match direction {
            Direction::Swapin => (&self.src, &self.dst),
            Direction::Swapout => (&self.dst, &self.src),
        }
    }

    /// Bridge that emits the mirror transaction for `direction`.
    pub fn emitter(&self, direction: Direction) -> &Arc<dyn ChainBridge> {
        match direction {
            Direction::Swapin => &self.dst,
            Direction::Swapout => &self.src,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> SwapValuePolicy {
        SwapValuePolicy {
            minimum_swap: U256::from(100u64),
            maximum_swap: U256::from(1_000_000u64),
            fee_permille: 1,
            minimum_fee: U256::from(10u64),
            maximum_fee: U256::from(500u64),
        }
    }

    #[test]
    fn test_check_swap_value_bounds() {
        let p = policy();
        assert!(!p.check_swap_value(U256::from(99u64)));
        assert!(p.check_swap_value(U256::from(100u64)));
        assert!(p.check_swap_value(U256::from(1_000_000u64)));
        assert!(!p.check_swap_value(U256::from(1_000_001u64)));
    }

    #[test]
    fn test_calc_swap_value_fee_clamping() {
        let p = policy();
        // Proportional fee below the floor: floor applies.
        assert_eq!(p.calc_swap_value(U256::from(1_000u64)), U256::from(990u64));
        // Proportional fee inside the band.
        assert_eq!(p.calc_swap_value(U256::from(100_000u64)), U256::from(99_900u64));
        // Proportional fee above the cap: cap applies.
        assert_eq!(
            p.calc_swap_value(U256::from(1_000_000u64)),
            U256::from(999_500u64)
        );
        // Mirrored amount never exceeds the observed amount.
        assert!(p.calc_swap_value(U256::from(5u64)) <= U256::from(5u64));
    }

    #[test]
    fn test_gas_floor_never_lowers() {
        let mut extra = TxExtra {
            gas_price: U256::from(10u64),
            gas_limit: 90_000,
            nonce: None,
        };
        extra.raise_gas_price_floor(U256::from(25u64));
        assert_eq!(extra.gas_price, U256::from(25u64));
        extra.raise_gas_price_floor(U256::from(7u64));
        assert_eq!(extra.gas_price, U256::from(25u64));
    }

    #[test]
    fn test_known_erc20_constants() {
        // Well-known values pin the selector derivation.
        assert_eq!(*ERC20_TRANSFER_FUNC_HASH, [0xa9, 0x05, 0x9c, 0xbb]);
        assert_eq!(
            format!("{:x}", *ERC20_TRANSFER_TOPIC),
            "ddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"
        );
    }
}
