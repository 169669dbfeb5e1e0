//! Ethereum Classic chain adapter
//!
//! Composes the EVM base adapter. Only initialization differs: ETC
//! gateways report a network id distinct from the EIP-155 chain id, so
//! the signer chain id is discovered through `net_version` and mapped.

use super::evm::{is_custom_network, EvmBridge};
use super::{BuildTxArgs, ChainBridge, SwapValuePolicy, TxStatus, TxSwapInfo};
use crate::config::{GatewayConfig, TokenConfig};
use crate::dcrm::DcrmSigner;
use crate::error::{BridgeError, BridgeResult};

use async_trait::async_trait;
use ethers::providers::{Http, Provider};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Bytes, Transaction, U256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Chain ids of the supported named ETC networks.
pub fn etc_chain_id(net_id: &str) -> Option<u64> {
    match net_id {
        "mainnet" => Some(61),
        "kotti" => Some(6),
        "mordor" => Some(63),
        _ => None,
    }
}

/// Map an ETC gateway network id to its signer chain id.
fn chain_id_of_network(network_id: u64) -> Option<u64> {
    match network_id {
        1 => Some(61),
        6 => Some(6),
        7 => Some(63),
        _ => None,
    }
}

/// Bridge adapter for Ethereum Classic networks
pub struct EtcBridge {
    inner: EvmBridge,
}

impl EtcBridge {
    /// Connect to an ETC gateway, discover the signer chain id through
    /// `net_version` and finish initialization via the EVM base.
    pub async fn connect(
        token: TokenConfig,
        gateway: GatewayConfig,
        dcrm: Arc<dyn DcrmSigner>,
        is_src: bool,
    ) -> BridgeResult<Self> {
        let net_id = token.net_id.to_lowercase();
        let is_custom = is_custom_network(&net_id);
        let target = etc_chain_id(&net_id);
        if !is_custom && target.is_none() {
            return Err(BridgeError::Config(format!(
                "unsupported etc network: {}",
                token.net_id
            )));
        }

        let provider = EvmBridge::make_provider(&gateway)?;
        let chain_id = Self::discover_signer_chain_id(&provider, &gateway).await?;

        if let Some(target) = target {
            if chain_id != U256::from(target) {
                return Err(BridgeError::Config(format!(
                    "gateway chainID {chain_id} is not {} ({})",
                    target, token.net_id
                )));
            }
        }
        info!("verify chain id succeed, network {} chain id {}", net_id, chain_id);

        let inner = EvmBridge::bootstrap(provider, token, gateway, dcrm, is_src, chain_id).await?;
        Ok(Self { inner })
    }

    /// Query `net_version` until the gateway answers, then map the
    /// network id. An unknown network id is a configuration error.
    async fn discover_signer_chain_id(
        provider: &Provider<Http>,
        gateway: &GatewayConfig,
    ) -> BridgeResult<U256> {
        let mut delay = Duration::from_secs(3);
        let network_id: String = loop {
            match provider.request::<_, String>("net_version", ()).await {
                Ok(version) => break version,
                Err(e) => {
                    error!("can not get gateway network id: {e}");
                    warn!("retry query gateway {}", gateway.api_address);
                    tokio::time::sleep(delay).await;
                    delay = std::cmp::min(delay * 2, Duration::from_secs(30));
                }
            }
        };

        let network_id: u64 = network_id
            .parse()
            .map_err(|_| BridgeError::Config(format!("bad etc network id {network_id:?}")))?;
        chain_id_of_network(network_id)
            .map(U256::from)
            .ok_or_else(|| BridgeError::Config(format!("unsupported etc network {network_id}")))
    }
}

#[async_trait]
impl ChainBridge for EtcBridge {
    fn token(&self) -> &TokenConfig {
        self.inner.token()
    }

    fn is_src(&self) -> bool {
        self.inner.is_src()
    }

    fn chain_id(&self) -> U256 {
        self.inner.chain_id()
    }

    fn latest_cached_block(&self) -> u64 {
        self.inner.latest_cached_block()
    }

    fn swap_policy(&self) -> &SwapValuePolicy {
        self.inner.swap_policy()
    }

    fn is_valid_address(&self, address: &str) -> bool {
        self.inner.is_valid_address(address)
    }

    async fn get_transaction(&self, tx_hash: &str) -> BridgeResult<Transaction> {
        self.inner.get_transaction(tx_hash).await
    }

    async fn get_transaction_status(&self, tx_hash: &str) -> TxStatus {
        self.inner.get_transaction_status(tx_hash).await
    }

    async fn get_latest_block_number(&self) -> BridgeResult<u64> {
        self.inner.get_latest_block_number().await
    }

    async fn verify_transaction(
        &self,
        tx_hash: &str,
        allow_unstable: bool,
        counterpart: &dyn ChainBridge,
    ) -> BridgeResult<TxSwapInfo> {
        self.inner
            .verify_transaction(tx_hash, allow_unstable, counterpart)
            .await
    }

    async fn build_raw_transaction(&self, args: &mut BuildTxArgs) -> BridgeResult<TypedTransaction> {
        self.inner.build_raw_transaction(args).await
    }

    async fn dcrm_sign_transaction(
        &self,
        raw: &TypedTransaction,
        args: &mut BuildTxArgs,
    ) -> BridgeResult<(Bytes, String)> {
        self.inner.dcrm_sign_transaction(raw, args).await
    }

    async fn send_transaction(&self, signed: &Bytes) -> BridgeResult<String> {
        self.inner.send_transaction(signed).await
    }
}
