//! EVM chain adapter
//!
//! Implements the full bridge capability set against an `ethers` HTTP
//! provider. Construction refuses to complete until the gateway answers
//! the chain-id and latest-block queries; a chain id that contradicts the
//! configured network is a configuration error surfaced to the caller.

use super::verify;
use super::{
    is_equal_ignore_case, BuildTxArgs, ChainBridge, SwapValuePolicy, TxStatus, TxSwapInfo,
    ERC20_TRANSFER_FUNC_HASH, SIGNATURE_LENGTH, SWAPIN_FUNC_HASH,
};
use crate::config::{GatewayConfig, TokenConfig};
use crate::dcrm::DcrmSigner;
use crate::error::{BridgeError, BridgeResult};
use crate::store::Direction;

use async_trait::async_trait;
use ethers::providers::{Http, Middleware, Provider};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{
    Address, Bytes, NameOrAddress, RecoveryMessage, Signature, Transaction, TransactionRequest,
    H256, U256,
};
use ethers::utils::keccak256;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Base delay of the startup retry loop against the gateway.
const RETRY_BASE: Duration = Duration::from_secs(3);
/// Backoff cap; retries continue indefinitely at this pace.
const RETRY_CAP: Duration = Duration::from_secs(30);

/// Default gas limit for mirror transactions when the caller supplies none.
const DEFAULT_GAS_LIMIT: u64 = 90_000;

/// Chain ids of the supported named Ethereum networks.
pub fn ethereum_chain_id(net_id: &str) -> Option<u64> {
    match net_id {
        "mainnet" => Some(1),
        "rinkeby" => Some(4),
        _ => None,
    }
}

/// The `custom` escape skips numeric chain-id validation.
pub fn is_custom_network(net_id: &str) -> bool {
    net_id == "custom"
}

fn gw_err(e: impl std::fmt::Display) -> BridgeError {
    BridgeError::Gateway(e.to_string())
}

fn fmt_address(address: Address) -> String {
    format!("{address:#x}")
}

fn next_delay(delay: Duration) -> Duration {
    std::cmp::min(delay * 2, RETRY_CAP)
}

fn parse_tx_hash(tx_hash: &str) -> BridgeResult<H256> {
    tx_hash.parse().map_err(|_| BridgeError::TxNotFound)
}

fn address_word(address: Address) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[12..].copy_from_slice(address.as_bytes());
    word
}

/// Require exactly one rsv tuple from the threshold signer.
pub(crate) fn expect_single_rsv(rsvs: &[String]) -> BridgeResult<&str> {
    if rsvs.len() != 1 {
        warn!("signer returned {} rsv tuples, require one", rsvs.len());
        return Err(BridgeError::Sign(
            "get sign status require one rsv but return many".to_string(),
        ));
    }
    Ok(&rsvs[0])
}

/// Attach a 65-byte `(r, s, v)` signature to a legacy transaction,
/// recover the sender and require it to equal `expected_sender`. The
/// transaction must still hash to `msg_hash`, the digest the signing
/// group actually signed. Returns the RLP-encoded signed transaction
/// and its hash.
pub(crate) fn attach_dcrm_signature(
    tx: &TypedTransaction,
    sig: &[u8],
    chain_id: u64,
    expected_sender: &str,
    msg_hash: H256,
) -> BridgeResult<(Bytes, String)> {
    if tx.sighash() != msg_hash {
        return Err(BridgeError::MsgHashMismatch);
    }
    if sig.len() != SIGNATURE_LENGTH {
        return Err(BridgeError::Sign("wrong length of signature".to_string()));
    }
    let recovery_id = match sig[64] {
        0 | 27 => 0u64,
        1 | 28 => 1u64,
        other => {
            return Err(BridgeError::Sign(format!("invalid recovery id {other}")));
        }
    };
    let signature = Signature {
        r: U256::from_big_endian(&sig[0..32]),
        s: U256::from_big_endian(&sig[32..64]),
        v: recovery_id + 35 + chain_id * 2,
    };

    let sender = signature
        .recover(RecoveryMessage::Hash(msg_hash))
        .map_err(|e| BridgeError::Sign(format!("recover sender failed: {e}")))?;
    if !is_equal_ignore_case(&fmt_address(sender), expected_sender) {
        error!(
            "verify sender failed, have {} want {}",
            fmt_address(sender),
            expected_sender
        );
        return Err(BridgeError::Sign("wrong sender address".to_string()));
    }

    let raw = tx.rlp_signed(&signature);
    let tx_hash = format!("{:#x}", H256::from(keccak256(&raw)));
    Ok((raw, tx_hash))
}

/// Bridge adapter for EVM-compatible chains
pub struct EvmBridge {
    provider: Provider<Http>,
    token: TokenConfig,
    gateway: GatewayConfig,
    policy: SwapValuePolicy,
    dcrm: Arc<dyn DcrmSigner>,
    is_src: bool,
    chain_id: U256,
    latest_block: AtomicU64,
}

impl EvmBridge {
    /// Connect to an Ethereum-family gateway, verify its chain id against
    /// the configured network and finish initialization.
    pub async fn connect(
        token: TokenConfig,
        gateway: GatewayConfig,
        dcrm: Arc<dyn DcrmSigner>,
        is_src: bool,
    ) -> BridgeResult<Self> {
        let net_id = token.net_id.to_lowercase();
        let target = if is_custom_network(&net_id) {
            None
        } else {
            Some(ethereum_chain_id(&net_id).ok_or_else(|| {
                BridgeError::Config(format!("unsupported ethereum network: {}", token.net_id))
            })?)
        };

        let provider = Self::make_provider(&gateway)?;
        let chain_id = Self::discover_chain_id(&provider, &gateway).await;

        if let Some(target) = target {
            if chain_id != U256::from(target) {
                return Err(BridgeError::Config(format!(
                    "gateway chainID {chain_id} is not {} ({})",
                    target, token.net_id
                )));
            }
        }
        info!("verify chain id succeed, network {} chain id {}", net_id, chain_id);

        Self::bootstrap(provider, token, gateway, dcrm, is_src, chain_id).await
    }

    /// Finish initialization once the chain id is known. Shared with
    /// adapters that discover the chain id differently.
    pub(crate) async fn bootstrap(
        provider: Provider<Http>,
        token: TokenConfig,
        gateway: GatewayConfig,
        dcrm: Arc<dyn DcrmSigner>,
        is_src: bool,
        chain_id: U256,
    ) -> BridgeResult<Self> {
        let policy = SwapValuePolicy::from_token(&token)?;
        let bridge = Self {
            provider,
            token,
            gateway,
            policy,
            dcrm,
            is_src,
            chain_id,
            latest_block: AtomicU64::new(0),
        };
        bridge.verify_token_config().await?;
        bridge.init_latest_block().await;
        Ok(bridge)
    }

    pub(crate) fn make_provider(gateway: &GatewayConfig) -> BridgeResult<Provider<Http>> {
        let url = reqwest::Url::parse(&gateway.api_address).map_err(|e| {
            BridgeError::Config(format!("invalid gateway url {}: {e}", gateway.api_address))
        })?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(gateway.timeout_secs))
            .build()
            .map_err(|e| BridgeError::Config(e.to_string()))?;
        Ok(Provider::new(Http::new_with_client(url, client)))
    }

    /// Query `eth_chainId`, retrying until the gateway answers.
    pub(crate) async fn discover_chain_id(
        provider: &Provider<Http>,
        gateway: &GatewayConfig,
    ) -> U256 {
        let mut delay = RETRY_BASE;
        loop {
            match provider.get_chainid().await {
                Ok(chain_id) => return chain_id,
                Err(e) => {
                    error!("can not get gateway chain id: {e}");
                    warn!("retry query gateway {}", gateway.api_address);
                    tokio::time::sleep(delay).await;
                    delay = next_delay(delay);
                }
            }
        }
    }

    /// Validate the configured DCRM and contract addresses. The contract
    /// must carry code: an ERC-20 on the source side, the bridge contract
    /// on the destination side.
    async fn verify_token_config(&self) -> BridgeResult<()> {
        if !self.is_valid_address(&self.token.dcrm_address) {
            return Err(BridgeError::Config(format!(
                "invalid dcrm address {}",
                self.token.dcrm_address
            )));
        }

        let Some(contract) = self.token.contract_address() else {
            if !self.is_src {
                return Err(BridgeError::Config(
                    "destination chain requires a bridge contract address".to_string(),
                ));
            }
            return Ok(());
        };

        if !self.is_valid_address(contract) {
            return Err(BridgeError::Config(format!("invalid contract address {contract}")));
        }
        if self.is_src && !self.token.is_erc20() {
            return Err(BridgeError::Config(format!(
                "unsupported contract address {contract} in source chain, assign id = \"ERC20\""
            )));
        }

        let address: Address = contract
            .parse()
            .map_err(|_| BridgeError::Config(format!("invalid contract address {contract}")))?;
        let mut delay = RETRY_BASE;
        let code = loop {
            match self.provider.get_code(address, None).await {
                Ok(code) => break code,
                Err(e) => {
                    error!("get contract code failed: {e}");
                    warn!("retry query gateway {}", self.gateway.api_address);
                    tokio::time::sleep(delay).await;
                    delay = next_delay(delay);
                }
            }
        };
        if code.as_ref().is_empty() {
            return Err(BridgeError::Config(format!(
                "contract address {contract} has no code on chain {}",
                self.chain_id
            )));
        }
        info!("verify contract address pass, address {}", contract);
        Ok(())
    }

    /// Seed the latest-block cache, retrying until the gateway answers.
    async fn init_latest_block(&self) {
        let mut delay = RETRY_BASE;
        loop {
            match self.get_latest_block_number().await {
                Ok(latest) => {
                    info!(
                        "get latest block number succeed, number {} chain {} net {}",
                        latest, self.token.block_chain, self.token.net_id
                    );
                    return;
                }
                Err(e) => {
                    error!("get latest block number failed: {e}");
                    warn!("retry query gateway {}", self.gateway.api_address);
                    tokio::time::sleep(delay).await;
                    delay = next_delay(delay);
                }
            }
        }
    }

    fn dcrm_address(&self) -> BridgeResult<Address> {
        self.token
            .dcrm_address
            .parse()
            .map_err(|_| BridgeError::Config(format!("invalid dcrm address {}", self.token.dcrm_address)))
    }

    /// Receiver every signed transaction must target: the configured
    /// contract, or the recall recipient on a contract-less source chain.
    fn expected_receiver(&self, args: &BuildTxArgs) -> String {
        match self.token.contract_address() {
            Some(contract) => contract.to_string(),
            None => args.bind.clone(),
        }
    }
}

#[async_trait]
impl ChainBridge for EvmBridge {
    fn token(&self) -> &TokenConfig {
        &self.token
    }

    fn is_src(&self) -> bool {
        self.is_src
    }

    fn chain_id(&self) -> U256 {
        self.chain_id
    }

    fn latest_cached_block(&self) -> u64 {
        self.latest_block.load(Ordering::Relaxed)
    }

    fn swap_policy(&self) -> &SwapValuePolicy {
        &self.policy
    }

    fn is_valid_address(&self, address: &str) -> bool {
        let hex = address.strip_prefix("0x").unwrap_or(address);
        hex.len() == 40 && hex.chars().all(|c| c.is_ascii_hexdigit())
    }

    async fn get_transaction(&self, tx_hash: &str) -> BridgeResult<Transaction> {
        let hash = parse_tx_hash(tx_hash)?;
        self.provider
            .get_transaction(hash)
            .await
            .map_err(gw_err)?
            .ok_or(BridgeError::TxNotFound)
    }

    async fn get_transaction_status(&self, tx_hash: &str) -> TxStatus {
        let mut status = TxStatus::default();
        let Ok(hash) = parse_tx_hash(tx_hash) else {
            return status;
        };

        let receipt = match self.provider.get_transaction_receipt(hash).await {
            Ok(Some(receipt)) => receipt,
            Ok(None) => return status,
            Err(e) => {
                debug!("get receipt failed for {tx_hash}: {e}");
                return status;
            }
        };

        if receipt.status != Some(1u64.into()) {
            debug!("transaction {tx_hash} with wrong receipt status {:?}", receipt.status);
        }
        status.block_height = receipt.block_number.map(|n| n.as_u64()).unwrap_or(0);
        status.block_hash = receipt.block_hash;

        if let Some(block_hash) = receipt.block_hash {
            match self.provider.get_block(block_hash).await {
                Ok(Some(block)) => status.block_time = block.timestamp.as_u64(),
                Ok(None) => {}
                Err(e) => debug!("get block {block_hash:?} failed: {e}"),
            }
        }

        if receipt.status == Some(1u64.into()) {
            match self.get_latest_block_number().await {
                Ok(latest) => {
                    status.confirmations = latest.saturating_sub(status.block_height)
                }
                Err(e) => debug!("get latest block number failed: {e}"),
            }
        }

        status.receipt = Some(receipt);
        status
    }

    async fn get_latest_block_number(&self) -> BridgeResult<u64> {
        let latest = self
            .provider
            .get_block_number()
            .await
            .map_err(gw_err)?
            .as_u64();
        self.latest_block.store(latest, Ordering::Relaxed);
        Ok(latest)
    }

    async fn verify_transaction(
        &self,
        tx_hash: &str,
        allow_unstable: bool,
        counterpart: &dyn ChainBridge,
    ) -> BridgeResult<TxSwapInfo> {
        if self.is_src {
            let tx = self.get_transaction(tx_hash).await?;
            let status = if allow_unstable {
                None
            } else {
                Some(self.get_transaction_status(tx_hash).await)
            };
            if self.token.is_erc20() {
                verify::verify_swapin_erc20(tx_hash, &tx, status.as_ref(), &self.token, &self.policy)
            } else {
                verify::verify_swapin_native(tx_hash, &tx, status.as_ref(), &self.token, &self.policy)
            }
        } else {
            let bind_is_valid = |address: &str| counterpart.is_valid_address(address);
            if allow_unstable {
                let tx = self.get_transaction(tx_hash).await?;
                verify::verify_swapout_unstable(tx_hash, &tx, &self.token, &self.policy, &bind_is_valid)
            } else {
                let status = self.get_transaction_status(tx_hash).await;
                verify::verify_swapout_stable(tx_hash, &status, &self.token, &self.policy, &bind_is_valid)
            }
        }
    }

    async fn build_raw_transaction(&self, args: &mut BuildTxArgs) -> BridgeResult<TypedTransaction> {
        let recipient: Address = args.bind.parse().map_err(|_| {
            BridgeError::Transaction(format!("invalid mirror recipient {}", args.bind))
        })?;

        let (to, value, data): (Address, U256, Vec<u8>) = match args.direction {
            Direction::Swapin => {
                // Mint on the destination bridge contract.
                let contract: Address = self
                    .token
                    .contract_address()
                    .ok_or_else(|| {
                        BridgeError::Config("no bridge contract configured for mint".to_string())
                    })?
                    .parse()
                    .map_err(|_| BridgeError::Config("invalid contract address".to_string()))?;
                let deposit_hash = parse_tx_hash(&args.swap_id)?;

                let mut data = SWAPIN_FUNC_HASH.to_vec();
                data.extend_from_slice(deposit_hash.as_bytes());
                data.extend_from_slice(&address_word(recipient));
                let mut amount = [0u8; 32];
                args.value.to_big_endian(&mut amount);
                data.extend_from_slice(&amount);
                (contract, U256::zero(), data)
            }
            Direction::Swapout => match self.token.contract_address() {
                // ERC-20 release from the DCRM account.
                Some(contract) => {
                    let contract: Address = contract
                        .parse()
                        .map_err(|_| BridgeError::Config("invalid contract address".to_string()))?;
                    let mut data = ERC20_TRANSFER_FUNC_HASH.to_vec();
                    data.extend_from_slice(&address_word(recipient));
                    let mut amount = [0u8; 32];
                    args.value.to_big_endian(&mut amount);
                    data.extend_from_slice(&amount);
                    (contract, U256::zero(), data)
                }
                // Native release straight to the recall recipient.
                None => (recipient, args.value, Vec::new()),
            },
        };

        let dcrm_address = self.dcrm_address()?;
        let nonce = match args.extra.nonce {
            Some(nonce) => nonce,
            None => self
                .provider
                .get_transaction_count(dcrm_address, None)
                .await
                .map_err(gw_err)?
                .as_u64(),
        };
        args.extra.nonce = Some(nonce);

        if args.extra.gas_price.is_zero() {
            args.extra.gas_price = self.provider.get_gas_price().await.map_err(gw_err)?;
        }
        if args.extra.gas_limit == 0 {
            args.extra.gas_limit = DEFAULT_GAS_LIMIT;
        }

        let request = TransactionRequest::new()
            .from(dcrm_address)
            .to(to)
            .value(value)
            .data(data)
            .nonce(nonce)
            .gas(args.extra.gas_limit)
            .gas_price(args.extra.gas_price)
            .chain_id(self.chain_id.as_u64());

        Ok(TypedTransaction::Legacy(request))
    }

    async fn dcrm_sign_transaction(
        &self,
        raw: &TypedTransaction,
        args: &mut BuildTxArgs,
    ) -> BridgeResult<(Bytes, String)> {
        if !matches!(raw, TypedTransaction::Legacy(_)) {
            return Err(BridgeError::WrongRawTx);
        }
        let to = match raw.to() {
            Some(NameOrAddress::Address(address)) if *address != Address::zero() => {
                fmt_address(*address)
            }
            _ => return Err(BridgeError::Sign("[sign] tx receiver is empty".to_string())),
        };
        let expected = self.expected_receiver(args);
        if !is_equal_ignore_case(&to, &expected) {
            return Err(BridgeError::Sign(format!(
                "[sign] tx receiver mismatch. have {to} want {expected}"
            )));
        }

        // Never sign with a gas price below the gateway's current quote.
        let current = self.provider.get_gas_price().await.map_err(gw_err)?;
        args.extra.raise_gas_price_floor(current);
        let mut tx = raw.clone();
        tx.set_gas_price(args.extra.gas_price);

        let sighash = tx.sighash();
        let msg_context = serde_json::to_string(args)
            .map_err(|e| BridgeError::Internal(format!("encode sign context: {e}")))?;

        info!("dcrm sign start, txid {} msghash {:#x}", args.swap_id, sighash);
        let (key_id, rsvs) = self
            .dcrm
            .do_sign_one(&self.token.dcrm_pubkey, &format!("{sighash:#x}"), &msg_context)
            .await?;
        info!("dcrm sign finished, keyID {} txid {}", key_id, args.swap_id);

        let rsv = expect_single_rsv(&rsvs)?;
        let sig = hex::decode(rsv.trim_start_matches("0x"))
            .map_err(|_| BridgeError::Sign(format!("bad rsv encoding of keyID {key_id}")))?;
        if sig.len() != SIGNATURE_LENGTH {
            return Err(BridgeError::Sign(format!("wrong signature of keyID {key_id}")));
        }

        let (signed, tx_hash) = attach_dcrm_signature(
            &tx,
            &sig,
            self.chain_id.as_u64(),
            &self.token.dcrm_address,
            sighash,
        )?;
        info!("dcrm sign success, txid {} txhash {}", args.swap_id, tx_hash);
        Ok((signed, tx_hash))
    }

    async fn send_transaction(&self, signed: &Bytes) -> BridgeResult<String> {
        let pending = self
            .provider
            .send_raw_transaction(signed.clone())
            .await
            .map_err(gw_err)?;
        Ok(format!("{:#x}", pending.tx_hash()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::signers::{LocalWallet, Signer};

    #[test]
    fn test_ethereum_network_map() {
        assert_eq!(ethereum_chain_id("mainnet"), Some(1));
        assert_eq!(ethereum_chain_id("rinkeby"), Some(4));
        assert_eq!(ethereum_chain_id("ropsten"), None);
        assert!(is_custom_network("custom"));
        assert!(!is_custom_network("mainnet"));
    }

    #[test]
    fn test_single_rsv_required() {
        let one = vec!["0xab".to_string()];
        assert!(expect_single_rsv(&one).is_ok());

        let two = vec!["0xab".to_string(), "0xcd".to_string()];
        let err = expect_single_rsv(&two).unwrap_err();
        assert!(err.to_string().contains("require one rsv"));

        assert!(expect_single_rsv(&[]).is_err());
    }

    fn legacy_tx(chain_id: u64) -> TypedTransaction {
        TypedTransaction::Legacy(
            TransactionRequest::new()
                .to("0x8d0304b8ff0a05fdc0a147a139a11ee7bc326cd1"
                    .parse::<Address>()
                    .unwrap())
                .value(0u64)
                .data(vec![0x01, 0x02])
                .nonce(7u64)
                .gas(90_000u64)
                .gas_price(25u64)
                .chain_id(chain_id),
        )
    }

    #[test]
    fn test_attach_signature_recovers_expected_sender() {
        let chain_id = 4u64;
        let wallet: LocalWallet =
            "4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318"
                .parse()
                .unwrap();
        let tx = legacy_tx(chain_id);
        let sighash = tx.sighash();

        // A wallet stands in for the threshold signer: same rsv shape.
        let signature = wallet.sign_hash(sighash).unwrap();
        let mut rsv = [0u8; 65];
        signature.r.to_big_endian(&mut rsv[0..32]);
        signature.s.to_big_endian(&mut rsv[32..64]);
        rsv[64] = signature.v as u8; // 27 or 28 from sign_hash

        let sender = format!("{:#x}", wallet.address());
        let (raw, tx_hash) =
            attach_dcrm_signature(&tx, &rsv, chain_id, &sender, sighash).unwrap();
        assert!(!raw.is_empty());
        assert!(tx_hash.starts_with("0x"));
        assert_eq!(tx_hash.len(), 66);

        // A different expected sender must be rejected.
        let other = "0x00000000000000000000000000000000000000aa";
        assert!(matches!(
            attach_dcrm_signature(&tx, &rsv, chain_id, other, sighash),
            Err(BridgeError::Sign(_))
        ));

        // A digest other than the one the group signed must be rejected.
        let wrong_hash = H256::repeat_byte(0x77);
        assert!(matches!(
            attach_dcrm_signature(&tx, &rsv, chain_id, &sender, wrong_hash),
            Err(BridgeError::MsgHashMismatch)
        ));
    }

    #[test]
    fn test_attach_signature_rejects_wrong_length() {
        let tx = legacy_tx(1);
        let short = [0u8; 64];
        assert!(attach_dcrm_signature(&tx, &short, 1, "0x00", tx.sighash()).is_err());
    }
}
