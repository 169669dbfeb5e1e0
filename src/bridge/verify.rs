//! Swap transaction verification
//!
//! Swapouts are burns observed on the destination chain: the stable path
//! reads the burn event from the receipt logs, the unstable path reads
//! the same fields from the call data. Swapins are deposits observed on
//! the source chain, either native transfers to the DCRM address or
//! ERC-20 transfers into it.
//!
//! The checkers here are pure over already-fetched data; the adapters
//! fetch and delegate. Check ordering is load-bearing: the bind memo is
//! validated last, so a memo failure on an otherwise valid transaction
//! marks it recallable rather than failed.

use super::{
    is_equal_ignore_case, SwapValuePolicy, TxStatus, TxSwapInfo, ERC20_TRANSFER_FUNC_HASH,
    ERC20_TRANSFER_TOPIC, LOG_SWAPOUT_TOPIC, SWAPOUT_FUNC_HASH,
};
use crate::config::TokenConfig;
use crate::error::{BridgeError, BridgeResult};

use ethers::types::{Address, Log, Transaction, U256};

/// Minimum ABI payload: value word, offset word, length word.
const MIN_ENCODED_LEN: usize = 96;

fn fmt_address(address: Address) -> String {
    format!("{address:#x}")
}

fn word_at(data: &[u8], offset: usize) -> U256 {
    U256::from_big_endian(&data[offset..offset + 32])
}

/// Decode `(uint256 value, string bind)` in standard 32-byte-aligned ABI
/// encoding: value at word 0, the string offset at word 1, then length
/// and bytes at that offset. Offsets or lengths pointing outside the
/// payload are rejected.
pub fn parse_encoded_data(enc_data: &[u8]) -> BridgeResult<(String, U256)> {
    if enc_data.len() < MIN_ENCODED_LEN {
        return Err(BridgeError::TxWithWrongInput);
    }
    let value = word_at(enc_data, 0);

    let offset_word = word_at(enc_data, 32);
    if offset_word > U256::from(usize::MAX) {
        return Err(BridgeError::TxWithWrongInput);
    }
    let offset = offset_word.as_usize();
    if offset.checked_add(32).map_or(true, |end| end > enc_data.len()) {
        return Err(BridgeError::TxWithWrongInput);
    }

    let length_word = word_at(enc_data, offset);
    if length_word > U256::from(usize::MAX) {
        return Err(BridgeError::TxWithWrongInput);
    }
    let length = length_word.as_usize();
    let start = offset + 32;
    if start.checked_add(length).map_or(true, |end| end > enc_data.len()) {
        return Err(BridgeError::TxWithWrongInput);
    }

    let bind = String::from_utf8(enc_data[start..start + length].to_vec())
        .map_err(|_| BridgeError::TxWithWrongInput)?;
    Ok((bind, value))
}

/// Extract `(bind, value)` from burn call data: a four-byte selector
/// followed by the encoded payload.
pub fn parse_swapout_tx_input(input: &[u8]) -> BridgeResult<(String, U256)> {
    if input.len() < 4 || input[..4] != *SWAPOUT_FUNC_HASH {
        return Err(BridgeError::TxWithWrongInput);
    }
    parse_encoded_data(&input[4..])
}

/// Extract `(bind, value)` from receipt logs. The first non-removed log
/// with exactly two topics whose first topic is the burn event is
/// honored; later matches in the same receipt are ignored.
pub fn parse_swapout_tx_logs(logs: &[Log]) -> BridgeResult<(String, U256)> {
    for log in logs {
        if log.removed == Some(true) {
            continue;
        }
        if log.topics.len() != 2 || log.topics[0] != *LOG_SWAPOUT_TOPIC {
            continue;
        }
        return parse_encoded_data(&log.data);
    }
    Err(BridgeError::TxWithWrongInput)
}

/// Extract `(token sender, value)` from the first non-removed ERC-20
/// transfer log emitted by `contract` whose recipient is `dcrm_address`.
pub fn parse_erc20_transfer_logs(
    logs: &[Log],
    contract: &str,
    dcrm_address: &str,
) -> BridgeResult<(String, U256)> {
    for log in logs {
        if log.removed == Some(true) {
            continue;
        }
        if log.topics.len() != 3 || log.topics[0] != *ERC20_TRANSFER_TOPIC {
            continue;
        }
        if !is_equal_ignore_case(&fmt_address(log.address), contract) {
            continue;
        }
        let to = fmt_address(Address::from_slice(&log.topics[2].as_bytes()[12..]));
        if !is_equal_ignore_case(&to, dcrm_address) {
            continue;
        }
        if log.data.len() < 32 {
            return Err(BridgeError::TxWithWrongInput);
        }
        let from = fmt_address(Address::from_slice(&log.topics[1].as_bytes()[12..]));
        return Ok((from, word_at(&log.data, 0)));
    }
    Err(BridgeError::TxWithWrongInput)
}

/// Receipt and confirmation gate shared by the stable paths. A missing
/// receipt means the transaction is simply not mined yet; a receipt with
/// a failure code is a hard reject.
fn check_stability(status: &TxStatus, required_confirmations: u64) -> BridgeResult<()> {
    let receipt = status.receipt.as_ref().ok_or(BridgeError::TxNotStable)?;
    if receipt.status != Some(1u64.into()) {
        return Err(BridgeError::TxWithWrongReceipt);
    }
    if status.block_height == 0 || status.confirmations < required_confirmations {
        return Err(BridgeError::TxNotStable);
    }
    Ok(())
}

/// Verify a finalized swapout against its receipt.
pub fn verify_swapout_stable(
    tx_hash: &str,
    status: &TxStatus,
    token: &TokenConfig,
    policy: &SwapValuePolicy,
    bind_is_valid: &dyn Fn(&str) -> bool,
) -> BridgeResult<TxSwapInfo> {
    let mut info = TxSwapInfo {
        hash: tx_hash.to_string(),
        height: status.block_height,
        timestamp: status.block_time,
        ..Default::default()
    };

    check_stability(status, token.confirmations)?;
    let receipt = status.receipt.as_ref().ok_or(BridgeError::TxNotStable)?;

    if let Some(to) = receipt.to {
        info.to = fmt_address(to);
    }
    info.from = fmt_address(receipt.from);

    let contract = token.contract_address().unwrap_or_default();
    if !is_equal_ignore_case(&info.to, contract) {
        return Err(BridgeError::TxWithWrongReceiver);
    }
    if is_equal_ignore_case(&info.from, &token.dcrm_address) {
        return Err(BridgeError::TxWithWrongSender);
    }

    let (bind, value) = parse_swapout_tx_logs(&receipt.logs)?;
    info.bind = bind;
    info.value = value;

    if !policy.check_swap_value(info.value) {
        return Err(BridgeError::TxWithWrongValue);
    }

    // The memo is checked last: everything else about the burn is valid,
    // so a bad bind address makes the swap recallable.
    if !bind_is_valid(&info.bind) {
        return Err(BridgeError::TxWithWrongMemo);
    }

    Ok(info)
}

/// Verify a swapout before finality, from the transaction call data.
/// `timestamp` stays zero on this path; consumers tolerate it.
pub fn verify_swapout_unstable(
    tx_hash: &str,
    tx: &Transaction,
    token: &TokenConfig,
    policy: &SwapValuePolicy,
    bind_is_valid: &dyn Fn(&str) -> bool,
) -> BridgeResult<TxSwapInfo> {
    let mut info = TxSwapInfo {
        hash: tx_hash.to_string(),
        height: tx.block_number.map(|n| n.as_u64()).unwrap_or(0),
        ..Default::default()
    };
    if let Some(to) = tx.to {
        info.to = fmt_address(to);
    }
    info.from = fmt_address(tx.from);

    let contract = token.contract_address().unwrap_or_default();
    if !is_equal_ignore_case(&info.to, contract) {
        return Err(BridgeError::TxWithWrongReceiver);
    }
    if is_equal_ignore_case(&info.from, &token.dcrm_address) {
        return Err(BridgeError::TxWithWrongSender);
    }

    let (bind, value) = parse_swapout_tx_input(&tx.input)?;
    info.bind = bind;
    info.value = value;

    if !policy.check_swap_value(info.value) {
        return Err(BridgeError::TxWithWrongValue);
    }
    if !bind_is_valid(&info.bind) {
        return Err(BridgeError::TxWithWrongMemo);
    }

    Ok(info)
}

/// Verify a native-asset swapin deposit. The bind address defaults to
/// the depositor. `status` is `Some` on the stable path.
pub fn verify_swapin_native(
    tx_hash: &str,
    tx: &Transaction,
    status: Option<&TxStatus>,
    token: &TokenConfig,
    policy: &SwapValuePolicy,
) -> BridgeResult<TxSwapInfo> {
    let mut info = TxSwapInfo {
        hash: tx_hash.to_string(),
        height: tx.block_number.map(|n| n.as_u64()).unwrap_or(0),
        ..Default::default()
    };
    if let Some(to) = tx.to {
        info.to = fmt_address(to);
    }
    info.from = fmt_address(tx.from);
    info.bind = info.from.clone();
    info.value = tx.value;

    if let Some(status) = status {
        info.height = status.block_height;
        info.timestamp = status.block_time;
        check_stability(status, token.confirmations)?;
    }

    if !is_equal_ignore_case(&info.to, &token.dcrm_address) {
        return Err(BridgeError::TxWithWrongReceiver);
    }
    if is_equal_ignore_case(&info.from, &token.dcrm_address) {
        return Err(BridgeError::TxWithWrongSender);
    }
    if !policy.check_swap_value(info.value) {
        return Err(BridgeError::TxWithWrongValue);
    }

    Ok(info)
}

/// Verify an ERC-20 swapin deposit. The stable path reads the transfer
/// log from the receipt; the unstable path decodes the transfer call
/// data. Either way the recipient must be the DCRM address and the bind
/// defaults to the depositor.
pub fn verify_swapin_erc20(
    tx_hash: &str,
    tx: &Transaction,
    status: Option<&TxStatus>,
    token: &TokenConfig,
    policy: &SwapValuePolicy,
) -> BridgeResult<TxSwapInfo> {
    let mut info = TxSwapInfo {
        hash: tx_hash.to_string(),
        height: tx.block_number.map(|n| n.as_u64()).unwrap_or(0),
        ..Default::default()
    };
    if let Some(to) = tx.to {
        info.to = fmt_address(to);
    }
    info.from = fmt_address(tx.from);

    let contract = token.contract_address().unwrap_or_default();
    if !is_equal_ignore_case(&info.to, contract) {
        return Err(BridgeError::TxWithWrongReceiver);
    }

    match status {
        Some(status) => {
            info.height = status.block_height;
            info.timestamp = status.block_time;
            check_stability(status, token.confirmations)?;
            let receipt = status.receipt.as_ref().ok_or(BridgeError::TxNotStable)?;
            let (_, value) =
                parse_erc20_transfer_logs(&receipt.logs, contract, &token.dcrm_address)?;
            info.value = value;
        }
        None => {
            let input = tx.input.as_ref();
            if input.len() < 68 || input[..4] != *ERC20_TRANSFER_FUNC_HASH {
                return Err(BridgeError::TxWithWrongInput);
            }
            let recipient = fmt_address(Address::from_slice(&input[16..36]));
            if !is_equal_ignore_case(&recipient, &token.dcrm_address) {
                return Err(BridgeError::TxWithWrongReceiver);
            }
            info.value = word_at(input, 36);
        }
    }

    info.bind = info.from.clone();

    if is_equal_ignore_case(&info.from, &token.dcrm_address) {
        return Err(BridgeError::TxWithWrongSender);
    }
    if !policy.check_swap_value(info.value) {
        return Err(BridgeError::TxWithWrongValue);
    }

    Ok(info)
}
