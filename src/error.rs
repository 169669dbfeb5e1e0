//! Error types for the bridge coordinator

use thiserror::Error;

/// Main error type for the bridge
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Gateway error: {0}")]
    Gateway(String),

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    // Verification errors, in the order the checks run.
    #[error("tx not found")]
    TxNotFound,

    #[error("tx with wrong receipt")]
    TxWithWrongReceipt,

    #[error("tx not stable")]
    TxNotStable,

    #[error("tx with wrong receiver")]
    TxWithWrongReceiver,

    #[error("tx with wrong sender")]
    TxWithWrongSender,

    #[error("tx with wrong input data")]
    TxWithWrongInput,

    #[error("tx with wrong value")]
    TxWithWrongValue,

    #[error("tx with wrong memo")]
    TxWithWrongMemo,

    #[error("message hash mismatch")]
    MsgHashMismatch,

    #[error("wrong raw tx param")]
    WrongRawTx,

    #[error("Signing error: {0}")]
    Sign(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Swap {tx_id} not found")]
    SwapNotFound { tx_id: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BridgeError {
    /// Transient failures are retried on the next worker tick; everything
    /// else is classified by the caller (park, fail, or abort).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BridgeError::Gateway(_)
                | BridgeError::Timeout { .. }
                | BridgeError::Database(_)
                | BridgeError::TxNotStable
        )
    }

    /// Verification failures that park the record for operator recall
    /// instead of failing it outright.
    pub fn is_recallable(&self) -> bool {
        matches!(self, BridgeError::TxWithWrongMemo)
    }
}

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(BridgeError::TxNotStable.is_transient());
        assert!(BridgeError::Gateway("connection refused".into()).is_transient());
        assert!(!BridgeError::TxWithWrongReceiver.is_transient());
        assert!(!BridgeError::TxWithWrongMemo.is_transient());
        assert!(BridgeError::TxWithWrongMemo.is_recallable());
    }
}
