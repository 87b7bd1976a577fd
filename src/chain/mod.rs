mod simulated;

pub use simulated::SimulatedChain;

use crate::error::ChainError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

/// Nonces of one account: `latest` counts mined transactions, `pending`
/// additionally counts the ones waiting in the mempool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccountNonces {
    pub latest: u64,
    pub pending: u64,
}

/// What a transaction does, with every argument already resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransactionIntent {
    Deploy {
        contract: String,
        args: Vec<Value>,
        /// Library name → linked address.
        libraries: BTreeMap<String, String>,
    },
    Call {
        to: String,
        method: String,
        args: Vec<Value>,
    },
    Send {
        to: String,
        data: Option<String>,
    },
}

/// Signed-transaction request. Signing belongs to the client: `from` names
/// one of its accounts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRequest {
    pub from: String,
    pub nonce: u64,
    pub value: u128,
    pub intent: TransactionIntent,
}

/// A request signed for broadcast. The hash is fixed at signing, before any
/// node has seen the transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedTransaction {
    pub hash: String,
    pub request: TransactionRequest,
    /// Hex-encoded payload handed to the node.
    pub raw: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub tx_hash: String,
    pub block_number: u64,
    pub success: bool,
    pub contract_address: Option<String>,
    pub revert_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Never seen, or dropped from the mempool.
    Unknown,
    Pending,
    Mined(Receipt),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallRequest {
    pub from: Option<String>,
    pub to: String,
    pub method: String,
    pub args: Vec<Value>,
    pub output: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventArgumentQuery {
    pub tx_hash: String,
    pub emitter: String,
    pub event: String,
    pub argument: String,
    pub event_index: usize,
}

/// Chain collaborator: RPC transport plus signing.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Signing accounts, in configured order.
    async fn accounts(&self) -> Result<Vec<String>, ChainError>;

    async fn nonces(&self, account: &str) -> Result<AccountNonces, ChainError>;

    async fn block_number(&self) -> Result<u64, ChainError>;

    /// Sign without broadcasting. Broadcasting the result later yields a
    /// transaction with exactly `hash`.
    async fn sign_transaction(&self, request: &TransactionRequest) -> Result<SignedTransaction, ChainError>;

    /// Broadcast; resolves once the node accepted the transaction.
    async fn send_raw_transaction(&self, signed: &SignedTransaction) -> Result<(), ChainError>;

    /// Sign and broadcast in one step, for callers that journal nothing in
    /// between.
    async fn send_transaction(&self, request: &TransactionRequest) -> Result<String, ChainError> {
        let signed = self.sign_transaction(request).await?;
        self.send_raw_transaction(&signed).await?;
        Ok(signed.hash)
    }

    async fn transaction_status(&self, tx_hash: &str) -> Result<TransactionStatus, ChainError>;

    async fn static_call(&self, request: &CallRequest) -> Result<Value, ChainError>;

    async fn event_argument(&self, query: &EventArgumentQuery) -> Result<Value, ChainError>;

    fn poll_interval(&self) -> Duration {
        Duration::from_secs(1)
    }

    /// Poll until the transaction is mined with `confirmations` blocks on
    /// top (counting its own). Never gives up on its own: callers bound it
    /// with a timeout.
    async fn wait_for_receipt(&self, tx_hash: &str, confirmations: u64) -> Result<Receipt, ChainError> {
        let confirmations = confirmations.max(1);
        loop {
            if let TransactionStatus::Mined(receipt) = self.transaction_status(tx_hash).await? {
                let head = self.block_number().await?;
                if head.saturating_sub(receipt.block_number) + 1 >= confirmations {
                    return Ok(receipt);
                }
            }
            tokio::time::sleep(self.poll_interval()).await;
        }
    }
}
