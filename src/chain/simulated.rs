use super::{
    AccountNonces, CallRequest, ChainClient, EventArgumentQuery, Receipt, SignedTransaction,
    TransactionIntent, TransactionRequest, TransactionStatus,
};
use crate::error::ChainError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SimTransaction {
    request: TransactionRequest,
    receipt: Option<Receipt>,
}

/// Test hooks (`reverting`, `rejecting`, `unavailable`) are not part of a
/// snapshot.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct SimState {
    accounts: Vec<String>,
    block: u64,
    mined_nonces: HashMap<String, u64>,
    mempool: Vec<String>,
    transactions: HashMap<String, SimTransaction>,
    /// Address → contract name.
    contracts: HashMap<String, String>,
    /// `Contract` reverts its deployment, `Contract.method` reverts calls.
    #[serde(skip)]
    reverting: HashSet<String>,
    /// Errors returned at submission time, keyed like `reverting`.
    #[serde(skip)]
    rejecting: HashMap<String, ChainError>,
    call_results: HashMap<String, Value>,
    event_arguments: HashMap<String, Value>,
    auto_mine: bool,
    #[serde(skip)]
    unavailable: bool,
    submissions: Vec<TransactionRequest>,
}

/// Deterministic in-process chain.
///
/// Transactions are mined on submission unless auto-mining is switched off,
/// in which case they wait in a mempool until [`SimulatedChain::mine_pending`]
/// or vanish with [`SimulatedChain::drop_pending`].
pub struct SimulatedChain {
    state: Mutex<SimState>,
    poll_interval: Duration,
}

fn derive_address(seed: &[u8]) -> String {
    let digest = Sha256::digest(seed);
    format!("0x{}", &hex::encode(digest)[..40])
}

impl SimulatedChain {
    pub fn with_accounts(count: usize) -> Self {
        let credentials: Vec<String> = (0..count).map(|index| format!("account-{index}")).collect();
        Self::from_credentials(&credentials)
    }

    /// Accounts derived from signing credentials, so the same config always
    /// yields the same addresses.
    pub fn from_credentials(credentials: &[String]) -> Self {
        let accounts = credentials
            .iter()
            .map(|credential| derive_address(credential.as_bytes()))
            .collect();
        Self {
            state: Mutex::new(SimState {
                accounts,
                auto_mine: true,
                ..SimState::default()
            }),
            poll_interval: Duration::from_millis(5),
        }
    }

    /// Chain state as JSON, for carrying a simulated network across
    /// processes.
    pub fn snapshot(&self) -> serde_json::Result<String> {
        serde_json::to_string(&*self.state())
    }

    pub fn restore(snapshot: &str) -> serde_json::Result<Self> {
        Ok(Self {
            state: Mutex::new(serde_json::from_str(snapshot)?),
            poll_interval: Duration::from_millis(5),
        })
    }

    fn state(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn account(&self, index: usize) -> Option<String> {
        self.state().accounts.get(index).cloned()
    }

    /// `"Token"` reverts the deployment of `Token`; `"Token.mint"` reverts
    /// calls to `mint` on any `Token`.
    pub fn revert_on(&self, target: &str) {
        self.state().reverting.insert(target.to_string());
    }

    pub fn clear_reverts(&self) {
        self.state().reverting.clear();
    }

    /// Refuse submissions for `target` with `error` (nothing is broadcast).
    pub fn reject_on(&self, target: &str, error: ChainError) {
        self.state().rejecting.insert(target.to_string(), error);
    }

    pub fn set_call_result(&self, contract: &str, method: &str, value: Value) {
        self.state()
            .call_results
            .insert(format!("{contract}.{method}"), value);
    }

    pub fn set_event_argument(&self, event: &str, argument: &str, value: Value) {
        self.state()
            .event_arguments
            .insert(format!("{event}.{argument}"), value);
    }

    pub fn set_auto_mine(&self, enabled: bool) {
        self.state().auto_mine = enabled;
    }

    /// Every RPC fails while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state().unavailable = unavailable;
    }

    pub fn mine_pending(&self) {
        let mut state = self.state();
        let pending = std::mem::take(&mut state.mempool);
        for hash in pending {
            state.mine(&hash);
        }
    }

    /// Forget every mempool transaction, as if the node evicted them.
    pub fn drop_pending(&self) {
        let mut state = self.state();
        let pending = std::mem::take(&mut state.mempool);
        for hash in pending {
            state.transactions.remove(&hash);
        }
    }

    pub fn pending_count(&self) -> usize {
        self.state().mempool.len()
    }

    /// Every accepted submission, in order.
    pub fn submissions(&self) -> Vec<TransactionRequest> {
        self.state().submissions.clone()
    }

    pub fn submission_count(&self) -> usize {
        self.state().submissions.len()
    }

    pub fn contract_name(&self, address: &str) -> Option<String> {
        self.state().contracts.get(address).cloned()
    }

    fn check_available(&self) -> Result<(), ChainError> {
        if self.state().unavailable {
            return Err(ChainError::Rpc("connection refused".into()));
        }
        Ok(())
    }
}

impl SimState {
    fn pending_nonce(&self, account: &str) -> u64 {
        let latest = self.mined_nonces.get(account).copied().unwrap_or_default();
        let queued = self
            .mempool
            .iter()
            .filter_map(|hash| self.transactions.get(hash))
            .filter(|tx| tx.request.from == account)
            .count();
        latest + queued as u64
    }

    fn target_of(&self, intent: &TransactionIntent) -> String {
        match intent {
            TransactionIntent::Deploy { contract, .. } => contract.clone(),
            TransactionIntent::Call { to, method, .. } => {
                let name = self.contracts.get(to).map_or(to.as_str(), String::as_str);
                format!("{name}.{method}")
            }
            TransactionIntent::Send { to, .. } => to.clone(),
        }
    }

    fn mine(&mut self, hash: &str) {
        let Some(tx) = self.transactions.get(hash).cloned() else {
            return;
        };
        self.block += 1;
        *self.mined_nonces.entry(tx.request.from.clone()).or_default() += 1;

        let target = self.target_of(&tx.request.intent);
        let mut receipt = Receipt {
            tx_hash: hash.to_string(),
            block_number: self.block,
            success: true,
            contract_address: None,
            revert_reason: None,
        };

        let call_target_missing = matches!(
            &tx.request.intent,
            TransactionIntent::Call { to, .. } if !self.contracts.contains_key(to)
        );
        if self.reverting.contains(&target) || call_target_missing {
            receipt.success = false;
            receipt.revert_reason = Some(format!("{target} reverted"));
        } else if let TransactionIntent::Deploy { contract, .. } = &tx.request.intent {
            let seed = format!("{}:{}", tx.request.from, tx.request.nonce);
            let address = derive_address(seed.as_bytes());
            self.contracts.insert(address.clone(), contract.clone());
            receipt.contract_address = Some(address);
        }

        if let Some(stored) = self.transactions.get_mut(hash) {
            stored.receipt = Some(receipt);
        }
    }
}

#[async_trait]
impl ChainClient for SimulatedChain {
    async fn accounts(&self) -> Result<Vec<String>, ChainError> {
        self.check_available()?;
        Ok(self.state().accounts.clone())
    }

    async fn nonces(&self, account: &str) -> Result<AccountNonces, ChainError> {
        self.check_available()?;
        let state = self.state();
        Ok(AccountNonces {
            latest: state.mined_nonces.get(account).copied().unwrap_or_default(),
            pending: state.pending_nonce(account),
        })
    }

    async fn block_number(&self) -> Result<u64, ChainError> {
        self.check_available()?;
        Ok(self.state().block)
    }

    async fn sign_transaction(&self, request: &TransactionRequest) -> Result<SignedTransaction, ChainError> {
        self.check_available()?;
        if !self.state().accounts.contains(&request.from) {
            return Err(ChainError::Rpc(format!("unknown account {}", request.from)));
        }
        let encoded = serde_json::to_vec(request)
            .map_err(|error| ChainError::Rpc(format!("encode transaction: {error}")))?;
        Ok(SignedTransaction {
            hash: format!("0x{}", hex::encode(Sha256::digest(&encoded))),
            request: request.clone(),
            raw: hex::encode(&encoded),
        })
    }

    async fn send_raw_transaction(&self, signed: &SignedTransaction) -> Result<(), ChainError> {
        self.check_available()?;
        let request = &signed.request;
        let mut state = self.state();
        let target = state.target_of(&request.intent);
        if let Some(error) = state.rejecting.get(&target) {
            return Err(error.clone());
        }
        let expected = state.pending_nonce(&request.from);
        if request.nonce != expected {
            return Err(ChainError::NonceMismatch {
                account: request.from.clone(),
                expected,
                actual: request.nonce,
            });
        }

        state.submissions.push(request.clone());
        state.transactions.insert(
            signed.hash.clone(),
            SimTransaction {
                request: request.clone(),
                receipt: None,
            },
        );
        if state.auto_mine {
            state.mine(&signed.hash);
        } else {
            state.mempool.push(signed.hash.clone());
        }
        Ok(())
    }

    async fn transaction_status(&self, tx_hash: &str) -> Result<TransactionStatus, ChainError> {
        self.check_available()?;
        let state = self.state();
        Ok(match state.transactions.get(tx_hash) {
            None => TransactionStatus::Unknown,
            Some(SimTransaction { receipt: None, .. }) => TransactionStatus::Pending,
            Some(SimTransaction {
                receipt: Some(receipt),
                ..
            }) => TransactionStatus::Mined(receipt.clone()),
        })
    }

    async fn static_call(&self, request: &CallRequest) -> Result<Value, ChainError> {
        self.check_available()?;
        let state = self.state();
        let contract = state
            .contracts
            .get(&request.to)
            .ok_or_else(|| ChainError::NotFound(format!("no contract at {}", request.to)))?;
        let key = format!("{contract}.{}", request.method);
        if state.reverting.contains(&key) {
            return Err(ChainError::Reverted(format!("{key} reverted")));
        }

        let value = state
            .call_results
            .get(&key)
            .cloned()
            .unwrap_or_else(|| json!(format!("{key}()")));
        Ok(match (&request.output, value) {
            (Some(output), Value::Object(mut fields)) => fields.remove(output).unwrap_or(Value::Null),
            (_, value) => value,
        })
    }

    async fn event_argument(&self, query: &EventArgumentQuery) -> Result<Value, ChainError> {
        self.check_available()?;
        let state = self.state();
        let mined = state
            .transactions
            .get(&query.tx_hash)
            .and_then(|tx| tx.receipt.as_ref())
            .is_some_and(|receipt| receipt.success);
        if !mined {
            return Err(ChainError::NotFound(format!(
                "no successful transaction {}",
                query.tx_hash
            )));
        }
        if !state.contracts.contains_key(&query.emitter) {
            return Err(ChainError::NotFound(format!("no contract at {}", query.emitter)));
        }

        let key = format!("{}.{}", query.event, query.argument);
        Ok(state
            .event_arguments
            .get(&key)
            .cloned()
            .unwrap_or_else(|| json!(format!("{key}#{}", query.event_index))))
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }
}
