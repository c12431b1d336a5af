//! In-process ledger.
//!
//! `DevChain` keeps accounts, a mempool, SHA-256 linked blocks and receipts in
//! memory and runs the RentAgreement contract natively, so the whole agreement
//! lifecycle can run without a network (`ledger.mode = "dev"`) and under test.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use alloy::primitives::{keccak256, Address, Bytes, Log, TxHash, B256, U256};
use alloy::signers::local::PrivateKeySigner;
use alloy::sol_types::{SolEvent, SolInterface, SolValue};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::agreement::Agreement;
use crate::config::LedgerConfig;
use crate::contract::{encode_get_result, RentAgreement};
use crate::error::LedgerError;
use crate::ledger::{LedgerClient, Receipt};
use crate::transaction::{CallTarget, PendingCall, TxDescriptor};
use crate::utils::hash_data;

pub const DEV_CHAIN_ID: u64 = 1337;

const INTRINSIC_GAS: u64 = 21_000;
const CREATE_GAS: u64 = 32_000;
const INPUT_BYTE_GAS: u64 = 16;
const STORE_AGREEMENT_GAS: u64 = 110_000;
const STORE_WORD_GAS: u64 = 20_000;
const UPDATE_STATUS_GAS: u64 = 10_000;
const READ_GAS: u64 = 8_000;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Block {
    pub index: u64,
    pub timestamp: i64,
    pub transactions: Vec<TxHash>,
    pub previous_hash: String,
    pub hash: String,
}

impl Block {
    pub fn new(index: u64, timestamp: i64, transactions: Vec<TxHash>, previous_hash: String) -> Self {
        let hash = hash_data(&format!("{}{}{:?}{}", index, timestamp, transactions, previous_hash));
        Self { index, timestamp, transactions, previous_hash, hash }
    }
}

#[derive(Debug, Clone)]
struct PendingTx {
    hash: TxHash,
    tx: TxDescriptor,
}

/// Storage of one deployed RentAgreement instance.
#[derive(Debug, Default, Clone)]
struct AgreementStore {
    agreements: HashMap<B256, Agreement>,
    created: u64,
}

/// State change produced by a successful execution, applied only on inclusion.
#[derive(Debug)]
enum Effect {
    None,
    Deploy(Address),
    Insert { contract: Address, id: B256, agreement: Agreement },
    SetStatus { contract: Address, id: B256, status: bool },
}

#[derive(Debug)]
struct Execution {
    gas_used: u64,
    output: Bytes,
    logs: Vec<Log>,
    contract_address: Option<Address>,
    effect: Effect,
}

struct ChainState {
    chain: Vec<Block>,
    nonces: HashMap<Address, u64>,
    mempool: Vec<PendingTx>,
    receipts: HashMap<TxHash, Receipt>,
    contracts: HashMap<Address, AgreementStore>,
}

pub struct DevChain {
    state: Mutex<ChainState>,
    gas_price: u128,
    block_gas_limit: u64,
    auto_mine: bool,
    confirmation_timeout: Duration,
    poll_interval: Duration,
    submissions: AtomicU64,
}

impl DevChain {
    pub fn new(config: &LedgerConfig) -> Self {
        let genesis_block = Block::new(0, Utc::now().timestamp(), vec![], "0".to_string());
        Self {
            state: Mutex::new(ChainState {
                chain: vec![genesis_block],
                nonces: HashMap::new(),
                mempool: Vec::new(),
                receipts: HashMap::new(),
                contracts: HashMap::new(),
            }),
            gas_price: config.dev_gas_price_wei,
            block_gas_limit: config.dev_block_gas_limit,
            auto_mine: true,
            confirmation_timeout: config.confirmation_timeout(),
            poll_interval: config.poll_interval(),
            submissions: AtomicU64::new(0),
        }
    }

    /// With auto-mining off, transactions wait in the mempool for `mine_block`.
    pub fn with_auto_mine(mut self, auto_mine: bool) -> Self {
        self.auto_mine = auto_mine;
        self
    }

    fn state(&self) -> MutexGuard<'_, ChainState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn chain(&self) -> Vec<Block> {
        self.state().chain.clone()
    }

    pub fn pending_transactions(&self) -> usize {
        self.state().mempool.len()
    }

    /// Transactions accepted into the mempool so far.
    pub fn submitted_count(&self) -> u64 {
        self.submissions.load(Ordering::SeqCst)
    }

    pub fn agreement_count(&self, contract: Address) -> u64 {
        self.state().contracts.get(&contract).map_or(0, |store| store.created)
    }

    /// Includes every pending transaction in a new block.
    pub fn mine_block(&self) -> Option<Block> {
        let mut state = self.state();
        Self::mine(&mut state)
    }

    fn mine(state: &mut ChainState) -> Option<Block> {
        if state.mempool.is_empty() {
            return None;
        }
        let pending = std::mem::take(&mut state.mempool);
        let previous_block = state.chain.last()?.clone();
        let index = previous_block.index + 1;
        let timestamp = Utc::now().timestamp().max(previous_block.timestamp);

        let mut hashes = Vec::with_capacity(pending.len());
        for PendingTx { hash, tx } in pending {
            let receipt = Self::include(state, hash, &tx, index, timestamp);
            debug!(tx_hash = %hash, status = receipt.status, gas_used = receipt.gas_used, "transaction included");
            state.receipts.insert(hash, receipt);
            hashes.push(hash);
        }

        let new_block = Block::new(index, timestamp, hashes, previous_block.hash.clone());
        info!(index = new_block.index, hash = %new_block.hash, txs = new_block.transactions.len(), "block mined");
        state.chain.push(new_block.clone());
        Some(new_block)
    }

    fn include(state: &mut ChainState, hash: TxHash, tx: &TxDescriptor, block: u64, timestamp: i64) -> Receipt {
        let outcome = Self::execute(&state.contracts, &tx.call, tx.nonce, timestamp);
        let mut receipt = Receipt {
            transaction_hash: hash,
            block_number: Some(block),
            contract_address: None,
            status: false,
            gas_used: tx.gas_limit,
            logs: Vec::new(),
        };
        match outcome {
            Ok(execution) if execution.gas_used <= tx.gas_limit => {
                receipt.status = true;
                receipt.gas_used = execution.gas_used;
                receipt.contract_address = execution.contract_address;
                receipt.logs = execution.logs;
                Self::apply(&mut state.contracts, execution.effect);
            }
            Ok(execution) => {
                debug!(tx_hash = %hash, needed = execution.gas_used, limit = tx.gas_limit, "out of gas");
            }
            Err(reason) => {
                debug!(tx_hash = %hash, %reason, "execution reverted");
            }
        }
        receipt
    }

    fn apply(contracts: &mut HashMap<Address, AgreementStore>, effect: Effect) {
        match effect {
            Effect::None => {}
            Effect::Deploy(address) => {
                contracts.insert(address, AgreementStore::default());
            }
            Effect::Insert { contract, id, agreement } => {
                if let Some(store) = contracts.get_mut(&contract) {
                    store.agreements.insert(id, agreement);
                    store.created += 1;
                }
            }
            Effect::SetStatus { contract, id, status } => {
                if let Some(agreement) =
                    contracts.get_mut(&contract).and_then(|store| store.agreements.get_mut(&id))
                {
                    agreement.is_active = status;
                }
            }
        }
    }

    /// Runs `call` against `contracts` without touching them. `Err` carries the
    /// revert reason.
    fn execute(
        contracts: &HashMap<Address, AgreementStore>,
        call: &PendingCall,
        nonce: u64,
        timestamp: i64,
    ) -> Result<Execution, String> {
        let base_gas = INTRINSIC_GAS + INPUT_BYTE_GAS * call.input.len() as u64;
        let contract = match call.target {
            CallTarget::Create => {
                let address = call.from.create(nonce);
                return Ok(Execution {
                    gas_used: base_gas + CREATE_GAS,
                    output: Bytes::new(),
                    logs: Vec::new(),
                    contract_address: Some(address),
                    effect: Effect::Deploy(address),
                });
            }
            CallTarget::Contract(address) => address,
        };
        let store = contracts
            .get(&contract)
            .ok_or_else(|| format!("no contract deployed at {contract}"))?;
        let decoded = RentAgreement::RentAgreementCalls::abi_decode(&call.input)
            .map_err(|_| "unknown function selector".to_string())?;

        match decoded {
            RentAgreement::RentAgreementCalls::createAgreement(c) => {
                if c.landlord == Address::ZERO || c.tenant == Address::ZERO {
                    return Err("landlord and tenant are required".into());
                }
                if c.duration.is_zero() {
                    return Err("duration must be positive".into());
                }
                let stamp = U256::from(timestamp.max(0) as u64);
                let id = keccak256(
                    (c.landlord, c.tenant, c.propertyDetails.clone(), stamp, U256::from(store.created))
                        .abi_encode_packed(),
                );
                let words = (c.propertyDetails.len() as u64).div_ceil(32);
                let event = RentAgreement::AgreementCreated {
                    agreementId: id,
                    landlord: c.landlord,
                    tenant: c.tenant,
                };
                let agreement = Agreement {
                    landlord: c.landlord,
                    tenant: c.tenant,
                    property_details: c.propertyDetails,
                    rent_amount: c.rentAmount,
                    duration: c.duration,
                    timestamp: stamp,
                    is_active: true,
                };
                Ok(Execution {
                    gas_used: base_gas + STORE_AGREEMENT_GAS + STORE_WORD_GAS * words,
                    output: id.abi_encode().into(),
                    logs: vec![Log { address: contract, data: event.encode_log_data() }],
                    contract_address: None,
                    effect: Effect::Insert { contract, id, agreement },
                })
            }
            RentAgreement::RentAgreementCalls::updateAgreementStatus(c) => {
                if !store.agreements.contains_key(&c.agreementId) {
                    return Err("agreement does not exist".into());
                }
                let event = RentAgreement::AgreementStatusChanged {
                    agreementId: c.agreementId,
                    status: c.status,
                };
                Ok(Execution {
                    gas_used: base_gas + UPDATE_STATUS_GAS,
                    output: Bytes::new(),
                    logs: vec![Log { address: contract, data: event.encode_log_data() }],
                    contract_address: None,
                    effect: Effect::SetStatus { contract, id: c.agreementId, status: c.status },
                })
            }
            RentAgreement::RentAgreementCalls::getAgreement(c) => {
                let agreement = store.agreements.get(&c.agreementId).cloned().unwrap_or(Agreement {
                    landlord: Address::ZERO,
                    tenant: Address::ZERO,
                    property_details: String::new(),
                    rent_amount: U256::ZERO,
                    duration: U256::ZERO,
                    timestamp: U256::ZERO,
                    is_active: false,
                });
                Ok(Execution {
                    gas_used: base_gas + READ_GAS,
                    output: encode_get_result(&agreement),
                    logs: Vec::new(),
                    contract_address: None,
                    effect: Effect::None,
                })
            }
        }
    }

    fn transaction_hash(tx: &TxDescriptor) -> TxHash {
        let mut preimage = Vec::with_capacity(20 + 8 + 8 + tx.call.input.len());
        preimage.extend_from_slice(tx.sender().as_slice());
        preimage.extend_from_slice(&tx.nonce.to_be_bytes());
        preimage.extend_from_slice(&DEV_CHAIN_ID.to_be_bytes());
        preimage.extend_from_slice(&tx.call.input);
        keccak256(preimage)
    }
}

#[async_trait]
impl LedgerClient for DevChain {
    async fn current_nonce(&self, account: Address) -> Result<u64, LedgerError> {
        Ok(self.state().nonces.get(&account).copied().unwrap_or(0))
    }

    async fn estimate_gas(&self, call: &PendingCall) -> Result<u64, LedgerError> {
        let state = self.state();
        let nonce = state.nonces.get(&call.from).copied().unwrap_or(0);
        let execution = Self::execute(&state.contracts, call, nonce, Utc::now().timestamp())
            .map_err(LedgerError::Estimation)?;
        Ok(execution.gas_used)
    }

    async fn current_gas_price(&self) -> Result<u128, LedgerError> {
        Ok(self.gas_price)
    }

    async fn sign_and_send(
        &self,
        tx: &TxDescriptor,
        signer: &PrivateKeySigner,
    ) -> Result<TxHash, LedgerError> {
        let sender = tx.sender();
        if signer.address() != sender {
            return Err(LedgerError::Submission(format!(
                "signer {} does not match sender {sender}",
                signer.address()
            )));
        }
        if tx.gas_limit > self.block_gas_limit {
            return Err(LedgerError::Submission("exceeds block gas limit".into()));
        }

        let mut state = self.state();
        let expected = state.nonces.get(&sender).copied().unwrap_or(0);
        if tx.nonce < expected {
            return Err(LedgerError::NonceCollision {
                account: sender,
                message: format!("nonce too low: next nonce {expected}, tx nonce {}", tx.nonce),
            });
        }
        if tx.nonce > expected {
            return Err(LedgerError::Submission(format!(
                "nonce gap: next nonce {expected}, tx nonce {}",
                tx.nonce
            )));
        }

        let hash = Self::transaction_hash(tx);
        state.nonces.insert(sender, expected + 1);
        state.mempool.push(PendingTx { hash, tx: tx.clone() });
        self.submissions.fetch_add(1, Ordering::SeqCst);
        debug!(tx_hash = %hash, account = %sender, nonce = tx.nonce, "transaction accepted");

        if self.auto_mine {
            Self::mine(&mut state);
        }
        Ok(hash)
    }

    async fn await_confirmation(&self, hash: TxHash) -> Result<Receipt, LedgerError> {
        let poll = async {
            loop {
                let included = self.state().receipts.get(&hash).cloned();
                if let Some(receipt) = included {
                    return receipt;
                }
                tokio::time::sleep(self.poll_interval).await;
            }
        };
        let receipt = tokio::time::timeout(self.confirmation_timeout, poll)
            .await
            .map_err(|_| LedgerError::Timeout { hash, waited: self.confirmation_timeout })?;
        if !receipt.status {
            return Err(LedgerError::Reverted(hash));
        }
        Ok(receipt)
    }

    async fn call(&self, call: &PendingCall) -> Result<Bytes, LedgerError> {
        let state = self.state();
        if let CallTarget::Contract(address) = call.target {
            // Calls into an address without code return nothing, as on a real chain.
            if !state.contracts.contains_key(&address) {
                return Ok(Bytes::new());
            }
        }
        let nonce = state.nonces.get(&call.from).copied().unwrap_or(0);
        Self::execute(&state.contracts, call, nonce, Utc::now().timestamp())
            .map(|execution| execution.output)
            .map_err(|reason| LedgerError::Decode(format!("call reverted: {reason}")))
    }

    async fn is_connected(&self) -> bool {
        true
    }
}
