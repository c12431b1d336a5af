//! `LedgerClient` over an EVM JSON-RPC endpoint.
//!
//! Transactions are legacy (gas price) transactions, signed in-process with the
//! caller's key and broadcast raw; the key never leaves this process.

use std::time::Duration;

use alloy::eips::eip2718::Encodable2718;
use alloy::network::{Ethereum, EthereumWallet, ReceiptResponse as _, TransactionBuilder};
use alloy::primitives::{Address, Bytes, TxHash};
use alloy::providers::{Provider, RootProvider};
use alloy::rpc::types::{TransactionReceipt, TransactionRequest};
use alloy::signers::local::PrivateKeySigner;
use alloy::transports::TransportError;
use async_trait::async_trait;
use tracing::{debug, info};
use url::Url;

use crate::config::LedgerConfig;
use crate::error::LedgerError;
use crate::ledger::{LedgerClient, Receipt};
use crate::transaction::{CallTarget, PendingCall, TxDescriptor};

const NONCE_COLLISION_MARKERS: &[&str] = &[
    "nonce too low",
    "already known",
    "replacement transaction underpriced",
    "nonce has already been used",
];

pub struct RpcLedger {
    provider: RootProvider<Ethereum>,
    chain_id: u64,
    confirmation_timeout: Duration,
    poll_interval: Duration,
}

impl RpcLedger {
    /// Connects and pins the chain id used for signing.
    pub async fn connect(config: &LedgerConfig) -> Result<Self, LedgerError> {
        let url: Url = config
            .rpc_url
            .parse()
            .map_err(|e| LedgerError::Transport(format!("invalid rpc url {:?}: {e}", config.rpc_url)))?;
        let provider = RootProvider::<Ethereum>::new_http(url);
        let chain_id = provider.get_chain_id().await.map_err(transport)?;
        info!(chain_id, "connected to ledger endpoint");

        Ok(Self {
            provider,
            chain_id,
            confirmation_timeout: config.confirmation_timeout(),
            poll_interval: config.poll_interval(),
        })
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    fn request(call: &PendingCall) -> TransactionRequest {
        let request = TransactionRequest::default().with_from(call.from);
        match call.target {
            CallTarget::Create => request.with_deploy_code(call.input.clone()),
            CallTarget::Contract(address) => request.with_to(address).with_input(call.input.clone()),
        }
    }
}

#[async_trait]
impl LedgerClient for RpcLedger {
    async fn current_nonce(&self, account: Address) -> Result<u64, LedgerError> {
        self.provider.get_transaction_count(account).pending().await.map_err(transport)
    }

    async fn estimate_gas(&self, call: &PendingCall) -> Result<u64, LedgerError> {
        self.provider.estimate_gas(Self::request(call)).await.map_err(|e| match e.as_error_resp() {
            Some(payload) => LedgerError::Estimation(payload.message.to_string()),
            None => transport(e),
        })
    }

    async fn current_gas_price(&self) -> Result<u128, LedgerError> {
        self.provider.get_gas_price().await.map_err(transport)
    }

    async fn sign_and_send(
        &self,
        tx: &TxDescriptor,
        signer: &PrivateKeySigner,
    ) -> Result<TxHash, LedgerError> {
        let request = Self::request(&tx.call)
            .with_nonce(tx.nonce)
            .with_gas_limit(tx.gas_limit)
            .with_gas_price(tx.gas_price)
            .with_chain_id(self.chain_id);
        let wallet = EthereumWallet::from(signer.clone());
        let envelope = <TransactionRequest as TransactionBuilder<Ethereum>>::build(request, &wallet)
            .await
            .map_err(|e| LedgerError::Submission(format!("could not sign transaction: {e}")))?;

        let raw = envelope.encoded_2718();
        let pending = self.provider.send_raw_transaction(&raw).await.map_err(|e| {
            let message = match e.as_error_resp() {
                Some(payload) => payload.message.to_string(),
                None => return transport(e),
            };
            classify_rejection(tx.sender(), message)
        })?;
        let hash = *pending.tx_hash();
        debug!(tx_hash = %hash, nonce = tx.nonce, gas_limit = tx.gas_limit, "transaction broadcast");
        Ok(hash)
    }

    async fn await_confirmation(&self, hash: TxHash) -> Result<Receipt, LedgerError> {
        let poll = async {
            loop {
                match self.provider.get_transaction_receipt(hash).await {
                    Ok(Some(receipt)) => return to_receipt(receipt),
                    Ok(None) => {}
                    Err(e) => debug!(tx_hash = %hash, error = %e, "receipt poll failed"),
                }
                tokio::time::sleep(self.poll_interval).await;
            }
        };
        let receipt: Receipt = tokio::time::timeout(self.confirmation_timeout, poll)
            .await
            .map_err(|_| LedgerError::Timeout { hash, waited: self.confirmation_timeout })?;
        if !receipt.status {
            return Err(LedgerError::Reverted(hash));
        }
        Ok(receipt)
    }

    async fn call(&self, call: &PendingCall) -> Result<Bytes, LedgerError> {
        self.provider.call(Self::request(call)).await.map_err(|e| match e.as_error_resp() {
            Some(payload) => LedgerError::Decode(format!("call reverted: {}", payload.message)),
            None => transport(e),
        })
    }

    async fn is_connected(&self) -> bool {
        self.provider.get_block_number().await.is_ok()
    }
}

fn transport(err: TransportError) -> LedgerError {
    LedgerError::Transport(err.to_string())
}

/// Sorts a broadcast rejection into a nonce race or a plain rejection.
fn classify_rejection(account: Address, message: String) -> LedgerError {
    let lowered = message.to_ascii_lowercase();
    if NONCE_COLLISION_MARKERS.iter().any(|marker| lowered.contains(marker)) {
        LedgerError::NonceCollision { account, message }
    } else {
        LedgerError::Submission(message)
    }
}

fn to_receipt(receipt: TransactionReceipt) -> Receipt {
    Receipt {
        transaction_hash: receipt.transaction_hash,
        block_number: receipt.block_number,
        contract_address: receipt.contract_address,
        status: receipt.status(),
        gas_used: receipt.gas_used,
        logs: receipt.inner.logs().iter().map(|log| log.inner.clone()).collect(),
    }
}
