//! Ledger client abstraction.
//!
//! [`LedgerClient`] is the seam between agreement orchestration and whatever
//! actually holds the chain: a remote JSON-RPC endpoint ([`rpc::RpcLedger`]) or
//! the in-process [`crate::blockchain::DevChain`].

pub mod rpc;

use std::sync::Arc;

use alloy::primitives::{Address, Bytes, Log, TxHash};
use alloy::signers::local::PrivateKeySigner;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::info;

use crate::blockchain::DevChain;
use crate::config::{LedgerConfig, LedgerMode};
use crate::error::LedgerError;
use crate::transaction::{PendingCall, TxDescriptor};

/// Confirmation record of an included transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    pub transaction_hash: TxHash,
    pub block_number: Option<u64>,
    pub contract_address: Option<Address>,
    pub status: bool,
    pub gas_used: u64,
    pub logs: Vec<Log>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Next unused nonce of `account`, counting pending transactions.
    async fn current_nonce(&self, account: Address) -> Result<u64, LedgerError>;

    /// Simulates the call; `Estimation` if it would revert.
    async fn estimate_gas(&self, call: &PendingCall) -> Result<u64, LedgerError>;

    async fn current_gas_price(&self) -> Result<u128, LedgerError>;

    /// Signs locally and broadcasts.
    async fn sign_and_send(
        &self,
        tx: &TxDescriptor,
        signer: &PrivateKeySigner,
    ) -> Result<TxHash, LedgerError>;

    /// Waits for inclusion; `Timeout` past the configured bound, `Reverted` on
    /// failed execution.
    async fn await_confirmation(&self, hash: TxHash) -> Result<Receipt, LedgerError>;

    /// Read-only call against current state.
    async fn call(&self, call: &PendingCall) -> Result<Bytes, LedgerError>;

    async fn is_connected(&self) -> bool;
}

/// Process-wide ledger client, built on first use.
///
/// Concurrent first users share a single construction; later users get the
/// cached client.
pub struct LedgerHandle {
    config: LedgerConfig,
    client: OnceCell<Arc<dyn LedgerClient>>,
}

impl LedgerHandle {
    pub fn new(config: LedgerConfig) -> Self {
        Self { config, client: OnceCell::new() }
    }

    /// A handle around an already built client.
    pub fn ready(config: LedgerConfig, client: Arc<dyn LedgerClient>) -> Self {
        Self { config, client: OnceCell::new_with(Some(client)) }
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub async fn client(&self) -> Result<Arc<dyn LedgerClient>, LedgerError> {
        self.client
            .get_or_try_init(|| async {
                let client: Arc<dyn LedgerClient> = match self.config.mode {
                    LedgerMode::Rpc => Arc::new(rpc::RpcLedger::connect(&self.config).await?),
                    LedgerMode::Dev => Arc::new(DevChain::new(&self.config)),
                };
                info!(mode = ?self.config.mode, "ledger client initialized");
                Ok(client)
            })
            .await
            .cloned()
    }

    pub fn is_initialized(&self) -> bool {
        self.client.initialized()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dev_config() -> LedgerConfig {
        LedgerConfig { mode: LedgerMode::Dev, ..LedgerConfig::default() }
    }

    #[tokio::test]
    async fn handle_builds_the_client_once() {
        let handle = Arc::new(LedgerHandle::new(dev_config()));
        assert!(!handle.is_initialized());

        let (a, b) = tokio::join!(handle.client(), handle.client());
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(Arc::ptr_eq(&a, &b));
        assert!(handle.is_initialized());
        assert!(a.is_connected().await);
    }

    #[tokio::test]
    async fn ready_handle_returns_the_given_client() {
        let client: Arc<dyn LedgerClient> = Arc::new(DevChain::new(&dev_config()));
        let handle = LedgerHandle::ready(dev_config(), client.clone());
        assert!(handle.is_initialized());
        assert!(Arc::ptr_eq(&handle.client().await.unwrap(), &client));
    }
}
