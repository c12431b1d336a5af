//! Agreement orchestration.
//!
//! Every mutating operation runs the same pipeline: estimate (fails before any
//! signature is produced), price, then under the signer's account lock fetch the
//! nonce, sign and broadcast, then release the lock and wait for the receipt.
//! Only nonce collisions are retried, rebuilding and re-signing with a fresh
//! nonce while reusing the first estimate and gas price.

use std::time::Duration;

use alloy::primitives::{Address, TxHash};
use alloy::signers::local::PrivateKeySigner;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::agreement::{Agreement, AgreementId, AgreementState, AgreementView, CreatedAgreement, NewAgreement, StatusChange};
use crate::contract::{decode_get_result, AgreementContract};
use crate::error::{AppError, AppResult, LedgerError};
use crate::ledger::{LedgerClient, LedgerHandle, Receipt};
use crate::retry::RetryPolicy;
use crate::transaction::PendingCall;
use crate::units;
use crate::wallet::AccountLocks;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeployedContract {
    pub contract_address: Address,
    pub transaction_hash: TxHash,
}

pub struct AgreementService {
    ledger: LedgerHandle,
    locks: AccountLocks,
    retry: RetryPolicy,
}

impl AgreementService {
    pub fn new(ledger: LedgerHandle) -> Self {
        let config = ledger.config();
        let retry = RetryPolicy::new(
            config.nonce_retry_attempts,
            Duration::from_millis(config.retry_base_delay_ms),
        );
        Self { ledger, locks: AccountLocks::new(), retry }
    }

    pub fn ledger(&self) -> &LedgerHandle {
        &self.ledger
    }

    pub async fn is_connected(&self) -> bool {
        match self.ledger.client().await {
            Ok(client) => client.is_connected().await,
            Err(e) => {
                warn!(error = %e, "ledger client unavailable");
                false
            }
        }
    }

    /// Deploys a fresh RentAgreement instance owned by nobody in particular;
    /// any number of agreements can live in it.
    pub async fn deploy_contract(&self, signer: &PrivateKeySigner) -> AppResult<DeployedContract> {
        let client = self.ledger.client().await?;
        let call = AgreementContract::deploy(signer.address())?;
        let receipt = self.submit(client.as_ref(), call, signer).await?;
        let contract_address = receipt
            .contract_address
            .ok_or_else(|| LedgerError::Decode("deployment receipt has no contract address".into()))?;

        info!(contract = %contract_address, tx_hash = %receipt.transaction_hash, "agreement contract deployed");
        Ok(DeployedContract { contract_address, transaction_hash: receipt.transaction_hash })
    }

    /// Records a new agreement and returns the id the ledger assigned to it.
    pub async fn create_agreement(
        &self,
        contract_address: Address,
        agreement: NewAgreement,
        signer: &PrivateKeySigner,
    ) -> AppResult<CreatedAgreement> {
        if agreement.landlord == agreement.tenant {
            return Err(AppError::validation("landlord and tenant must be different accounts"));
        }
        let rent_base_units = units::to_base_units(agreement.rent_amount)?;

        let client = self.ledger.client().await?;
        let contract = AgreementContract::at(contract_address);
        let call = contract.encode_create(
            signer.address(),
            agreement.landlord,
            agreement.tenant,
            &agreement.property_details,
            rent_base_units,
            agreement.duration,
        );

        let result = self.confirm_creation(client.as_ref(), &contract, call, signer).await;
        debug!(contract = %contract_address, state = ?AgreementState::after_submission(&result), "creation settled");
        let created = result?;
        info!(
            contract = %contract_address,
            agreement_id = %created.agreement_id,
            tx_hash = %created.transaction_hash,
            "agreement created"
        );
        Ok(created)
    }

    async fn confirm_creation(
        &self,
        client: &dyn LedgerClient,
        contract: &AgreementContract,
        call: PendingCall,
        signer: &PrivateKeySigner,
    ) -> Result<CreatedAgreement, LedgerError> {
        let receipt = self.submit(client, call, signer).await?;
        let agreement_id = contract.decode_creation_event(&receipt)?;
        Ok(CreatedAgreement {
            agreement_id,
            transaction_hash: receipt.transaction_hash,
            block_number: receipt.block_number,
        })
    }

    /// Current on-chain record, rent in base units. Never mutates the ledger.
    pub async fn agreement(&self, contract_address: Address, id: AgreementId) -> AppResult<Agreement> {
        let client = self.ledger.client().await?;
        let raw = client.call(&AgreementContract::at(contract_address).encode_get(id)).await?;
        let agreement = decode_get_result(&raw)?;
        if agreement.is_vacant() {
            return Err(AppError::not_found(format!(
                "agreement {id} does not exist in contract {contract_address}"
            )));
        }
        Ok(agreement)
    }

    /// Snapshot of an agreement for display.
    pub async fn verify_agreement(&self, contract_address: Address, id: AgreementId) -> AppResult<AgreementView> {
        let agreement = self.agreement(contract_address, id).await?;
        Ok(agreement.to_view(id)?)
    }

    /// Flips the agreement's active flag.
    pub async fn update_status(
        &self,
        contract_address: Address,
        id: AgreementId,
        is_active: bool,
        signer: &PrivateKeySigner,
    ) -> AppResult<StatusChange> {
        self.agreement(contract_address, id).await?;

        let client = self.ledger.client().await?;
        let contract = AgreementContract::at(contract_address);
        let call = contract.encode_update_status(signer.address(), id, is_active);
        let receipt = self.submit(client.as_ref(), call, signer).await?;
        let applied = contract.decode_status_event(&receipt, id)?;

        info!(agreement_id = %id, is_active = applied, tx_hash = %receipt.transaction_hash, "agreement status updated");
        Ok(StatusChange { agreement_id: id, transaction_hash: receipt.transaction_hash, is_active: applied })
    }

    async fn submit(
        &self,
        client: &dyn LedgerClient,
        call: PendingCall,
        signer: &PrivateKeySigner,
    ) -> Result<Receipt, LedgerError> {
        let account = call.from;
        let gas = client.estimate_gas(&call).await?;
        let estimated = call.with_estimate(gas);
        let gas_price = client.current_gas_price().await?;
        debug!(%account, estimated_gas = gas, gas_limit = estimated.gas_limit, gas_price, "call priced");

        let estimated = &estimated;
        let hash = self
            .retry
            .run("sign_and_send", |attempt| async move {
                let _guard = self.locks.acquire(account).await;
                let nonce = client.current_nonce(account).await?;
                let tx = estimated.to_transaction(nonce, gas_price);
                debug!(%account, nonce, attempt, "signing transaction");
                client.sign_and_send(&tx, signer).await
            })
            .await?;

        info!(tx_hash = %hash, %account, "transaction submitted, awaiting confirmation");
        client.await_confirmation(hash).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LedgerConfig, LedgerMode};
    use crate::contract::{encode_get_result, RentAgreement};
    use crate::ledger::MockLedgerClient;
    use alloy::primitives::{Log, B256, U256};
    use alloy::sol_types::SolEvent;
    use rust_decimal::Decimal;
    use std::sync::Arc;

    const CONTRACT: Address = Address::repeat_byte(0xc0);

    fn config() -> LedgerConfig {
        LedgerConfig { mode: LedgerMode::Dev, retry_base_delay_ms: 1, ..LedgerConfig::default() }
    }

    fn service(mock: MockLedgerClient) -> AgreementService {
        AgreementService::new(LedgerHandle::ready(config(), Arc::new(mock)))
    }

    fn new_agreement(duration: u64) -> NewAgreement {
        NewAgreement {
            landlord: Address::repeat_byte(0xaa),
            tenant: Address::repeat_byte(0xbb),
            property_details: "Unit 4B".into(),
            rent_amount: Decimal::new(150000, 2),
            duration,
        }
    }

    fn receipt(logs: Vec<Log>) -> Receipt {
        Receipt {
            transaction_hash: TxHash::repeat_byte(0x77),
            block_number: Some(9),
            contract_address: None,
            status: true,
            gas_used: 120_000,
            logs,
        }
    }

    #[tokio::test]
    async fn reverting_estimate_never_signs() {
        let mut mock = MockLedgerClient::new();
        mock.expect_estimate_gas()
            .times(1)
            .returning(|_| Err(LedgerError::Estimation("duration must be positive".into())));
        mock.expect_current_gas_price().never();
        mock.expect_current_nonce().never();
        mock.expect_sign_and_send().never();

        let err = service(mock)
            .create_agreement(CONTRACT, new_agreement(0), &PrivateKeySigner::random())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "estimation");
    }

    #[tokio::test]
    async fn gas_limit_carries_the_margin() {
        let mut mock = MockLedgerClient::new();
        mock.expect_estimate_gas().returning(|_| Ok(100_000));
        mock.expect_current_gas_price().returning(|| Ok(2_000_000_000));
        mock.expect_current_nonce().returning(|_| Ok(4));
        mock.expect_sign_and_send()
            .withf(|tx, _| tx.gas_limit == 120_000 && tx.nonce == 4 && tx.gas_price == 2_000_000_000)
            .times(1)
            .returning(|_, _| Ok(TxHash::repeat_byte(0x77)));
        mock.expect_await_confirmation().returning(|_| {
            let event = RentAgreement::AgreementCreated {
                agreementId: B256::repeat_byte(0x42),
                landlord: Address::repeat_byte(0xaa),
                tenant: Address::repeat_byte(0xbb),
            };
            Ok(receipt(vec![Log { address: CONTRACT, data: event.encode_log_data() }]))
        });

        let created = service(mock)
            .create_agreement(CONTRACT, new_agreement(365), &PrivateKeySigner::random())
            .await
            .unwrap();
        assert_eq!(created.agreement_id, AgreementId::new(B256::repeat_byte(0x42)));
        assert_eq!(created.transaction_hash, TxHash::repeat_byte(0x77));
        assert_eq!(created.block_number, Some(9));
    }

    #[tokio::test]
    async fn receipt_without_event_is_not_success() {
        let mut mock = MockLedgerClient::new();
        mock.expect_estimate_gas().returning(|_| Ok(100_000));
        mock.expect_current_gas_price().returning(|| Ok(1));
        mock.expect_current_nonce().returning(|_| Ok(0));
        mock.expect_sign_and_send().returning(|_, _| Ok(TxHash::repeat_byte(0x77)));
        mock.expect_await_confirmation().returning(|_| Ok(receipt(vec![])));

        let err = service(mock)
            .create_agreement(CONTRACT, new_agreement(30), &PrivateKeySigner::random())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "missing_event");
    }

    #[tokio::test]
    async fn nonce_collision_refetches_and_resigns() {
        let mut mock = MockLedgerClient::new();
        let mut nonces = vec![5u64, 6].into_iter();
        mock.expect_estimate_gas().times(1).returning(|_| Ok(50_000));
        mock.expect_current_gas_price().times(1).returning(|| Ok(1));
        mock.expect_current_nonce().times(2).returning(move |_| Ok(nonces.next().unwrap()));
        let mut seq = mockall::Sequence::new();
        mock.expect_sign_and_send()
            .withf(|tx, _| tx.nonce == 5)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|tx, _| {
                Err(LedgerError::NonceCollision { account: tx.sender(), message: "nonce too low".into() })
            });
        mock.expect_sign_and_send()
            .withf(|tx, _| tx.nonce == 6)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(TxHash::repeat_byte(0x01)));
        mock.expect_await_confirmation().returning(|hash| {
            let mut r = receipt(vec![]);
            r.transaction_hash = hash;
            r.contract_address = Some(CONTRACT);
            Ok(r)
        });

        let deployed = service(mock).deploy_contract(&PrivateKeySigner::random()).await.unwrap();
        assert_eq!(deployed.contract_address, CONTRACT);
        assert_eq!(deployed.transaction_hash, TxHash::repeat_byte(0x01));
    }

    #[tokio::test]
    async fn persistent_collisions_surface_as_retryable() {
        let mut mock = MockLedgerClient::new();
        mock.expect_estimate_gas().returning(|_| Ok(50_000));
        mock.expect_current_gas_price().returning(|| Ok(1));
        mock.expect_current_nonce().times(3).returning(|_| Ok(0));
        mock.expect_sign_and_send().times(3).returning(|tx, _| {
            Err(LedgerError::NonceCollision { account: tx.sender(), message: "already known".into() })
        });
        mock.expect_await_confirmation().never();

        let err = service(mock).deploy_contract(&PrivateKeySigner::random()).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn timeout_is_reported_as_failure() {
        let mut mock = MockLedgerClient::new();
        mock.expect_estimate_gas().returning(|_| Ok(50_000));
        mock.expect_current_gas_price().returning(|| Ok(1));
        mock.expect_current_nonce().returning(|_| Ok(0));
        mock.expect_sign_and_send().returning(|_, _| Ok(TxHash::repeat_byte(0x02)));
        mock.expect_await_confirmation()
            .returning(|hash| Err(LedgerError::Timeout { hash, waited: Duration::from_secs(120) }));

        let err = service(mock)
            .create_agreement(CONTRACT, new_agreement(30), &PrivateKeySigner::random())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "timeout");
    }

    #[tokio::test]
    async fn equal_parties_are_rejected_before_touching_the_ledger() {
        let mut agreement = new_agreement(30);
        agreement.tenant = agreement.landlord;
        let err = service(MockLedgerClient::new())
            .create_agreement(CONTRACT, agreement, &PrivateKeySigner::random())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn vacant_record_is_not_found() {
        let mut mock = MockLedgerClient::new();
        mock.expect_call().returning(|_| {
            Ok(encode_get_result(&Agreement {
                landlord: Address::ZERO,
                tenant: Address::ZERO,
                property_details: String::new(),
                rent_amount: U256::ZERO,
                duration: U256::ZERO,
                timestamp: U256::ZERO,
                is_active: false,
            }))
        });
        mock.expect_sign_and_send().never();

        let err = service(mock)
            .verify_agreement(CONTRACT, AgreementId::new(B256::repeat_byte(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn empty_call_result_is_a_decode_error() {
        let mut mock = MockLedgerClient::new();
        mock.expect_call().returning(|_| Ok(alloy::primitives::Bytes::new()));
        let err = service(mock)
            .verify_agreement(CONTRACT, AgreementId::new(B256::repeat_byte(1)))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "decode");
    }
}
