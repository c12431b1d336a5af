//! Typed binding for the RentAgreement contract.
//!
//! The ABI is declared once through `sol!`; the creation bytecode is embedded
//! from `contracts/RentAgreement.bin` and decoded on first use.

use alloy::primitives::{Address, Bytes, Log, U256};
use alloy::sol;
use alloy::sol_types::{SolCall, SolEvent, SolType};
use once_cell::sync::Lazy;

use crate::agreement::{Agreement, AgreementId};
use crate::error::LedgerError;
use crate::ledger::Receipt;
use crate::transaction::PendingCall;

sol! {
    #[derive(Debug, PartialEq, Eq)]
    interface RentAgreement {
        struct Agreement {
            address landlord;
            address tenant;
            string propertyDetails;
            uint256 rentAmount;
            uint256 duration;
            uint256 timestamp;
            bool isActive;
        }

        event AgreementCreated(bytes32 indexed agreementId, address indexed landlord, address indexed tenant);
        event AgreementStatusChanged(bytes32 indexed agreementId, bool status);

        function createAgreement(address landlord, address tenant, string propertyDetails, uint256 rentAmount, uint256 duration) external returns (bytes32);
        function getAgreement(bytes32 agreementId) external view returns (Agreement);
        function updateAgreementStatus(bytes32 agreementId, bool status) external;
    }
}

static BYTECODE_HEX: &str = include_str!("../contracts/RentAgreement.bin");

static INIT_CODE: Lazy<Result<Bytes, String>> = Lazy::new(|| {
    alloy::hex::decode(BYTECODE_HEX.trim())
        .map(Bytes::from)
        .map_err(|e| format!("embedded RentAgreement bytecode is not hex: {e}"))
});

/// Creation bytecode of the contract.
pub fn init_code() -> Result<Bytes, LedgerError> {
    INIT_CODE.clone().map_err(LedgerError::Decode)
}

impl From<RentAgreement::Agreement> for Agreement {
    fn from(raw: RentAgreement::Agreement) -> Self {
        Self {
            landlord: raw.landlord,
            tenant: raw.tenant,
            property_details: raw.propertyDetails,
            rent_amount: raw.rentAmount,
            duration: raw.duration,
            timestamp: raw.timestamp,
            is_active: raw.isActive,
        }
    }
}

impl From<&Agreement> for RentAgreement::Agreement {
    fn from(agreement: &Agreement) -> Self {
        Self {
            landlord: agreement.landlord,
            tenant: agreement.tenant,
            propertyDetails: agreement.property_details.clone(),
            rentAmount: agreement.rent_amount,
            duration: agreement.duration,
            timestamp: agreement.timestamp,
            isActive: agreement.is_active,
        }
    }
}

/// A deployed RentAgreement instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgreementContract {
    address: Address,
}

impl AgreementContract {
    pub fn at(address: Address) -> Self {
        Self { address }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn deploy(from: Address) -> Result<PendingCall, LedgerError> {
        Ok(PendingCall::deploy(from, init_code()?))
    }

    pub fn encode_create(
        &self,
        from: Address,
        landlord: Address,
        tenant: Address,
        property_details: &str,
        rent_amount_base_units: U256,
        duration: u64,
    ) -> PendingCall {
        let input = RentAgreement::createAgreementCall {
            landlord,
            tenant,
            propertyDetails: property_details.to_string(),
            rentAmount: rent_amount_base_units,
            duration: U256::from(duration),
        }
        .abi_encode();
        PendingCall::call(from, self.address, input)
    }

    pub fn encode_get(&self, id: AgreementId) -> PendingCall {
        let input = RentAgreement::getAgreementCall { agreementId: id.as_b256() }.abi_encode();
        PendingCall::call(Address::ZERO, self.address, input)
    }

    pub fn encode_update_status(&self, from: Address, id: AgreementId, status: bool) -> PendingCall {
        let input = RentAgreement::updateAgreementStatusCall { agreementId: id.as_b256(), status }
            .abi_encode();
        PendingCall::call(from, self.address, input)
    }

    /// The agreement id from the single `AgreementCreated` log this contract
    /// emitted in `receipt`.
    pub fn decode_creation_event(&self, receipt: &Receipt) -> Result<AgreementId, LedgerError> {
        let event = self.single_event::<RentAgreement::AgreementCreated>(receipt, "AgreementCreated")?;
        Ok(AgreementId::new(event.agreementId))
    }

    /// The new status from the `AgreementStatusChanged` log for `id`.
    pub fn decode_status_event(&self, receipt: &Receipt, id: AgreementId) -> Result<bool, LedgerError> {
        let event =
            self.single_event::<RentAgreement::AgreementStatusChanged>(receipt, "AgreementStatusChanged")?;
        if event.agreementId != id.as_b256() {
            return Err(LedgerError::Decode(format!(
                "status event names agreement {}, expected {id}",
                event.agreementId
            )));
        }
        Ok(event.status)
    }

    fn single_event<E: SolEvent>(&self, receipt: &Receipt, name: &'static str) -> Result<E, LedgerError> {
        let mut matching = receipt.logs.iter().filter(|log| self.emitted::<E>(log));
        let log = matching.next().ok_or(LedgerError::MissingEvent {
            hash: receipt.transaction_hash,
            event: name,
        })?;
        if matching.next().is_some() {
            return Err(LedgerError::Decode(format!(
                "receipt of {} carries more than one {name} event",
                receipt.transaction_hash
            )));
        }
        E::decode_log_data(&log.data).map_err(|e| LedgerError::Decode(format!("{name}: {e}")))
    }

    fn emitted<E: SolEvent>(&self, log: &Log) -> bool {
        log.address == self.address && log.data.topics().first() == Some(&E::SIGNATURE_HASH)
    }
}

/// Decodes the `(landlord, tenant, propertyDetails, rentAmount, duration,
/// timestamp, isActive)` tuple returned by `getAgreement`.
pub fn decode_get_result(raw: &[u8]) -> Result<Agreement, LedgerError> {
    <RentAgreement::Agreement as SolType>::abi_decode(raw)
        .map(Agreement::from)
        .map_err(|e| LedgerError::Decode(format!("getAgreement result: {e}")))
}

/// Encodes an agreement the way `getAgreement` returns it.
pub fn encode_get_result(agreement: &Agreement) -> Bytes {
    <RentAgreement::Agreement as SolType>::abi_encode(&RentAgreement::Agreement::from(agreement)).into()
}
