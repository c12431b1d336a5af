use std::fmt;
use std::str::FromStr;

use alloy::primitives::{Address, TxHash, B256, U256};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::LedgerError;
use crate::units;

/// Ledger-assigned agreement handle, taken from the `AgreementCreated` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AgreementId(B256);

impl AgreementId {
    pub fn new(raw: B256) -> Self {
        Self(raw)
    }

    pub fn as_b256(&self) -> B256 {
        self.0
    }
}

impl fmt::Display for AgreementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for AgreementId {
    type Err = String;

    /// Accepts both `0x`-prefixed and bare hex.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let hex = s.strip_prefix("0x").unwrap_or(s);
        B256::from_str(hex)
            .map(Self)
            .map_err(|e| format!("invalid agreement id {s:?}: {e}"))
    }
}

impl Serialize for AgreementId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for AgreementId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// On-chain agreement record, amounts in base units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Agreement {
    pub landlord: Address,
    pub tenant: Address,
    pub property_details: String,
    pub rent_amount: U256,
    pub duration: U256,
    pub timestamp: U256,
    pub is_active: bool,
}

impl Agreement {
    /// The contract answers unknown ids with an all-zero record.
    pub fn is_vacant(&self) -> bool {
        self.landlord == Address::ZERO && self.timestamp.is_zero()
    }

    /// Presentation form: rent in the display unit, integers narrowed.
    pub fn to_view(&self, id: AgreementId) -> Result<AgreementView, LedgerError> {
        // Amounts written by other clients may carry more digits than a Decimal holds.
        let rent_amount = units::to_display(self.rent_amount).ok();
        let duration = narrow(self.duration, "duration")?;
        let timestamp = narrow(self.timestamp, "timestamp")?;
        let created_at = i64::try_from(timestamp)
            .ok()
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0));

        Ok(AgreementView {
            agreement_id: id,
            landlord: self.landlord,
            tenant: self.tenant,
            property_details: self.property_details.clone(),
            rent_amount,
            rent_amount_base_units: self.rent_amount.to_string(),
            duration,
            timestamp,
            created_at,
            is_active: self.is_active,
        })
    }
}

fn narrow(value: U256, field: &str) -> Result<u64, LedgerError> {
    u64::try_from(value).map_err(|_| LedgerError::Decode(format!("{field} {value} exceeds u64")))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgreementView {
    pub agreement_id: AgreementId,
    pub landlord: Address,
    pub tenant: Address,
    pub property_details: String,
    /// `None` when the amount has more significant digits than a `Decimal`
    /// can carry; `rent_amount_base_units` is always exact.
    pub rent_amount: Option<Decimal>,
    pub rent_amount_base_units: String,
    pub duration: u64,
    pub timestamp: u64,
    pub created_at: Option<DateTime<Utc>>,
    pub is_active: bool,
}

/// Input to agreement creation, rent in the display unit.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAgreement {
    pub landlord: Address,
    pub tenant: Address,
    pub property_details: String,
    pub rent_amount: Decimal,
    pub duration: u64,
}

/// Outcome of a confirmed `createAgreement`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreatedAgreement {
    pub agreement_id: AgreementId,
    pub transaction_hash: TxHash,
    pub block_number: Option<u64>,
}

/// Outcome of a confirmed `updateAgreementStatus`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusChange {
    pub agreement_id: AgreementId,
    pub transaction_hash: TxHash,
    pub is_active: bool,
}

/// Where an agreement stands from the caller's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgreementState {
    NonExistent,
    /// Submitted, not yet confirmed.
    Pending,
    Active,
    Inactive,
    /// Reverted or timed out; never written to the ledger.
    Failed,
}

impl AgreementState {
    pub fn from_record(agreement: Option<&Agreement>) -> Self {
        match agreement {
            None => Self::NonExistent,
            Some(a) if a.is_vacant() => Self::NonExistent,
            Some(a) if a.is_active => Self::Active,
            Some(_) => Self::Inactive,
        }
    }

    pub fn after_submission(result: &Result<CreatedAgreement, LedgerError>) -> Self {
        match result {
            Ok(_) => Self::Active,
            Err(LedgerError::Reverted(_) | LedgerError::Timeout { .. }) => Self::Failed,
            Err(_) => Self::NonExistent,
        }
    }
}
