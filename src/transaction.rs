use alloy::primitives::{Address, Bytes};
use serde::{Deserialize, Serialize};

/// Gas headroom over the estimate, as a ratio (120%).
const GAS_MARGIN_NUMERATOR: u64 = 6;
const GAS_MARGIN_DENOMINATOR: u64 = 5;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallTarget {
    /// Contract creation; the input is init code.
    Create,
    Contract(Address),
}

/// A call as seen before it is priced: who sends it, where it goes, what it carries.
///
/// The same value is used to estimate, to build the signed transaction, and for
/// read-only calls, so the encoded input can never drift between those steps.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PendingCall {
    pub from: Address,
    pub target: CallTarget,
    pub input: Bytes,
}

impl PendingCall {
    pub fn new(from: Address, target: CallTarget, input: impl Into<Bytes>) -> Self {
        Self { from, target, input: input.into() }
    }

    pub fn deploy(from: Address, init_code: impl Into<Bytes>) -> Self {
        Self::new(from, CallTarget::Create, init_code)
    }

    pub fn call(from: Address, contract: Address, input: impl Into<Bytes>) -> Self {
        Self::new(from, CallTarget::Contract(contract), input)
    }

    /// Attaches a gas estimate, applying the safety margin.
    pub fn with_estimate(self, estimated_gas: u64) -> EstimatedCall {
        EstimatedCall {
            gas_limit: gas_limit_with_margin(estimated_gas),
            estimated_gas,
            call: self,
        }
    }
}

/// A call that passed estimation and carries its gas budget.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct EstimatedCall {
    pub call: PendingCall,
    pub estimated_gas: u64,
    pub gas_limit: u64,
}

impl EstimatedCall {
    pub fn to_transaction(&self, nonce: u64, gas_price: u128) -> TxDescriptor {
        TxDescriptor {
            call: self.call.clone(),
            nonce,
            gas_limit: self.gas_limit,
            gas_price,
        }
    }
}

/// Everything needed to sign a legacy transaction.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TxDescriptor {
    pub call: PendingCall,
    pub nonce: u64,
    pub gas_limit: u64,
    pub gas_price: u128,
}

impl TxDescriptor {
    pub fn sender(&self) -> Address {
        self.call.from
    }
}

fn gas_limit_with_margin(estimated_gas: u64) -> u64 {
    let scaled = u128::from(estimated_gas) * u128::from(GAS_MARGIN_NUMERATOR)
        / u128::from(GAS_MARGIN_DENOMINATOR);
    u64::try_from(scaled).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn margin_is_twenty_percent_truncated() {
        assert_eq!(gas_limit_with_margin(100_000), 120_000);
        assert_eq!(gas_limit_with_margin(21_001), 25_201);
        assert_eq!(gas_limit_with_margin(0), 0);
        assert_eq!(gas_limit_with_margin(u64::MAX), u64::MAX);
    }

    #[test]
    fn descriptor_keeps_the_estimated_call() {
        let from = Address::repeat_byte(0x11);
        let contract = Address::repeat_byte(0x22);
        let estimated = PendingCall::call(from, contract, vec![1u8, 2, 3]).with_estimate(50_000);

        let tx = estimated.to_transaction(7, 1_000_000_000);
        assert_eq!(tx.sender(), from);
        assert_eq!(tx.nonce, 7);
        assert_eq!(tx.gas_limit, 60_000);
        assert_eq!(tx.call.target, CallTarget::Contract(contract));
        assert_eq!(tx.call.input.as_ref(), &[1u8, 2, 3]);
    }
}
