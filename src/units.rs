//! Display amounts (`Decimal`) to base units (`U256`) and back, never through floats.

use alloy::primitives::U256;
use rust_decimal::Decimal;
use thiserror::Error;

/// Decimal places between the display unit and the base unit.
pub const BASE_UNIT_DECIMALS: u32 = 18;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UnitError {
    #[error("amount must not be negative: {0}")]
    Negative(Decimal),

    #[error("amount {0} is finer than one base unit ({BASE_UNIT_DECIMALS} decimal places)")]
    TooPrecise(Decimal),

    #[error("base amount {0} does not fit in a display decimal")]
    Overflow(U256),
}

/// Converts a display amount into base units.
pub fn to_base_units(amount: Decimal) -> Result<U256, UnitError> {
    if amount.is_sign_negative() && !amount.is_zero() {
        return Err(UnitError::Negative(amount));
    }
    let normalized = amount.normalize();
    let scale = normalized.scale();
    if scale > BASE_UNIT_DECIMALS {
        return Err(UnitError::TooPrecise(amount));
    }
    // |mantissa| < 2^96 and the factor is at most 10^18, so the product fits.
    let mantissa = normalized.mantissa().unsigned_abs();
    let factor = 10u128.pow(BASE_UNIT_DECIMALS - scale);
    Ok(U256::from(mantissa) * U256::from(factor))
}

/// Converts base units back into a normalized display amount.
pub fn to_display(base: U256) -> Result<Decimal, UnitError> {
    let unit = U256::from(10u128.pow(BASE_UNIT_DECIMALS));
    let whole = base / unit;
    let mut fraction = base % unit;
    let mut scale = BASE_UNIT_DECIMALS;
    let ten = U256::from(10u8);
    while scale > 0 && fraction % ten == U256::ZERO {
        fraction /= ten;
        scale -= 1;
    }

    let shift = U256::from(10u128.pow(scale));
    let mantissa = whole
        .checked_mul(shift)
        .and_then(|w| w.checked_add(fraction))
        .ok_or(UnitError::Overflow(base))?;
    let mantissa = i128::try_from(mantissa).map_err(|_| UnitError::Overflow(base))?;
    Decimal::try_from_i128_with_scale(mantissa, scale)
        .map(|d| d.normalize())
        .map_err(|_| UnitError::Overflow(base))
}
