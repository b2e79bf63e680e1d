use alloy::primitives::U256;
use bigdecimal::BigDecimal;
use std::str::FromStr;

/// Largest power of ten that fits in a U256.
const MAX_DECIMALS: u8 = 77;

/// Render a raw token amount with `decimals` fractional digits.
///
/// Uses integer division and remainder only, so values of any size keep full
/// precision. Trailing fractional zeros are dropped: `1500000` with 6 decimals
/// becomes `"1.5"` and zero is always `"0"`.
pub fn format_amount(raw: U256, decimals: u8) -> String {
    if decimals == 0 || raw.is_zero() {
        return raw.to_string();
    }

    let decimals = decimals.min(MAX_DECIMALS);
    let divisor = U256::from(10u64).pow(U256::from(decimals));
    let whole = raw / divisor;
    let fraction = raw % divisor;

    if fraction.is_zero() {
        return whole.to_string();
    }

    let padded = format!("{:0>width$}", fraction.to_string(), width = decimals as usize);
    format!("{}.{}", whole, padded.trim_end_matches('0'))
}

/// Convert a raw on-chain integer to a `BigDecimal` for NUMERIC storage.
pub fn to_big_decimal(raw: U256) -> BigDecimal {
    // U256 decimal strings are always valid BigDecimal input
    BigDecimal::from_str(&raw.to_string()).unwrap_or_default()
}
