use thiserror::Error;

use crate::config::COIN;

// Number of decimals of one coin
pub const COIN_DECIMALS: usize = 8;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AmountError {
    #[error("Invalid amount '{0}'")]
    Invalid(String),
    #[error("Amount '{0}' has more than {COIN_DECIMALS} decimals")]
    TooPrecise(String),
    #[error("Amount '{0}' is negative")]
    Negative(String),
    #[error("Amount '{0}' overflows")]
    Overflow(String),
}

/// Format an amount of satoshis the way node RPCs print coin values.
pub fn format_coin(value: u64) -> String {
    format!(
        "{}.{:0width$}",
        value / COIN,
        value % COIN,
        width = COIN_DECIMALS
    )
}

/// Parse a decimal coin value into satoshis without going through floats.
///
/// Accepts the plain decimal form (`"49.99"`) and the exponent form
/// (`"1e-8"`) that JSON encoders emit for very small values.
pub fn parse_coin(value: &str) -> Result<u64, AmountError> {
    let value = value.trim();
    if value.starts_with('-') {
        return Err(AmountError::Negative(value.to_owned()));
    }

    let (mantissa, exponent) = match value.find(['e', 'E']) {
        Some(idx) => {
            let exponent: i32 = value[idx + 1..]
                .parse()
                .map_err(|_| AmountError::Invalid(value.to_owned()))?;
            (&value[..idx], exponent)
        }
        None => (value, 0),
    };

    let (int_part, frac_part) = match mantissa.split_once('.') {
        Some((i, f)) => (i, f),
        None => (mantissa, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return Err(AmountError::Invalid(value.to_owned()));
    }
    if !int_part.chars().all(|c| c.is_ascii_digit()) || !frac_part.chars().all(|c| c.is_ascii_digit()) {
        return Err(AmountError::Invalid(value.to_owned()));
    }

    // All digits as one integer, then shift the decimal point
    let digits = format!("{int_part}{frac_part}");
    let scale = COIN_DECIMALS as i32 - frac_part.len() as i32 + exponent;
    let digits = digits.trim_start_matches('0');
    if digits.is_empty() {
        return Ok(0);
    }

    let mut result: u64 = digits
        .parse()
        .map_err(|_| AmountError::Overflow(value.to_owned()))?;
    if scale >= 0 {
        for _ in 0..scale {
            result = result
                .checked_mul(10)
                .ok_or_else(|| AmountError::Overflow(value.to_owned()))?;
        }
    } else {
        for _ in 0..(-scale) {
            if result % 10 != 0 {
                return Err(AmountError::TooPrecise(value.to_owned()));
            }
            result /= 10;
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_coin() {
        assert_eq!(format_coin(COIN), "1.00000000");
        assert_eq!(format_coin(1), "0.00000001");
        assert_eq!(format_coin(50 * COIN + 12345), "50.00012345");
    }

    #[test]
    fn test_parse_coin() {
        assert_eq!(parse_coin("50").unwrap(), 50 * COIN);
        assert_eq!(parse_coin("50.0").unwrap(), 50 * COIN);
        assert_eq!(parse_coin("49.99997180").unwrap(), 4_999_997_180);
        assert_eq!(parse_coin("0.00000001").unwrap(), 1);
        assert_eq!(parse_coin("1e-8").unwrap(), 1);
        assert_eq!(parse_coin("1E-08").unwrap(), 1);
        assert_eq!(parse_coin("2.5e1").unwrap(), 25 * COIN);
        assert_eq!(parse_coin("0").unwrap(), 0);
    }

    #[test]
    fn test_parse_coin_rejects() {
        assert!(matches!(parse_coin("-1"), Err(AmountError::Negative(_))));
        assert!(matches!(
            parse_coin("0.000000001"),
            Err(AmountError::TooPrecise(_))
        ));
        assert!(matches!(parse_coin("abc"), Err(AmountError::Invalid(_))));
        assert!(matches!(parse_coin("."), Err(AmountError::Invalid(_))));
    }

    #[test]
    fn test_format_parse_roundtrip() {
        for value in [0, 1, 546, COIN - 1, 21_000_000 * COIN] {
            assert_eq!(parse_coin(&format_coin(value)).unwrap(), value);
        }
    }
}
