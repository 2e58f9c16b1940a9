use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Decimals of the settlement token (matches the 6-decimal ERC20 unit)
pub const DECIMALS: u32 = 6;

const SCALE: i64 = 1_000_000;

/// Signed fixed-point amount in micro-units of the settlement token
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Amount(i64);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AmountParseError {
    #[error("empty amount")]
    Empty,
    #[error("invalid digit in amount: {0}")]
    InvalidDigit(String),
    #[error("more than {DECIMALS} decimal places: {0}")]
    TooPrecise(String),
    #[error("amount out of range: {0}")]
    OutOfRange(String),
}

impl Amount {
    pub const ZERO: Amount = Amount(0);

    pub const fn from_micros(micros: i64) -> Self {
        Self(micros)
    }

    /// Whole token units, e.g. `Amount::from_units(10)` is 10.000000
    pub const fn from_units(units: i64) -> Self {
        Self(units * SCALE)
    }

    pub const fn micros(self) -> i64 {
        self.0
    }

    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    pub fn checked_add(self, rhs: Amount) -> Option<Amount> {
        self.0.checked_add(rhs.0).map(Amount)
    }

    pub fn checked_sub(self, rhs: Amount) -> Option<Amount> {
        self.0.checked_sub(rhs.0).map(Amount)
    }

    pub fn checked_neg(self) -> Option<Amount> {
        self.0.checked_neg().map(Amount)
    }

    pub fn saturating_add(self, rhs: Amount) -> Amount {
        Amount(self.0.saturating_add(rhs.0))
    }

    pub fn saturating_mul(self, factor: u64) -> Amount {
        let factor = i64::try_from(factor).unwrap_or(i64::MAX);
        Amount(self.0.saturating_mul(factor))
    }

    /// Token base units for ERC20 calls (negative amounts have no on-chain form)
    pub fn to_token_units(self) -> Option<ethers::types::U256> {
        u64::try_from(self.0).ok().map(ethers::types::U256::from)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        let scale = SCALE as u64;
        write!(f, "{}{}.{:06}", sign, abs / scale, abs % scale)
    }
}

impl FromStr for Amount {
    type Err = AmountParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(AmountParseError::Empty);
        }

        let (negative, digits) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s),
        };

        let (whole, frac) = digits.split_once('.').unwrap_or((digits, ""));
        if whole.is_empty() && frac.is_empty() {
            return Err(AmountParseError::Empty);
        }
        if !whole.chars().all(|c| c.is_ascii_digit()) || !frac.chars().all(|c| c.is_ascii_digit()) {
            return Err(AmountParseError::InvalidDigit(s.to_string()));
        }
        if frac.len() > DECIMALS as usize {
            return Err(AmountParseError::TooPrecise(s.to_string()));
        }

        let out_of_range = || AmountParseError::OutOfRange(s.to_string());

        let whole: i64 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| out_of_range())?
        };
        let mut frac_micros: i64 = 0;
        for (i, c) in frac.chars().enumerate() {
            let digit = i64::from(c as u8 - b'0');
            frac_micros += digit * 10i64.pow(DECIMALS - 1 - i as u32);
        }

        let micros = whole
            .checked_mul(SCALE)
            .and_then(|w| w.checked_add(frac_micros))
            .ok_or_else(out_of_range)?;

        Ok(Amount(if negative { -micros } else { micros }))
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let amount: Amount = "4.5".parse().unwrap();
        assert_eq!(amount.micros(), 4_500_000);
        assert_eq!(amount.to_string(), "4.500000");

        let negative: Amount = "-0.000001".parse().unwrap();
        assert_eq!(negative.micros(), -1);
        assert_eq!(negative.to_string(), "-0.000001");

        assert_eq!(Amount::from_units(10).to_string(), "10.000000");
    }

    #[test]
    fn test_rejects_malformed() {
        assert_eq!("".parse::<Amount>(), Err(AmountParseError::Empty));
        assert!(matches!("1.0000001".parse::<Amount>(), Err(AmountParseError::TooPrecise(_))));
        assert!(matches!("1e6".parse::<Amount>(), Err(AmountParseError::InvalidDigit(_))));
        assert!(matches!(
            "99999999999999999999".parse::<Amount>(),
            Err(AmountParseError::OutOfRange(_))
        ));
    }

    #[test]
    fn test_serde_as_decimal_string() {
        let json = serde_json::to_string(&Amount::from_micros(4_500_000)).unwrap();
        assert_eq!(json, "\"4.500000\"");
        let back: Amount = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Amount::from_micros(4_500_000));
    }

    #[test]
    fn test_checked_arithmetic() {
        let max = Amount::from_micros(i64::MAX);
        assert!(max.checked_add(Amount::from_micros(1)).is_none());
        assert_eq!(
            Amount::from_units(10).checked_sub(Amount::from_micros(4_500_000)),
            Some(Amount::from_micros(5_500_000))
        );
        assert!(Amount::from_micros(-1).to_token_units().is_none());
    }
}
