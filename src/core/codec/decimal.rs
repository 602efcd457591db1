// Exact fixed-point decimal used between converters and decimal columns.
use std::fmt;

use crate::core::error::{Error, ErrorKind};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Decimal {
    unscaled: i128,
    scale: u32,
}

impl Decimal {
    pub fn new(unscaled: i128, scale: u32) -> Self {
        Self { unscaled, scale }
    }

    pub fn from_integer(value: i64) -> Self {
        Self::new(value as i128, 0)
    }

    pub fn unscaled(&self) -> i128 {
        self.unscaled
    }

    pub fn scale(&self) -> u32 {
        self.scale
    }

    pub fn parse(text: &str) -> Result<Self, Error> {
        let invalid = || {
            Error::new(ErrorKind::Serialization)
                .with_message(format!("\"{text}\" is not a decimal number"))
        };
        let trimmed = text.trim();
        let (negative, digits) = match trimmed.as_bytes().first() {
            Some(b'-') => (true, &trimmed[1..]),
            Some(b'+') => (false, &trimmed[1..]),
            _ => (false, trimmed),
        };
        let (whole, fraction) = match digits.split_once('.') {
            Some((whole, fraction)) => (whole, fraction),
            None => (digits, ""),
        };
        if whole.is_empty() && fraction.is_empty() {
            return Err(invalid());
        }
        let mut unscaled: i128 = 0;
        for byte in whole.bytes().chain(fraction.bytes()) {
            if !byte.is_ascii_digit() {
                return Err(invalid());
            }
            unscaled = unscaled
                .checked_mul(10)
                .and_then(|value| value.checked_add(i128::from(byte - b'0')))
                .ok_or_else(invalid)?;
        }
        if negative {
            unscaled = -unscaled;
        }
        Ok(Self::new(unscaled, fraction.len() as u32))
    }

    pub fn from_f64(value: f64) -> Result<Self, Error> {
        if !value.is_finite() {
            return Err(Error::new(ErrorKind::Serialization)
                .with_message(format!("{value} has no decimal representation")));
        }
        Self::parse(&value.to_string())
    }

    /// Returns the unscaled value at `scale`, truncating extra fraction digits toward zero.
    pub fn rescale(&self, scale: u32) -> Option<i128> {
        if scale >= self.scale {
            let factor = 10i128.checked_pow(scale - self.scale)?;
            self.unscaled.checked_mul(factor)
        } else {
            let factor = 10i128.checked_pow(self.scale - scale)?;
            Some(self.unscaled / factor)
        }
    }

    pub fn to_f64(&self) -> f64 {
        self.to_string().parse().unwrap_or(f64::NAN)
    }

    pub fn trunc_i64(&self) -> Option<i64> {
        self.rescale(0).and_then(|value| i64::try_from(value).ok())
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.unscaled < 0 { "-" } else { "" };
        let digits = self.unscaled.unsigned_abs().to_string();
        if self.scale == 0 {
            return write!(f, "{sign}{digits}");
        }
        let scale = self.scale as usize;
        let padded = format!("{digits:0>width$}", width = scale + 1);
        let (whole, fraction) = padded.split_at(padded.len() - scale);
        write!(f, "{sign}{whole}.{fraction}")
    }
}
