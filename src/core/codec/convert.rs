//! Purpose: Map opaque source values onto the primitives column codecs accept.
//! Exports: `ValueConverter`, `SourceValue`, `GenericValueConverter`, `conversion_error`.
//! Role: Seam between a host application's value model and the column engine.
//! Invariants: Every getter returns `Ok(None)` for a null source value.
//! Invariants: Failures are `Serialization` errors naming the value and its type.
use std::fmt;

use time::{Date, PrimitiveDateTime, Time};

use super::decimal::Decimal;
use super::temporal;
use super::text::hex_encode;
use crate::core::error::{Error, ErrorKind};

pub trait ValueConverter {
    type Value: ?Sized;

    fn get_string(&self, value: &Self::Value) -> Result<Option<String>, Error>;
    fn get_integer(&self, value: &Self::Value) -> Result<Option<i64>, Error>;
    fn get_number(&self, value: &Self::Value) -> Result<Option<f64>, Error>;
    fn get_decimal(&self, value: &Self::Value) -> Result<Option<Decimal>, Error>;
    fn get_date(&self, value: &Self::Value) -> Result<Option<PrimitiveDateTime>, Error>;
    fn get_boolean(&self, value: &Self::Value) -> Result<Option<bool>, Error>;
    fn get_bytes(&self, value: &Self::Value) -> Result<Option<Vec<u8>>, Error>;
}

pub fn conversion_error(value: &dyn fmt::Display, type_name: &str, target: &str) -> Error {
    Error::new(ErrorKind::Serialization).with_message(format!(
        "value \"{value}\" of type {type_name} is not convertible to {target}"
    ))
}

#[derive(Clone, Debug, PartialEq)]
pub enum SourceValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Decimal(Decimal),
    Text(String),
    Bytes(Vec<u8>),
    Date(Date),
    DateTime(PrimitiveDateTime),
    Time(Time),
}

impl SourceValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Int(_) => "integer",
            Self::Float(_) => "float",
            Self::Decimal(_) => "decimal",
            Self::Text(_) => "string",
            Self::Bytes(_) => "bytes",
            Self::Date(_) => "date",
            Self::DateTime(_) => "datetime",
            Self::Time(_) => "time",
        }
    }

    fn fail(&self, target: &str) -> Error {
        conversion_error(self, self.type_name(), target)
    }
}

impl fmt::Display for SourceValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(value) => write!(f, "{value}"),
            Self::Int(value) => write!(f, "{value}"),
            Self::Float(value) => write!(f, "{value}"),
            Self::Decimal(value) => write!(f, "{value}"),
            Self::Text(value) => write!(f, "{value}"),
            Self::Bytes(value) => write!(f, "{}", hex_encode(value)),
            Self::Date(value) => write!(f, "{value}"),
            Self::DateTime(value) => write!(f, "{value}"),
            Self::Time(value) => write!(f, "{value}"),
        }
    }
}

/// Converter for `SourceValue`, with the usual lenient cross-type rules.
#[derive(Clone, Copy, Debug, Default)]
pub struct GenericValueConverter;

impl ValueConverter for GenericValueConverter {
    type Value = SourceValue;

    fn get_string(&self, value: &SourceValue) -> Result<Option<String>, Error> {
        Ok(Some(match value {
            SourceValue::Null => return Ok(None),
            SourceValue::Text(text) => text.clone(),
            SourceValue::Bool(_)
            | SourceValue::Int(_)
            | SourceValue::Float(_)
            | SourceValue::Decimal(_) => value.to_string(),
            SourceValue::Date(date) => temporal::format_date(*date)?,
            SourceValue::DateTime(datetime) => temporal::format_datetime(*datetime)?,
            SourceValue::Time(time) => temporal::format_time(*time)?,
            SourceValue::Bytes(_) => return Err(value.fail("String")),
        }))
    }

    fn get_integer(&self, value: &SourceValue) -> Result<Option<i64>, Error> {
        match value {
            SourceValue::Null => Ok(None),
            SourceValue::Int(value) => Ok(Some(*value)),
            SourceValue::Bool(flag) => Ok(Some(i64::from(*flag))),
            SourceValue::Float(number) if number.is_finite() => Ok(Some(number.trunc() as i64)),
            SourceValue::Decimal(decimal) => decimal
                .trunc_i64()
                .map(Some)
                .ok_or_else(|| value.fail("Integer")),
            SourceValue::Text(text) if text.trim().is_empty() => Ok(None),
            SourceValue::Text(text) => text
                .trim()
                .parse::<i64>()
                .map(Some)
                .map_err(|_| value.fail("Integer")),
            _ => Err(value.fail("Integer")),
        }
    }

    fn get_number(&self, value: &SourceValue) -> Result<Option<f64>, Error> {
        match value {
            SourceValue::Null => Ok(None),
            SourceValue::Int(value) => Ok(Some(*value as f64)),
            SourceValue::Float(number) => Ok(Some(*number)),
            SourceValue::Decimal(decimal) => Ok(Some(decimal.to_f64())),
            SourceValue::Text(text) if text.trim().is_empty() => Ok(None),
            SourceValue::Text(text) => text
                .trim()
                .parse::<f64>()
                .map(Some)
                .map_err(|_| value.fail("Number")),
            _ => Err(value.fail("Number")),
        }
    }

    fn get_decimal(&self, value: &SourceValue) -> Result<Option<Decimal>, Error> {
        match value {
            SourceValue::Null => Ok(None),
            SourceValue::Int(value) => Ok(Some(Decimal::from_integer(*value))),
            SourceValue::Float(number) => Decimal::from_f64(*number)
                .map(Some)
                .map_err(|_| value.fail("BigNumber")),
            SourceValue::Decimal(decimal) => Ok(Some(*decimal)),
            SourceValue::Text(text) if text.trim().is_empty() => Ok(None),
            SourceValue::Text(text) => Decimal::parse(text)
                .map(Some)
                .map_err(|_| value.fail("BigNumber")),
            _ => Err(value.fail("BigNumber")),
        }
    }

    fn get_date(&self, value: &SourceValue) -> Result<Option<PrimitiveDateTime>, Error> {
        match value {
            SourceValue::Null => Ok(None),
            SourceValue::Date(date) => Ok(Some(date.midnight())),
            SourceValue::DateTime(datetime) => Ok(Some(*datetime)),
            SourceValue::Time(time) => Ok(Some(PrimitiveDateTime::new(temporal::epoch(), *time))),
            SourceValue::Text(text) if text.trim().is_empty() => Ok(None),
            SourceValue::Text(text) => temporal::parse_any(text)
                .map(Some)
                .map_err(|_| value.fail("Date")),
            _ => Err(value.fail("Date")),
        }
    }

    fn get_boolean(&self, value: &SourceValue) -> Result<Option<bool>, Error> {
        match value {
            SourceValue::Null => Ok(None),
            SourceValue::Bool(flag) => Ok(Some(*flag)),
            SourceValue::Int(0) => Ok(Some(false)),
            SourceValue::Int(1) => Ok(Some(true)),
            SourceValue::Text(text) => match text.trim().to_ascii_lowercase().as_str() {
                "" => Ok(None),
                "true" | "y" | "yes" | "1" => Ok(Some(true)),
                "false" | "n" | "no" | "0" => Ok(Some(false)),
                _ => Err(value.fail("Boolean")),
            },
            _ => Err(value.fail("Boolean")),
        }
    }

    fn get_bytes(&self, value: &SourceValue) -> Result<Option<Vec<u8>>, Error> {
        match value {
            SourceValue::Null => Ok(None),
            SourceValue::Bytes(bytes) => Ok(Some(bytes.clone())),
            SourceValue::Text(text) => Ok(Some(text.as_bytes().to_vec())),
            _ => Err(value.fail("Binary")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{GenericValueConverter, SourceValue, ValueConverter};
    use crate::core::codec::decimal::Decimal;
    use crate::core::error::ErrorKind;
    use time::macros::{date, datetime};

    #[test]
    fn integer_conversions() {
        let conv = GenericValueConverter;
        assert_eq!(conv.get_integer(&SourceValue::Bool(true)).expect("bool"), Some(1));
        assert_eq!(conv.get_integer(&SourceValue::Float(-2.9)).expect("float"), Some(-2));
        assert_eq!(
            conv.get_integer(&SourceValue::Text(" 17 ".into())).expect("text"),
            Some(17)
        );
        assert_eq!(conv.get_integer(&SourceValue::Text(String::new())).expect("empty"), None);
        assert_eq!(conv.get_integer(&SourceValue::Null).expect("null"), None);
    }

    #[test]
    fn failure_names_value_and_type() {
        let conv = GenericValueConverter;
        let err = conv
            .get_integer(&SourceValue::Text("twelve".into()))
            .expect_err("not a number");
        assert_eq!(err.kind(), ErrorKind::Serialization);
        assert_eq!(
            err.message(),
            Some("value \"twelve\" of type string is not convertible to Integer")
        );
    }

    #[test]
    fn decimal_and_number_conversions() {
        let conv = GenericValueConverter;
        assert_eq!(
            conv.get_decimal(&SourceValue::Text("1.25".into())).expect("dec"),
            Some(Decimal::new(125, 2))
        );
        assert_eq!(
            conv.get_number(&SourceValue::Decimal(Decimal::new(5, 1))).expect("num"),
            Some(0.5)
        );
        assert!(conv.get_number(&SourceValue::Bool(true)).is_err());
    }

    #[test]
    fn date_conversions() {
        let conv = GenericValueConverter;
        assert_eq!(
            conv.get_date(&SourceValue::Date(date!(2001 - 02 - 03))).expect("date"),
            Some(datetime!(2001-02-03 00:00:00))
        );
        assert_eq!(
            conv.get_date(&SourceValue::Text("2001-02-03 04:05:06".into()))
                .expect("text"),
            Some(datetime!(2001-02-03 04:05:06))
        );
        assert!(conv.get_date(&SourceValue::Int(5)).is_err());
    }

    #[test]
    fn boolean_and_bytes_conversions() {
        let conv = GenericValueConverter;
        assert_eq!(conv.get_boolean(&SourceValue::Text("Yes".into())).expect("b"), Some(true));
        assert_eq!(conv.get_boolean(&SourceValue::Int(0)).expect("b"), Some(false));
        assert!(conv.get_boolean(&SourceValue::Int(7)).is_err());
        assert_eq!(
            conv.get_bytes(&SourceValue::Text("ab".into())).expect("bytes"),
            Some(b"ab".to_vec())
        );
        assert!(conv.get_string(&SourceValue::Bytes(vec![1])).is_err());
    }
}
