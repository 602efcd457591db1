//! Purpose: Typed column codecs for the binary and delimited-text record formats.
//! Exports: `Column`, `ColumnKind`, `ColumnSpec`, converters, charsets, buffers.
//! Role: Leaf layer under `core::record`; knows nothing about pipes or SQL.
//! Invariants: A column's kind is fixed at construction; only its value changes.
//! Invariants: Binary widths never exceed `ColumnKind::max_binary_width`.
//! Invariants: Null columns still encode a zero value of the kind's width.
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::error::{Error, ErrorKind};

pub mod buffer;
mod column;
pub mod convert;
pub mod decimal;
pub mod nulls;
pub mod temporal;
pub mod text;

pub use buffer::{ByteReader, ByteWriter, Endian};
pub use column::Column;
pub use convert::{GenericValueConverter, SourceValue, ValueConverter};
pub use decimal::Decimal;
pub use nulls::NullIndicator;
pub use text::Charset;

pub const MAX_DECIMAL_PRECISION: u8 = 18;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ColumnKind {
    TinyInt,
    SmallInt,
    MediumInt,
    Int,
    BigInt,
    Float,
    Double,
    Decimal { precision: u8, scale: u8 },
    Char(u16),
    Varchar(u16),
    Binary(u16),
    Varbinary(u16),
    Date,
    DateAsInt,
    DateTime,
    Time,
}

impl ColumnKind {
    pub fn decimal(precision: u8, scale: u8) -> Result<Self, Error> {
        if precision == 0 || precision > MAX_DECIMAL_PRECISION || scale > precision {
            return Err(Error::new(ErrorKind::Usage).with_message(format!(
                "DECIMAL({precision},{scale}) needs 1 <= precision <= {MAX_DECIMAL_PRECISION} and scale <= precision"
            )));
        }
        Ok(Self::Decimal { precision, scale })
    }

    /// Storage width of a fixed decimal for the given precision.
    pub fn decimal_width(precision: u8) -> usize {
        match precision {
            0..=2 => 1,
            3..=4 => 2,
            5..=9 => 4,
            _ => 8,
        }
    }

    pub fn max_binary_width(&self) -> usize {
        match *self {
            Self::TinyInt => 1,
            Self::SmallInt => 2,
            Self::MediumInt => 3,
            Self::Int | Self::Float | Self::DateAsInt => 4,
            Self::BigInt | Self::Double => 8,
            Self::Decimal { precision, .. } => Self::decimal_width(precision),
            Self::Char(len) | Self::Binary(len) => usize::from(len),
            Self::Varchar(len) | Self::Varbinary(len) => 2 + usize::from(len),
            Self::Date => temporal::DATE_WIDTH,
            Self::DateTime => temporal::DATETIME_WIDTH,
            Self::Time => temporal::TIME_WIDTH,
        }
    }

    pub fn needs_enclosure(&self) -> bool {
        matches!(
            self,
            Self::Char(_) | Self::Varchar(_) | Self::Binary(_) | Self::Varbinary(_)
        )
    }

    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            Self::TinyInt | Self::SmallInt | Self::MediumInt | Self::Int | Self::BigInt
        )
    }

    /// Inclusive range of an integer kind.
    pub fn integer_range(&self) -> Option<(i64, i64)> {
        match self {
            Self::TinyInt => Some((i8::MIN.into(), i8::MAX.into())),
            Self::SmallInt => Some((i16::MIN.into(), i16::MAX.into())),
            Self::MediumInt => Some((-(1 << 23), (1 << 23) - 1)),
            Self::Int => Some((i32::MIN.into(), i32::MAX.into())),
            Self::BigInt => Some((i64::MIN, i64::MAX)),
            _ => None,
        }
    }

    /// Maps a database column description onto a codec. `DATE` becomes
    /// `DateAsInt` when `binary` is set and the ASCII `Date` form otherwise.
    pub fn from_spec(spec: &ColumnSpec, binary: bool) -> Result<Self, Error> {
        let type_name = spec.type_name.trim().to_ascii_uppercase();
        let base = type_name
            .split(|ch: char| ch == '(' || ch.is_whitespace())
            .next()
            .unwrap_or("");
        let length = || -> Result<u16, Error> {
            match u16::try_from(spec.precision) {
                Ok(0) | Err(_) => Err(Error::new(ErrorKind::Usage).with_message(format!(
                    "column {} of type {} needs a length between 1 and {}",
                    spec.name,
                    spec.type_name,
                    u16::MAX
                ))),
                Ok(len) => Ok(len),
            }
        };
        Ok(match base {
            "TINYINT" | "BOOL" | "BOOLEAN" | "BIT" => Self::TinyInt,
            "SMALLINT" => Self::SmallInt,
            "MEDIUMINT" => Self::MediumInt,
            "INT" | "INTEGER" => Self::Int,
            "BIGINT" => Self::BigInt,
            "FLOAT" | "REAL" => Self::Float,
            "DOUBLE" => Self::Double,
            "DECIMAL" | "NUMERIC" | "DEC" => {
                let precision = u8::try_from(spec.precision).unwrap_or(u8::MAX);
                let scale = u8::try_from(spec.scale).unwrap_or(u8::MAX);
                Self::decimal(precision, scale).map_err(|err| {
                    let message = format!(
                        "column {}: {}",
                        spec.name,
                        err.message().unwrap_or("invalid decimal")
                    );
                    err.with_message(message)
                })?
            }
            "CHAR" => Self::Char(length()?),
            "VARCHAR" | "TEXT" | "LONGVARCHAR" => Self::Varchar(length()?),
            "BINARY" => Self::Binary(length()?),
            "VARBINARY" => Self::Varbinary(length()?),
            "DATE" if binary => Self::DateAsInt,
            "DATE" => Self::Date,
            "DATETIME" | "TIMESTAMP" => Self::DateTime,
            "TIME" => Self::Time,
            _ => {
                return Err(Error::new(ErrorKind::Usage).with_message(format!(
                    "column {} has unsupported type {}",
                    spec.name, spec.type_name
                )));
            }
        })
    }
}

impl fmt::Display for ColumnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TinyInt => write!(f, "TINYINT"),
            Self::SmallInt => write!(f, "SMALLINT"),
            Self::MediumInt => write!(f, "MEDIUMINT"),
            Self::Int => write!(f, "INT"),
            Self::BigInt => write!(f, "BIGINT"),
            Self::Float => write!(f, "FLOAT"),
            Self::Double => write!(f, "DOUBLE"),
            Self::Decimal { precision, scale } => write!(f, "DECIMAL({precision},{scale})"),
            Self::Char(len) => write!(f, "CHAR({len})"),
            Self::Varchar(len) => write!(f, "VARCHAR({len})"),
            Self::Binary(len) => write!(f, "BINARY({len})"),
            Self::Varbinary(len) => write!(f, "VARBINARY({len})"),
            Self::Date => write!(f, "DATE"),
            Self::DateAsInt => write!(f, "DATE(int)"),
            Self::DateTime => write!(f, "DATETIME"),
            Self::Time => write!(f, "TIME"),
        }
    }
}

/// One entry of the ordered column metadata a load target reports.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ColumnSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub precision: u32,
    #[serde(default)]
    pub scale: u32,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            precision: 0,
            scale: 0,
        }
    }

    pub fn with_precision(mut self, precision: u32, scale: u32) -> Self {
        self.precision = precision;
        self.scale = scale;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::{ColumnKind, ColumnSpec};
    use crate::core::error::ErrorKind;

    #[test]
    fn decimal_width_follows_precision() {
        for (precision, width) in [(1, 1), (2, 1), (3, 2), (4, 2), (5, 4), (9, 4), (10, 8), (18, 8)]
        {
            assert_eq!(ColumnKind::decimal_width(precision), width, "p={precision}");
        }
    }

    #[test]
    fn decimal_bounds_are_validated() {
        assert!(ColumnKind::decimal(0, 0).is_err());
        assert!(ColumnKind::decimal(19, 0).is_err());
        assert!(ColumnKind::decimal(4, 5).is_err());
        assert!(ColumnKind::decimal(18, 18).is_ok());
    }

    #[test]
    fn spec_mapping_covers_common_types() {
        let cases = [
            (ColumnSpec::new("a", "tinyint"), ColumnKind::TinyInt),
            (ColumnSpec::new("a", "BOOLEAN"), ColumnKind::TinyInt),
            (ColumnSpec::new("a", "MEDIUMINT"), ColumnKind::MediumInt),
            (ColumnSpec::new("a", "INT UNSIGNED"), ColumnKind::Int),
            (ColumnSpec::new("a", "real"), ColumnKind::Float),
            (
                ColumnSpec::new("a", "DECIMAL").with_precision(10, 2),
                ColumnKind::Decimal {
                    precision: 10,
                    scale: 2,
                },
            ),
            (ColumnSpec::new("a", "CHAR").with_precision(3, 0), ColumnKind::Char(3)),
            (ColumnSpec::new("a", "varchar(20)").with_precision(20, 0), ColumnKind::Varchar(20)),
            (ColumnSpec::new("a", "TIMESTAMP"), ColumnKind::DateTime),
            (ColumnSpec::new("a", "TIME"), ColumnKind::Time),
        ];
        for (spec, kind) in cases {
            assert_eq!(ColumnKind::from_spec(&spec, true).expect("map"), kind);
        }
        let date = ColumnSpec::new("d", "DATE");
        assert_eq!(ColumnKind::from_spec(&date, true).expect("map"), ColumnKind::DateAsInt);
        assert_eq!(ColumnKind::from_spec(&date, false).expect("map"), ColumnKind::Date);
    }

    #[test]
    fn spec_mapping_rejects_unknown_and_unsized() {
        let err = ColumnKind::from_spec(&ColumnSpec::new("g", "GEOMETRY"), true)
            .expect_err("unsupported");
        assert_eq!(err.kind(), ErrorKind::Usage);
        assert!(err.message().unwrap_or("").contains("column g"));
        assert!(ColumnKind::from_spec(&ColumnSpec::new("v", "VARCHAR"), true).is_err());
    }

    #[test]
    fn only_string_like_kinds_need_enclosure() {
        assert!(ColumnKind::Char(1).needs_enclosure());
        assert!(ColumnKind::Varbinary(1).needs_enclosure());
        assert!(!ColumnKind::Int.needs_enclosure());
        assert!(!ColumnKind::Date.needs_enclosure());
    }
}
