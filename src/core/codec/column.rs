use time::{Date, PrimitiveDateTime, Time};

use super::buffer::{ByteReader, ByteWriter, Endian};
use super::convert::ValueConverter;
use super::decimal::Decimal;
use super::temporal;
use super::text::{Charset, hex_decode, hex_encode};
use super::ColumnKind;
use crate::core::error::{Error, ErrorKind};

#[derive(Clone, Debug, PartialEq)]
enum Value {
    Int(i64),
    Float(f32),
    Double(f64),
    // Unscaled, already multiplied by 10^scale.
    Decimal(i64),
    Bytes(Vec<u8>),
    Date(Date),
    DateTime(PrimitiveDateTime),
    Time(Time),
}

impl Value {
    fn zero(kind: ColumnKind) -> Self {
        match kind {
            ColumnKind::TinyInt
            | ColumnKind::SmallInt
            | ColumnKind::MediumInt
            | ColumnKind::Int
            | ColumnKind::BigInt => Self::Int(0),
            ColumnKind::Float => Self::Float(0.0),
            ColumnKind::Double => Self::Double(0.0),
            ColumnKind::Decimal { .. } => Self::Decimal(0),
            ColumnKind::Binary(len) => Self::Bytes(vec![0; usize::from(len)]),
            ColumnKind::Char(_) | ColumnKind::Varchar(_) | ColumnKind::Varbinary(_) => {
                Self::Bytes(Vec::new())
            }
            ColumnKind::Date | ColumnKind::DateAsInt => Self::Date(temporal::epoch()),
            ColumnKind::DateTime => Self::DateTime(temporal::epoch().midnight()),
            ColumnKind::Time => Self::Time(Time::MIDNIGHT),
        }
    }
}

/// One typed cell of a record. `None` value means SQL NULL.
#[derive(Clone, Debug, PartialEq)]
pub struct Column {
    name: String,
    kind: ColumnKind,
    value: Option<Value>,
    charset: Charset,
    strict: bool,
}

impl Column {
    pub fn new(name: impl Into<String>, kind: ColumnKind) -> Self {
        Self {
            name: name.into(),
            kind,
            value: None,
            charset: Charset::default(),
            strict: false,
        }
    }

    pub fn with_charset(mut self, charset: Charset) -> Self {
        self.charset = charset;
        self
    }

    /// Strict columns reject oversized or out-of-range values instead of truncating.
    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ColumnKind {
        self.kind
    }

    pub fn is_null(&self) -> bool {
        self.value.is_none()
    }

    pub fn needs_enclosure(&self) -> bool {
        self.kind.needs_enclosure()
    }

    /// Marks the column null, or restores the kind's zero value when clearing null.
    pub fn set_null(&mut self, is_null: bool) {
        if is_null {
            self.value = None;
        } else if self.value.is_none() {
            self.value = Some(Value::zero(self.kind));
        }
    }

    fn mismatch(&self, what: &str) -> Error {
        Error::new(ErrorKind::Usage).with_message(format!(
            "column {} ({}) does not accept {what}",
            self.name, self.kind
        ))
    }

    fn too_big(&self, detail: String) -> Error {
        Error::new(ErrorKind::Serialization).with_message(format!(
            "data is too big for column {} ({}): {detail}",
            self.name, self.kind
        ))
    }

    pub fn set_i64(&mut self, value: i64) -> Result<(), Error> {
        match self.kind {
            ColumnKind::Float | ColumnKind::Double => return self.set_f64(value as f64),
            ColumnKind::Decimal { .. } => return self.set_decimal(Decimal::from_integer(value)),
            _ => {}
        }
        let Some((min, max)) = self.kind.integer_range() else {
            return Err(self.mismatch("an integer"));
        };
        let stored = if (min..=max).contains(&value) {
            value
        } else if self.strict {
            return Err(self.too_big(format!("{value} is outside {min}..={max}")));
        } else {
            wrap_integer(self.kind, value)
        };
        self.value = Some(Value::Int(stored));
        Ok(())
    }

    pub fn set_f64(&mut self, value: f64) -> Result<(), Error> {
        self.value = Some(match self.kind {
            ColumnKind::Double => Value::Double(value),
            ColumnKind::Float => {
                if self.strict && value.is_finite() && value.abs() > f64::from(f32::MAX) {
                    return Err(self.too_big(format!("{value} overflows FLOAT")));
                }
                Value::Float(value as f32)
            }
            ColumnKind::Decimal { .. } => return self.set_decimal(Decimal::from_f64(value)?),
            _ => return Err(self.mismatch("a floating point number")),
        });
        Ok(())
    }

    /// Rescales to the column's scale (truncating) and rejects values beyond 10^precision - 1.
    pub fn set_decimal(&mut self, value: Decimal) -> Result<(), Error> {
        let ColumnKind::Decimal { precision, scale } = self.kind else {
            return match self.kind {
                ColumnKind::Float | ColumnKind::Double => self.set_f64(value.to_f64()),
                _ if self.kind.is_integer() => match value.trunc_i64() {
                    Some(int) => self.set_i64(int),
                    None => Err(self.too_big(format!("{value} overflows {}", self.kind))),
                },
                _ => Err(self.mismatch("a decimal")),
            };
        };
        let max = 10i128.pow(u32::from(precision)) - 1;
        let scaled = value
            .rescale(u32::from(scale))
            .filter(|scaled| scaled.abs() <= max)
            .ok_or_else(|| self.too_big(format!("{value} exceeds precision {precision}")))?;
        self.value = Some(Value::Decimal(scaled as i64));
        Ok(())
    }

    pub fn set_str(&mut self, value: &str) -> Result<(), Error> {
        let limit = match self.kind {
            ColumnKind::Char(len) | ColumnKind::Varchar(len) => usize::from(len),
            _ => return Err(self.mismatch("a string")),
        };
        let mut bytes = self.charset.encode(value, self.strict)?;
        if bytes.len() > limit {
            if self.strict {
                return Err(self.too_big(format!("{} bytes, limit {limit}", bytes.len())));
            }
            self.charset.truncate(&mut bytes, limit);
        }
        self.value = Some(Value::Bytes(bytes));
        Ok(())
    }

    pub fn set_bytes(&mut self, value: &[u8]) -> Result<(), Error> {
        let (limit, fixed) = match self.kind {
            ColumnKind::Binary(len) => (usize::from(len), true),
            ColumnKind::Varbinary(len) => (usize::from(len), false),
            _ => return Err(self.mismatch("bytes")),
        };
        if value.len() > limit && self.strict {
            return Err(self.too_big(format!("{} bytes, limit {limit}", value.len())));
        }
        let mut bytes = value[..value.len().min(limit)].to_vec();
        if fixed {
            bytes.resize(limit, 0);
        }
        self.value = Some(Value::Bytes(bytes));
        Ok(())
    }

    pub fn set_date(&mut self, value: Date) -> Result<(), Error> {
        match self.kind {
            ColumnKind::Date => {
                temporal::format_date(value)?;
            }
            ColumnKind::DateAsInt => {
                temporal::date_to_int(value)?;
            }
            ColumnKind::DateTime => return self.set_datetime(value.midnight()),
            _ => return Err(self.mismatch("a date")),
        }
        self.value = Some(Value::Date(value));
        Ok(())
    }

    pub fn set_datetime(&mut self, value: PrimitiveDateTime) -> Result<(), Error> {
        match self.kind {
            ColumnKind::DateTime => {
                temporal::format_datetime(value)?;
                self.value = Some(Value::DateTime(value));
                Ok(())
            }
            ColumnKind::Date | ColumnKind::DateAsInt => self.set_date(value.date()),
            ColumnKind::Time => self.set_time(value.time()),
            _ => Err(self.mismatch("a datetime")),
        }
    }

    pub fn set_time(&mut self, value: Time) -> Result<(), Error> {
        if self.kind != ColumnKind::Time {
            return Err(self.mismatch("a time"));
        }
        self.value = Some(Value::Time(value));
        Ok(())
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self.value {
            Some(Value::Int(value)) => Some(value),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self.value {
            Some(Value::Float(value)) => Some(f64::from(value)),
            Some(Value::Double(value)) => Some(value),
            _ => None,
        }
    }

    pub fn as_decimal(&self) -> Option<Decimal> {
        match (self.kind, &self.value) {
            (ColumnKind::Decimal { scale, .. }, Some(Value::Decimal(unscaled))) => {
                Some(Decimal::new(i128::from(*unscaled), u32::from(scale)))
            }
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match &self.value {
            Some(Value::Bytes(bytes)) => Some(bytes),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<Date> {
        match self.value {
            Some(Value::Date(value)) => Some(value),
            Some(Value::DateTime(value)) => Some(value.date()),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<PrimitiveDateTime> {
        match self.value {
            Some(Value::DateTime(value)) => Some(value),
            _ => None,
        }
    }

    pub fn as_time(&self) -> Option<Time> {
        match self.value {
            Some(Value::Time(value)) => Some(value),
            _ => None,
        }
    }

    fn apply<T>(
        &mut self,
        value: Option<T>,
        set: impl FnOnce(&mut Self, T) -> Result<(), Error>,
    ) -> Result<(), Error> {
        match value {
            Some(value) => set(self, value),
            None => {
                self.set_null(true);
                Ok(())
            }
        }
    }

    pub fn set_from_value<C: ValueConverter>(
        &mut self,
        value: &C::Value,
        converter: &C,
    ) -> Result<(), Error> {
        match self.kind {
            ColumnKind::TinyInt
            | ColumnKind::SmallInt
            | ColumnKind::MediumInt
            | ColumnKind::Int
            | ColumnKind::BigInt => self.apply(converter.get_integer(value)?, Self::set_i64),
            ColumnKind::Float | ColumnKind::Double => {
                self.apply(converter.get_number(value)?, Self::set_f64)
            }
            ColumnKind::Decimal { .. } => {
                self.apply(converter.get_decimal(value)?, Self::set_decimal)
            }
            ColumnKind::Char(_) | ColumnKind::Varchar(_) => {
                self.apply(converter.get_string(value)?, |column, text| {
                    column.set_str(&text)
                })
            }
            ColumnKind::Binary(_) | ColumnKind::Varbinary(_) => {
                self.apply(converter.get_bytes(value)?, |column, bytes| {
                    column.set_bytes(&bytes)
                })
            }
            ColumnKind::Date | ColumnKind::DateAsInt | ColumnKind::DateTime | ColumnKind::Time => {
                self.apply(converter.get_date(value)?, Self::set_datetime)
            }
        }
    }

    /// Parses the column's own text form (as produced by `encode_text`).
    pub fn set_from_text(&mut self, text: &str) -> Result<(), Error> {
        let invalid = |column: &Self| {
            Error::new(ErrorKind::Serialization).with_message(format!(
                "\"{text}\" is not a valid {} for column {}",
                column.kind, column.name
            ))
        };
        match self.kind {
            ColumnKind::TinyInt
            | ColumnKind::SmallInt
            | ColumnKind::MediumInt
            | ColumnKind::Int
            | ColumnKind::BigInt => {
                let value = text.trim().parse::<i64>().map_err(|_| invalid(self))?;
                self.set_i64(value)
            }
            ColumnKind::Float | ColumnKind::Double => {
                let value = text.trim().parse::<f64>().map_err(|_| invalid(self))?;
                self.set_f64(value)
            }
            ColumnKind::Decimal { .. } => {
                let value = Decimal::parse(text).map_err(|_| invalid(self))?;
                self.set_decimal(value)
            }
            ColumnKind::Char(_) | ColumnKind::Varchar(_) => self.set_str(text),
            ColumnKind::Binary(_) | ColumnKind::Varbinary(_) => self.set_bytes(&hex_decode(text)?),
            ColumnKind::Date | ColumnKind::DateAsInt => self.set_date(temporal::parse_date(text)?),
            ColumnKind::DateTime => self.set_datetime(temporal::parse_datetime(text)?),
            ColumnKind::Time => self.set_time(temporal::parse_time(text)?),
        }
    }

    pub fn encode_text(&self) -> Result<Option<String>, Error> {
        let Some(value) = &self.value else {
            return Ok(None);
        };
        let text = match value {
            Value::Int(value) => value.to_string(),
            Value::Float(value) => value.to_string(),
            Value::Double(value) => value.to_string(),
            Value::Decimal(_) => self
                .as_decimal()
                .map(|decimal| decimal.to_string())
                .unwrap_or_default(),
            Value::Bytes(bytes) => match self.kind {
                ColumnKind::Binary(_) | ColumnKind::Varbinary(_) => hex_encode(bytes),
                _ => self.charset.decode(bytes)?,
            },
            Value::Date(date) => temporal::format_date(*date)?,
            Value::DateTime(datetime) => temporal::format_datetime(*datetime)?,
            Value::Time(time) => temporal::format_time(*time)?,
        };
        Ok(Some(text))
    }

    pub fn encode_binary(&self, out: &mut ByteWriter) -> Result<(), Error> {
        let zero = Value::zero(self.kind);
        let value = self.value.as_ref().unwrap_or(&zero);
        match (self.kind, value) {
            (ColumnKind::TinyInt, Value::Int(v)) => out.put_u8(*v as i8 as u8),
            (ColumnKind::SmallInt, Value::Int(v)) => out.put_i16(*v as i16),
            (ColumnKind::MediumInt, Value::Int(v)) => {
                let low = (*v & 0xFFFF) as u16;
                let high = ((*v >> 16) & 0xFF) as u8;
                match out.endian() {
                    Endian::Little => {
                        out.put_u16(low)?;
                        out.put_u8(high)
                    }
                    Endian::Big => {
                        out.put_u8(high)?;
                        out.put_u16(low)
                    }
                }
            }
            (ColumnKind::Int, Value::Int(v)) => out.put_i32(*v as i32),
            (ColumnKind::BigInt, Value::Int(v)) => out.put_i64(*v),
            (ColumnKind::Float, Value::Float(v)) => out.put_f32(*v),
            (ColumnKind::Double, Value::Double(v)) => out.put_f64(*v),
            (ColumnKind::Decimal { precision, .. }, Value::Decimal(v)) => {
                match ColumnKind::decimal_width(precision) {
                    1 => out.put_u8(*v as i8 as u8),
                    2 => out.put_i16(*v as i16),
                    4 => out.put_i32(*v as i32),
                    _ => out.put_i64(*v),
                }
            }
            (ColumnKind::Char(len), Value::Bytes(bytes)) => {
                let len = usize::from(len);
                let body = &bytes[..bytes.len().min(len)];
                // Null chars are all spaces.
                out.put_slice(body)?;
                out.put_fill(b' ', len - body.len())
            }
            (ColumnKind::Binary(len), Value::Bytes(bytes)) => {
                let len = usize::from(len);
                let body = &bytes[..bytes.len().min(len)];
                out.put_slice(body)?;
                out.put_fill(0, len - body.len())
            }
            (ColumnKind::Varchar(_) | ColumnKind::Varbinary(_), Value::Bytes(bytes)) => {
                let len = u16::try_from(bytes.len()).map_err(|_| {
                    self.too_big(format!("{} bytes exceed a 16-bit length", bytes.len()))
                })?;
                out.put_u16(len)?;
                out.put_slice(bytes)
            }
            (ColumnKind::Date, Value::Date(date)) if self.value.is_some() => {
                out.put_slice(temporal::format_date(*date)?.as_bytes())
            }
            (ColumnKind::DateAsInt, Value::Date(date)) if self.value.is_some() => {
                out.put_i32(temporal::date_to_int(*date)?)
            }
            (ColumnKind::DateTime, Value::DateTime(datetime)) if self.value.is_some() => {
                out.put_slice(temporal::format_datetime(*datetime)?.as_bytes())
            }
            (ColumnKind::Time, Value::Time(time)) if self.value.is_some() => {
                out.put_slice(temporal::format_time(*time)?.as_bytes())
            }
            (ColumnKind::Date | ColumnKind::DateAsInt | ColumnKind::DateTime | ColumnKind::Time, _) => {
                out.put_fill(0, self.kind.max_binary_width())
            }
            _ => Err(Error::new(ErrorKind::Internal).with_message(format!(
                "column {} holds a value that does not match {}",
                self.name, self.kind
            ))),
        }
    }

    /// Reads this column's bytes; `is_null` comes from the record's null bitmap.
    pub fn decode_binary(&mut self, input: &mut ByteReader<'_>, is_null: bool) -> Result<(), Error> {
        let value = match self.kind {
            ColumnKind::TinyInt => Value::Int(i64::from(input.get_u8()? as i8)),
            ColumnKind::SmallInt => Value::Int(i64::from(input.get_i16()?)),
            ColumnKind::MediumInt => {
                let (low, high) = match input.endian() {
                    Endian::Little => {
                        let low = input.get_u16()?;
                        (low, input.get_u8()?)
                    }
                    Endian::Big => {
                        let high = input.get_u8()?;
                        (input.get_u16()?, high)
                    }
                };
                let raw = (i32::from(high) << 16) | i32::from(low);
                Value::Int(i64::from((raw << 8) >> 8))
            }
            ColumnKind::Int => Value::Int(i64::from(input.get_i32()?)),
            ColumnKind::BigInt => Value::Int(input.get_i64()?),
            ColumnKind::Float => Value::Float(input.get_f32()?),
            ColumnKind::Double => Value::Double(input.get_f64()?),
            ColumnKind::Decimal { precision, .. } => {
                Value::Decimal(match ColumnKind::decimal_width(precision) {
                    1 => i64::from(input.get_u8()? as i8),
                    2 => i64::from(input.get_i16()?),
                    4 => i64::from(input.get_i32()?),
                    _ => input.get_i64()?,
                })
            }
            ColumnKind::Char(len) => {
                let raw = input.take(usize::from(len))?;
                let end = raw.iter().rposition(|&byte| byte != b' ').map_or(0, |pos| pos + 1);
                Value::Bytes(raw[..end].to_vec())
            }
            ColumnKind::Binary(len) => Value::Bytes(input.take(usize::from(len))?.to_vec()),
            ColumnKind::Varchar(limit) | ColumnKind::Varbinary(limit) => {
                let len = input.get_u16()?;
                if len > limit && !is_null {
                    return Err(self.too_big(format!("encoded length {len}, limit {limit}")));
                }
                Value::Bytes(input.take(usize::from(len))?.to_vec())
            }
            ColumnKind::DateAsInt => {
                let raw = input.get_i32()?;
                if is_null {
                    Value::zero(self.kind)
                } else {
                    Value::Date(temporal::int_to_date(raw)?)
                }
            }
            ColumnKind::Date | ColumnKind::DateTime | ColumnKind::Time => {
                let raw = input.take(self.kind.max_binary_width())?;
                if is_null {
                    Value::zero(self.kind)
                } else {
                    let text = std::str::from_utf8(raw).map_err(|err| {
                        Error::new(ErrorKind::Serialization)
                            .with_message(format!("column {} holds non-ASCII temporal bytes", self.name))
                            .with_source(err)
                    })?;
                    match self.kind {
                        ColumnKind::Date => Value::Date(temporal::parse_date(text)?),
                        ColumnKind::DateTime => Value::DateTime(temporal::parse_datetime(text)?),
                        _ => Value::Time(temporal::parse_time(text)?),
                    }
                }
            }
        };
        self.value = if is_null { None } else { Some(value) };
        Ok(())
    }
}

fn wrap_integer(kind: ColumnKind, value: i64) -> i64 {
    match kind {
        ColumnKind::TinyInt => i64::from(value as i8),
        ColumnKind::SmallInt => i64::from(value as i16),
        ColumnKind::MediumInt => (value << 40) >> 40,
        ColumnKind::Int => i64::from(value as i32),
        _ => value,
    }
}
