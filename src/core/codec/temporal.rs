//! Purpose: Date and time text forms plus the century-signed date-as-integer encoding.
//! Exports: `format_date`, `parse_date`, `format_datetime`, `parse_datetime`,
//! `format_time`, `parse_time`, `date_to_int`, `int_to_date`.
//! Invariants: Text forms are fixed width (10, 19 and 8 ASCII bytes) for years 0..=9999.
//! Invariants: `int_to_date(date_to_int(d)) == d` on both sides of 1900-01-01.
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{Date, Month, PrimitiveDateTime, Time};

use crate::core::error::{Error, ErrorKind};

const DATE_FORMAT: &[BorrowedFormatItem<'static>] = format_description!("[year]-[month]-[day]");
const TIME_FORMAT: &[BorrowedFormatItem<'static>] = format_description!("[hour]:[minute]:[second]");
const DATETIME_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

pub const DATE_WIDTH: usize = 10;
pub const TIME_WIDTH: usize = 8;
pub const DATETIME_WIDTH: usize = 19;

fn check_year(year: i32) -> Result<(), Error> {
    if !(0..=9999).contains(&year) {
        return Err(Error::new(ErrorKind::Serialization)
            .with_message(format!("year {year} is outside 0000..=9999")));
    }
    Ok(())
}

fn format_error(err: time::error::Format) -> Error {
    Error::new(ErrorKind::Serialization)
        .with_message("failed to format temporal value")
        .with_source(err)
}

fn parse_error(text: &str, what: &str, err: time::error::Parse) -> Error {
    Error::new(ErrorKind::Serialization)
        .with_message(format!("\"{text}\" is not a valid {what}"))
        .with_source(err)
}

pub fn format_date(date: Date) -> Result<String, Error> {
    check_year(date.year())?;
    date.format(DATE_FORMAT).map_err(format_error)
}

pub fn parse_date(text: &str) -> Result<Date, Error> {
    Date::parse(text.trim(), DATE_FORMAT).map_err(|err| parse_error(text, "date", err))
}

pub fn format_datetime(value: PrimitiveDateTime) -> Result<String, Error> {
    check_year(value.year())?;
    value.format(DATETIME_FORMAT).map_err(format_error)
}

pub fn parse_datetime(text: &str) -> Result<PrimitiveDateTime, Error> {
    PrimitiveDateTime::parse(text.trim(), DATETIME_FORMAT)
        .map_err(|err| parse_error(text, "datetime", err))
}

pub fn format_time(value: Time) -> Result<String, Error> {
    value.format(TIME_FORMAT).map_err(format_error)
}

pub fn parse_time(text: &str) -> Result<Time, Error> {
    Time::parse(text.trim(), TIME_FORMAT).map_err(|err| parse_error(text, "time", err))
}

/// Accepts any of the three text forms and widens it to a datetime.
pub fn parse_any(text: &str) -> Result<PrimitiveDateTime, Error> {
    let trimmed = text.trim();
    match trimmed.len() {
        DATETIME_WIDTH => parse_datetime(trimmed),
        DATE_WIDTH => Ok(parse_date(trimmed)?.midnight()),
        TIME_WIDTH => Ok(PrimitiveDateTime::new(epoch(), parse_time(trimmed)?)),
        _ => Err(Error::new(ErrorKind::Serialization)
            .with_message(format!("\"{text}\" is not a date, time or datetime"))),
    }
}

pub(crate) fn epoch() -> Date {
    time::macros::date!(1970 - 01 - 01)
}

/// Positive for years from 1900 on; years before 1900 are reflected around 9999
/// and complemented so the sign bit alone marks the century side.
pub fn date_to_int(date: Date) -> Result<i32, Error> {
    let year = date.year();
    let month_day = i64::from(u8::from(date.month())) * 100 + i64::from(date.day());
    let raw = if year >= 1900 {
        i64::from(year - 1900) * 10_000 + month_day
    } else {
        !(i64::from(1899 - year) * 10_000 + (9_999 - month_day))
    };
    i32::try_from(raw).map_err(|_| {
        Error::new(ErrorKind::Serialization)
            .with_message(format!("date {date} does not fit the integer encoding"))
    })
}

pub fn int_to_date(raw: i32) -> Result<Date, Error> {
    let invalid = || {
        Error::new(ErrorKind::Serialization)
            .with_message(format!("{raw} is not a valid encoded date"))
    };
    let (year, month, day) = if raw >= 0 {
        let raw = i64::from(raw);
        let rem = raw % 10_000;
        (1900 + raw / 10_000, rem / 100, rem % 100)
    } else {
        let reflected = i64::from(!raw);
        let rem = 9_999 - reflected % 10_000;
        (1899 - reflected / 10_000, rem / 100, rem % 100)
    };
    let year = i32::try_from(year).map_err(|_| invalid())?;
    let month = u8::try_from(month)
        .ok()
        .and_then(|month| Month::try_from(month).ok())
        .ok_or_else(invalid)?;
    let day = u8::try_from(day).map_err(|_| invalid())?;
    Date::from_calendar_date(year, month, day).map_err(|_| invalid())
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::{date, datetime, time};

    #[test]
    fn date_int_matches_known_value_after_1900() {
        assert_eq!(date_to_int(date!(2023 - 06 - 15)).expect("encode"), 1_230_615);
        assert_eq!(int_to_date(1_230_615).expect("decode"), date!(2023 - 06 - 15));
    }

    #[test]
    fn date_int_is_negative_before_1900_and_round_trips() {
        for value in [
            date!(1899 - 12 - 31),
            date!(1850 - 02 - 28),
            date!(1001 - 01 - 01),
            date!(0001 - 07 - 04),
        ] {
            let raw = date_to_int(value).expect("encode");
            assert!(raw < 0, "{value} -> {raw}");
            assert_eq!(int_to_date(raw).expect("decode"), value);
        }
    }

    #[test]
    fn century_boundary_flips_sign() {
        let before = date_to_int(date!(1899 - 12 - 31)).expect("encode");
        let after = date_to_int(date!(1900 - 01 - 01)).expect("encode");
        assert_eq!(before, !8_768);
        assert_eq!(after, 101);
    }

    #[test]
    fn decode_rejects_impossible_dates() {
        assert!(int_to_date(0).is_err());
        assert!(int_to_date(1_231_340).is_err());
    }

    #[test]
    fn text_forms_are_fixed_width() {
        assert_eq!(format_date(date!(0099 - 01 - 02)).expect("date"), "0099-01-02");
        assert_eq!(
            format_datetime(datetime!(2024-02-29 07:08:09)).expect("datetime"),
            "2024-02-29 07:08:09"
        );
        assert_eq!(format_time(time!(23:59:01)).expect("time"), "23:59:01");
    }

    #[test]
    fn parse_any_widens_each_form() {
        assert_eq!(
            parse_any("2020-01-02").expect("date"),
            datetime!(2020-01-02 00:00:00)
        );
        assert_eq!(
            parse_any("10:11:12").expect("time"),
            datetime!(1970-01-01 10:11:12)
        );
        assert!(parse_any("yesterday").is_err());
    }
}
