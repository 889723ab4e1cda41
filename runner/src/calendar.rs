use chrono::{Datelike, Duration, Months, NaiveDate, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CalendarError {
    #[error("Invalid date '{0}', expected YYYYMMDD[HH[MM]]")]
    InvalidDate(String),
    #[error("Date arithmetic left the supported range")]
    OutOfRange,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Calendar {
    #[default]
    Standard,
    /// 365 day years, 29 February never exists
    Noleap,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChunkUnit {
    Hour,
    Day,
    Week,
    #[default]
    Month,
    Year,
}

/// Precision used when a date becomes part of a job name
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DateFormat {
    Day,
    Hour,
    Minute,
}

pub fn parse_date(input: &str) -> Result<NaiveDateTime, CalendarError> {
    let input = input.trim();
    let invalid = || CalendarError::InvalidDate(input.to_owned());

    if !input.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }

    let field = |range: std::ops::Range<usize>| -> Result<u32, CalendarError> {
        input
            .get(range)
            .and_then(|value| value.parse().ok())
            .ok_or_else(invalid)
    };

    let (hour, minute) = match input.len() {
        8 => (0, 0),
        10 => (field(8..10)?, 0),
        12 => (field(8..10)?, field(10..12)?),
        _ => return Err(invalid()),
    };

    let year = field(0..4)? as i32;

    NaiveDate::from_ymd_opt(year, field(4..6)?, field(6..8)?)
        .and_then(|date| date.and_hms_opt(hour, minute, 0))
        .ok_or_else(invalid)
}

pub fn format_date(date: &NaiveDateTime, format: DateFormat) -> String {
    match format {
        DateFormat::Day => date.format("%Y%m%d"),
        DateFormat::Hour => date.format("%Y%m%d%H"),
        DateFormat::Minute => date.format("%Y%m%d%H%M"),
    }
    .to_string()
}

/// Coarsest format that still tells all given dates apart
pub fn date_format_for<'a, I: IntoIterator<Item = &'a NaiveDateTime>>(dates: I) -> DateFormat {
    dates
        .into_iter()
        .map(|date| {
            if date.minute() != 0 {
                DateFormat::Minute
            } else if date.hour() != 0 {
                DateFormat::Hour
            } else {
                DateFormat::Day
            }
        })
        .max()
        .unwrap_or(DateFormat::Day)
}

/// Add `amount` units (negative to subtract) to `date` under `calendar`
pub fn add(
    date: NaiveDateTime,
    amount: i64,
    unit: ChunkUnit,
    calendar: Calendar,
) -> Result<NaiveDateTime, CalendarError> {
    match unit {
        ChunkUnit::Hour => add_hours(date, amount, calendar),
        ChunkUnit::Day => add_days(date, amount, calendar),
        ChunkUnit::Week => add_days(date, amount * 7, calendar),
        ChunkUnit::Month => add_months(date, amount, calendar),
        ChunkUnit::Year => add_months(date, amount * 12, calendar),
    }
}

pub fn subtract(
    date: NaiveDateTime,
    amount: i64,
    unit: ChunkUnit,
    calendar: Calendar,
) -> Result<NaiveDateTime, CalendarError> {
    add(date, -amount, unit, calendar)
}

pub fn previous_day(date: NaiveDateTime, calendar: Calendar) -> Result<NaiveDateTime, CalendarError> {
    add_days(date, -1, calendar)
}

/// First instant covered by `chunk` (1-based) of a run starting at `start`
pub fn chunk_start_date(
    start: NaiveDateTime,
    chunk: u32,
    chunk_size: u32,
    unit: ChunkUnit,
    calendar: Calendar,
) -> Result<NaiveDateTime, CalendarError> {
    let offset = i64::from(chunk.saturating_sub(1)) * i64::from(chunk_size);
    add(start, offset, unit, calendar)
}

/// First instant after `chunk`, i.e. the start of the next chunk
pub fn chunk_end_date(
    start: NaiveDateTime,
    chunk: u32,
    chunk_size: u32,
    unit: ChunkUnit,
    calendar: Calendar,
) -> Result<NaiveDateTime, CalendarError> {
    add(start, i64::from(chunk) * i64::from(chunk_size), unit, calendar)
}

fn add_hours(
    date: NaiveDateTime,
    hours: i64,
    calendar: Calendar,
) -> Result<NaiveDateTime, CalendarError> {
    match calendar {
        Calendar::Standard => date
            .checked_add_signed(Duration::hours(hours))
            .ok_or(CalendarError::OutOfRange),
        Calendar::Noleap => {
            let total = i64::from(date.hour()) + hours;
            let shifted = add_days(date, total.div_euclid(24), calendar)?;

            shifted
                .with_hour(total.rem_euclid(24) as u32)
                .ok_or(CalendarError::OutOfRange)
        }
    }
}

fn add_days(date: NaiveDateTime, days: i64, calendar: Calendar) -> Result<NaiveDateTime, CalendarError> {
    match calendar {
        Calendar::Standard => date
            .checked_add_signed(Duration::days(days))
            .ok_or(CalendarError::OutOfRange),
        Calendar::Noleap => {
            let day = date.date();
            let year = i64::from(day.year());
            let ordinal = i64::from(day.ordinal0());
            let leap_shift = i64::from(is_leap(day.year()) && ordinal > 59);

            let total = year * 365 + ordinal - leap_shift + days;
            let new_year = i32::try_from(total.div_euclid(365)).map_err(|_| CalendarError::OutOfRange)?;
            let mut new_ordinal = total.rem_euclid(365) as u32;

            if is_leap(new_year) && new_ordinal >= 59 {
                new_ordinal += 1;
            }

            NaiveDate::from_yo_opt(new_year, new_ordinal + 1)
                .map(|new_day| new_day.and_time(date.time()))
                .ok_or(CalendarError::OutOfRange)
        }
    }
}

fn add_months(
    date: NaiveDateTime,
    months: i64,
    calendar: Calendar,
) -> Result<NaiveDateTime, CalendarError> {
    let magnitude = Months::new(u32::try_from(months.unsigned_abs()).map_err(|_| CalendarError::OutOfRange)?);

    // chrono clamps the day to the end of the target month
    let shifted = if months >= 0 {
        date.checked_add_months(magnitude)
    } else {
        date.checked_sub_months(magnitude)
    }
    .ok_or(CalendarError::OutOfRange)?;

    if calendar == Calendar::Noleap && shifted.month() == 2 && shifted.day() == 29 {
        shifted.with_day(28).ok_or(CalendarError::OutOfRange)
    } else {
        Ok(shifted)
    }
}

fn is_leap(year: i32) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(input: &str) -> NaiveDateTime {
        parse_date(input).unwrap()
    }

    #[test]
    fn parses_all_precisions() {
        assert_eq!(format_date(&date("19900101"), DateFormat::Day), "19900101");
        assert_eq!(format_date(&date("1990010112"), DateFormat::Hour), "1990010112");
        assert_eq!(
            format_date(&date("199001011230"), DateFormat::Minute),
            "199001011230"
        );
        assert!(parse_date("1990-01-01").is_err());
        assert!(parse_date("19901301").is_err());
        assert!(parse_date("199001").is_err());
    }

    #[test]
    fn format_follows_finest_date() {
        let dates = [date("19900101"), date("1990010106")];
        assert_eq!(date_format_for(&dates), DateFormat::Hour);
        assert_eq!(date_format_for(&dates[..1]), DateFormat::Day);
    }

    #[test]
    fn month_addition_clamps_to_month_end() {
        let start = date("19910131");
        assert_eq!(
            add(start, 1, ChunkUnit::Month, Calendar::Standard).unwrap(),
            date("19910228")
        );
        assert_eq!(
            add(date("19920131"), 1, ChunkUnit::Month, Calendar::Standard).unwrap(),
            date("19920229")
        );
        assert_eq!(
            add(date("19920131"), 1, ChunkUnit::Month, Calendar::Noleap).unwrap(),
            date("19920228")
        );
        assert_eq!(
            subtract(date("19920331"), 1, ChunkUnit::Month, Calendar::Standard).unwrap(),
            date("19920229")
        );
    }

    #[test]
    fn noleap_days_skip_february_29() {
        assert_eq!(
            add(date("19920228"), 1, ChunkUnit::Day, Calendar::Noleap).unwrap(),
            date("19920301")
        );
        assert_eq!(
            add(date("19920301"), -1, ChunkUnit::Day, Calendar::Noleap).unwrap(),
            date("19920228")
        );
        assert_eq!(
            add(date("19920101"), 365, ChunkUnit::Day, Calendar::Noleap).unwrap(),
            date("19930101")
        );
        assert_eq!(
            add(date("19920101"), 365, ChunkUnit::Day, Calendar::Standard).unwrap(),
            date("19921231")
        );
        assert_eq!(
            add(date("1992022818"), 12, ChunkUnit::Hour, Calendar::Noleap).unwrap(),
            date("1992030106")
        );
    }

    #[test]
    fn chunk_boundaries() {
        let start = date("20000101");
        assert_eq!(
            chunk_start_date(start, 1, 3, ChunkUnit::Month, Calendar::Standard).unwrap(),
            start
        );
        assert_eq!(
            chunk_start_date(start, 2, 3, ChunkUnit::Month, Calendar::Standard).unwrap(),
            date("20000401")
        );
        assert_eq!(
            chunk_end_date(start, 2, 3, ChunkUnit::Month, Calendar::Standard).unwrap(),
            date("20000701")
        );
        assert_eq!(
            previous_day(date("20000301"), Calendar::Standard).unwrap(),
            date("20000229")
        );
    }
}
