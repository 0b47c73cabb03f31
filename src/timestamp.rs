use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use nom::{
    branch::alt,
    bytes::complete::take_while_m_n,
    character::complete::{char, digit1, one_of},
    combinator::{all_consuming, map, map_res, opt},
    sequence::{preceded, tuple},
    IResult,
};
use thiserror::Error;

use crate::model::AggregationKey;

/// Output layout of a normalized instant: `1999-06-17T00:11:00.000Z`.
pub const CANONICAL_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimestampError {
    #[error("'{0}' is not a timestamp (expected YYYY-MM-DD HH:MM:SS)")]
    Syntax(String),
    #[error("'{0}' is not a valid calendar instant")]
    OutOfRange(String),
}

struct Parts<'a> {
    year: i32,
    month: u32,
    day: u32,
    hour: u32,
    minute: u32,
    second: u32,
    fraction: Option<&'a str>,
    /// Seconds east of UTC. `None` means the timestamp was naive.
    offset: Option<i32>,
}

// --- BASIC PARSERS ---

fn fixed_digits<'a>(n: usize) -> impl FnMut(&'a str) -> IResult<&'a str, u32> {
    map_res(take_while_m_n(n, n, |c: char| c.is_ascii_digit()), |s: &str| s.parse::<u32>())
}

fn parse_date(input: &str) -> IResult<&str, (i32, u32, u32)> {
    let (input, (year, _, month, _, day)) =
        tuple((fixed_digits(4), char('-'), fixed_digits(2), char('-'), fixed_digits(2)))(input)?;
    Ok((input, (year as i32, month, day)))
}

fn parse_time(input: &str) -> IResult<&str, (u32, u32, u32)> {
    let (input, (hour, _, minute, _, second)) =
        tuple((fixed_digits(2), char(':'), fixed_digits(2), char(':'), fixed_digits(2)))(input)?;
    Ok((input, (hour, minute, second)))
}

fn parse_offset(input: &str) -> IResult<&str, i32> {
    alt((
        map(one_of("Zz"), |_| 0),
        map(
            tuple((one_of("+-"), fixed_digits(2), opt(char(':')), fixed_digits(2))),
            |(sign, hours, _, minutes)| {
                let secs = (hours * 3600 + minutes * 60) as i32;
                if sign == '-' { -secs } else { secs }
            },
        ),
    ))(input)
}

fn parse_parts(input: &str) -> IResult<&str, Parts<'_>> {
    let (input, (date, _, time, fraction, offset)) = all_consuming(tuple((
        parse_date,
        one_of("Tt "),
        parse_time,
        opt(preceded(char('.'), digit1)),
        opt(parse_offset),
    )))(input)?;

    let (year, month, day) = date;
    let (hour, minute, second) = time;
    Ok((input, Parts { year, month, day, hour, minute, second, fraction, offset }))
}

/// First three fractional digits, right-padded. Finer precision is truncated.
fn millis(fraction: Option<&str>) -> u32 {
    let Some(digits) = fraction else { return 0 };
    digits
        .bytes()
        .chain(std::iter::repeat(b'0'))
        .take(3)
        .fold(0, |acc, d| acc * 10 + u32::from(d - b'0'))
}

/// Parses one textual timestamp into a UTC instant with millisecond resolution.
///
/// Naive timestamps (no `Z` and no offset) are read as UTC.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, TimestampError> {
    let text = raw.trim();
    let (_, parts) = parse_parts(text).map_err(|_| TimestampError::Syntax(text.to_string()))?;
    let out_of_range = || TimestampError::OutOfRange(text.to_string());

    let date = NaiveDate::from_ymd_opt(parts.year, parts.month, parts.day).ok_or_else(out_of_range)?;
    let time = NaiveTime::from_hms_milli_opt(parts.hour, parts.minute, parts.second, millis(parts.fraction))
        .ok_or_else(out_of_range)?;
    let naive = NaiveDateTime::new(date, time);

    match parts.offset {
        None => Ok(Utc.from_utc_datetime(&naive)),
        Some(secs) => FixedOffset::east_opt(secs)
            .and_then(|tz| tz.from_local_datetime(&naive).single())
            .map(|local| local.with_timezone(&Utc))
            .ok_or_else(out_of_range),
    }
}

/// Key Normalizer: collapses every encoding of one instant onto one key.
pub fn normalize(beacon_id: i64, raw: &str) -> Result<AggregationKey, TimestampError> {
    Ok(AggregationKey::new(beacon_id, parse_timestamp(raw)?))
}

pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format(CANONICAL_FORMAT).to_string()
}
