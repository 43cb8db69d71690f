use crate::error::{CoreError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Date, Month, OffsetDateTime, Time};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FhirDateTime(pub OffsetDateTime);

impl FhirDateTime {
    pub fn new(datetime: OffsetDateTime) -> Self {
        Self(datetime)
    }

    pub fn into_inner(self) -> OffsetDateTime {
        self.0
    }
}

impl fmt::Display for FhirDateTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let formatted = self.0.format(&Rfc3339).map_err(|_| fmt::Error)?;
        write!(f, "{formatted}")
    }
}

impl FromStr for FhirDateTime {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        let datetime = OffsetDateTime::parse(s, &Rfc3339).map_err(|e| {
            CoreError::invalid_date_time(format!("Failed to parse FHIR DateTime '{s}': {e}"))
        })?;
        Ok(FhirDateTime(datetime))
    }
}

impl Serialize for FhirDateTime {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let formatted = self.0.format(&Rfc3339).map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(&formatted)
    }
}

impl<'de> Deserialize<'de> for FhirDateTime {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        FhirDateTime::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// Precision of a FHIR date or dateTime literal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatePrecision {
    Year,
    Month,
    Day,
    Instant,
}

/// A FHIR date/dateTime literal expanded to the half-open interval it denotes.
///
/// `2020` covers `[2020-01-01, 2021-01-01)`, `2020-03-04` covers one day and a
/// full dateTime covers a single instant (`start == end`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartialDateTime {
    pub start: OffsetDateTime,
    pub end: OffsetDateTime,
    pub precision: DatePrecision,
}

impl PartialDateTime {
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        let invalid = || CoreError::invalid_date_time(format!("Unsupported FHIR date '{s}'"));

        if s.contains('T') {
            let instant = FhirDateTime::from_str(s)?.into_inner();
            return Ok(Self {
                start: instant,
                end: instant,
                precision: DatePrecision::Instant,
            });
        }

        let parts: Vec<&str> = s.split('-').collect();
        let year: i32 = parts
            .first()
            .filter(|y| y.len() == 4)
            .and_then(|y| y.parse().ok())
            .ok_or_else(invalid)?;
        match parts.len() {
            1 => {
                let start = Date::from_calendar_date(year, Month::January, 1)?;
                let end = Date::from_calendar_date(year + 1, Month::January, 1)?;
                Ok(Self::from_dates(start, end, DatePrecision::Year))
            }
            2 => {
                let month: u8 = parts[1].parse().map_err(|_| invalid())?;
                let month = Month::try_from(month).map_err(|_| invalid())?;
                let start = Date::from_calendar_date(year, month, 1)?;
                let (next_year, next_month) = if month == Month::December {
                    (year + 1, Month::January)
                } else {
                    (year, month.next())
                };
                let end = Date::from_calendar_date(next_year, next_month, 1)?;
                Ok(Self::from_dates(start, end, DatePrecision::Month))
            }
            3 => {
                let date = parse_date(s)?;
                let end = date.next_day().ok_or_else(invalid)?;
                Ok(Self::from_dates(date, end, DatePrecision::Day))
            }
            _ => Err(invalid()),
        }
    }

    fn from_dates(start: Date, end: Date, precision: DatePrecision) -> Self {
        Self {
            start: start.midnight().assume_utc(),
            end: end.midnight().assume_utc(),
            precision,
        }
    }
}

impl From<time::error::ComponentRange> for CoreError {
    fn from(err: time::error::ComponentRange) -> Self {
        CoreError::invalid_date_time(err.to_string())
    }
}

/// Parses a `YYYY-MM-DD` date.
pub fn parse_date(s: &str) -> Result<Date> {
    Ok(Date::parse(s, format_description!("[year]-[month]-[day]"))?)
}

/// Formats a date as `YYYY-MM-DD`.
pub fn format_date(date: Date) -> String {
    date.format(format_description!("[year]-[month]-[day]"))
        .unwrap_or_default()
}

/// Formats an instant as RFC 3339.
pub fn format_date_time(value: OffsetDateTime) -> String {
    FhirDateTime(value).to_string()
}

/// Renders an OMOP date/datetime pair, preferring the datetime column.
pub fn render_date_time(date: Option<Date>, datetime: Option<OffsetDateTime>) -> Option<String> {
    match (datetime, date) {
        (Some(dt), _) => Some(format_date_time(dt)),
        (None, Some(d)) => Some(format_date(d)),
        (None, None) => None,
    }
}

/// Splits a FHIR dateTime into OMOP date and datetime columns.
///
/// Date-only values leave the datetime column empty.
pub fn split_date_time(s: &str) -> Result<(Date, Option<OffsetDateTime>)> {
    let parsed = PartialDateTime::parse(s)?;
    let date = parsed.start.date();
    let datetime = (parsed.precision == DatePrecision::Instant).then_some(parsed.start);
    Ok((date, datetime))
}

/// Midnight UTC of `date`.
pub fn start_of_day(date: Date) -> OffsetDateTime {
    date.with_time(Time::MIDNIGHT).assume_utc()
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::{date, datetime};

    #[test]
    fn test_fhir_datetime_display() {
        let fhir_dt = FhirDateTime::new(datetime!(2023-05-15 14:30:00 UTC));
        assert_eq!(fhir_dt.to_string(), "2023-05-15T14:30:00Z");
    }

    #[test]
    fn test_fhir_datetime_from_str_with_offset() {
        let fhir_dt = FhirDateTime::from_str("2023-05-15T14:30:00+02:00").unwrap();
        let expected_utc = datetime!(2023-05-15 12:30:00 UTC);
        assert_eq!(fhir_dt.0.to_offset(time::UtcOffset::UTC), expected_utc);
    }

    #[test]
    fn test_fhir_datetime_from_str_invalid() {
        assert!(FhirDateTime::from_str("invalid-date").is_err());
        assert!(FhirDateTime::from_str("2023-13-01T00:00:00Z").is_err());
        assert!(FhirDateTime::from_str("").is_err());
    }

    #[test]
    fn test_fhir_datetime_serde() {
        let fhir_dt = FhirDateTime::new(datetime!(2023-05-15 14:30:00 UTC));
        let json = serde_json::to_string(&fhir_dt).unwrap();
        assert_eq!(json, "\"2023-05-15T14:30:00Z\"");
        let back: FhirDateTime = serde_json::from_str(&json).unwrap();
        assert_eq!(back, fhir_dt);
    }

    #[test]
    fn test_partial_year() {
        let p = PartialDateTime::parse("2020").unwrap();
        assert_eq!(p.precision, DatePrecision::Year);
        assert_eq!(p.start, datetime!(2020-01-01 00:00:00 UTC));
        assert_eq!(p.end, datetime!(2021-01-01 00:00:00 UTC));
    }

    #[test]
    fn test_partial_month_december() {
        let p = PartialDateTime::parse("2020-12").unwrap();
        assert_eq!(p.precision, DatePrecision::Month);
        assert_eq!(p.end, datetime!(2021-01-01 00:00:00 UTC));
    }

    #[test]
    fn test_partial_day_and_instant() {
        let p = PartialDateTime::parse("2020-02-29").unwrap();
        assert_eq!(p.precision, DatePrecision::Day);
        assert_eq!(p.end, datetime!(2020-03-01 00:00:00 UTC));

        let p = PartialDateTime::parse("2020-02-29T10:15:00Z").unwrap();
        assert_eq!(p.precision, DatePrecision::Instant);
        assert_eq!(p.start, p.end);
    }

    #[test]
    fn test_partial_invalid() {
        assert!(PartialDateTime::parse("20").is_err());
        assert!(PartialDateTime::parse("2020-13").is_err());
        assert!(PartialDateTime::parse("2020-01-01-01").is_err());
        assert!(PartialDateTime::parse("abcd").is_err());
    }

    #[test]
    fn test_split_and_render() {
        let (d, dt) = split_date_time("2021-06-01").unwrap();
        assert_eq!(d, date!(2021 - 06 - 01));
        assert!(dt.is_none());
        assert_eq!(render_date_time(Some(d), dt).as_deref(), Some("2021-06-01"));

        let (d, dt) = split_date_time("2021-06-01T08:00:00Z").unwrap();
        assert_eq!(d, date!(2021 - 06 - 01));
        assert_eq!(
            render_date_time(Some(d), dt).as_deref(),
            Some("2021-06-01T08:00:00Z")
        );
    }
}
