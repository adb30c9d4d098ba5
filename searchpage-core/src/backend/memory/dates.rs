//! Date parsing, formatting and calendar arithmetic on epoch milliseconds.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};

use crate::query::aggs::CalendarUnit;

/// Parses a date the way the backend reads date fields: RFC 3339 first, then
/// the request `format`, then plain dates and epoch milliseconds.
pub(crate) fn parse_date(value: &str, format: Option<&str>) -> Option<i64> {
  if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
    return Some(dt.timestamp_millis());
  }
  let mut patterns: Vec<String> = Vec::with_capacity(4);
  if let Some(format) = format {
    patterns.push(joda_to_strftime(format));
  }
  patterns.push("%Y-%m-%dT%H:%M:%S".into());
  patterns.push("%Y-%m-%d %H:%M:%S".into());
  patterns.push("%Y-%m-%d".into());
  for pattern in &patterns {
    if let Ok(dt) = NaiveDateTime::parse_from_str(value, pattern) {
      return Some(dt.and_utc().timestamp_millis());
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, pattern) {
      return date
        .and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().timestamp_millis());
    }
  }
  value.parse::<i64>().ok()
}

pub(crate) fn format_millis(millis: i64, format: Option<&str>) -> Option<String> {
  let dt = Utc.timestamp_millis_opt(millis).single()?;
  Some(match format {
    Some(format) => dt.format(&joda_to_strftime(format)).to_string(),
    None => dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
  })
}

/// Translates the common Joda-style tokens (`yyyy-MM-dd HH:mm:ss`) into
/// strftime. Unknown letters pass through unchanged.
pub(crate) fn joda_to_strftime(format: &str) -> String {
  const TOKENS: [(&str, &str); 9] = [
    ("yyyy", "%Y"),
    ("yy", "%y"),
    ("MM", "%m"),
    ("dd", "%d"),
    ("HH", "%H"),
    ("mm", "%M"),
    ("ss", "%S"),
    ("SSS", "%3f"),
    ("'T'", "T"),
  ];
  let mut out = String::with_capacity(format.len() * 2);
  let mut rest = format;
  'scan: while !rest.is_empty() {
    for (token, replacement) in TOKENS {
      if let Some(tail) = rest.strip_prefix(token) {
        out.push_str(replacement);
        rest = tail;
        continue 'scan;
      }
    }
    let mut chars = rest.chars();
    if let Some(ch) = chars.next() {
      out.push(ch);
    }
    rest = chars.as_str();
  }
  out
}

/// Start of the calendar bucket containing `value`.
pub(crate) fn truncate_calendar(value: i64, unit: CalendarUnit) -> Option<i64> {
  let dt = DateTime::<Utc>::from_timestamp_millis(value)?;
  let date = dt.date_naive();
  let start = match unit {
    CalendarUnit::Minute => date.and_hms_opt(dt.hour(), dt.minute(), 0)?,
    CalendarUnit::Hour => date.and_hms_opt(dt.hour(), 0, 0)?,
    CalendarUnit::Day => date.and_hms_opt(0, 0, 0)?,
    CalendarUnit::Week => date
      .checked_sub_signed(Duration::days(date.weekday().num_days_from_monday() as i64))?
      .and_hms_opt(0, 0, 0)?,
    CalendarUnit::Month => date.with_day(1)?.and_hms_opt(0, 0, 0)?,
    CalendarUnit::Quarter => {
      let first_month = ((date.month() - 1) / 3) * 3 + 1;
      date.with_day(1)?.with_month(first_month)?.and_hms_opt(0, 0, 0)?
    }
    CalendarUnit::Year => NaiveDate::from_ymd_opt(date.year(), 1, 1)?.and_hms_opt(0, 0, 0)?,
  };
  Some(start.and_utc().timestamp_millis())
}

/// Start of the calendar bucket following the one starting at `value`.
pub(crate) fn add_calendar(value: i64, unit: CalendarUnit) -> Option<i64> {
  let dt = DateTime::<Utc>::from_timestamp_millis(value)?;
  let next = match unit {
    CalendarUnit::Minute => dt.checked_add_signed(Duration::minutes(1))?,
    CalendarUnit::Hour => dt.checked_add_signed(Duration::hours(1))?,
    CalendarUnit::Day => dt.checked_add_signed(Duration::days(1))?,
    CalendarUnit::Week => dt.checked_add_signed(Duration::weeks(1))?,
    CalendarUnit::Month => add_months(dt, 1)?,
    CalendarUnit::Quarter => add_months(dt, 3)?,
    CalendarUnit::Year => add_months(dt, 12)?,
  };
  Some(next.timestamp_millis())
}

fn add_months(dt: DateTime<Utc>, months: u32) -> Option<DateTime<Utc>> {
  let total = dt.month0() + months;
  let year = dt.year() + (total / 12) as i32;
  let month = total % 12 + 1;
  let date = NaiveDate::from_ymd_opt(year, month, 1)?;
  Some(date.and_hms_opt(0, 0, 0)?.and_utc())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_formats_and_epoch() {
    assert_eq!(parse_date("1970-01-02", None), Some(86_400_000));
    assert_eq!(parse_date("1970-01-01T00:00:01Z", None), Some(1_000));
    assert_eq!(parse_date("02/01/1970", Some("dd/MM/yyyy")), Some(86_400_000));
    assert_eq!(parse_date("5000", None), Some(5_000));
    assert_eq!(parse_date("soon", None), None);
  }

  #[test]
  fn formats_with_joda_patterns() {
    assert_eq!(joda_to_strftime("yyyy-MM-dd'T'HH:mm"), "%Y-%m-%dT%H:%M");
    assert_eq!(
      format_millis(86_400_000, Some("yyyy-MM-dd")).as_deref(),
      Some("1970-01-02")
    );
  }

  #[test]
  fn calendar_steps_cross_year_boundaries() {
    let nov = parse_date("2023-11-15", None).unwrap();
    let start = truncate_calendar(nov, CalendarUnit::Quarter).unwrap();
    assert_eq!(Some(start), parse_date("2023-10-01", None));
    assert_eq!(
      add_calendar(start, CalendarUnit::Quarter),
      parse_date("2024-01-01", None)
    );
    let week = truncate_calendar(parse_date("2024-01-04", None).unwrap(), CalendarUnit::Week);
    assert_eq!(week, parse_date("2024-01-01", None));
  }
}
