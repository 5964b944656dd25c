use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};

/// Granularity assumed when the repository is not asked (or does not say).
pub const DEFAULT_GRANULARITY: &str = "YYYY-MM-DDThh:mm:ssZ";

const DAY_GRANULARITY: &str = "YYYY-MM-DD";

/// The two datestamp granularities OAI-PMH 2.0 allows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    Day,
    Second,
}

impl Granularity {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            DAY_GRANULARITY => Some(Granularity::Day),
            DEFAULT_GRANULARITY => Some(Granularity::Second),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Day => DAY_GRANULARITY,
            Granularity::Second => DEFAULT_GRANULARITY,
        }
    }

    pub fn format(&self, at: &DateTime<Utc>) -> String {
        match self {
            Granularity::Day => at.format("%Y-%m-%d").to_string(),
            Granularity::Second => at.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        }
    }
}

/// Formats `at` for a `from`/`until` argument. Unrecognized granularity strings
/// fall back to second precision.
pub fn format_with_granularity(at: &DateTime<Utc>, granularity: &str) -> String {
    Granularity::parse(granularity)
        .unwrap_or(Granularity::Second)
        .format(at)
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unparsable datestamp '{value}'")]
pub struct DatestampError {
    pub value: String,
}

/// Parses a header datestamp in either OAI granularity. Offsets other than `Z`
/// and fractional seconds are tolerated since some repositories emit them.
pub fn parse_datestamp(value: &str) -> Result<DateTime<Utc>, DatestampError> {
    let trimmed = value.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(parsed.with_timezone(&Utc));
    }
    for pattern in ["%Y-%m-%dT%H:%M:%SZ", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, pattern) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
        .ok_or_else(|| DatestampError {
            value: value.to_string(),
        })
}
