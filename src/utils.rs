//! Input parsing and file naming helpers

use chrono::{NaiveDate, NaiveDateTime};

use crate::error::{Error, Result};
use crate::types::RecordKey;

/// Collections whose images cannot be ordered through the RAPI
pub const ORDER_DISABLED_COLLECTIONS: &[&str] = &[
    "Radarsat1RawProducts",
    "Radarsat2RawProducts",
    "RCMScienceData",
    "NAPL",
];

/// Whether records of this collection have to be left out of orders
pub fn is_order_disabled(collection: &str) -> bool {
    ORDER_DISABLED_COLLECTIONS.contains(&collection)
}

/// Inclusive acquisition date range
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DateRange {
    /// Start of the range
    pub start: NaiveDateTime,
    /// End of the range
    pub end: NaiveDateTime,
}

impl DateRange {
    /// Bounds formatted the way RAPI queries expect them
    pub fn to_rapi(&self) -> (String, String) {
        const FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";
        (
            self.start.format(FORMAT).to_string(),
            self.end.format(FORMAT).to_string(),
        )
    }
}

/// Parse `YYYYMMDD[THHMMSS]-YYYYMMDD[THHMMSS]`
///
/// A date without a time starts at midnight.
///
/// # Examples
///
/// ```
/// use eodms_dl::utils::parse_date_range;
///
/// let range = parse_date_range("20200501-20210105T054540").unwrap();
/// assert_eq!(range.start.to_string(), "2020-05-01 00:00:00");
/// assert_eq!(range.end.to_string(), "2021-01-05 05:45:40");
/// ```
pub fn parse_date_range(input: &str) -> Result<DateRange> {
    let (start, end) = input
        .trim()
        .split_once('-')
        .ok_or_else(|| Error::InvalidInput(format!("date range '{input}' must be start-end")))?;

    let range = DateRange {
        start: parse_timestamp(start)?,
        end: parse_timestamp(end)?,
    };
    if range.start > range.end {
        return Err(Error::InvalidInput(format!(
            "date range '{input}' ends before it starts"
        )));
    }
    Ok(range)
}

fn parse_timestamp(value: &str) -> Result<NaiveDateTime> {
    let value = value.trim();
    let invalid = || Error::InvalidInput(format!("'{value}' is not YYYYMMDD or YYYYMMDDTHHMMSS"));

    match value.split_once(['T', 't']) {
        Some((date, time)) => {
            NaiveDateTime::parse_from_str(&format!("{date}T{time}"), "%Y%m%dT%H%M%S")
                .map_err(|_| invalid())
        }
        None => NaiveDate::parse_from_str(value, "%Y%m%d")
            .ok()
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .ok_or_else(invalid),
    }
}

/// Parse a maximum of the form `total[:per_order]`
///
/// Returns the total image limit and the per-order limit; either may be absent.
pub fn parse_maximum(input: &str) -> Result<(Option<usize>, Option<i64>)> {
    let input = input.trim();
    if input.is_empty() {
        return Ok((None, None));
    }

    let (total, per_order) = match input.split_once(':') {
        Some((total, per_order)) => (total.trim(), Some(per_order.trim())),
        None => (input, None),
    };

    let total = if total.is_empty() {
        None
    } else {
        Some(total.parse::<usize>().map_err(|_| {
            Error::InvalidInput(format!("maximum '{input}' has an invalid total"))
        })?)
    };
    let per_order = match per_order {
        Some(value) if !value.is_empty() => Some(value.parse::<i64>().map_err(|_| {
            Error::InvalidInput(format!("maximum '{input}' has an invalid per-order limit"))
        })?),
        _ => None,
    };
    Ok((total, per_order))
}

/// Parse record ids of the form `Collection:id,id|Collection:id`
///
/// Duplicates are dropped, keeping the first occurrence.
pub fn parse_record_ids(input: &str) -> Result<Vec<RecordKey>> {
    let mut keys: Vec<RecordKey> = Vec::new();
    for group in input.split('|').map(str::trim).filter(|g| !g.is_empty()) {
        let (collection, ids) = group.split_once(':').ok_or_else(|| {
            Error::InvalidInput(format!("'{group}' must be Collection:id[,id...]"))
        })?;
        let collection = collection.trim();
        if collection.is_empty() {
            return Err(Error::InvalidInput(format!("'{group}' has no collection")));
        }
        for id in ids.split(',').map(str::trim).filter(|id| !id.is_empty()) {
            let key = RecordKey::new(collection, id);
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
    }
    if keys.is_empty() {
        return Err(Error::InvalidInput("no record ids given".to_string()));
    }
    Ok(keys)
}

/// Replace characters that are unsafe in file names
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_matches('.');
    if cleaned.is_empty() {
        "download".to_string()
    } else {
        cleaned.to_string()
    }
}

/// Last path segment of a URL, percent-decoded
pub fn file_name_from_url(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let last = parsed.path_segments()?.next_back()?;
    if last.is_empty() {
        return None;
    }
    let decoded = urlencoding::decode(last).ok()?;
    Some(sanitize_filename(&decoded))
}
