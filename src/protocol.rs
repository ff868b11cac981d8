//! Wire format for counter datagrams.
//!
//! One datagram carries newline-separated rows of the form
//!
//! ```text
//! <key>:<value>|<type>[|@<rate>](:<value>|<type>[|@<rate>])*
//! ```
//!
//! Parsing never fails as a whole: every row and every record inside a row
//! yields its own `Result`, so one bad record never takes its siblings down.

use thiserror::Error;

/// Group used when a raw key carries no `.` separator.
pub const DEFAULT_GROUP: &str = "c";

const ESCAPED_COLON: &str = ";COLON;";
const ESCAPED_PERIOD: &str = ";PERIOD;";

/// Type tag clients use for timers, which this server does not aggregate.
const TIMER_TYPE: &str = "ms";

// ─── Errors ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    /// Row has a key but no `:`-separated records.
    #[error("malformed row {0:?}: expected <key>:<record>")]
    MalformedRow(String),

    /// Record has fewer than two `|`-separated fields.
    #[error("malformed record {record:?} for key {key:?}")]
    MalformedRecord { key: String, record: String },

    #[error("unsupported metric type {kind:?} for key {key:?}")]
    UnsupportedMetricType { key: String, kind: String },

    /// Value scaled by the sample rate does not fit in an `f64`.
    #[error("record {record:?} for key {key:?} scales out of range")]
    OutOfRange { key: String, record: String },
}

// ─── Parsed types ────────────────────────────────────────────────

/// A single accepted counter update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Record {
    pub value: i64,
    pub sample_rate: f64,
}

impl Record {
    /// Value scaled up by the inverse of the client's sample rate.
    pub fn delta(&self) -> f64 {
        self.value as f64 * (1.0 / self.sample_rate)
    }
}

/// One row of a datagram: a key and every record that shares it.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub key: String,
    pub records: Vec<Result<Record, ProtocolError>>,
}

pub type ParsedRow = Result<Row, ProtocolError>;

// ─── Parsing ─────────────────────────────────────────────────────

/// Split a datagram into rows and parse each one independently.
/// Blank rows (e.g. a trailing newline) are skipped.
pub fn parse_datagram(msg: &str) -> Vec<ParsedRow> {
    msg.split('\n')
        .map(str::trim)
        .filter(|row| !row.is_empty())
        .map(parse_row)
        .collect()
}

pub fn parse_row(row: &str) -> ParsedRow {
    let mut bits = row.split(':');
    let key = bits.next().unwrap_or_default();

    let records: Vec<&str> = bits.collect();
    if records.is_empty() {
        return Err(ProtocolError::MalformedRow(row.to_owned()));
    }

    Ok(Row {
        key: key.to_owned(),
        records: records
            .into_iter()
            .map(|record| parse_record(key, record))
            .collect(),
    })
}

fn parse_record(key: &str, record: &str) -> Result<Record, ProtocolError> {
    let fields: Vec<&str> = record.split('|').collect();
    if fields.len() < 2 {
        return Err(ProtocolError::MalformedRecord {
            key: key.to_owned(),
            record: record.to_owned(),
        });
    }

    let kind = fields[1].trim();
    if kind == TIMER_TYPE {
        return Err(ProtocolError::UnsupportedMetricType {
            key: key.to_owned(),
            kind: kind.to_owned(),
        });
    }

    let sample_rate = fields
        .get(2)
        .and_then(|f| parse_sample_rate(f))
        .unwrap_or(1.0);

    // A non-numeric value still counts as a single event.
    let value = fields[0].trim().parse::<i64>().unwrap_or(1);

    let parsed = Record { value, sample_rate };
    if !parsed.delta().is_finite() {
        return Err(ProtocolError::OutOfRange {
            key: key.to_owned(),
            record: record.to_owned(),
        });
    }
    Ok(parsed)
}

/// `@0.25` → `Some(0.25)`. Anything that does not start with `@` followed by
/// a positive decimal yields `None`.
fn parse_sample_rate(field: &str) -> Option<f64> {
    let digits = field.trim().strip_prefix('@')?;
    let end = digits
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(digits.len());

    let rate = longest_decimal_prefix(&digits[..end])?;
    // Subnormal rates are positive but their inverse overflows.
    if rate > 0.0 && (1.0 / rate).is_finite() {
        Some(rate)
    } else {
        tracing::warn!(field, "ignoring unusable sample rate");
        None
    }
}

/// `"0.5.1"` → `0.5`: keep everything up to a second decimal point.
fn longest_decimal_prefix(run: &str) -> Option<f64> {
    let cut = run
        .match_indices('.')
        .nth(1)
        .map(|(i, _)| i)
        .unwrap_or(run.len());
    run[..cut].parse().ok()
}

// ─── Key handling ────────────────────────────────────────────────

/// Split a raw (still escaped) key on its first `.` into group and member,
/// then decode both halves.
pub fn split_key(raw: &str) -> (String, String) {
    match raw.split_once('.') {
        Some((group, member)) => (unescape(group), unescape(member)),
        None => (DEFAULT_GROUP.to_owned(), unescape(raw)),
    }
}

pub fn unescape(s: &str) -> String {
    s.replace(ESCAPED_COLON, ":").replace(ESCAPED_PERIOD, ".")
}
