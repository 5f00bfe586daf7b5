//! Message filename codec
//!
//! Every message on the bus is one file whose name carries its identity:
//!
//! ```text
//! MMDDHHMMSS-<type>-<fromName>><toName>-<id>.md
//! 1019143005-task-core>worker-abc123.md
//! ```
//!
//! The timestamp is rendered in UTC without the year, so names sort by time
//! within a year. Only the base name of compound identities is kept; the full
//! `group/name` form lives in the message frontmatter.
//!
//! Structural rules that keep decoding unambiguous:
//! - `type` and id carry no `-`, `>` or `/`
//! - names carry no `>` (both names may contain `-`)
//!
//! Reserved characters are replaced with `_` when encoding, so a type such as
//! `task-complete` is written as `task_complete`. The frontmatter keeps the
//! exact value.

use super::address::base_name;
use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use thiserror::Error;

/// File extension for message files
pub const MESSAGE_EXTENSION: &str = "md";

const TIMESTAMP_DIGITS: usize = 10;
const TIMESTAMP_FORMAT: &str = "%m%d%H%M%S";

/// Errors raised while encoding or decoding a message filename
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FilenameError {
    #[error("not a message file (expected .md extension): '{0}'")]
    MissingExtension(String),

    #[error("invalid timestamp prefix in '{0}'")]
    InvalidTimestamp(String),

    #[error("missing '-' or '>' separator in '{0}'")]
    MissingSeparator(String),

    #[error("more than one '>' separator in '{0}'")]
    MultipleArrows(String),

    #[error("missing trailing id in '{0}'")]
    MissingId(String),

    #[error("{field} cannot be empty")]
    EmptyField { field: &'static str },
}

/// The identity recovered from a message filename
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFilename {
    /// Second-precision timestamp, year inferred at decode time
    pub timestamp: DateTime<Utc>,
    /// Message type tag
    pub msg_type: String,
    /// Sender base name
    pub from: String,
    /// Recipient base name
    pub to: String,
    /// Message id
    pub id: String,
}

const TAG_RESERVED: &[char] = &['-', '>', '/'];
const NAME_RESERVED: &[char] = &['>'];

/// Build the filename for a message
///
/// `from` and `to` may be compound identities; only their base names are
/// encoded. Fails only when a field is empty.
///
/// Reserved characters become `_`, so the mapping is not injective: ids
/// `a-b` and `a_b` with the same second, type and route share a filename.
/// The store never overwrites, so the second such write fails instead of
/// replacing the first.
pub fn encode(
    timestamp: DateTime<Utc>,
    from: &str,
    to: &str,
    msg_type: &str,
    id: &str,
) -> Result<String, FilenameError> {
    let msg_type = sanitize("type", msg_type, TAG_RESERVED)?;
    let from = sanitize("from", base_name(from), NAME_RESERVED)?;
    let to = sanitize("to", base_name(to), NAME_RESERVED)?;
    let id = sanitize("id", id, TAG_RESERVED)?;

    Ok(format!(
        "{}-{}-{}>{}-{}.{}",
        timestamp.format(TIMESTAMP_FORMAT),
        msg_type,
        from,
        to,
        id,
        MESSAGE_EXTENSION
    ))
}

/// Parse a message filename, assuming the current year
pub fn decode(filename: &str) -> Result<ParsedFilename, FilenameError> {
    decode_at(filename, Utc::now())
}

/// Parse a message filename relative to a reference time
///
/// The year is taken from `now`. If that places the message more than a day
/// in the future it was written last year (the name crossed a year boundary).
pub fn decode_at(filename: &str, now: DateTime<Utc>) -> Result<ParsedFilename, FilenameError> {
    let stem = filename
        .strip_suffix(".md")
        .ok_or_else(|| FilenameError::MissingExtension(filename.to_string()))?;

    let digits = stem
        .get(..TIMESTAMP_DIGITS)
        .filter(|d| d.bytes().all(|b| b.is_ascii_digit()))
        .ok_or_else(|| FilenameError::InvalidTimestamp(filename.to_string()))?;
    let rest = &stem[TIMESTAMP_DIGITS..];

    let rest = rest
        .strip_prefix('-')
        .ok_or_else(|| FilenameError::MissingSeparator(filename.to_string()))?;
    let (msg_type, rest) = rest
        .split_once('-')
        .ok_or_else(|| FilenameError::MissingSeparator(filename.to_string()))?;
    let (from, rest) = rest
        .split_once('>')
        .ok_or_else(|| FilenameError::MissingSeparator(filename.to_string()))?;
    if rest.contains('>') || msg_type.contains('>') {
        return Err(FilenameError::MultipleArrows(filename.to_string()));
    }
    let (to, id) = rest
        .rsplit_once('-')
        .ok_or_else(|| FilenameError::MissingId(filename.to_string()))?;
    if id.is_empty() {
        return Err(FilenameError::MissingId(filename.to_string()));
    }
    if msg_type.is_empty() {
        return Err(FilenameError::EmptyField { field: "type" });
    }
    if from.is_empty() {
        return Err(FilenameError::EmptyField { field: "from" });
    }
    if to.is_empty() {
        return Err(FilenameError::EmptyField { field: "to" });
    }

    let timestamp = infer_timestamp(digits, now)
        .ok_or_else(|| FilenameError::InvalidTimestamp(filename.to_string()))?;

    Ok(ParsedFilename {
        timestamp,
        msg_type: msg_type.to_string(),
        from: from.to_string(),
        to: to.to_string(),
        id: id.to_string(),
    })
}

/// Check whether a name looks like a message file without fully decoding it
pub fn is_message_filename(filename: &str) -> bool {
    decode(filename).is_ok()
}

fn sanitize(field: &'static str, value: &str, reserved: &[char]) -> Result<String, FilenameError> {
    if value.trim().is_empty() {
        return Err(FilenameError::EmptyField { field });
    }
    Ok(value
        .chars()
        .map(|c| {
            if reserved.contains(&c) || c.is_whitespace() || c.is_control() {
                '_'
            } else {
                c
            }
        })
        .collect())
}

fn infer_timestamp(digits: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let field = |range: std::ops::Range<usize>| digits.get(range)?.parse::<u32>().ok();
    let (month, day) = (field(0..2)?, field(2..4)?);
    let (hour, minute, second) = (field(4..6)?, field(6..8)?, field(8..10)?);

    let at_year = |year: i32| {
        Utc.with_ymd_and_hms(year, month, day, hour, minute, second)
            .single()
    };

    match at_year(now.year()) {
        Some(ts) if ts > now + Duration::days(1) => at_year(now.year() - 1),
        Some(ts) => Some(ts),
        // Feb 29 outside a leap year can only have been written earlier
        None => (1..=4).find_map(|back| at_year(now.year() - back)),
    }
}
