//! Bus message format
//!
//! A message file is UTF-8 text with a line-oriented frontmatter block
//! followed by the body:
//!
//! ```text
//! ---
//! to: team/worker
//! from: core/core
//! type: task
//! msg-id: abc123
//! timestamp: 2026-10-19T14:30:05Z
//! headline: Refactor the parser
//! ---
//!
//! body text
//! ```
//!
//! Fields are written verbatim, one `key: value` per line. The five mandatory
//! fields always come first and cannot be overridden by extension fields.

use super::address::AgentId;
use super::filename::{self, ParsedFilename};
use crate::rearmatter::{self, RearmatterReport};
use chrono::{DateTime, SecondsFormat, Utc};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// Frontmatter block delimiter
pub const FENCE: &str = "---";

/// Keys every message carries, in write order
pub const MANDATORY_KEYS: [&str; 5] = ["to", "from", "type", "msg-id", "timestamp"];

/// Errors raised while formatting or parsing message frontmatter
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrontmatterError {
    #[error("message does not start with a '---' frontmatter fence")]
    MissingOpeningFence,

    #[error("frontmatter is not closed by a '---' fence")]
    MissingClosingFence,

    #[error("frontmatter line is not 'key: value': '{0}'")]
    MalformedLine(String),

    #[error("frontmatter is missing mandatory field '{0}'")]
    MissingField(&'static str),

    #[error("invalid timestamp '{0}'")]
    InvalidTimestamp(String),

    #[error("invalid agent identity in '{field}': {reason}")]
    InvalidAgent { field: &'static str, reason: String },

    #[error("invalid frontmatter key '{0}'")]
    InvalidKey(String),

    #[error("value for '{key}' cannot span lines or be empty")]
    InvalidValue { key: String },
}

/// Typed message frontmatter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frontmatter {
    /// Recipient, possibly compound
    pub to: AgentId,
    /// Sender, possibly compound
    pub from: AgentId,
    /// Open-ended type tag (`task`, `ask`, `task-complete`, ...)
    pub msg_type: String,
    /// Caller-supplied message id
    pub msg_id: String,
    /// Second-precision write time
    pub timestamp: DateTime<Utc>,
    /// Extension fields (`headline`, `status`, ...)
    pub extra: BTreeMap<String, String>,
}

impl Frontmatter {
    /// Render the frontmatter lines (without fences)
    pub fn to_lines(&self) -> Result<Vec<String>, FrontmatterError> {
        check_value("type", &self.msg_type)?;
        check_value("msg-id", &self.msg_id)?;

        let mut lines = vec![
            format!("to: {}", self.to),
            format!("from: {}", self.from),
            format!("type: {}", self.msg_type),
            format!("msg-id: {}", self.msg_id),
            format!("timestamp: {}", format_timestamp(self.timestamp)),
        ];

        for (key, value) in &self.extra {
            if MANDATORY_KEYS.contains(&key.as_str()) {
                continue;
            }
            check_key(key)?;
            if value.contains(['\n', '\r']) {
                return Err(FrontmatterError::InvalidValue { key: key.clone() });
            }
            lines.push(format!("{}: {}", key, value));
        }

        Ok(lines)
    }

    /// Look up any field by its on-disk key, rendered as it is written
    pub fn get(&self, key: &str) -> Option<Cow<'_, str>> {
        match key {
            "to" => Some(Cow::Borrowed(self.to.as_str())),
            "from" => Some(Cow::Borrowed(self.from.as_str())),
            "type" => Some(Cow::Borrowed(&self.msg_type)),
            "msg-id" => Some(Cow::Borrowed(&self.msg_id)),
            "timestamp" => Some(Cow::Owned(format_timestamp(self.timestamp))),
            _ => self.extra.get(key).map(|v| Cow::Borrowed(v.as_str())),
        }
    }
}

/// Render a timestamp the way frontmatter stores it
pub fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Serialize a message: fences, one line per field, a blank line, the body
pub fn format_message(frontmatter: &Frontmatter, body: &str) -> Result<String, FrontmatterError> {
    let lines = frontmatter.to_lines()?;
    Ok(format!(
        "{fence}\n{}\n{fence}\n\n{}",
        lines.join("\n"),
        body,
        fence = FENCE
    ))
}

/// Split message text into its frontmatter and body
pub fn parse_message(text: &str) -> Result<(Frontmatter, String), FrontmatterError> {
    let rest = text
        .strip_prefix("---\n")
        .or_else(|| text.strip_prefix("---\r\n"))
        .ok_or(FrontmatterError::MissingOpeningFence)?;

    let mut fields: BTreeMap<String, String> = BTreeMap::new();
    let mut offset = 0;
    let mut body_start = None;

    for line in rest.split_inclusive('\n') {
        offset += line.len();
        let trimmed = line.trim_end_matches(['\n', '\r']);
        if trimmed == FENCE {
            body_start = Some(offset);
            break;
        }
        if trimmed.trim().is_empty() {
            continue;
        }
        let (key, value) = trimmed
            .split_once(':')
            .ok_or_else(|| FrontmatterError::MalformedLine(trimmed.to_string()))?;
        let value = value.strip_prefix(' ').unwrap_or(value);
        fields.insert(key.trim().to_string(), value.to_string());
    }

    let body_start = body_start.ok_or(FrontmatterError::MissingClosingFence)?;
    let body = &rest[body_start..];
    let body = body
        .strip_prefix('\n')
        .or_else(|| body.strip_prefix("\r\n"))
        .unwrap_or(body);

    let mut take = |key: &'static str| {
        fields
            .remove(key)
            .ok_or(FrontmatterError::MissingField(key))
    };

    let to = parse_agent("to", &take("to")?)?;
    let from = parse_agent("from", &take("from")?)?;
    let msg_type = take("type")?;
    let msg_id = take("msg-id")?;
    let raw_timestamp = take("timestamp")?;
    let timestamp = DateTime::parse_from_rfc3339(raw_timestamp.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| FrontmatterError::InvalidTimestamp(raw_timestamp.clone()))?;

    Ok((
        Frontmatter {
            to,
            from,
            msg_type: msg_type.trim().to_string(),
            msg_id: msg_id.trim().to_string(),
            timestamp,
            extra: fields,
        },
        body.to_string(),
    ))
}

fn parse_agent(field: &'static str, value: &str) -> Result<AgentId, FrontmatterError> {
    value
        .parse()
        .map_err(|e: super::AddressError| FrontmatterError::InvalidAgent {
            field,
            reason: e.to_string(),
        })
}

fn check_key(key: &str) -> Result<(), FrontmatterError> {
    if key.is_empty()
        || key != key.trim()
        || key.contains([':', '\n', '\r'])
        || key == FENCE
    {
        return Err(FrontmatterError::InvalidKey(key.to_string()));
    }
    Ok(())
}

fn check_value(key: &str, value: &str) -> Result<(), FrontmatterError> {
    if value.trim().is_empty() || value.contains(['\n', '\r']) {
        return Err(FrontmatterError::InvalidValue {
            key: key.to_string(),
        });
    }
    Ok(())
}

/// Generate a message id that is safe to embed in a filename
pub fn new_message_id() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let counter = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{:x}{:04x}", nanos, counter)
}

/// A message about to be written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageDraft {
    pub from: AgentId,
    pub to: AgentId,
    pub msg_type: String,
    pub id: String,
    pub body: String,
    pub extra: BTreeMap<String, String>,
}

impl MessageDraft {
    /// Create a new draft
    pub fn new(
        from: AgentId,
        to: AgentId,
        msg_type: impl Into<String>,
        id: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            from,
            to,
            msg_type: msg_type.into(),
            id: id.into(),
            body: body.into(),
            extra: BTreeMap::new(),
        }
    }

    /// Create a draft from string identities
    pub fn try_new(
        from: impl AsRef<str>,
        to: impl AsRef<str>,
        msg_type: impl Into<String>,
        id: impl Into<String>,
        body: impl Into<String>,
    ) -> Result<Self, super::AddressError> {
        Ok(Self::new(
            from.as_ref().parse()?,
            to.as_ref().parse()?,
            msg_type,
            id,
            body,
        ))
    }

    /// Add an extension frontmatter field
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Build the frontmatter this draft will be written with
    pub fn frontmatter(&self, timestamp: DateTime<Utc>) -> Frontmatter {
        Frontmatter {
            to: self.to.clone(),
            from: self.from.clone(),
            msg_type: self.msg_type.clone(),
            msg_id: self.id.clone(),
            timestamp,
            extra: self.extra.clone(),
        }
    }
}

/// A message read back from the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    /// Where the message lives
    pub path: PathBuf,
    /// Identity decoded from the filename
    pub filename: ParsedFilename,
    /// Authoritative identity and extension fields
    pub frontmatter: Frontmatter,
    /// Original body, including any rearmatter block
    pub body: String,
}

impl StoredMessage {
    /// Read and decode a message file
    ///
    /// Fails with a structural error when the filename or the frontmatter is
    /// malformed; callers scanning a directory skip such files.
    pub fn read(path: impl AsRef<Path>) -> crate::Result<Self> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| filename::FilenameError::MissingExtension(path.display().to_string()))?;
        let parsed = filename::decode(name)?;
        let text = fs::read_to_string(path)?;
        let (frontmatter, body) = parse_message(&text)?;

        Ok(Self {
            path: path.to_path_buf(),
            filename: parsed,
            frontmatter,
            body,
        })
    }

    /// The file name (used as a stable per-message key)
    pub fn file_name(&self) -> &str {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
    }

    /// Frontmatter timestamp (full year, authoritative ordering key)
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.frontmatter.timestamp
    }

    /// Get the sender's identity
    pub fn sender(&self) -> &AgentId {
        &self.frontmatter.from
    }

    /// Get the recipient's identity
    pub fn recipient(&self) -> &AgentId {
        &self.frontmatter.to
    }

    pub fn msg_type(&self) -> &str {
        &self.frontmatter.msg_type
    }

    pub fn id(&self) -> &str {
        &self.frontmatter.msg_id
    }

    /// Body with any trailing rearmatter block removed
    pub fn content(&self) -> &str {
        rearmatter::extract(&self.body).content
    }

    /// Advisory validation of the attached rearmatter, if any
    pub fn rearmatter(&self) -> Option<RearmatterReport> {
        rearmatter::extract(&self.body)
            .block
            .map(rearmatter::validate)
    }
}

/// Selection criteria for the read API
#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    pub to: Option<AgentId>,
    pub from: Option<AgentId>,
    pub msg_type: Option<String>,
    pub since: Option<DateTime<Utc>>,
}

impl MessageFilter {
    /// Match everything
    pub fn new() -> Self {
        Self::default()
    }

    /// Only messages addressed to this agent (lenient match)
    pub fn addressed_to(mut self, agent: AgentId) -> Self {
        self.to = Some(agent);
        self
    }

    /// Only messages sent by this agent (lenient match)
    pub fn sent_by(mut self, agent: AgentId) -> Self {
        self.from = Some(agent);
        self
    }

    /// Only messages of this type
    pub fn of_type(mut self, msg_type: impl Into<String>) -> Self {
        self.msg_type = Some(msg_type.into());
        self
    }

    /// Only messages written at or after this time
    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    /// Check a stored message against the filter
    pub fn matches(&self, message: &StoredMessage) -> bool {
        if let Some(ref to) = self.to {
            if !to.matches(message.recipient().as_str()) {
                return false;
            }
        }
        if let Some(ref from) = self.from {
            if !from.matches(message.sender().as_str()) {
                return false;
            }
        }
        if let Some(ref msg_type) = self.msg_type {
            if message.msg_type() != msg_type {
                return false;
            }
        }
        if let Some(since) = self.since {
            if message.timestamp() < since {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_frontmatter() -> Frontmatter {
        MessageDraft::try_new("core/core", "team/worker", "task", "abc123", "hello")
            .unwrap()
            .frontmatter(Utc.with_ymd_and_hms(2026, 10, 19, 14, 30, 5).unwrap())
    }

    #[test]
    fn test_format_message_layout() {
        let text = format_message(&sample_frontmatter(), "hello").unwrap();
        assert_eq!(
            text,
            "---\nto: team/worker\nfrom: core/core\ntype: task\nmsg-id: abc123\n\
             timestamp: 2026-10-19T14:30:05Z\n---\n\nhello"
        );
    }

    #[test]
    fn test_mandatory_fields_win_over_extras() {
        let mut fm = sample_frontmatter();
        fm.extra.insert("to".to_string(), "someone/else".to_string());
        fm.extra.insert("headline".to_string(), "Parser: phase 2".to_string());

        let text = format_message(&fm, "body").unwrap();
        assert!(text.contains("to: team/worker\n"));
        assert!(!text.contains("someone/else"));

        let (parsed, body) = parse_message(&text).unwrap();
        assert_eq!(parsed.to.as_str(), "team/worker");
        assert_eq!(parsed.get("headline").as_deref(), Some("Parser: phase 2"));
        assert_eq!(body, "body");
    }

    #[test]
    fn test_get_covers_every_written_key() {
        let fm = sample_frontmatter();
        let text = format_message(&fm, "").unwrap();
        for line in text.lines().filter(|l| l.contains(": ")) {
            let (key, value) = line.split_once(": ").unwrap();
            assert_eq!(fm.get(key).as_deref(), Some(value), "key {}", key);
        }
        assert_eq!(fm.get("timestamp").as_deref(), Some("2026-10-19T14:30:05Z"));
        assert!(fm.get("missing").is_none());
    }

    #[test]
    fn test_parse_keeps_body_with_fences() {
        let body = "done\n---\nrearmatter:\n  confidence: 0.9\n---";
        let text = format_message(&sample_frontmatter(), body).unwrap();
        let (fm, parsed_body) = parse_message(&text).unwrap();
        assert_eq!(fm.msg_id, "abc123");
        assert_eq!(parsed_body, body);
    }

    #[test]
    fn test_parse_structural_errors() {
        assert_eq!(
            parse_message("no frontmatter"),
            Err(FrontmatterError::MissingOpeningFence)
        );
        assert_eq!(
            parse_message("---\nto: a\n"),
            Err(FrontmatterError::MissingClosingFence)
        );
        assert_eq!(
            parse_message("---\nto: a\nfrom: b\ntype: t\nmsg-id: x\n---\n"),
            Err(FrontmatterError::MissingField("timestamp"))
        );
        assert!(matches!(
            parse_message("---\nto: a\nfrom: b\ntype: t\nmsg-id: x\ntimestamp: yesterday\n---\n"),
            Err(FrontmatterError::InvalidTimestamp(_))
        ));
        assert!(matches!(
            parse_message("---\njunk line\n---\n"),
            Err(FrontmatterError::MalformedLine(_))
        ));
    }

    #[test]
    fn test_unrepresentable_extras_are_rejected() {
        let mut fm = sample_frontmatter();
        fm.extra.insert("note".to_string(), "two\nlines".to_string());
        assert!(matches!(
            format_message(&fm, ""),
            Err(FrontmatterError::InvalidValue { .. })
        ));

        let mut fm = sample_frontmatter();
        fm.extra.insert("bad:key".to_string(), "v".to_string());
        assert!(matches!(
            format_message(&fm, ""),
            Err(FrontmatterError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_message_ids_are_filename_safe() {
        let a = new_message_id();
        let b = new_message_id();
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
