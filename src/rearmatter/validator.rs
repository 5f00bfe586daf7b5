//! Rearmatter extraction and validation
//!
//! Validation is advisory: it reports errors and warnings but never decides
//! whether a message is written or delivered.

use super::types::{requires_sections, Grade, LineNotes, Rearmatter, SpawnPriority, SpawnRequest};
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use thiserror::Error;

/// Top-level key wrapping the block on disk
pub const BLOCK_KEY: &str = "rearmatter";

/// Top-level fields with a defined meaning; anything else is warned about
pub const RECOGNIZED_FIELDS: [&str; 8] = [
    "confidence",
    "confidence_sections",
    "grade",
    "grade_sections",
    "speculation",
    "gaps",
    "assumptions",
    "spawn",
];

const BLOCK_OPEN: &str = "---\nrearmatter:";
const BLOCK_CLOSE: &str = "\n---";

/// Structural failures, raised only by [`validate_strict`]
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RearmatterError {
    #[error("rearmatter is not valid YAML: {0}")]
    Syntax(String),

    #[error("rearmatter must be a mapping, got {0}")]
    NotAMapping(&'static str),
}

/// A message body split into content and trailing rearmatter block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extracted<'a> {
    /// Body without the block (the whole body when there is none)
    pub content: &'a str,
    /// Text between the block fences, starting with `rearmatter:`
    pub block: Option<&'a str>,
}

/// Outcome of validating one rearmatter block
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RearmatterReport {
    /// True iff `errors` is empty
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    /// Every field that validated, normalized (grades uppercased)
    pub data: Option<Rearmatter>,
    /// Whether the confidence/grade values demand a section breakdown
    pub requires_sections: bool,
}

impl RearmatterReport {
    fn structural(error: &RearmatterError) -> Self {
        Self {
            valid: false,
            errors: vec![error.to_string()],
            ..Default::default()
        }
    }
}

/// Split a trailing rearmatter block off a message body
///
/// The block must be the last thing in the body:
///
/// ```text
/// ---
/// rearmatter:
///   confidence: 0.8
/// ---
/// ```
pub fn extract(body: &str) -> Extracted<'_> {
    let none = Extracted {
        content: body,
        block: None,
    };

    let trimmed = body.trim_end();
    if !trimmed.ends_with(BLOCK_CLOSE) {
        return none;
    }

    let Some(open) = trimmed.rfind(BLOCK_OPEN) else {
        return none;
    };
    if open > 0 && !trimmed[..open].ends_with('\n') {
        return none;
    }

    let inner_start = open + "---\n".len();
    let inner_end = trimmed.len() - BLOCK_CLOSE.len();
    if inner_end < inner_start {
        return none;
    }

    Extracted {
        content: trimmed[..open].trim_end(),
        block: Some(&trimmed[inner_start..inner_end]),
    }
}

/// Validate a rearmatter block, reporting structural problems as errors
pub fn validate(text: &str) -> RearmatterReport {
    match load_mapping(text) {
        Ok(mapping) => validate_mapping(&mapping),
        Err(e) => RearmatterReport::structural(&e),
    }
}

/// Validate a rearmatter block, failing on unparseable or non-mapping input
pub fn validate_strict(text: &str) -> Result<RearmatterReport, RearmatterError> {
    let mapping = load_mapping(text)?;
    Ok(validate_mapping(&mapping))
}

/// Serialize rearmatter to YAML (without the `rearmatter:` wrapper)
pub fn format(data: &Rearmatter) -> Result<String, serde_yaml::Error> {
    serde_yaml::to_string(data)
}

/// Render a complete fenced block ready to append to a body
pub fn format_block(data: &Rearmatter) -> Result<String, serde_yaml::Error> {
    let mut wrapper = BTreeMap::new();
    wrapper.insert(BLOCK_KEY, data);
    let yaml = serde_yaml::to_string(&wrapper)?;
    Ok(format!("---\n{}---", yaml))
}

/// Append a block to a body, separated by a blank line
pub fn append_block(body: &str, data: &Rearmatter) -> Result<String, serde_yaml::Error> {
    Ok(format!("{}\n\n{}", body.trim_end(), format_block(data)?))
}

fn load_mapping(text: &str) -> Result<Mapping, RearmatterError> {
    let value: Value =
        serde_yaml::from_str(text).map_err(|e| RearmatterError::Syntax(e.to_string()))?;

    let mapping = match value {
        Value::Mapping(m) => m,
        other => return Err(RearmatterError::NotAMapping(kind(&other))),
    };

    // Accept both the wrapped form from a body and a bare mapping
    if mapping.len() == 1 {
        if let Some(inner) = mapping.get(BLOCK_KEY) {
            return match inner {
                Value::Mapping(m) => Ok(m.clone()),
                other => Err(RearmatterError::NotAMapping(kind(other))),
            };
        }
    }

    Ok(mapping)
}

#[derive(Default)]
struct Findings {
    errors: Vec<String>,
    warnings: Vec<String>,
}

impl Findings {
    fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }
}

fn validate_mapping(mapping: &Mapping) -> RearmatterReport {
    let mut findings = Findings::default();
    let mut data = Rearmatter::default();

    for key in mapping.keys() {
        let name = key_string(key);
        if !RECOGNIZED_FIELDS.contains(&name.as_str()) {
            findings.warn(format!("unknown rearmatter field '{}'", name));
        }
    }

    let raw_confidence = mapping.get("confidence");
    let raw_grade = mapping.get("grade");

    if let Some(value) = raw_confidence {
        match check_confidence("confidence", value) {
            Ok(c) => data.confidence = Some(c),
            Err(e) => findings.error(e),
        }
    }
    if let Some(value) = raw_grade {
        match check_grade("grade", value) {
            Ok(g) => data.grade = Some(g),
            Err(e) => findings.error(e),
        }
    }

    let needs_sections = requires_sections(
        raw_confidence.and_then(Value::as_f64),
        raw_grade
            .and_then(Value::as_str)
            .and_then(|g| g.parse::<Grade>().ok()),
    );

    data.confidence_sections = check_sections(
        mapping,
        "confidence_sections",
        raw_confidence.is_some(),
        needs_sections,
        &mut findings,
        check_confidence,
    );
    data.grade_sections = check_sections(
        mapping,
        "grade_sections",
        raw_grade.is_some(),
        needs_sections,
        &mut findings,
        check_grade,
    );

    data.speculation = check_line_notes(mapping, "speculation", &mut findings);
    data.gaps = check_line_notes(mapping, "gaps", &mut findings);
    data.assumptions = check_line_notes(mapping, "assumptions", &mut findings);

    if let Some(value) = mapping.get("spawn") {
        data.spawn = check_spawn(value, &mut findings);
    }

    RearmatterReport {
        valid: findings.errors.is_empty(),
        errors: findings.errors,
        warnings: findings.warnings,
        data: Some(data),
        requires_sections: needs_sections,
    }
}

fn check_confidence(field: &str, value: &Value) -> Result<f64, String> {
    let Some(c) = value.as_f64() else {
        return Err(format!("{} must be a number, got {}", field, kind(value)));
    };
    if !(0.0..=1.0).contains(&c) {
        return Err(format!("{} must be between 0 and 1, got {}", field, c));
    }
    Ok(c)
}

fn check_grade(field: &str, value: &Value) -> Result<Grade, String> {
    let Some(s) = value.as_str() else {
        return Err(format!(
            "{} must be one of A, B, C, D, F, got {}",
            field,
            kind(value)
        ));
    };
    s.parse::<Grade>()
        .map_err(|_| format!("{} must be one of A, B, C, D, F, got '{}'", field, s))
}

fn check_sections<T>(
    mapping: &Mapping,
    field: &str,
    top_level_present: bool,
    needs_sections: bool,
    findings: &mut Findings,
    check: fn(&str, &Value) -> Result<T, String>,
) -> Option<BTreeMap<String, T>> {
    let Some(value) = mapping.get(field) else {
        if needs_sections && top_level_present {
            findings.warn(format!(
                "below threshold (confidence < 0.7 or grade worse than C) but no {} breakdown provided",
                field
            ));
        }
        return None;
    };

    if !needs_sections {
        findings.warn(format!("{} provided but not required", field));
    }

    let Value::Mapping(entries) = value else {
        findings.error(format!("{} must be a mapping, got {}", field, kind(value)));
        return None;
    };

    let mut sections = BTreeMap::new();
    for (key, entry) in entries {
        let name = key_string(key);
        match check(&format!("{}.{}", field, name), entry) {
            Ok(v) => {
                sections.insert(name, v);
            }
            Err(e) => findings.error(e),
        }
    }
    Some(sections)
}

fn check_line_notes(mapping: &Mapping, field: &str, findings: &mut Findings) -> Option<LineNotes> {
    let value = mapping.get(field)?;
    let Value::Mapping(entries) = value else {
        findings.error(format!("{} must be a mapping, got {}", field, kind(value)));
        return None;
    };

    let mut notes = LineNotes::new();
    for (key, entry) in entries {
        let name = key_string(key);
        let line = line_number(key);
        if line.is_none() {
            findings.warn(format!(
                "{} key '{}' is not a positive line number",
                field, name
            ));
        }

        let Some(text) = entry.as_str() else {
            findings.error(format!(
                "{}.{} must be a string, got {}",
                field,
                name,
                kind(entry)
            ));
            continue;
        };
        if text.trim().is_empty() {
            findings.warn(format!("{}.{} is empty", field, name));
            continue;
        }
        if let Some(line) = line {
            notes.insert(line, text.to_string());
        }
    }
    Some(notes)
}

fn check_spawn(value: &Value, findings: &mut Findings) -> Option<SpawnRequest> {
    let Value::Mapping(spawn) = value else {
        findings.error(format!("spawn must be a mapping, got {}", kind(value)));
        return None;
    };

    let mut required = |field: &str| -> Option<String> {
        match spawn.get(field) {
            None => {
                findings.error(format!("spawn.{} is required", field));
                None
            }
            Some(Value::String(s)) if s.trim().is_empty() => {
                findings.error(format!("spawn.{} cannot be empty", field));
                None
            }
            Some(Value::String(s)) => Some(s.clone()),
            Some(other) => {
                findings.error(format!("spawn.{} must be a string, got {}", field, kind(other)));
                None
            }
        }
    };
    let mesh = required("mesh");
    let reason = required("reason");
    let context = required("context");

    let lens = spawn
        .get("lens")
        .and_then(|v| check_string_list("spawn.lens", v, findings));
    let entity_refs = spawn
        .get("entity_refs")
        .and_then(|v| check_string_list("spawn.entity_refs", v, findings));

    let priority = spawn.get("priority").and_then(|v| {
        let parsed = match v.as_str() {
            Some(s) => s.parse::<SpawnPriority>(),
            None => Err(format!(
                "spawn.priority must be one of high, normal, low, got {}",
                kind(v)
            )),
        };
        parsed.map_err(|e| findings.error(e)).ok()
    });

    for key in spawn.keys() {
        let name = key_string(key);
        if ![
            "mesh",
            "reason",
            "context",
            "lens",
            "priority",
            "entity_refs",
        ]
        .contains(&name.as_str())
        {
            findings.warn(format!("unknown spawn field '{}'", name));
        }
    }

    Some(SpawnRequest {
        mesh: mesh?,
        reason: reason?,
        context: context?,
        lens,
        priority,
        entity_refs,
    })
}

fn check_string_list(field: &str, value: &Value, findings: &mut Findings) -> Option<Vec<String>> {
    let Value::Sequence(items) = value else {
        findings.error(format!("{} must be a list of strings, got {}", field, kind(value)));
        return None;
    };

    let mut list = Vec::with_capacity(items.len());
    let mut ok = true;
    for (i, item) in items.iter().enumerate() {
        match item.as_str() {
            Some(s) => list.push(s.to_string()),
            None => {
                findings.error(format!("{}[{}] must be a string, got {}", field, i, kind(item)));
                ok = false;
            }
        }
    }
    ok.then_some(list)
}

fn line_number(key: &Value) -> Option<u32> {
    let n = match key {
        Value::Number(n) => n.as_u64()?,
        Value::String(s) => s.trim().parse::<u64>().ok()?,
        _ => return None,
    };
    if n == 0 {
        return None;
    }
    u32::try_from(n).ok()
}

fn key_string(key: &Value) -> String {
    match key {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => "null".to_string(),
        other => kind(other).to_string(),
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Sequence(_) => "a list",
        Value::Mapping(_) => "a mapping",
        Value::Tagged(_) => "a tagged value",
    }
}
