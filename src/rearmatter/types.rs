//! Rearmatter data types

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Confidence below this value makes a section breakdown mandatory
pub const CONFIDENCE_THRESHOLD: f64 = 0.7;

/// Grades worse than this make a section breakdown mandatory
pub const GRADE_THRESHOLD: Grade = Grade::C;

/// Self-assessed quality grade, best to worst
///
/// Ordering follows declaration order, so `Grade::A < Grade::F` and
/// "worse than C" is `grade > Grade::C`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Grade {
    A,
    B,
    C,
    D,
    F,
}

impl Grade {
    pub const ALL: [Grade; 5] = [Grade::A, Grade::B, Grade::C, Grade::D, Grade::F];

    pub fn as_str(&self) -> &'static str {
        match self {
            Grade::A => "A",
            Grade::B => "B",
            Grade::C => "C",
            Grade::D => "D",
            Grade::F => "F",
        }
    }

    /// Check whether this grade is strictly worse than `other`
    pub fn is_worse_than(&self, other: Grade) -> bool {
        *self > other
    }
}

impl FromStr for Grade {
    type Err = String;

    /// Case-insensitive; surrounding whitespace is ignored
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "A" => Ok(Grade::A),
            "B" => Ok(Grade::B),
            "C" => Ok(Grade::C),
            "D" => Ok(Grade::D),
            "F" => Ok(Grade::F),
            _ => Err(format!("grade must be one of A, B, C, D, F, got '{}'", s)),
        }
    }
}

impl fmt::Display for Grade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Urgency of a spawn request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpawnPriority {
    High,
    #[default]
    Normal,
    Low,
}

impl FromStr for SpawnPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" => Ok(SpawnPriority::High),
            "normal" => Ok(SpawnPriority::Normal),
            "low" => Ok(SpawnPriority::Low),
            _ => Err(format!(
                "spawn.priority must be one of high, normal, low, got '{}'",
                s
            )),
        }
    }
}

/// Request for a new mesh to be spawned on the sender's behalf
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnRequest {
    pub mesh: String,
    pub reason: String,
    pub context: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lens: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<SpawnPriority>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_refs: Option<Vec<String>>,
}

impl SpawnRequest {
    pub fn new(
        mesh: impl Into<String>,
        reason: impl Into<String>,
        context: impl Into<String>,
    ) -> Self {
        Self {
            mesh: mesh.into(),
            reason: reason.into(),
            context: context.into(),
            lens: None,
            priority: None,
            entity_refs: None,
        }
    }

    pub fn with_priority(mut self, priority: SpawnPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_lens(mut self, lens: Vec<String>) -> Self {
        self.lens = Some(lens);
        self
    }

    pub fn with_entity_refs(mut self, refs: Vec<String>) -> Self {
        self.entity_refs = Some(refs);
        self
    }
}

/// Line-numbered annotations (`speculation`, `gaps`, `assumptions`)
pub type LineNotes = BTreeMap<u32, String>;

/// Structured self-assessment attached to a message body
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Rearmatter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence_sections: Option<BTreeMap<String, f64>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grade: Option<Grade>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grade_sections: Option<BTreeMap<String, Grade>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speculation: Option<LineNotes>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gaps: Option<LineNotes>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assumptions: Option<LineNotes>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spawn: Option<SpawnRequest>,
}

impl Rearmatter {
    /// Whether this self-assessment must carry a section breakdown
    pub fn requires_sections(&self) -> bool {
        requires_sections(self.confidence, self.grade)
    }
}

/// Breakdown policy: sections are mandatory when confidence is below 0.7 or
/// the grade is worse than C
///
/// Depends only on the two values, not on whether sections were supplied.
pub fn requires_sections(confidence: Option<f64>, grade: Option<Grade>) -> bool {
    let low_confidence = confidence.is_some_and(|c| c < CONFIDENCE_THRESHOLD);
    let low_grade = grade.is_some_and(|g| g.is_worse_than(GRADE_THRESHOLD));
    low_confidence || low_grade
}
