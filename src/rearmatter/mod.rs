//! Rearmatter: trailing self-assessment blocks on message bodies
//!
//! An agent may end a message body with a fenced YAML block describing how
//! confident it is in the content:
//!
//! ```text
//! Refactored the parser.
//!
//! ---
//! rearmatter:
//!   confidence: 0.6
//!   grade: B
//!   confidence_sections:
//!     lexer: 0.9
//!     recovery: 0.3
//! ---
//! ```
//!
//! Low confidence or a poor grade calls for a per-section breakdown. The
//! validator reports problems but never rejects a message.

mod types;
mod validator;

pub use types::{
    requires_sections, Grade, LineNotes, Rearmatter, SpawnPriority, SpawnRequest,
    CONFIDENCE_THRESHOLD, GRADE_THRESHOLD,
};
pub use validator::{
    append_block, extract, format, format_block, validate, validate_strict, Extracted,
    RearmatterError, RearmatterReport, BLOCK_KEY, RECOGNIZED_FIELDS,
};
