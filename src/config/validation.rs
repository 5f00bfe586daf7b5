//! Configuration validation
//!
//! Validates bus configuration for correctness:
//! - Timing intervals are non-zero and consistent
//! - Retry policy can only grow its backoff
//! - Dual-write has a distinct destination

use super::bus_config::BusConfig;
use crate::MeshBusError;

/// Validation error details
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub section: Option<String>,
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            section: None,
            field: field.into(),
            message: message.into(),
        }
    }

    fn in_section(mut self, section: impl Into<String>) -> Self {
        self.section = Some(section.into());
        self
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(ref section) = self.section {
            write!(f, "[{}] {}: {}", section, self.field, self.message)
        } else {
            write!(f, "{}: {}", self.field, self.message)
        }
    }
}

/// Validation result
pub type ValidationResult = std::result::Result<(), Vec<ValidationError>>;

/// Validate a bus configuration
pub fn validate_config(config: &BusConfig) -> ValidationResult {
    let mut errors = Vec::new();

    for (field, value) in [
        ("settle_delay_ms", config.settle_delay_ms),
        ("poll_interval_ms", config.poll_interval_ms),
        ("rescan_interval_ms", config.rescan_interval_ms),
        ("stop_grace_ms", config.stop_grace_ms),
    ] {
        if value == 0 {
            errors.push(ValidationError::new(field, "Must be greater than zero"));
        }
    }

    if config.rescan_interval_ms < config.poll_interval_ms {
        errors.push(ValidationError::new(
            "rescan_interval_ms",
            format!(
                "Rescan interval ({}ms) must not be shorter than the poll interval ({}ms)",
                config.rescan_interval_ms, config.poll_interval_ms
            ),
        ));
    }

    let retry = &config.delivery_retry;
    if !retry.multiplier.is_finite() || retry.multiplier < 1.0 {
        errors.push(
            ValidationError::new(
                "multiplier",
                format!("Backoff multiplier must be at least 1.0, got {}", retry.multiplier),
            )
            .in_section("delivery_retry"),
        );
    }
    if retry.max_backoff_ms < retry.initial_backoff_ms {
        errors.push(
            ValidationError::new(
                "max_backoff_ms",
                "Maximum backoff must not be shorter than the initial backoff",
            )
            .in_section("delivery_retry"),
        );
    }

    match (&config.legacy_dir, config.dual_write) {
        (None, true) => errors.push(ValidationError::new(
            "legacy_dir",
            "dual_write is enabled but no legacy_dir is set",
        )),
        (Some(legacy), _) if *legacy == config.messages_dir() => {
            errors.push(ValidationError::new(
                "legacy_dir",
                "legacy_dir must differ from the messages directory",
            ))
        }
        _ => {}
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Validate and return a formatted error
pub fn validate_config_result(config: &BusConfig) -> crate::Result<()> {
    validate_config(config).map_err(|errors| {
        let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        MeshBusError::Config(format!(
            "Configuration validation failed:\n  - {}",
            messages.join("\n  - ")
        ))
    })
}
