//! Configuration validation utilities.

use super::error::{ConfigError, ConfigResult};
use super::schema::{ConcordConfig, LogOutput, LogRotation, LoggingConfig};
use concord_analysis::PreviewConfig;
use concord_framework::WakeConfig;

/// Validates the entire configuration.
pub fn validate_config(config: &ConcordConfig) -> ConfigResult<()> {
    validate_logging_config(&config.logging)?;
    validate_wake_config(&config.wake)?;

    if config.analysis.call_graph_depth == 0 {
        return Err(ConfigError::validation(
            "analysis.call_graph_depth must be greater than 0",
        ));
    }

    validate_preview_config(&config.preview)?;
    Ok(())
}

/// Validates logging settings.
fn validate_logging_config(logging: &LoggingConfig) -> ConfigResult<()> {
    for module in logging.filters.keys() {
        if module.trim().is_empty() {
            return Err(ConfigError::validation("Log filter module name cannot be empty"));
        }
    }

    if logging.output == LogOutput::File && logging.file_path.is_none() {
        return Err(ConfigError::validation(
            "logging.file_path is required when output is 'file'",
        ));
    }

    if logging.rotation != LogRotation::Never && logging.max_files == 0 {
        return Err(ConfigError::validation(
            "logging.max_files must be greater than 0 when rotation is enabled",
        ));
    }

    Ok(())
}

/// Validates wake settings.
fn validate_wake_config(wake: &WakeConfig) -> ConfigResult<()> {
    if wake.wake_prefix.iter().any(|p| p.is_empty()) {
        return Err(ConfigError::validation("Wake prefixes cannot be empty strings"));
    }

    if wake.plugin_set.iter().any(|p| p.trim().is_empty()) {
        return Err(ConfigError::validation("plugin_set entries cannot be empty"));
    }

    Ok(())
}

/// Validates dry-run preview settings.
fn validate_preview_config(preview: &PreviewConfig) -> ConfigResult<()> {
    if preview.slow_handler_ms == 0 {
        return Err(ConfigError::validation(
            "preview.slow_handler_ms must be greater than 0",
        ));
    }

    if preview.default_sender_id.is_empty() {
        return Err(ConfigError::validation(
            "preview.default_sender_id cannot be empty",
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_default_config() {
        let config = ConcordConfig::default();
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_validate_invalid_log_level() {
        // Unknown level names never reach validation: they fail to deserialize.
        let parsed = serde_json::from_str::<ConcordConfig>(r#"{"logging": {"level": "verbose"}}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_validate_empty_wake_prefix() {
        let mut config = ConcordConfig::default();
        config.wake.wake_prefix = vec!["/".to_string(), String::new()];

        let result = validate_config(&config);
        assert!(matches!(result, Err(ConfigError::ValidationError { .. })));
    }

    #[test]
    fn test_validate_zero_limits() {
        let mut config = ConcordConfig::default();
        config.analysis.call_graph_depth = 0;
        assert!(validate_config(&config).is_err());

        let mut config = ConcordConfig::default();
        config.preview.slow_handler_ms = 0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_file_output_needs_path() {
        let mut config = ConcordConfig::default();
        config.logging.output = LogOutput::File;
        assert!(validate_config(&config).is_err());

        config.logging.file_path = Some("logs/concord.log".into());
        assert!(validate_config(&config).is_ok());

        config.logging.rotation = LogRotation::Hourly;
        config.logging.max_files = 0;
        assert!(validate_config(&config).is_err());
    }
}
