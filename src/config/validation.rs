use std::net::SocketAddr;

use tracing_subscriber::EnvFilter;

use crate::config::models::{PipelineConfig, RateLimitConfig, ServerConfig};

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone)]
pub enum ValidationError {
    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid listen address '{address}': {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Server configuration validator
pub struct ServerConfigValidator;

impl ServerConfigValidator {
    /// Validate the entire server configuration, reporting every problem at once
    pub fn validate(config: &ServerConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = Self::validate_listen_address(&config.listen_addr) {
            errors.push(e);
        }

        if let Err(e) = config.shutdown_timeout() {
            errors.push(ValidationError::InvalidField {
                field: "shutdown_timeout".to_string(),
                message: e.to_string(),
            });
        }

        if let Err(e) = EnvFilter::try_new(&config.logging.level) {
            errors.push(ValidationError::InvalidField {
                field: "logging.level".to_string(),
                message: e.to_string(),
            });
        }

        if let Err(mut pipeline_errors) = Self::validate_pipeline(&config.pipeline) {
            errors.append(&mut pipeline_errors);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    /// Validate listen address format
    fn validate_listen_address(address: &str) -> ValidationResult<()> {
        if address.parse::<SocketAddr>().is_err() {
            return Err(ValidationError::InvalidListenAddress {
                address: address.to_string(),
                reason: "Must be in format 'IP:PORT' (e.g., '127.0.0.1:3000' or '0.0.0.0:8080')"
                    .to_string(),
            });
        }
        Ok(())
    }

    fn validate_pipeline(config: &PipelineConfig) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if config.enable_rate_limit {
            if let Err(e) = Self::validate_rate_limit(&config.rate_limit) {
                errors.push(e);
            }
        }

        if let Some(hook) = &config.panic_notify_hook {
            if let Err(e) = Self::validate_url(hook, "pipeline.panic_notify_hook") {
                errors.push(e);
            }
        }

        if config.max_body_bytes == 0 {
            errors.push(ValidationError::InvalidField {
                field: "pipeline.max_body_bytes".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn validate_rate_limit(config: &RateLimitConfig) -> ValidationResult<()> {
        if config.capacity == 0 {
            return Err(ValidationError::InvalidField {
                field: "pipeline.rate_limit.capacity".to_string(),
                message: "Must be greater than 0 when rate limiting is enabled".to_string(),
            });
        }
        if !config.refill_per_second.is_finite() || config.refill_per_second < 0.0 {
            return Err(ValidationError::InvalidField {
                field: "pipeline.rate_limit.refill_per_second".to_string(),
                message: format!(
                    "Must be a finite, non-negative number (got {})",
                    config.refill_per_second
                ),
            });
        }
        Ok(())
    }

    fn validate_url(url: &str, field_name: &str) -> ValidationResult<()> {
        match url::Url::parse(url) {
            Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => Ok(()),
            Ok(parsed) => Err(ValidationError::InvalidField {
                field: field_name.to_string(),
                message: format!("Unsupported URL scheme '{}'", parsed.scheme()),
            }),
            Err(e) => Err(ValidationError::InvalidField {
                field: field_name.to_string(),
                message: format!("Invalid URL '{url}': {e}"),
            }),
        }
    }

    fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
        if errors.len() == 1 {
            return errors[0].to_string();
        }

        let mut message = format!("Found {} validation errors:\n", errors.len());
        for (i, error) in errors.iter().enumerate() {
            message.push_str(&format!("  {}. {}\n", i + 1, error));
        }
        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(ServerConfigValidator::validate(&ServerConfig::default()).is_ok());
    }

    #[test]
    fn rejects_bad_listen_address() {
        let config = ServerConfig::builder().listen_addr("localhost").build();
        assert!(ServerConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn rejects_zero_capacity_only_when_enabled() {
        let mut config = ServerConfig::default();
        config.pipeline.rate_limit.capacity = 0;
        assert!(ServerConfigValidator::validate(&config).is_ok());

        config.pipeline.enable_rate_limit = true;
        assert!(ServerConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn rejects_non_http_notify_hook() {
        let mut config = ServerConfig::default();
        config.pipeline.panic_notify_hook = Some("ftp://alerts".to_string());
        assert!(ServerConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn reports_all_errors_together() {
        let mut config = ServerConfig::builder()
            .listen_addr("nope")
            .shutdown_timeout("soon")
            .build();
        config.pipeline.max_body_bytes = 0;

        let err = ServerConfigValidator::validate(&config).unwrap_err();
        assert!(err.to_string().contains("Found 3 validation errors"));
    }
}
