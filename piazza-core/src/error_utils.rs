use crate::error::*;
use tracing::{error, warn};

pub trait ErrorExt {
    fn log_error(&self) -> &Self;
    fn log_warn(&self) -> &Self;
    fn is_retryable(&self) -> bool;
    fn user_friendly_message(&self) -> String;
    fn error_code(&self) -> String;
}

impl ErrorExt for CoreError {
    fn log_error(&self) -> &Self {
        error!("CoreError: {}", self);
        match self {
            CoreError::Piazza(e) => {
                error!("Piazza API error details: {:?}", e);
            }
            CoreError::Config(e) => {
                error!("Configuration error details: {:?}", e);
            }
            _ => {}
        }
        self
    }

    fn log_warn(&self) -> &Self {
        warn!("CoreError (warning): {}", self);
        self
    }

    fn is_retryable(&self) -> bool {
        match self {
            CoreError::Piazza(e) => e.is_retryable(),
            _ => false,
        }
    }

    fn user_friendly_message(&self) -> String {
        match self {
            CoreError::Piazza(e) => e.user_friendly_message(),
            CoreError::Config(e) => e.user_friendly_message(),
            CoreError::Network(_) => {
                "Network connection error. Please check your internet connection.".to_string()
            }
            CoreError::Io(e) => format!("File access failed: {}", e),
            CoreError::Serialization(_) => {
                "A data file could not be read as JSON. It may be truncated or hand-edited."
                    .to_string()
            }
            CoreError::Cancelled => "The harvest was interrupted.".to_string(),
            CoreError::InvalidInput { message } => format!("Invalid input: {}", message),
            CoreError::Internal { .. } => {
                "An unexpected error occurred. Please try again later.".to_string()
            }
        }
    }

    fn error_code(&self) -> String {
        match self {
            CoreError::Piazza(_) => "PIAZZA_API".to_string(),
            CoreError::Config(_) => "CONFIG".to_string(),
            CoreError::Io(_) => "IO".to_string(),
            CoreError::Serialization(_) => "SERIALIZATION".to_string(),
            CoreError::Network(_) => "NETWORK".to_string(),
            CoreError::Cancelled => "CANCELLED".to_string(),
            CoreError::InvalidInput { .. } => "INVALID_INPUT".to_string(),
            CoreError::Internal { .. } => "INTERNAL".to_string(),
        }
    }
}

impl ErrorExt for PiazzaApiError {
    fn log_error(&self) -> &Self {
        error!("PiazzaApiError: {}", self);
        self
    }

    fn log_warn(&self) -> &Self {
        warn!("PiazzaApiError (warning): {}", self);
        self
    }

    /// Only throttling is worth another attempt; everything else is fatal to the run.
    fn is_retryable(&self) -> bool {
        matches!(self, PiazzaApiError::RateLimited { .. })
    }

    fn user_friendly_message(&self) -> String {
        match self {
            PiazzaApiError::AuthenticationFailed { .. } => {
                "Piazza login failed. Please check PIAZZA_EMAIL and PIAZZA_PASSWORD.".to_string()
            }
            PiazzaApiError::NotAuthenticated => {
                "Not logged in to Piazza. Log in before fetching posts.".to_string()
            }
            PiazzaApiError::RateLimited { .. } => {
                "Piazza is throttling requests. Please wait before trying again.".to_string()
            }
            PiazzaApiError::PostNotFound { post_id } => {
                format!("Post {} could not be found.", post_id)
            }
            PiazzaApiError::ServerError { status_code } => {
                format!("Piazza returned a server error ({}).", status_code)
            }
            _ => "Piazza API error occurred. Please try again later.".to_string(),
        }
    }

    fn error_code(&self) -> String {
        match self {
            PiazzaApiError::AuthenticationFailed { .. } => "PIAZZA_AUTH_FAILED".to_string(),
            PiazzaApiError::NotAuthenticated => "PIAZZA_NOT_AUTHENTICATED".to_string(),
            PiazzaApiError::RateLimited { .. } => "PIAZZA_RATE_LIMIT".to_string(),
            PiazzaApiError::RequestFailed { .. } => "PIAZZA_REQUEST_FAILED".to_string(),
            PiazzaApiError::PostNotFound { .. } => "PIAZZA_POST_NOT_FOUND".to_string(),
            PiazzaApiError::InvalidResponse { .. } => "PIAZZA_INVALID_RESPONSE".to_string(),
            PiazzaApiError::ServerError { .. } => "PIAZZA_SERVER_ERROR".to_string(),
        }
    }
}

impl ErrorExt for ConfigError {
    fn log_error(&self) -> &Self {
        error!("ConfigError: {}", self);
        self
    }

    fn log_warn(&self) -> &Self {
        warn!("ConfigError (warning): {}", self);
        self
    }

    fn is_retryable(&self) -> bool {
        false
    }

    fn user_friendly_message(&self) -> String {
        match self {
            ConfigError::FileNotFound { path } => {
                format!("Configuration file '{}' was not found.", path)
            }
            ConfigError::MissingField { field } => {
                format!("Configuration is missing the required field '{}'.", field)
            }
            ConfigError::InvalidValue { field, value } => {
                format!("'{}' is not a valid value for {}.", value, field)
            }
            ConfigError::MissingEnvironmentVariable { var_name } => {
                format!("Please set the {} environment variable.", var_name)
            }
            ConfigError::Parse(_) => {
                "The configuration file is not valid TOML.".to_string()
            }
        }
    }

    fn error_code(&self) -> String {
        match self {
            ConfigError::FileNotFound { .. } => "CONFIG_FILE_NOT_FOUND".to_string(),
            ConfigError::MissingField { .. } => "CONFIG_MISSING_FIELD".to_string(),
            ConfigError::InvalidValue { .. } => "CONFIG_INVALID_VALUE".to_string(),
            ConfigError::MissingEnvironmentVariable { .. } => "CONFIG_MISSING_ENV".to_string(),
            ConfigError::Parse(_) => "CONFIG_PARSE".to_string(),
        }
    }
}

/// Reports errors to the log in a consistent shape.
#[derive(Debug, Clone)]
pub struct ErrorReporter {
    report_errors: bool,
    report_warnings: bool,
}

impl Default for ErrorReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorReporter {
    pub fn new() -> Self {
        Self {
            report_errors: true,
            report_warnings: false,
        }
    }

    pub fn with_error_reporting(mut self, enabled: bool) -> Self {
        self.report_errors = enabled;
        self
    }

    pub fn with_warning_reporting(mut self, enabled: bool) -> Self {
        self.report_warnings = enabled;
        self
    }

    pub fn report_error(&self, error: &CoreError) {
        if self.report_errors {
            error.log_error();
            error!(
                code = %error.error_code(),
                "{}",
                error.user_friendly_message()
            );
        }
    }

    pub fn report_warning(&self, error: &CoreError) {
        if self.report_warnings {
            error.log_warn();
        }
    }
}
