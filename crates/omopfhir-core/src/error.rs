use thiserror::Error;

/// Errors from the FHIR model, dates and resource type names.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Invalid FHIR resource type: {0}")]
    InvalidResourceType(String),

    #[error("Invalid FHIR DateTime: {0}")]
    InvalidDateTime(String),

    #[error("Invalid resource data: {message}")]
    InvalidResource { message: String },

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Time parsing error: {0}")]
    TimeError(#[from] time::error::Parse),
}

impl CoreError {
    /// Create a new InvalidResourceType error
    pub fn invalid_resource_type(resource_type: impl Into<String>) -> Self {
        Self::InvalidResourceType(resource_type.into())
    }

    /// Create a new InvalidDateTime error
    pub fn invalid_date_time(datetime: impl Into<String>) -> Self {
        Self::InvalidDateTime(datetime.into())
    }

    /// Create a new InvalidResource error
    pub fn invalid_resource(message: impl Into<String>) -> Self {
        Self::InvalidResource {
            message: message.into(),
        }
    }

    /// Everything except a failure to serialize our own output is the
    /// caller's fault.
    pub fn is_client_error(&self) -> bool {
        !matches!(self, Self::JsonError(err) if err.is_io())
    }

    /// Get error category for logging and metrics
    pub fn category(&self) -> &'static str {
        match self {
            Self::InvalidResourceType(_) | Self::InvalidResource { .. } => "validation",
            Self::InvalidDateTime(_) | Self::TimeError(_) => "datetime",
            Self::JsonError(_) => "serialization",
        }
    }
}

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, CoreError>;
