//! Service error taxonomy.

use thiserror::Error;

use crate::store::StoreError;

/// Errors returned by the broadcast services.
///
/// Everything except [`ServiceError::Store`] is raised before any side
/// effect and concerns only the caller.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// A field is missing or out of bounds.
    #[error("Invalid {field}: {message}")]
    Validation {
        field: &'static str,
        message: String,
    },

    /// Nothing displayable remained after sanitization.
    #[error("Content empty after sanitization")]
    EmptyContent,

    /// The caller may not post into this topic.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// The referenced entity does not exist for this caller.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The request is not supported on this session.
    #[error("Unsupported: {0}")]
    Unsupported(&'static str),

    /// Persistence failed.
    #[error("Store error: {0}")]
    Store(#[source] StoreError),
}

impl ServiceError {
    pub(crate) fn validation(field: &'static str, message: impl Into<String>) -> Self {
        ServiceError::Validation {
            field,
            message: message.into(),
        }
    }

    /// Numeric code carried in error frames.
    #[must_use]
    pub fn code(&self) -> u16 {
        match self {
            ServiceError::Validation { .. } | ServiceError::EmptyContent => 400,
            ServiceError::Forbidden(_) => 403,
            ServiceError::NotFound(_) => 404,
            ServiceError::Unsupported(_) => 405,
            ServiceError::Store(_) => 500,
        }
    }

    /// Check if this is a validation error (sanitized-empty content included).
    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ServiceError::Validation { .. } | ServiceError::EmptyContent
        )
    }

    /// Short label for the error counter.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            ServiceError::Validation { .. } => "validation",
            ServiceError::EmptyContent => "empty_content",
            ServiceError::Forbidden(_) => "forbidden",
            ServiceError::NotFound(_) => "not_found",
            ServiceError::Unsupported(_) => "unsupported",
            ServiceError::Store(_) => "store",
        }
    }
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => ServiceError::NotFound(what),
            other => ServiceError::Store(other),
        }
    }
}
