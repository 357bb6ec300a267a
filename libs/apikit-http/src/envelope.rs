//! Uniform success/error wrapper returned by [`BaseApiService`](crate::BaseApiService)

use crate::error::{ApiError, ErrorKind, FieldErrors};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use time::OffsetDateTime;

/// Free-form key/value metadata attached to envelopes and error details
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Error part of a failed [`ApiResponse`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetail {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// Present for validation failures only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_errors: Option<FieldErrors>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl ErrorDetail {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
            field_errors: None,
            metadata: None,
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    #[must_use]
    pub fn with_field_errors(mut self, field_errors: FieldErrors) -> Self {
        self.field_errors = Some(field_errors);
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

impl From<&ApiError> for ErrorDetail {
    fn from(err: &ApiError) -> Self {
        let mut detail = ErrorDetail::new(err.kind(), err.message());
        detail.details = err.details().map(ToOwned::to_owned);
        detail.field_errors = err.field_errors().cloned();
        detail
    }
}

/// Success or error result of one logical request
///
/// `success` is true exactly when `error` is absent, and `data` is only ever
/// present on success. Fields are private so the pair cannot drift apart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[must_use]
pub struct ApiResponse<T> {
    success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<ErrorDetail>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    metadata: Option<Metadata>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
            status_code: None,
            error: None,
            metadata: None,
        }
    }

    /// Failed envelope with an explicit error detail
    pub fn failure(error: ErrorDetail, status_code: Option<u16>) -> Self {
        Self {
            success: false,
            data: None,
            message: Some(error.message.clone()),
            status_code,
            error: Some(error),
            metadata: None,
        }
    }

    /// Map a taxonomy error to a failed envelope
    ///
    /// Validation keeps its field errors and status 422, Unauthorized is
    /// always 401, other kinds carry the status of the response (if any).
    pub fn from_error(err: &ApiError) -> Self {
        Self::failure(ErrorDetail::from(err), err.status_code())
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_status_code(mut self, status_code: u16) -> Self {
        self.status_code = Some(status_code);
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.success
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        !self.success
    }

    #[must_use]
    pub fn has_data(&self) -> bool {
        self.data.is_some()
    }

    #[must_use]
    pub fn is_validation_error(&self) -> bool {
        self.error_kind() == Some(ErrorKind::Validation)
    }

    #[must_use]
    pub fn is_unauthorized(&self) -> bool {
        self.error_kind() == Some(ErrorKind::Unauthorized)
    }

    #[must_use]
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    #[must_use]
    pub fn field_errors(&self) -> Option<&FieldErrors> {
        self.error.as_ref().and_then(|e| e.field_errors.as_ref())
    }

    #[must_use]
    pub fn data(&self) -> Option<&T> {
        self.data.as_ref()
    }

    #[must_use]
    pub fn into_data(self) -> Option<T> {
        self.data
    }

    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    #[must_use]
    pub fn status_code(&self) -> Option<u16> {
        self.status_code
    }

    #[must_use]
    pub fn error(&self) -> Option<&ErrorDetail> {
        self.error.as_ref()
    }

    #[must_use]
    pub fn metadata(&self) -> Option<&Metadata> {
        self.metadata.as_ref()
    }

    /// Transform the payload, keeping everything else
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ApiResponse<U> {
        ApiResponse {
            success: self.success,
            data: self.data.map(f),
            message: self.message,
            status_code: self.status_code,
            error: self.error,
            metadata: self.metadata,
        }
    }
}

impl<T> From<Result<T, ApiError>> for ApiResponse<T> {
    fn from(result: Result<T, ApiError>) -> Self {
        match result {
            Ok(data) => ApiResponse::success(data),
            Err(err) => ApiResponse::from_error(&err),
        }
    }
}
