//! Business-level error model.
//!
//! Every failure that reaches the wire is a [`ClassifiedError`]: an HTTP
//! (transport) status paired with a business code and a fixed message. The
//! optional cause travels to logs and notifications only; it is never
//! serialized into the response body.
use std::{fmt, sync::Arc};

use axum::{
    Json,
    response::{IntoResponse, Response},
};
use http::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Closed set of business codes emitted by the pipeline itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusinessCode {
    /// Unrecoverable fault while serving the request.
    ServerError,
    /// Rejected by admission control.
    TooManyRequests,
    /// Request parameters could not be bound.
    ParamBindError,
}

impl BusinessCode {
    pub const fn code(self) -> i32 {
        match self {
            BusinessCode::ServerError => 10001,
            BusinessCode::TooManyRequests => 10002,
            BusinessCode::ParamBindError => 10103,
        }
    }

    /// Fixed human-readable text for this code.
    pub const fn text(self) -> &'static str {
        match self {
            BusinessCode::ServerError => "Internal Server Error",
            BusinessCode::TooManyRequests => "Too Many Requests",
            BusinessCode::ParamBindError => "Invalid request parameters",
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            10001 => Some(BusinessCode::ServerError),
            10002 => Some(BusinessCode::TooManyRequests),
            10103 => Some(BusinessCode::ParamBindError),
            _ => None,
        }
    }
}

impl fmt::Display for BusinessCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.code(), self.text())
    }
}

/// Wire shape of every non-2xx response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub code: i32,
    pub message: String,
}

/// A failure classified into transport status and business code.
#[derive(Debug, Clone)]
pub struct ClassifiedError {
    http_status: StatusCode,
    business_code: i32,
    business_message: String,
    cause: Option<Arc<eyre::Report>>,
}

impl ClassifiedError {
    /// Build an error with an application-defined business code.
    ///
    /// A zero or otherwise invalid HTTP status is normalized to 500.
    pub fn new(http_status: u16, business_code: i32, message: impl Into<String>) -> Self {
        let http_status =
            StatusCode::from_u16(http_status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        Self {
            http_status,
            business_code,
            business_message: message.into(),
            cause: None,
        }
    }

    /// Build an error from one of the pipeline's own codes, using its fixed text.
    pub fn from_code(http_status: StatusCode, code: BusinessCode) -> Self {
        Self {
            http_status,
            business_code: code.code(),
            business_message: code.text().to_string(),
            cause: None,
        }
    }

    pub fn server_error() -> Self {
        Self::from_code(StatusCode::INTERNAL_SERVER_ERROR, BusinessCode::ServerError)
    }

    pub fn too_many_requests() -> Self {
        Self::from_code(StatusCode::TOO_MANY_REQUESTS, BusinessCode::TooManyRequests)
    }

    pub fn param_bind_error() -> Self {
        Self::from_code(StatusCode::BAD_REQUEST, BusinessCode::ParamBindError)
    }

    /// Attach the underlying cause. Returns a new value; the receiver is consumed.
    pub fn with_cause<E>(mut self, cause: E) -> Self
    where
        E: Into<eyre::Report>,
    {
        self.cause = Some(Arc::new(cause.into()));
        self
    }

    pub fn http_status(&self) -> StatusCode {
        self.http_status
    }

    pub fn business_code(&self) -> i32 {
        self.business_code
    }

    pub fn business_message(&self) -> &str {
        &self.business_message
    }

    pub fn cause(&self) -> Option<&eyre::Report> {
        self.cause.as_deref()
    }

    pub fn to_failure(&self) -> Failure {
        Failure {
            code: self.business_code,
            message: self.business_message.clone(),
        }
    }
}

impl fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}: {}",
            self.http_status.as_u16(),
            self.business_code,
            self.business_message
        )?;
        if let Some(cause) = &self.cause {
            write!(f, " (cause: {cause})")?;
        }
        Ok(())
    }
}

impl IntoResponse for ClassifiedError {
    fn into_response(self) -> Response {
        (self.http_status, Json(self.to_failure())).into_response()
    }
}

/// A panic recovered while running the handler chain.
#[derive(Debug, Clone, Error)]
#[error("request panicked: {message}")]
pub struct RequestFault {
    pub message: String,
    pub stack: String,
}

impl RequestFault {
    /// Convert into the wire-facing error. The stack stays server-side.
    pub fn classify(&self) -> ClassifiedError {
        ClassifiedError::server_error().with_cause(eyre::eyre!("{}", self.message))
    }
}
