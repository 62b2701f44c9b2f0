//! A uniform HTTP error type for handlers: every fallible route returns `Result<_, HttpError>`
//! and this takes care of logging plus rendering the right status code and body.

use std::panic::Location;

use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use tracing::error;

#[derive(Debug)]
pub struct HttpError {
    status: StatusCode,
    message: String,
    source: Option<anyhow::Error>,
    location: &'static Location<'static>,
    /// Set only for 416 responses; carries the image size so `into_response` can emit the
    /// authoritative `Content-Range: bytes */{size}` header alongside the status.
    range_total_size: Option<u64>,
}

impl HttpError {
    #[track_caller]
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            source: None,
            location: Location::caller(),
            range_total_size: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<anyhow::Error>) -> Self {
        self.source = Some(source.into());
        self
    }

    #[track_caller]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    #[track_caller]
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, message)
    }

    #[track_caller]
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    #[track_caller]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    #[track_caller]
    pub fn method_not_allowed(message: impl Into<String>) -> Self {
        Self::new(StatusCode::METHOD_NOT_ALLOWED, message)
    }

    #[track_caller]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }

    /// `size` is the image's total size, rendered verbatim into the response's
    /// `Content-Range: bytes */{size}` header — the only authoritative piece of information a
    /// 416 is required to carry.
    #[track_caller]
    pub fn range_not_satisfiable(message: impl Into<String>, size: u64) -> Self {
        let mut err = Self::new(StatusCode::RANGE_NOT_SATISFIABLE, message);
        err.range_total_size = Some(size);
        err
    }

    #[track_caller]
    pub fn bad_gateway(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, message)
    }

    #[track_caller]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        match &self.source {
            Some(source) => error!(location = %self.location, error = ?source, "{}", self.message),
            None => error!(location = %self.location, "{}", self.message),
        }
        match self.range_total_size {
            Some(size) => (self.status, [(header::CONTENT_RANGE, format!("bytes */{size}"))], self.message).into_response(),
            None => (self.status, self.message).into_response(),
        }
    }
}

impl From<crate::backend::BackendError> for HttpError {
    #[track_caller]
    fn from(err: crate::backend::BackendError) -> Self {
        use crate::backend::BackendError;
        match err {
            BackendError::NotSupported => Self::bad_request("operation not supported by this image's backend"),
            BackendError::BadUrl(_) => Self::internal("ticket refers to an unsupported image url").with_source(err),
            BackendError::OutOfRange { offset, end, size } => {
                Self::range_not_satisfiable(format!("range [{offset}, {end}) lies outside of image of size {size}"), size)
            }
            other => Self::bad_gateway("backend request failed").with_source(other),
        }
    }
}

impl From<crate::ticket_store::TicketError> for HttpError {
    #[track_caller]
    fn from(err: crate::ticket_store::TicketError) -> Self {
        use crate::ticket_store::TicketError;
        match err {
            TicketError::NotFound => Self::not_found("no such ticket"),
            TicketError::Canceled => Self::forbidden("ticket has been canceled"),
            TicketError::Expired => Self::forbidden("ticket has expired"),
            TicketError::VerbNotAllowed => Self::forbidden("operation not permitted by this ticket"),
            TicketError::RangeNotSatisfiable { start, end, size } => {
                Self::range_not_satisfiable(format!("range [{start}, {end}) lies outside of image of size {size}"), size)
            }
        }
    }
}
