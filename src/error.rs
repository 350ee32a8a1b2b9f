use crate::store::StoreError;
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use thiserror::Error;

/// Reasons a check could not produce a [Decision](crate::limiter::Decision).
///
/// None of these are rate limit rejections; a request that is over quota is reported as a
/// successful check with `admitted == false`.
#[derive(Debug, Error)]
pub enum Error {
    /// The quota has a zero limit or a zero window. This is a configuration bug, the store is
    /// never contacted.
    #[error("Invalid quota policy: limit {limit}, window {window_millis}ms (both must be non-zero)")]
    InvalidPolicy { limit: u64, window_millis: u64 },
    /// The store could not be reached in time. Whether to admit anyway is up to the integrator.
    #[error("Window store unavailable: {0}")]
    StoreUnavailable(#[source] StoreError),
    /// The store answered, but not with something the sliding window protocol can produce.
    #[error("Window store protocol error: {0}")]
    StoreProtocol(String),
}

impl Error {
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }
}

impl From<StoreError> for Error {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Protocol(message) => Self::StoreProtocol(message),
            other => Self::StoreUnavailable(other),
        }
    }
}

impl ResponseError for Error {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::InvalidPolicy { .. } | Self::StoreProtocol(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).finish()
    }
}
