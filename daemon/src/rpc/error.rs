use actix_web::{error::QueryPayloadError, http::StatusCode, web, HttpRequest, HttpResponse, ResponseError};
use chrono::NaiveDate;
use costwise_common::api::ErrorBody;
use thiserror::Error;

use crate::core::error::StorageError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("no completed run covers {start} to {end}")]
    NoCompletedRun { start: NaiveDate, end: NaiveDate },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl ApiError {
    fn kind(&self) -> &'static str {
        match self {
            ApiError::InvalidRequest(_) => "invalid_request",
            ApiError::NotFound(_)
            | ApiError::NoCompletedRun { .. }
            | ApiError::Storage(StorageError::NotFound(_)) => "not_found",
            ApiError::Storage(_) => "internal_error",
        }
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_)
            | ApiError::NoCompletedRun { .. }
            | ApiError::Storage(StorageError::NotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        if matches!(self, ApiError::Storage(_)) {
            error!("read API storage failure: {}", self);
        }
        HttpResponse::build(self.status_code()).json(ErrorBody {
            error: self.kind().to_string(),
            detail: Some(self.to_string()),
        })
    }
}

// Malformed or missing query parameters answer with the shared error body
// instead of actix's plain-text default
pub fn query_config() -> web::QueryConfig {
    web::QueryConfig::default().error_handler(query_error_handler)
}

fn query_error_handler(err: QueryPayloadError, _req: &HttpRequest) -> actix_web::Error {
    let body = ErrorBody {
        error: "invalid_request".to_string(),
        detail: Some(err.to_string()),
    };
    actix_web::error::InternalError::from_response(err, HttpResponse::BadRequest().json(body))
        .into()
}
