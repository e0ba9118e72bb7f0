//! API errors and the rejection handler

use crate::auth::AuthError;
use lifecycle_core::{ControlPlaneError, RegistryError};
use serde::Serialize;
use std::convert::Infallible;
use warp::http::StatusCode;
use warp::{Rejection, Reply};

/// Error response body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, serde::Deserialize)]
pub struct ErrorBody {
    /// Stable error code
    pub error: String,
    pub message: String,
}

/// Errors surfaced by handlers
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Internal(String),
}

impl warp::reject::Reject for ApiError {}

impl ApiError {
    /// HTTP status and stable code
    #[must_use]
    pub fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            Self::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            Self::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
            Self::Forbidden(_) => (StatusCode::FORBIDDEN, "FORBIDDEN"),
            Self::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            Self::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT"),
            Self::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL"),
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        if err.is_forbidden() {
            Self::Forbidden(err.to_string())
        } else {
            Self::Unauthorized(err.to_string())
        }
    }
}

impl From<ControlPlaneError> for ApiError {
    fn from(err: ControlPlaneError) -> Self {
        match err {
            ControlPlaneError::NotFound(_) => Self::NotFound(err.to_string()),
            ControlPlaneError::Conflict(_)
            | ControlPlaneError::StateMachine(_)
            | ControlPlaneError::Registry(RegistryError::VersionConflict { .. }) => {
                Self::Conflict(err.to_string())
            }
            ControlPlaneError::InvalidUpdate(_) => Self::BadRequest(err.to_string()),
            ControlPlaneError::Registry(_) => {
                tracing::error!(error = %err, "registration store failure");
                Self::Internal("registration store unavailable".to_string())
            }
        }
    }
}

fn reply(
    status: StatusCode,
    error: &str,
    message: String,
) -> warp::reply::WithStatus<warp::reply::Json> {
    let body = ErrorBody {
        error: error.to_string(),
        message,
    };
    warp::reply::with_status(warp::reply::json(&body), status)
}

/// Turn every rejection into an `{error, message}` response
pub async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
    if let Some(api) = err.find::<ApiError>() {
        let (status, code) = api.status_and_code();
        return Ok(reply(status, code, api.to_string()));
    }
    if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
        return Ok(reply(StatusCode::BAD_REQUEST, "BAD_REQUEST", e.to_string()));
    }
    if err.is_not_found() {
        return Ok(reply(
            StatusCode::NOT_FOUND,
            "NOT_FOUND",
            "no such resource".to_string(),
        ));
    }
    if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        return Ok(reply(
            StatusCode::METHOD_NOT_ALLOWED,
            "METHOD_NOT_ALLOWED",
            "method not allowed".to_string(),
        ));
    }
    if err.find::<warp::reject::PayloadTooLarge>().is_some() {
        return Ok(reply(
            StatusCode::PAYLOAD_TOO_LARGE,
            "PAYLOAD_TOO_LARGE",
            "request body too large".to_string(),
        ));
    }
    if err.find::<warp::reject::UnsupportedMediaType>().is_some() {
        return Ok(reply(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "UNSUPPORTED_MEDIA_TYPE",
            "expected application/json".to_string(),
        ));
    }

    tracing::error!(rejection = ?err, "unhandled rejection");
    Ok(reply(
        StatusCode::INTERNAL_SERVER_ERROR,
        "INTERNAL",
        "internal error".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use lifecycle_core::RegistrationId;

    #[test]
    fn control_plane_errors_map_to_statuses() {
        let cases = [
            (
                ControlPlaneError::NotFound(RegistrationId::new()),
                StatusCode::NOT_FOUND,
            ),
            (
                ControlPlaneError::Conflict("in flight".to_string()),
                StatusCode::CONFLICT,
            ),
            (
                ControlPlaneError::InvalidUpdate("empty".to_string()),
                StatusCode::BAD_REQUEST,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status_and_code().0, status);
        }
    }

    #[test]
    fn auth_errors_split_401_and_403() {
        assert_eq!(
            ApiError::from(AuthError::MissingToken).status_and_code().0,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ApiError::from(AuthError::Forbidden("viewer".to_string()))
                .status_and_code()
                .0,
            StatusCode::FORBIDDEN
        );
    }
}
