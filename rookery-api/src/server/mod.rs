use axum::{
    Router,
    extract::{
        FromRef, Request,
        rejection::{JsonRejection, PathRejection, QueryRejection},
    },
    http::{StatusCode, Uri},
    response::{IntoResponse, Response},
};
use axum_extra::typed_header::TypedHeaderRejection;
use json::Json;
use policy::{Gatekeeper, PolicyError};
use rookery_common::{
    cursor::CursorDecodeError,
    model::{Id, post::PostMarker},
};
use rookery_db::DbClient;
use rookery_timeline::{Timeline, TimelineError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, warn};

mod identity;
mod json;
mod page;
mod policy;
mod routes;

pub type AppTimeline = Timeline<DbClient>;

pub type ServerRouter = Router<ServerState>;

#[derive(Clone, FromRef)]
pub struct ServerState {
    pub timeline: Arc<AppTimeline>,
    pub gatekeeper: Arc<Gatekeeper>,
}

impl ServerState {
    #[must_use]
    pub fn new(timeline: Arc<AppTimeline>) -> Self {
        Self {
            timeline,
            gatekeeper: Arc::new(Gatekeeper::new()),
        }
    }
}

pub fn routes() -> ServerRouter {
    routes::routes().fallback(fallback)
}

pub async fn fallback(request: Request) -> ServerError {
    ServerError::UnknownRoute(request.into_parts().0.uri)
}

pub type Result<T, E = ServerError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Unknown route requested: {0}")]
    UnknownRoute(Uri),
    #[error("Path rejected: {0}")]
    PathRejection(#[from] PathRejection),
    #[error("Query rejected: {0}")]
    QueryRejection(#[from] QueryRejection),
    #[error("Incoming JSON rejected: {0}")]
    JsonRejection(#[from] JsonRejection),
    #[error("JSON response could not be serialized: {0}")]
    JsonResponse(#[from] serde_json::Error),
    #[error("X-Authenticated-User header was invalid: {0}")]
    InvalidIdentityHeader(TypedHeaderRejection),
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error("Invalid cursor: {0}")]
    InvalidCursor(CursorDecodeError),
    #[error("Page size must be between 1 and {max}, got {0}", max = page::MAX_PAGE_SIZE)]
    InvalidPageSize(usize),
    #[error("Timeout must be at most {max} ms, got {0}", max = page::MAX_TIMEOUT_MS)]
    InvalidTimeout(u64),
    #[error("Post with id {0} was not found.")]
    PostByIdNotFound(Id<PostMarker>),
    #[error(transparent)]
    Timeline(#[from] TimelineError),
}

impl ServerError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServerError::UnknownRoute(_)
            | ServerError::PathRejection(_)
            | ServerError::PostByIdNotFound(_) => StatusCode::NOT_FOUND,
            ServerError::Policy(PolicyError::Unauthenticated(_)) => StatusCode::UNAUTHORIZED,
            ServerError::Policy(PolicyError::RateLimited(_)) => StatusCode::TOO_MANY_REQUESTS,
            ServerError::QueryRejection(_)
            | ServerError::JsonRejection(_)
            | ServerError::InvalidIdentityHeader(_)
            | ServerError::InvalidCursor(_)
            | ServerError::InvalidPageSize(_)
            | ServerError::InvalidTimeout(_) => StatusCode::BAD_REQUEST,
            ServerError::Timeline(error) if error.is_retryable() => StatusCode::SERVICE_UNAVAILABLE,
            ServerError::JsonResponse(_) | ServerError::Timeline(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Hash, Serialize, Deserialize)]
struct ErrorResponse {
    status: u16,
    message: String,
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();

        if status.is_server_error() {
            error!(error = %self, %status, "Replying with error");
        } else {
            warn!(error = %self, %status, "Replying with error");
        }

        let error_response = ErrorResponse {
            status: status.as_u16(),
            message: self.to_string(),
        };
        (status, Json(error_response)).into_response()
    }
}
