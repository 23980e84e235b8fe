use error_types::{ErrorResponse, ServiceError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error("unknown purpose: {0}")]
    UnknownPurpose(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("upload {0} not found")]
    NotFound(uuid::Uuid),

    #[error("caller does not own upload {0}")]
    NotOwner(uuid::Uuid),

    #[error("object absent or oversize: {0}")]
    ObjectInvalid(String),

    #[error("object store error: {0}")]
    ObjectStore(#[from] crate::object_store::ObjectStoreError),
}

impl CoordinatorError {
    pub fn to_response(&self) -> ErrorResponse {
        let service_error = match self {
            CoordinatorError::Database(_) | CoordinatorError::ObjectStore(_) => ServiceError::InternalError(self.to_string()),
            CoordinatorError::UnknownPurpose(_) => ServiceError::BadRequest(self.to_string()),
            CoordinatorError::Unauthorized(_) => ServiceError::Unauthorized,
            CoordinatorError::NotFound(_) => ServiceError::NotFound(self.to_string()),
            CoordinatorError::NotOwner(_) => ServiceError::Forbidden(self.to_string()),
            CoordinatorError::ObjectInvalid(_) => ServiceError::BadRequest(self.to_string()),
        };
        service_error.to_response()
    }

    pub fn status_code(&self) -> actix_web::http::StatusCode {
        actix_web::http::StatusCode::from_u16(self.to_response().status).unwrap_or(actix_web::http::StatusCode::INTERNAL_SERVER_ERROR)
    }
}

impl actix_web::ResponseError for CoordinatorError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        CoordinatorError::status_code(self)
    }

    fn error_response(&self) -> actix_web::HttpResponse {
        actix_web::HttpResponse::build(self.status_code()).json(self.to_response())
    }
}
