use actix_web::{web, HttpRequest, HttpResponse};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoordinatorError;
use crate::object_store::ObjectStore;
use crate::repository::UploadRepository;
use crate::UploadCoordinator;

#[derive(Debug, Deserialize)]
pub struct RequestUploadBody {
    pub purpose: String,
}

#[derive(Debug, Serialize)]
pub struct RequestUploadResponse {
    pub upload_id: Uuid,
    pub presigned_url: String,
    pub object_key: String,
    pub expires_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Deserialize)]
pub struct CompleteUploadBody {
    pub upload_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct CompleteUploadResponse {
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct UploadStatusResponse {
    pub id: Uuid,
    pub status: String,
    pub derived_urls: Option<serde_json::Value>,
    pub error: Option<String>,
}

fn owner_id(req: &HttpRequest) -> Result<Uuid, CoordinatorError> {
    req.headers()
        .get("X-User-ID")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or_else(|| CoordinatorError::Unauthorized("missing or invalid X-User-ID header".to_string()))
}

pub async fn request_upload<R, O>(
    req: HttpRequest,
    body: web::Json<RequestUploadBody>,
    coordinator: web::Data<UploadCoordinator<R, O>>,
) -> Result<HttpResponse, CoordinatorError>
where
    R: UploadRepository + 'static,
    O: ObjectStore + 'static,
{
    let owner_id = owner_id(&req)?;
    let result = coordinator.request_upload(owner_id, &body.purpose).await?;

    Ok(HttpResponse::Ok().json(RequestUploadResponse {
        upload_id: result.upload_id,
        presigned_url: result.presigned_url,
        object_key: result.object_key,
        expires_at: result.expires_at,
    }))
}

pub async fn complete_upload<R, O>(
    req: HttpRequest,
    body: web::Json<CompleteUploadBody>,
    coordinator: web::Data<UploadCoordinator<R, O>>,
) -> Result<HttpResponse, CoordinatorError>
where
    R: UploadRepository + 'static,
    O: ObjectStore + 'static,
{
    let owner_id = owner_id(&req)?;
    let record = coordinator.complete_upload(owner_id, body.upload_id).await?;

    Ok(HttpResponse::Ok().json(CompleteUploadResponse {
        status: record.status().as_str().to_string(),
    }))
}

pub async fn get_upload<R, O>(
    path: web::Path<Uuid>,
    coordinator: web::Data<UploadCoordinator<R, O>>,
) -> Result<HttpResponse, CoordinatorError>
where
    R: UploadRepository + 'static,
    O: ObjectStore + 'static,
{
    let record = coordinator.get_status(path.into_inner()).await?;

    Ok(HttpResponse::Ok().json(UploadStatusResponse {
        id: record.id,
        status: record.status().as_str().to_string(),
        derived_urls: record.derived_urls.clone(),
        error: record.error.clone(),
    }))
}

pub fn configure<R, O>(cfg: &mut web::ServiceConfig)
where
    R: UploadRepository + 'static,
    O: ObjectStore + 'static,
{
    cfg.route("/upload/request", web::post().to(request_upload::<R, O>))
        .route("/upload/complete", web::post().to(complete_upload::<R, O>))
        .route("/upload/{id}", web::get().to(get_upload::<R, O>));
}
