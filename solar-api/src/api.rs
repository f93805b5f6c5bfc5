use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRef, FromRequest, Multipart, OriginalUri, Path, Request, State};
use axum::http::header::{CONTENT_TYPE, ETAG};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use http_body_util::Limited;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

use crate::error::{ServiceError, ServiceResult};
use crate::service::{NewImage, Record, SolarInput, SolarService, CREATED, DELETED, UPDATED};

pub type SharedService = Arc<SolarService>;

#[derive(Clone)]
pub struct AppState {
    pub service: SharedService,
    /// Cap for JSON bodies; multipart routes are bounded by the route layer.
    pub json_body_bytes: usize,
}

impl FromRef<AppState> for SharedService {
    fn from_ref(state: &AppState) -> Self {
        state.service.clone()
    }
}

#[derive(Debug, Serialize)]
pub struct CreatedResponse {
    pub id: String,
    pub message: &'static str,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: &'static str,
}

pub async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "solar-api"
    }))
}

pub async fn create_solar(
    State(service): State<SharedService>,
    multipart: Multipart,
) -> ServiceResult<(StatusCode, Json<CreatedResponse>)> {
    let input = read_solar_form(multipart).await?;
    let id = service.create(input).await?;

    Ok((
        StatusCode::CREATED,
        Json(CreatedResponse {
            id,
            message: CREATED,
        }),
    ))
}

pub async fn list_solar(State(service): State<SharedService>) -> ServiceResult<Json<Vec<Record>>> {
    Ok(Json(service.list().await?))
}

pub async fn get_solar(
    State(service): State<SharedService>,
    Path(id): Path<String>,
) -> ServiceResult<Json<Record>> {
    Ok(Json(service.get(&id).await?))
}

/// Accepts either `multipart/form-data` (which may carry a new image) or a
/// JSON object `{name, description?}`. A body of any other type is ignored,
/// so validation reports the missing name.
pub async fn update_solar(
    State(state): State<AppState>,
    Path(id): Path<String>,
    request: Request,
) -> ServiceResult<Json<MessageResponse>> {
    let input = if is_multipart(request.headers()) {
        let multipart = Multipart::from_request(request, &()).await?;
        read_solar_form(multipart).await?
    } else {
        let (parts, body) = request.into_parts();
        let limited = Request::from_parts(parts, Body::new(Limited::new(body, state.json_body_bytes)));
        match Json::<Value>::from_request(limited, &()).await {
            Ok(Json(payload)) => json_input(payload),
            Err(JsonRejection::MissingJsonContentType(_)) => SolarInput::default(),
            Err(rejection) => return Err(rejection.into()),
        }
    };

    state.service.update(&id, input).await?;
    Ok(Json(MessageResponse { message: UPDATED }))
}

pub async fn delete_solar(
    State(service): State<SharedService>,
    Path(id): Path<String>,
) -> ServiceResult<Json<MessageResponse>> {
    service.delete(&id).await?;
    Ok(Json(MessageResponse { message: DELETED }))
}

pub async fn get_media(
    State(service): State<SharedService>,
    Path(key): Path<String>,
) -> ServiceResult<Response> {
    let obj_data = service.open_image(&key).await?;

    let mut headers = HeaderMap::new();

    if let Some(ct) = obj_data
        .metadata
        .content_type
        .as_deref()
        .and_then(|ct| HeaderValue::from_str(ct).ok())
    {
        headers.insert(CONTENT_TYPE, ct);
    }

    if let Ok(etag) = HeaderValue::from_str(&obj_data.metadata.etag) {
        headers.insert(ETAG, etag);
    }

    Ok((headers, Body::from_stream(obj_data.stream)).into_response())
}

/// Fallback for unknown paths and for known paths hit with the wrong method.
pub async fn route_not_found(OriginalUri(uri): OriginalUri) -> ServiceError {
    let target = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path());
    ServiceError::RouteNotFound(target.to_string())
}

fn is_multipart(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("multipart/form-data"))
}

/// Non-string `name` values are treated as absent and fail validation.
fn json_input(payload: Value) -> SolarInput {
    let Value::Object(mut fields) = payload else {
        return SolarInput::default();
    };

    SolarInput {
        name: fields
            .get("name")
            .and_then(Value::as_str)
            .map(str::to_string),
        description: fields.remove("description"),
        image: None,
    }
}

async fn read_solar_form(mut multipart: Multipart) -> ServiceResult<SolarInput> {
    let mut input = SolarInput::default();

    while let Some(field) = multipart.next_field().await? {
        let field_name = field.name().unwrap_or_default().to_string();

        match field_name.as_str() {
            "name" => input.name = Some(field.text().await?),
            "description" => input.description = Some(Value::String(field.text().await?)),
            "image" => {
                let file_name = field.file_name().map(str::to_string);
                let content_type = field.content_type().map(str::to_string);
                let data = field.bytes().await?;

                // Browsers submit an empty part for an untouched file input
                if data.is_empty() && file_name.as_deref().map_or(true, str::is_empty) {
                    continue;
                }

                input.image = Some(NewImage {
                    file_name,
                    content_type,
                    data,
                });
            }
            _ => {}
        }
    }

    Ok(input)
}
