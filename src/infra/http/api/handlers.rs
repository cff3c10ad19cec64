//! `/v1` key-value handlers.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use tracing::warn;

use crate::application::repository::{AddOutcome, ChangeOutcome, GetOutcome};

use super::error::ApiError;
use super::models::{AddKeyValueRequest, RemoveKeyRequest, UpdateKeyValueRequest};
use super::state::ApiState;

/// Only absent (or `null`) fields are rejected; empty strings are valid keys.
fn required(field: Option<String>, name: &'static str) -> Result<String, ApiError> {
    field.ok_or_else(|| {
        ApiError::bad_request(
            "missing required field",
            Some(format!("`{name}` is required")),
        )
    })
}

fn location_for(key: &str) -> String {
    format!("/v1/{}", urlencoding::encode(key))
}

pub async fn add_key_value(
    State(state): State<ApiState>,
    payload: Result<Json<AddKeyValueRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload?;
    let key = required(request.new_key, "newKey")?;
    let value = required(request.value, "value")?;

    match state.repository.add_key_value(&key, &value).await? {
        AddOutcome::Success => {
            let mut response = (StatusCode::CREATED, Json(value)).into_response();
            match HeaderValue::from_str(&location_for(&key)) {
                Ok(location) => {
                    response.headers_mut().insert(header::LOCATION, location);
                }
                Err(err) => warn!(key, error = %err, "key is not a valid Location header value"),
            }
            Ok(response)
        }
        AddOutcome::AlreadyPresent => Err(ApiError::conflict("key already exists")),
    }
}

pub async fn get_value_by_key(
    State(state): State<ApiState>,
    Path(key): Path<String>,
) -> Result<Response, ApiError> {
    match state.repository.get_value_by_key(&key).await? {
        GetOutcome::Success(value) => Ok((StatusCode::OK, Json(value)).into_response()),
        GetOutcome::NotFound => Err(ApiError::not_found("key not found")),
    }
}

/// `GET /v1` without a key.
pub async fn missing_key() -> ApiError {
    ApiError::bad_request("missing required field", Some("a key is required".to_string()))
}

pub async fn update_key_value(
    State(state): State<ApiState>,
    payload: Result<Json<UpdateKeyValueRequest>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let Json(request) = payload?;
    let key = required(request.key, "key")?;
    let new_value = required(request.new_value, "newValue")?;

    match state.repository.update_key_value(&key, &new_value).await? {
        ChangeOutcome::Success => Ok(StatusCode::NO_CONTENT),
        ChangeOutcome::NotFound => Err(ApiError::not_found("key not found")),
    }
}

pub async fn remove_by_key(
    State(state): State<ApiState>,
    payload: Result<Json<RemoveKeyRequest>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let Json(request) = payload?;
    let key = required(request.key, "key")?;

    match state.repository.remove_by_key(&key).await? {
        ChangeOutcome::Success => Ok(StatusCode::NO_CONTENT),
        ChangeOutcome::NotFound => Err(ApiError::not_found("key not found")),
    }
}
