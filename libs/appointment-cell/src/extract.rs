// libs/appointment-cell/src/extract.rs
//
// Request extractors whose rejections use the cell's error envelope.

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        FromRequest, FromRequestParts, Path, Query, Request,
    },
    http::request::Parts,
    Json,
};
use tracing::debug;

use crate::error::AppointmentError;
use crate::models::AppointmentId;

/// The `{appointment_id}` path segment.
#[derive(Debug, Clone, Copy)]
pub struct AppointmentPath(pub AppointmentId);

impl<S> FromRequestParts<S> for AppointmentPath
where
    S: Send + Sync,
{
    type Rejection = AppointmentError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Path(id) = Path::<AppointmentId>::from_request_parts(parts, state)
            .await
            .map_err(|e: PathRejection| {
                debug!("Rejected appointment path {}: {}", parts.uri.path(), e.body_text());
                AppointmentError::Validation(format!("invalid appointment id: {}", e.body_text()))
            })?;
        Ok(Self(id))
    }
}

/// Query string parameters.
#[derive(Debug, Clone)]
pub struct QueryParams<T>(pub T);

impl<T, S> FromRequestParts<S> for QueryParams<T>
where
    Query<T>: FromRequestParts<S, Rejection = QueryRejection>,
    S: Send + Sync,
{
    type Rejection = AppointmentError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Query(value) = Query::<T>::from_request_parts(parts, state)
            .await
            .map_err(|e| AppointmentError::Validation(e.body_text()))?;
        Ok(Self(value))
    }
}

/// A JSON request body.
#[derive(Debug, Clone)]
pub struct JsonBody<T>(pub T);

impl<T, S> FromRequest<S> for JsonBody<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = AppointmentError;

    async fn from_request(request: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(request, state)
            .await
            .map_err(|e| AppointmentError::Validation(e.body_text()))?;
        Ok(Self(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::header;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct Paging {
        limit: u32,
    }

    #[tokio::test]
    async fn malformed_query_is_a_validation_error() {
        let (mut parts, _) = axum::http::Request::builder()
            .uri("/search?limit=many")
            .body(())
            .unwrap()
            .into_parts();

        let result = QueryParams::<Paging>::from_request_parts(&mut parts, &()).await;
        assert!(matches!(result, Err(AppointmentError::Validation(_))));

        let (mut parts, _) = axum::http::Request::builder()
            .uri("/search?limit=5")
            .body(())
            .unwrap()
            .into_parts();
        let QueryParams(paging) = QueryParams::<Paging>::from_request_parts(&mut parts, &())
            .await
            .unwrap();
        assert_eq!(paging.limit, 5);
    }

    #[tokio::test]
    async fn malformed_json_is_a_validation_error() {
        let request = axum::http::Request::builder()
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{\"limit\":"))
            .unwrap();

        let result = JsonBody::<Paging>::from_request(request, &()).await;
        assert!(matches!(result, Err(AppointmentError::Validation(_))));
    }
}
