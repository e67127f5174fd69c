use crate::errors::ServiceError;
use crate::services::cart::CartOwner;
use async_trait::async_trait;
use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use uuid::Uuid;
use validator::Validate;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const SESSION_ID_HEADER: &str = "x-session-id";

/// Standard success response
pub fn success_response<T: Serialize>(data: T) -> Response {
    (StatusCode::OK, Json(data)).into_response()
}

/// Standard created response
pub fn created_response<T: Serialize>(data: T) -> Response {
    (StatusCode::CREATED, Json(data)).into_response()
}

/// Standard no content response
pub fn no_content_response() -> Response {
    StatusCode::NO_CONTENT.into_response()
}

/// Validate request input
pub fn validate_input<T: Validate>(input: &T) -> Result<(), ServiceError> {
    input
        .validate()
        .map_err(|e| ServiceError::ValidationError(format!("Validation failed: {}", e)))
}

/// Cart owner taken from the `x-user-id` / `x-session-id` headers set by the
/// session layer in front of this service. A user id wins over a session id.
#[derive(Debug, Clone)]
pub struct Owner(pub CartOwner);

#[async_trait]
impl<S> FromRequestParts<S> for Owner
where
    S: Send + Sync,
{
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let user_id = match header(USER_ID_HEADER) {
            Some(raw) => Some(Uuid::parse_str(&raw).map_err(|_| {
                ServiceError::ValidationError(format!("{} must be a UUID", USER_ID_HEADER))
            })?),
            None => None,
        };
        CartOwner::from_parts(user_id, header(SESSION_ID_HEADER)).map(Owner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    async fn extract(req: Request<()>) -> Result<Owner, ServiceError> {
        let (mut parts, _) = req.into_parts();
        Owner::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn user_header_takes_precedence() {
        let user = Uuid::new_v4();
        let req = Request::builder()
            .header(USER_ID_HEADER, user.to_string())
            .header(SESSION_ID_HEADER, "sess-1")
            .body(())
            .unwrap();
        let Owner(owner) = extract(req).await.unwrap();
        assert_eq!(owner, CartOwner::User(user));
    }

    #[tokio::test]
    async fn missing_owner_is_a_validation_error() {
        let req = Request::builder().body(()).unwrap();
        let err = extract(req).await.unwrap_err();
        assert!(matches!(err, ServiceError::ValidationError(_)));

        let req = Request::builder()
            .header(USER_ID_HEADER, "not-a-uuid")
            .body(())
            .unwrap();
        assert!(matches!(
            extract(req).await.unwrap_err(),
            ServiceError::ValidationError(_)
        ));
    }
}
