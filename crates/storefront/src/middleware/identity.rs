//! Identity extractor for per-user routes.

use axum::{extract::FromRequestParts, http::request::Parts};

use shelf_core::Username;

use crate::error::{AppError, set_sentry_user};

/// Header carrying the username authenticated by the upstream proxy.
pub const AUTHENTICATED_USER_HEADER: &str = "x-authenticated-user";

/// Extractor that requires an authenticated user.
///
/// Rejects with 401 when the header is missing and 400 when it does not hold
/// a well-formed username.
///
/// # Example
///
/// ```rust,ignore
/// async fn cart_count(RequireUser(user): RequireUser) -> impl IntoResponse {
///     format!("Hello, {user}!")
/// }
/// ```
pub struct RequireUser(pub Username);

impl<S> FromRequestParts<S> for RequireUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(AUTHENTICATED_USER_HEADER)
            .ok_or_else(|| AppError::Unauthorized("authentication required".to_string()))?
            .to_str()
            .map_err(|_| AppError::BadRequest("malformed user header".to_string()))?;

        let username =
            Username::parse(raw).map_err(|e| AppError::BadRequest(format!("username: {e}")))?;
        set_sentry_user(username.as_str());
        Ok(Self(username))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use axum::http::{Request, StatusCode};
    use axum::response::IntoResponse;

    use super::*;

    async fn extract(header: Option<&str>) -> Result<RequireUser, AppError> {
        let mut builder = Request::builder().uri("/cart");
        if let Some(value) = header {
            builder = builder.header(AUTHENTICATED_USER_HEADER, value);
        }
        let (mut parts, ()) = builder.body(()).unwrap().into_parts();
        RequireUser::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn test_header_present() {
        let RequireUser(user) = extract(Some("bob")).await.unwrap();
        assert_eq!(user.as_str(), "bob");
    }

    #[tokio::test]
    async fn test_header_missing() {
        let err = extract(None).await.err().unwrap();
        assert_eq!(err.into_response().status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_header_malformed() {
        let err = extract(Some("bad name")).await.err().unwrap();
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }
}
