use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use service_core::error::AppError;

pub const USER_ID_HEADER: &str = "x-user-id";

/// Caller identity from the `X-User-ID` header.
///
/// The gateway sits behind a trusted front end that authenticates users and
/// sets this header; the value is taken as is.
#[derive(Debug, Clone)]
pub struct UserId(pub String);

#[async_trait]
impl<S> FromRequestParts<S> for UserId
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| AppError::Unauthorized(anyhow::anyhow!("Missing X-User-ID header")))?;

        tracing::Span::current().record("user_id", user_id);

        Ok(UserId(user_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    async fn extract(request: Request<()>) -> Result<UserId, AppError> {
        let (mut parts, _) = request.into_parts();
        UserId::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn reads_trimmed_header() {
        let request = Request::builder()
            .header("X-User-ID", " alice ")
            .body(())
            .unwrap();

        assert_eq!(extract(request).await.unwrap().0, "alice");
    }

    #[tokio::test]
    async fn missing_or_blank_header_is_unauthorized() {
        let blank = Request::builder().header("X-User-ID", "  ").body(()).unwrap();
        assert!(matches!(extract(blank).await, Err(AppError::Unauthorized(_))));

        let missing = Request::builder().body(()).unwrap();
        assert!(matches!(extract(missing).await, Err(AppError::Unauthorized(_))));
    }
}
