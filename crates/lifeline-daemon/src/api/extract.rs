//! Request extractors that reject with [`ApiError`] JSON bodies.

use axum::Json;
use axum::extract::{FromRequest, FromRequestParts, Query, Request};
use axum::http::HeaderMap;
use axum::http::request::Parts;
use lifeline_core::access::{Requester, Role};
use serde::de::DeserializeOwned;

use super::error::ApiError;

/// Header carrying the caller's id, set by the upstream auth layer.
pub const REQUESTER_ID_HEADER: &str = "x-requester-id";

/// Header carrying the caller's role (`user`, `helper` or `admin`).
/// Defaults to `user` when absent.
pub const REQUESTER_ROLE_HEADER: &str = "x-requester-role";

/// Maximum accepted length of a requester id.
const MAX_REQUESTER_ID_LEN: usize = 128;

/// The authenticated caller.
#[derive(Debug, Clone)]
pub struct Caller(pub Requester);

/// Reads the requester identity from the trusted headers.
///
/// # Errors
///
/// Returns `ApiError::Unauthenticated` if the id header is missing, empty,
/// oversized or not UTF-8, or if the role is unknown.
pub fn requester_from_headers(headers: &HeaderMap) -> Result<Requester, ApiError> {
    let id = headers
        .get(REQUESTER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ApiError::Unauthenticated(format!("{REQUESTER_ID_HEADER} is required")))?;
    if id.len() > MAX_REQUESTER_ID_LEN {
        return Err(ApiError::Unauthenticated(format!(
            "{REQUESTER_ID_HEADER} exceeds {MAX_REQUESTER_ID_LEN} bytes"
        )));
    }

    let role = match headers.get(REQUESTER_ROLE_HEADER) {
        None => Role::User,
        Some(value) => value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<Role>().ok())
            .ok_or_else(|| {
                ApiError::Unauthenticated(format!("{REQUESTER_ROLE_HEADER} is not a known role"))
            })?,
    };
    Ok(Requester::new(id, role))
}

impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        requester_from_headers(&parts.headers).map(Self)
    }
}

/// `Json` with a JSON error body on rejection.
#[derive(Debug, Clone)]
pub struct ApiJson<T>(pub T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        Json::<T>::from_request(req, state)
            .await
            .map(|Json(value)| Self(value))
            .map_err(|rejection| ApiError::BadRequest(rejection.body_text()))
    }
}

/// `Query` with a JSON error body on rejection.
#[derive(Debug, Clone)]
pub struct ApiQuery<T>(pub T);

impl<S, T> FromRequestParts<S> for ApiQuery<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        Query::<T>::from_request_parts(parts, state)
            .await
            .map(|Query(value)| Self(value))
            .map_err(|rejection| ApiError::BadRequest(rejection.body_text()))
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    fn headers(id: Option<&str>, role: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(id) = id {
            headers.insert(REQUESTER_ID_HEADER, HeaderValue::from_str(id).unwrap());
        }
        if let Some(role) = role {
            headers.insert(REQUESTER_ROLE_HEADER, HeaderValue::from_str(role).unwrap());
        }
        headers
    }

    #[test]
    fn test_role_defaults_to_user() {
        let requester = requester_from_headers(&headers(Some("u1"), None)).unwrap();
        assert_eq!(requester, Requester::user("u1"));
    }

    #[test]
    fn test_helper_and_admin_roles() {
        let helper = requester_from_headers(&headers(Some("h1"), Some("helper"))).unwrap();
        assert_eq!(helper.role, Role::Helper);
        let admin = requester_from_headers(&headers(Some("ops"), Some("admin"))).unwrap();
        assert!(admin.is_admin());
    }

    #[test]
    fn test_missing_or_bad_identity_is_rejected() {
        assert!(matches!(
            requester_from_headers(&headers(None, Some("user"))),
            Err(ApiError::Unauthenticated(_))
        ));
        assert!(matches!(
            requester_from_headers(&headers(Some("   "), None)),
            Err(ApiError::Unauthenticated(_))
        ));
        assert!(matches!(
            requester_from_headers(&headers(Some("u1"), Some("root"))),
            Err(ApiError::Unauthenticated(_))
        ));
        let long = "x".repeat(MAX_REQUESTER_ID_LEN + 1);
        assert!(requester_from_headers(&headers(Some(&long), None)).is_err());
    }
}
