//! services/api/src/web/middleware.rs
//!
//! Identity middleware for protecting routes.
//!
//! Authentication happens upstream; the gateway forwards the caller's id and role
//! in `x-user-id` and `x-user-role`. Nothing here trusts ambient state.

use axum::{extract::Request, http::HeaderMap, middleware::Next, response::Response};
use circulation_core::Role;

use crate::error::ApiError;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";

/// The caller on whose behalf a request runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Principal {
    pub user_id: i64,
    pub role: Role,
}

impl Principal {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// Allows the member themselves or an admin.
    pub fn ensure_self_or_admin(&self, user_id: i64) -> Result<(), ApiError> {
        if self.user_id == user_id || self.is_admin() {
            Ok(())
        } else {
            Err(ApiError::Forbidden(
                "cannot view another member's loans".to_string(),
            ))
        }
    }

    pub fn ensure_admin(&self) -> Result<(), ApiError> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(ApiError::Forbidden("admin role required".to_string()))
        }
    }

    fn from_headers(headers: &HeaderMap) -> Result<Self, ApiError> {
        let user_id = headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                ApiError::Unauthenticated(format!("{} header is required", USER_ID_HEADER))
            })?
            .trim()
            .parse::<i64>()
            .ok()
            .filter(|id| *id > 0)
            .ok_or_else(|| {
                ApiError::Unauthenticated(format!("invalid {} header", USER_ID_HEADER))
            })?;

        let role = match headers.get(USER_ROLE_HEADER) {
            None => Role::User,
            Some(value) => value
                .to_str()
                .ok()
                .and_then(Role::parse)
                .ok_or_else(|| {
                    ApiError::Unauthenticated(format!("invalid {} header", USER_ROLE_HEADER))
                })?,
        };

        Ok(Self { user_id, role })
    }
}

/// Middleware that reads the caller's identity and stores it as a `Principal`.
///
/// Missing or malformed identity is rejected with 401 before any handler runs.
pub async fn require_identity(mut req: Request, next: Next) -> Result<Response, ApiError> {
    let principal = Principal::from_headers(req.headers())?;
    req.extensions_mut().insert(principal);
    Ok(next.run(req).await)
}
