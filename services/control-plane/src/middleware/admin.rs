//! Role gates
//!
//! Both middlewares must run after `auth_middleware`.

use axum::{body::Body, extract::Request, middleware::Next, response::Response};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::AuthContext;
use crate::error::ApiError;

/// Admin context extracted from validated admin user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminContext {
    pub admin_id: Uuid,
    pub email: String,
}

fn auth_context(request: &Request<Body>) -> Result<AuthContext, ApiError> {
    request.extensions().get::<AuthContext>().cloned().ok_or_else(|| {
        tracing::error!("AuthContext not found - ensure auth_middleware runs first");
        ApiError::Unauthorized
    })
}

/// 401 without AuthContext, 403 for non-admins
pub async fn admin_middleware(
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let auth = auth_context(&request)?;

    if !auth.is_admin() {
        tracing::warn!(
            "Non-admin user {} attempted to access admin endpoint",
            auth.user_id
        );
        return Err(ApiError::Forbidden("admin role required".to_string()));
    }

    request.extensions_mut().insert(AdminContext {
        admin_id: auth.user_id,
        email: auth.email,
    });

    Ok(next.run(request).await)
}

/// Developers and admins only
pub async fn developer_middleware(
    request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let auth = auth_context(&request)?;

    if !auth.role.can_publish() {
        return Err(ApiError::Forbidden(
            "developer role required; upgrade via POST /v1/me/developer".to_string(),
        ));
    }

    Ok(next.run(request).await)
}
