use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};

use crate::config::AuthConfig;
use crate::error::AppError;
use crate::models::CurrentOwner;
use crate::AppState;

/// Header set by the upstream auth gateway
pub const OWNER_HEADER: &str = "X-Owner-Id";

const MAX_OWNER_ID_LEN: usize = 128;

/// Owner middleware
/// Reads the authenticated owner id forwarded by the gateway
pub async fn owner_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let current_owner = resolve_owner(request.headers(), &state.config.auth)?;

    // Insert current owner into request extensions
    request.extensions_mut().insert(current_owner);

    Ok(next.run(request).await)
}

fn resolve_owner(headers: &HeaderMap, auth: &AuthConfig) -> Result<CurrentOwner, AppError> {
    let owner_id = headers
        .get(OWNER_HEADER)
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .unwrap_or_default();

    if owner_id.is_empty() {
        return Err(AppError::Unauthorized("Missing owner identity".to_string()));
    }
    if owner_id.len() > MAX_OWNER_ID_LEN || owner_id.chars().any(char::is_control) {
        return Err(AppError::Unauthorized("Invalid owner identity".to_string()));
    }

    Ok(CurrentOwner {
        id: owner_id.to_string(),
        is_admin: auth.is_admin(owner_id),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(owner: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(OWNER_HEADER, HeaderValue::from_str(owner).unwrap());
        headers
    }

    #[test]
    fn test_resolve_owner() {
        let auth = AuthConfig {
            admin_owners: vec!["root".to_string()],
        };

        let owner = resolve_owner(&headers(" alice "), &auth).unwrap();
        assert_eq!(owner.id, "alice");
        assert!(!owner.is_admin);
        assert!(resolve_owner(&headers("root"), &auth).unwrap().is_admin);

        assert!(matches!(
            resolve_owner(&HeaderMap::new(), &auth),
            Err(AppError::Unauthorized(_))
        ));
        assert!(matches!(
            resolve_owner(&headers(&"x".repeat(129)), &auth),
            Err(AppError::Unauthorized(_))
        ));
    }
}
