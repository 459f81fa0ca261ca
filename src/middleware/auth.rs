use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};

use crate::error::AppError;
use crate::AppState;

/// Token of a `Bearer` authorization header; the scheme is case-insensitive
fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim_start().split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

/// Authentication middleware
/// Verifies the bearer token and stores the caller's ClaimSet in the request
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let auth_header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok());

    let token = match auth_header.and_then(bearer_token) {
        Some(token) => token,
        _ => {
            return Err(AppError::InvalidToken(
                "Missing or invalid Authorization header".to_string(),
            ));
        }
    };

    let claims = match state.verifier.verify(token).await {
        Ok(claims) => claims,
        Err(e) => {
            tracing::warn!(
                required_algorithm = state.verifier.algorithm_name(),
                error = %e,
                "Token is not valid!"
            );
            return Err(e);
        }
    };

    if let Some(role) = &state.required_role {
        if !claims.has_role(role) {
            tracing::warn!(
                subject = %claims.subject,
                roles = ?claims.roles,
                required_role = %role,
                "Caller lacks the required role"
            );
            return Err(AppError::Forbidden);
        }
    }

    request.extensions_mut().insert(claims);

    Ok(next.run(request).await)
}
