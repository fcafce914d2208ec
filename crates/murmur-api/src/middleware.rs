use axum::{
    extract::{Request, State},
    http::{StatusCode, header},
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{DecodingKey, Validation, decode};

use murmur_types::api::Claims;

use crate::state::AppState;

/// The verified caller of a request, if any. Inserted into request
/// extensions by [`identify`].
#[derive(Debug, Clone, Default)]
pub struct Identity {
    pub claims: Option<Claims>,
}

impl Identity {
    pub fn subject(&self) -> Option<String> {
        self.claims.as_ref().map(|c| c.sub.clone())
    }
}

/// Validate the bearer JWT if one is presented. A request without an
/// Authorization header continues as anonymous; a bad token is rejected.
pub async fn identify(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let claims = match req.headers().get(header::AUTHORIZATION) {
        None => None,
        Some(value) => {
            let token = value
                .to_str()
                .ok()
                .and_then(|v| v.strip_prefix("Bearer "))
                .ok_or(StatusCode::UNAUTHORIZED)?;

            let token_data = decode::<Claims>(
                token,
                &DecodingKey::from_secret(state.jwt_secret.as_bytes()),
                &Validation::default(),
            )
            .map_err(|_| StatusCode::UNAUTHORIZED)?;
            Some(token_data.claims)
        }
    };

    req.extensions_mut().insert(Identity { claims });
    Ok(next.run(req).await)
}
