use axum::{extract::State, http::HeaderMap, Json};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use scholia_shared::{Principal, Role, UserProfile};
use serde::{Deserialize, Serialize};

use crate::{
    db,
    error::{ApiError, ApiResult},
    users, AppState,
};

// ── JWT Claims ──

/// Claims issued by the auth provider.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: i64,    // user id
    #[serde(default)]
    pub role: Role,
    pub exp: usize,  // expiry (unix timestamp)
}

impl Claims {
    pub fn new(principal: Principal, ttl_secs: usize) -> Self {
        let now = chrono::Utc::now().timestamp().max(0) as usize;
        Self {
            sub: principal.id,
            role: principal.role,
            exp: now + ttl_secs,
        }
    }
}

pub fn issue_token(principal: Principal, jwt_secret: &str, ttl_secs: usize) -> ApiResult<String> {
    encode(
        &Header::default(),
        &Claims::new(principal, ttl_secs),
        &EncodingKey::from_secret(jwt_secret.as_bytes()),
    )
    .map_err(ApiError::internal)
}

// ── Extract authenticated principal from Authorization header ──

pub fn principal(headers: &HeaderMap, jwt_secret: &str) -> ApiResult<Principal> {
    let token = headers
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(ApiError::Unauthorized)?;

    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(jwt_secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|_| ApiError::Unauthorized)?;

    Ok(Principal {
        id: data.claims.sub,
        role: data.claims.role,
    })
}

/// Like [`principal`], but an absent or invalid token means anonymous.
pub fn optional_principal(headers: &HeaderMap, jwt_secret: &str) -> Option<Principal> {
    principal(headers, jwt_secret).ok()
}

pub fn require_admin(principal: &Principal) -> ApiResult<()> {
    if principal.is_admin() {
        Ok(())
    } else {
        Err(ApiError::forbidden("administrator role required"))
    }
}

// ── Handlers ──

/// GET /api/auth/me
pub async fn me(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<UserProfile>> {
    let principal = principal(&headers, &state.jwt_secret)?;
    let profile = db::blocking(&state.db, move |conn| users::get_profile(conn, principal.id)).await?;
    Ok(Json(profile))
}
