use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier, password_hash::{SaltString, rand_core::OsRng}};
use axum::{
    Extension, Json,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    response::IntoResponse,
};
use axum_extra::extract::CookieJar;
use axum_extra::extract::cookie::{Cookie, SameSite};
use jsonwebtoken::{EncodingKey, Header, encode};
use serde_json::json;
use tracing::{info, warn};

use tavern_crypto::seal_cookie;
use tavern_gateway::blocking;
use tavern_gateway::cache::keys;
use tavern_gateway::gatekeeper::IDENTITY_COOKIE;
use tavern_types::TavernError;
use tavern_types::api::{Claims, IdentityEntry, LoginRequest, LoginResponse, RegisterRequest};
use tavern_types::models::SafeUser;

use crate::AppState;
use crate::error::{ApiError, ApiResult};

pub async fn register(
    State(state): State<AppState>,
    jar: CookieJar,
    payload: Result<Json<RegisterRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(req) = payload?;

    // Validate input
    let name = req.name.trim().to_string();
    if name.chars().count() < 3 || name.chars().count() > 32 {
        return Err(TavernError::validation_with(
            "Name must be 3-32 characters",
            json!({ "field": "name" }),
        )
        .into());
    }
    if req.password.len() < 8 {
        return Err(TavernError::validation_with(
            "Password must be at least 8 characters",
            json!({ "field": "password" }),
        )
        .into());
    }

    // Hash password with Argon2id
    let salt = SaltString::generate(&mut OsRng);
    let password_hash = Argon2::default()
        .hash_password(req.password.as_bytes(), &salt)
        .map_err(|e| TavernError::Intern(format!("password hashing failed: {e}")))?
        .to_string();

    let lookup = name.clone();
    let user = blocking(&state.gateway.db, move |db| {
        if db.get_user_by_name(&lookup)?.is_some() {
            return Ok(None);
        }
        let id = db.create_user(&lookup, &password_hash, false)?;
        Ok(db.get_user_by_id(id)?.map(|row| row.into_safe()))
    })
    .await?
    .ok_or_else(|| TavernError::Conflict(format!("Name '{name}' is taken")))?;

    info!("Registered {} ({})", user.name, user.id);
    let (jar, body) = issue_identity(&state, jar, user).await?;
    Ok((StatusCode::CREATED, jar, body))
}

pub async fn login(
    State(state): State<AppState>,
    jar: CookieJar,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(req) = payload?;
    let invalid = || ApiError(TavernError::Authentication("Invalid name or password".into()));

    let name = req.name.trim().to_string();
    let user = blocking(&state.gateway.db, move |db| db.get_user_by_name(&name))
        .await?
        .ok_or_else(invalid)?;

    // Verify password
    let parsed_hash = PasswordHash::new(&user.password)
        .map_err(|e| TavernError::Intern(format!("stored hash for user {} is unreadable: {e}", user.id)))?;
    if Argon2::default()
        .verify_password(req.password.as_bytes(), &parsed_hash)
        .is_err()
    {
        warn!("Failed login for {}", user.name);
        return Err(invalid());
    }

    let (jar, body) = issue_identity(&state, jar, user.into_safe()).await?;
    Ok((jar, body))
}

/// Revoke the token, clear the cookie and drop every live socket of the user.
pub async fn logout(
    State(state): State<AppState>,
    Extension(user): Extension<SafeUser>,
    jar: CookieJar,
) -> impl IntoResponse {
    let gateway = &state.gateway;
    gateway.cache.delete(&keys::identity(user.id)).await;
    let closed = gateway.disconnect_user(user.id).await;
    info!("{} ({}) logged out, {} sockets closed", user.name, user.id, closed);

    let jar = jar.remove(Cookie::build(IDENTITY_COOKIE).path("/"));
    (StatusCode::NO_CONTENT, jar)
}

pub async fn me(Extension(user): Extension<SafeUser>) -> Json<SafeUser> {
    Json(user)
}

/// Sign a token, remember it as the user's only valid one and hand it out in
/// the sealed cookie.
async fn issue_identity(state: &AppState, jar: CookieJar, user: SafeUser) -> ApiResult<(CookieJar, Json<LoginResponse>)> {
    let token = create_token(&state.gateway.keys.jwt_secret, &user, state.token_ttl.as_secs())?;

    state
        .gateway
        .cache
        .set_json_with_ttl(
            &keys::identity(user.id),
            &IdentityEntry {
                token: token.clone(),
                user: user.clone(),
            },
            state.token_ttl,
        )
        .await?;

    let sealed = seal_cookie(&state.gateway.keys.cookie_key, &token)?;
    let cookie = Cookie::build((IDENTITY_COOKIE, sealed))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .secure(state.secure_cookie);

    Ok((jar.add(cookie), Json(LoginResponse { user })))
}

fn create_token(secret: &str, user: &SafeUser, ttl_secs: u64) -> anyhow::Result<String> {
    let claims = Claims {
        sub: user.id,
        name: user.name.clone(),
        exp: (chrono::Utc::now().timestamp() as u64 + ttl_secs) as usize,
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;

    Ok(token)
}
