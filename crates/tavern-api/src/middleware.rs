use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use axum_extra::extract::CookieJar;

use tavern_gateway::gatekeeper::{IDENTITY_COOKIE, authenticate};

use crate::AppState;
use crate::error::ApiError;

/// Resolve the identity cookie to a `SafeUser` and attach it to the request.
/// Same checks as the gateway handshake, so a logout locks out both.
pub async fn require_auth(
    State(state): State<AppState>,
    jar: CookieJar,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let gateway = &state.gateway;
    let cookie = jar.get(IDENTITY_COOKIE).map(|c| c.value());
    let user = authenticate(&gateway.keys, &gateway.cache, cookie).await?;

    req.extensions_mut().insert(user);
    Ok(next.run(req).await)
}
