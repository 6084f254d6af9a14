pub mod auth;
pub mod error;
pub mod middleware;
pub mod notes;
pub mod sessions;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router, middleware as axum_middleware,
    routing::{get, patch, post, put},
};

use tavern_gateway::Gateway;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub gateway: Gateway,
    /// Lifetime of identity tokens and of their `jwt-cache` entries.
    pub token_ttl: Duration,
    pub secure_cookie: bool,
}

/// Every HTTP route except the gateway upgrade.
pub fn routes(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login));

    let protected_routes = Router::new()
        .route("/auth/logout", post(auth::logout))
        .route("/auth/me", get(auth::me))
        .route("/sessions", post(sessions::create_session))
        .route("/sessions/{session_id}", get(sessions::get_session))
        .route(
            "/sessions/{session_id}/notes",
            get(notes::list_notes).post(notes::create_note),
        )
        .route(
            "/notes/{note_id}",
            get(notes::get_note).patch(notes::update_note).delete(notes::delete_note),
        )
        .route("/notes/{note_id}/up", post(notes::move_up))
        .route("/notes/{note_id}/down", post(notes::move_down))
        .route("/characters", post(sessions::create_character))
        .route("/characters/{character_id}", put(sessions::update_character))
        .layer(axum_middleware::from_fn_with_state(state.clone(), middleware::require_auth));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use http_body_util::BodyExt;
    use serde_json::{Value, json};
    use tavern_crypto::CookieKey;
    use tavern_db::Database;
    use tavern_gateway::gatekeeper::AuthKeys;
    use tower::ServiceExt;

    fn app() -> (Router, AppState) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let keys = AuthKeys {
            jwt_secret: "test-secret".into(),
            cookie_key: CookieKey::generate(),
        };
        let state = Arc::new(AppStateInner {
            gateway: Gateway::new(db, keys, Duration::from_millis(50)),
            token_ttl: Duration::from_secs(3600),
            secure_cookie: false,
        });
        (routes(state.clone()), state)
    }

    async fn call(app: &Router, method: &str, uri: &str, cookie: Option<&str>, body: Option<Value>) -> (StatusCode, Option<String>, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        if let Some(cookie) = cookie {
            req = req.header(header::COOKIE, cookie);
        }
        let body = match body {
            Some(json) => {
                req = req.header(header::CONTENT_TYPE, "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };

        let res = app.clone().oneshot(req.body(body).unwrap()).await.unwrap();
        let status = res.status();
        let set_cookie = res
            .headers()
            .get(header::SET_COOKIE)
            .map(|v| v.to_str().unwrap().split(';').next().unwrap().to_string());
        let bytes = res.into_body().collect().await.unwrap().to_bytes();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, set_cookie, json)
    }

    async fn register(app: &Router, name: &str) -> (i64, String) {
        let (status, cookie, body) = call(
            app,
            "POST",
            "/auth/register",
            None,
            Some(json!({ "name": name, "password": "correct horse" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        (body["user"]["id"].as_i64().unwrap(), cookie.unwrap())
    }

    #[tokio::test]
    async fn register_login_and_logout() {
        let (app, _) = app();
        let (id, cookie) = register(&app, "mira").await;
        assert!(cookie.starts_with("tavern_identity="));

        let (status, _, me) = call(&app, "GET", "/auth/me", Some(&cookie), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(me["id"], id);
        assert!(me.get("password").is_none());

        let (status, _, body) = call(
            &app,
            "POST",
            "/auth/login",
            None,
            Some(json!({ "name": "mira", "password": "wrong password" })),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["status"], 401);

        let (status, login_cookie, _) = call(
            &app,
            "POST",
            "/auth/login",
            None,
            Some(json!({ "name": "mira", "password": "correct horse" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let login_cookie = login_cookie.unwrap();

        let (status, _, _) = call(&app, "POST", "/auth/logout", Some(&login_cookie), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _, _) = call(&app, "GET", "/auth/me", Some(&login_cookie), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn registration_is_validated() {
        let (app, _) = app();
        register(&app, "mira").await;

        let (status, _, body) = call(
            &app,
            "POST",
            "/auth/register",
            None,
            Some(json!({ "name": "mira", "password": "another one" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["status"], 409);

        let (status, _, body) = call(
            &app,
            "POST",
            "/auth/register",
            None,
            Some(json!({ "name": "ok name", "password": "short" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["data"]["field"], "password");

        let (status, _, _) = call(&app, "POST", "/auth/register", None, Some(json!({ "name": "x" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn notes_over_http_keep_their_order() {
        let (app, _) = app();
        let (_, cookie) = register(&app, "mira").await;
        let cookie = Some(cookie.as_str());

        let (status, _, session) =
            call(&app, "POST", "/sessions", cookie, Some(json!({ "game": "dnd5e", "name": "Friday" }))).await;
        assert_eq!(status, StatusCode::CREATED);
        let notes_uri = format!("/sessions/{}/notes", session["id"]);

        let mut ids = Vec::new();
        for title in ["one", "two", "three"] {
            let (status, _, note) = call(&app, "POST", &notes_uri, cookie, Some(json!({ "title": title }))).await;
            assert_eq!(status, StatusCode::CREATED);
            ids.push(note["id"].as_i64().unwrap());
        }

        let (status, _, body) = call(&app, "POST", &format!("/notes/{}/up", ids[0]), cookie, None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["message"], "Cannot go up further");

        let (status, _, moved) = call(&app, "POST", &format!("/notes/{}/up", ids[2]), cookie, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(moved["position"], 2);

        let (status, _, _) = call(&app, "DELETE", &format!("/notes/{}", ids[0]), cookie, None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (_, _, listed) = call(&app, "GET", &notes_uri, cookie, None).await;
        let order: Vec<_> = listed
            .as_array()
            .unwrap()
            .iter()
            .map(|n| (n["title"].as_str().unwrap().to_string(), n["position"].as_i64().unwrap()))
            .collect();
        assert_eq!(order, vec![("three".to_string(), 1), ("two".to_string(), 2)]);

        let (status, _, patched) = call(
            &app,
            "PATCH",
            &format!("/notes/{}", ids[1]),
            cookie,
            Some(json!({ "isShared": true })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(patched["isShared"], true);
    }

    #[tokio::test]
    async fn private_notes_and_characters_belong_to_their_owner() {
        let (app, _) = app();
        let (_, owner) = register(&app, "owner").await;
        let (_, other) = register(&app, "other").await;

        let (_, _, session) = call(
            &app,
            "POST",
            "/sessions",
            Some(&owner),
            Some(json!({ "game": "dnd5e", "name": "t" })),
        )
        .await;
        let (_, _, note) = call(
            &app,
            "POST",
            &format!("/sessions/{}/notes", session["id"]),
            Some(&owner),
            Some(json!({ "title": "secret", "text": "the butler" })),
        )
        .await;

        let (status, _, _) = call(&app, "GET", &format!("/notes/{}", note["id"]), Some(&other), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, _, _) = call(&app, "GET", "/notes/not-a-number", Some(&owner), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _, character) = call(
            &app,
            "POST",
            "/characters",
            Some(&owner),
            Some(json!({ "game": "dnd5e", "data": { "hp": 10 } })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let uri = format!("/characters/{}", character["id"]);

        let (status, _, _) = call(&app, "PUT", &uri, Some(&other), Some(json!({ "data": { "hp": 0 } }))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, _, updated) = call(&app, "PUT", &uri, Some(&owner), Some(json!({ "data": { "hp": 7 } }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["data"]["hp"], 7);
    }

    #[tokio::test]
    async fn missing_cookie_is_unauthorized() {
        let (app, _) = app();
        let (status, _, body) = call(&app, "GET", "/sessions/1/notes", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["message"], "Not authenticated");
    }

    #[tokio::test]
    async fn logout_closes_live_sockets() {
        let (app, state) = app();
        let (id, cookie) = register(&app, "mira").await;
        let (_, _, session) = call(
            &app,
            "POST",
            "/sessions",
            Some(&cookie),
            Some(json!({ "game": "dnd5e", "name": "t" })),
        )
        .await;

        let sealed = cookie.trim_start_matches("tavern_identity=").to_string();
        let handshake = tavern_gateway::gatekeeper::Handshake {
            cookie: Some(sealed),
            query: tavern_types::api::HandshakeQuery {
                session_id: Some(session["id"].to_string()),
                character_id: None,
            },
        };
        let binding = tavern_gateway::gatekeeper::admit(&state.gateway, handshake).await.unwrap();
        assert_eq!(binding.user.id, id);
        let (_socket, _rx) = state.gateway.attach(binding).await.unwrap();
        assert_eq!(state.gateway.hub.socket_count().await, 1);

        call(&app, "POST", "/auth/logout", Some(&cookie), None).await;
        assert_eq!(state.gateway.hub.socket_count().await, 0);
    }
}
