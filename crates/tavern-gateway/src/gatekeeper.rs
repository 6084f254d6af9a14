//! Connection admission: turns handshake data into a `ConnectionBinding` or a refusal.

use jsonwebtoken::{DecodingKey, Validation, decode};
use serde_json::json;
use tracing::{debug, info};

use tavern_crypto::{CookieKey, open_cookie};
use tavern_types::TavernError;
use tavern_types::api::{Claims, HandshakeQuery, IdentityEntry};
use tavern_types::models::{Character, SafeUser};

use crate::cache::{Cache, keys};
use crate::{Gateway, blocking};

/// Name of the cookie carrying the sealed identity token.
pub const IDENTITY_COOKIE: &str = "tavern_identity";

/// Server secrets used to open and verify identity cookies.
#[derive(Debug, Clone)]
pub struct AuthKeys {
    pub jwt_secret: String,
    pub cookie_key: CookieKey,
}

/// Raw inputs of a connection attempt.
#[derive(Debug, Clone, Default)]
pub struct Handshake {
    pub cookie: Option<String>,
    pub query: HandshakeQuery,
}

/// Who sits where. A master never has a character; a player always has one
/// they own.
#[derive(Debug, Clone, PartialEq)]
pub enum Seat {
    Master,
    Player { character: Character },
}

/// Metadata of one live connection, built once at admission and never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionBinding {
    pub user: SafeUser,
    pub session_id: i64,
    pub seat: Seat,
}

impl ConnectionBinding {
    pub fn is_master(&self) -> bool {
        matches!(self.seat, Seat::Master)
    }

    pub fn character(&self) -> Option<&Character> {
        match &self.seat {
            Seat::Master => None,
            Seat::Player { character } => Some(character),
        }
    }

    pub fn character_id(&self) -> Option<i64> {
        self.character().map(|c| c.id)
    }

    /// Guard for master-exclusive actions. Call before touching any state.
    pub fn require_master(&self, action: &str) -> Result<(), TavernError> {
        if self.is_master() {
            Ok(())
        } else {
            Err(TavernError::Forbidden(format!("Only the master can {action}")))
        }
    }
}

/// Open the cookie, verify the token and check it against the login cache.
pub async fn authenticate(keys: &AuthKeys, cache: &Cache, cookie: Option<&str>) -> Result<SafeUser, TavernError> {
    let cookie = cookie
        .filter(|c| !c.is_empty())
        .ok_or_else(|| TavernError::Authentication("Not authenticated".into()))?;

    let token = open_cookie(&keys.cookie_key, cookie).map_err(|e| {
        debug!("Identity cookie rejected: {:#}", e);
        TavernError::Authentication("Invalid identity cookie".into())
    })?;

    let claims = decode::<Claims>(
        &token,
        &DecodingKey::from_secret(keys.jwt_secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|e| {
        debug!("Identity token rejected: {}", e);
        TavernError::Authentication("Invalid or expired token".into())
    })?
    .claims;

    let entry: Option<IdentityEntry> = cache.get_json(&keys::identity(claims.sub)).await?;
    match entry {
        Some(entry) if entry.token == token => Ok(entry.user),
        Some(_) => Err(TavernError::Authentication("Token has been superseded".into())),
        None => Err(TavernError::Authentication("Token has been revoked".into())),
    }
}

/// Admit a connection. Nothing is retained on failure; the sketch is warmed
/// only once the connection is attached to its room.
pub async fn admit(gateway: &Gateway, handshake: Handshake) -> Result<ConnectionBinding, TavernError> {
    let user = authenticate(&gateway.keys, &gateway.cache, handshake.cookie.as_deref()).await?;

    let session_id = parse_id(handshake.query.session_id.as_deref(), "sessionId")?;
    let session = blocking(&gateway.db, move |db| {
        db.get_session(session_id)?.map(|row| row.into_session()).transpose()
    })
    .await?
    .ok_or_else(|| TavernError::NotFound(format!("Session {session_id} not found")))?;

    let seat = if session.master_id == user.id {
        Seat::Master
    } else {
        let character_id = parse_id(handshake.query.character_id.as_deref(), "characterId")?;
        let character = blocking(&gateway.db, move |db| {
            db.get_character(character_id)?.map(|row| row.into_character()).transpose()
        })
        .await?
        .ok_or_else(|| TavernError::NotFound(format!("Character {character_id} not found")))?;

        if character.user_id != user.id {
            return Err(TavernError::Forbidden(format!(
                "Character {character_id} does not belong to you"
            )));
        }

        gateway.cache.set_json(&keys::character(character.id), &character).await?;
        Seat::Player { character }
    };

    let binding = ConnectionBinding {
        user,
        session_id: session.id,
        seat,
    };
    info!(
        "{} ({}) admitted to session {} as {}",
        binding.user.name,
        binding.user.id,
        binding.session_id,
        if binding.is_master() { "master" } else { "player" }
    );
    Ok(binding)
}

fn parse_id(raw: Option<&str>, field: &'static str) -> Result<i64, TavernError> {
    let raw = raw.ok_or_else(|| {
        TavernError::validation_with(format!("{field} is required"), json!({ "field": field }))
    })?;

    match raw.trim().parse::<i64>() {
        Ok(id) if id > 0 => Ok(id),
        _ => Err(TavernError::validation_with(
            format!("{field} must be a positive integer"),
            json!({ "field": field, "value": raw }),
        )),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use jsonwebtoken::{EncodingKey, Header, encode};
    use tavern_crypto::seal_cookie;
    use tavern_db::Database;

    pub(crate) const JWT_SECRET: &str = "test-jwt-secret";

    pub(crate) fn test_gateway() -> Gateway {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let keys = AuthKeys {
            jwt_secret: JWT_SECRET.into(),
            cookie_key: CookieKey::generate(),
        };
        Gateway::new(db, keys, Duration::from_millis(50))
    }

    /// Register a user and log them in: returns the safe user and a sealed cookie.
    pub(crate) async fn login(gateway: &Gateway, name: &str) -> (SafeUser, String) {
        let id = gateway.db.create_user(name, "hash", false).unwrap();
        let user = gateway.db.get_user_by_id(id).unwrap().unwrap().into_safe();
        let cookie = issue_cookie(gateway, &user, 3600).await;
        (user, cookie)
    }

    pub(crate) async fn issue_cookie(gateway: &Gateway, user: &SafeUser, lifetime_secs: i64) -> String {
        let exp = (std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64
            + lifetime_secs) as usize;
        let claims = Claims {
            sub: user.id,
            name: user.name.clone(),
            exp,
        };
        let token = encode(&Header::default(), &claims, &EncodingKey::from_secret(JWT_SECRET.as_bytes())).unwrap();
        gateway
            .cache
            .set_json(
                &keys::identity(user.id),
                &IdentityEntry {
                    token: token.clone(),
                    user: user.clone(),
                },
            )
            .await
            .unwrap();
        seal_cookie(&gateway.keys.cookie_key, &token).unwrap()
    }

    pub(crate) fn handshake(cookie: &str, session_id: i64, character_id: Option<i64>) -> Handshake {
        Handshake {
            cookie: Some(cookie.to_string()),
            query: HandshakeQuery {
                session_id: Some(session_id.to_string()),
                character_id: character_id.map(|id| id.to_string()),
            },
        }
    }

    pub(crate) struct Table {
        pub gateway: Gateway,
        pub master: SafeUser,
        pub master_cookie: String,
        pub player: SafeUser,
        pub player_cookie: String,
        pub session_id: i64,
        pub character_id: i64,
    }

    pub(crate) async fn table() -> Table {
        let gateway = test_gateway();
        let (master, master_cookie) = login(&gateway, "gm").await;
        let (player, player_cookie) = login(&gateway, "player").await;
        let session_id = gateway.db.create_session(master.id, "dnd5e", "Friday").unwrap();
        let character_id = gateway
            .db
            .create_character(player.id, "dnd5e", r#"{"name":"Brakka"}"#)
            .unwrap();
        Table {
            gateway,
            master,
            master_cookie,
            player,
            player_cookie,
            session_id,
            character_id,
        }
    }

    #[tokio::test]
    async fn master_is_admitted_without_character() {
        let t = table().await;
        let binding = admit(&t.gateway, handshake(&t.master_cookie, t.session_id, None))
            .await
            .unwrap();

        assert!(binding.is_master());
        assert_eq!(binding.user, t.master);
        assert_eq!(binding.character_id(), None);
    }

    #[tokio::test]
    async fn player_is_bound_to_their_character() {
        let t = table().await;
        let binding = admit(
            &t.gateway,
            handshake(&t.player_cookie, t.session_id, Some(t.character_id)),
        )
        .await
        .unwrap();

        assert!(!binding.is_master());
        assert_eq!(binding.character().unwrap().data["name"], "Brakka");
        let cached: Character = t
            .gateway
            .cache
            .get_json(&keys::character(t.character_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cached.user_id, t.player.id);
    }

    #[tokio::test]
    async fn foreign_character_is_forbidden() {
        let t = table().await;
        let (_, intruder_cookie) = login(&t.gateway, "intruder").await;

        let err = admit(
            &t.gateway,
            handshake(&intruder_cookie, t.session_id, Some(t.character_id)),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), 403);
    }

    #[tokio::test]
    async fn missing_or_bad_ids_are_validation_errors() {
        let t = table().await;

        let mut hs = handshake(&t.player_cookie, t.session_id, None);
        let err = admit(&t.gateway, hs.clone()).await.unwrap_err();
        assert_eq!(err.status(), 400);
        assert_eq!(err.to_payload().data.unwrap()["field"], "characterId");

        hs.query.session_id = Some("-3".into());
        let err = admit(&t.gateway, hs.clone()).await.unwrap_err();
        assert_eq!(err.to_payload().data.unwrap()["field"], "sessionId");

        hs.query.session_id = None;
        assert_eq!(admit(&t.gateway, hs).await.unwrap_err().status(), 400);
    }

    #[tokio::test]
    async fn unknown_session_and_character_are_not_found() {
        let t = table().await;
        let err = admit(&t.gateway, handshake(&t.master_cookie, 999, None)).await.unwrap_err();
        assert_eq!(err.status(), 404);

        let err = admit(&t.gateway, handshake(&t.player_cookie, t.session_id, Some(999)))
            .await
            .unwrap_err();
        assert_eq!(err.status(), 404);
    }

    #[tokio::test]
    async fn authentication_failures() {
        let t = table().await;

        let mut no_cookie = handshake("", t.session_id, None);
        no_cookie.cookie = None;
        assert_eq!(admit(&t.gateway, no_cookie).await.unwrap_err().status(), 401);

        let garbage = handshake("definitely-not-sealed", t.session_id, None);
        assert_eq!(admit(&t.gateway, garbage).await.unwrap_err().status(), 401);

        let expired = issue_cookie(&t.gateway, &t.master, -3600).await;
        let err = admit(&t.gateway, handshake(&expired, t.session_id, None)).await.unwrap_err();
        assert_eq!(err.status(), 401);
    }

    #[tokio::test]
    async fn logout_revokes_and_relogin_supersedes() {
        let t = table().await;

        // A fresh login replaces the cached token; the older cookie stops working.
        let newer = issue_cookie(&t.gateway, &t.master, 7200).await;
        let err = admit(&t.gateway, handshake(&t.master_cookie, t.session_id, None))
            .await
            .unwrap_err();
        assert_eq!(err.status(), 401);
        assert!(admit(&t.gateway, handshake(&newer, t.session_id, None)).await.is_ok());

        t.gateway.cache.delete(&keys::identity(t.master.id)).await;
        let err = admit(&t.gateway, handshake(&newer, t.session_id, None)).await.unwrap_err();
        assert_eq!(err.to_payload().message, "Token has been revoked");
    }

    #[tokio::test]
    async fn attach_keeps_an_already_warm_sketch() {
        let t = table().await;
        let key = keys::sketch(t.session_id);
        t.gateway
            .cache
            .set_json(&key, &serde_json::json!({ "displayed": true }))
            .await
            .unwrap();

        let binding = admit(&t.gateway, handshake(&t.master_cookie, t.session_id, None))
            .await
            .unwrap();
        t.gateway.attach(binding).await.unwrap();
        let cached: tavern_types::models::Sketch = t.gateway.cache.get_json(&key).await.unwrap().unwrap();
        assert!(cached.displayed);
    }
}
