use serde::{Deserialize, Serialize};

use crate::models::SafeUser;

// -- JWT Claims --

/// Identity token claims, shared by the HTTP layer (issuing) and the gateway
/// (verifying at handshake).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: i64,
    pub name: String,
    pub exp: usize,
}

/// Cache entry written at login under `jwt-cache:{userId}`. Its presence is what
/// keeps a token alive; deleting it revokes every socket of that user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityEntry {
    pub token: String,
    pub user: SafeUser,
}

// -- Auth --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterRequest {
    pub name: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoginRequest {
    pub name: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoginResponse {
    pub user: SafeUser,
}

// -- Gateway handshake --

/// Query string of `GET /gateway`. Kept as raw strings so that malformed values
/// surface as validation errors instead of a rejected upgrade.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeQuery {
    pub session_id: Option<String>,
    pub character_id: Option<String>,
}

// -- Notes --

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateNoteRequest {
    pub title: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub is_shared: bool,
}

// -- Sessions & characters --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateSessionRequest {
    pub game: String,
    pub name: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateCharacterRequest {
    pub game: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Full replacement of a character sheet.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateCharacterRequest {
    pub data: serde_json::Value,
}
