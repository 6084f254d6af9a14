use axum::{
    Extension, Json,
    extract::{Path, State, rejection::{JsonRejection, PathRejection}},
    http::StatusCode,
    response::IntoResponse,
};
use serde_json::{Value, json};

use tavern_gateway::blocking;
use tavern_gateway::cache::keys;
use tavern_types::TavernError;
use tavern_types::api::{CreateCharacterRequest, CreateSessionRequest, UpdateCharacterRequest};
use tavern_types::models::{Character, SafeUser, Session, Sketch};

use crate::AppState;
use crate::error::ApiResult;

/// Create a session; its creator is the master.
pub async fn create_session(
    State(state): State<AppState>,
    Extension(user): Extension<SafeUser>,
    payload: Result<Json<CreateSessionRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(req) = payload?;
    let game = required(&req.game, "game")?;
    let name = required(&req.name, "name")?;

    let session = blocking(&state.gateway.db, move |db| {
        let id = db.create_session(user.id, &game, &name)?;
        db.get_session(id)?.map(|row| row.into_session()).transpose()
    })
    .await?
    .ok_or_else(|| TavernError::Intern("session vanished after insert".into()))?;

    Ok((StatusCode::CREATED, Json(session)))
}

/// A session with the live sketch when a table is in progress.
pub async fn get_session(
    State(state): State<AppState>,
    path: Result<Path<i64>, PathRejection>,
) -> ApiResult<Json<Session>> {
    let Path(session_id) = path?;

    let mut session = blocking(&state.gateway.db, move |db| {
        db.get_session(session_id)?.map(|row| row.into_session()).transpose()
    })
    .await?
    .ok_or_else(|| TavernError::NotFound(format!("Session {session_id} not found")))?;

    let live: Option<Sketch> = state.gateway.cache.get_json(&keys::sketch(session_id)).await?;
    if let Some(sketch) = live {
        session.sketch = sketch;
    }
    Ok(Json(session))
}

pub async fn create_character(
    State(state): State<AppState>,
    Extension(user): Extension<SafeUser>,
    payload: Result<Json<CreateCharacterRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(req) = payload?;
    let game = required(&req.game, "game")?;
    let data = match req.data {
        Value::Null => json!({}),
        data => data,
    };
    let data_json = serde_json::to_string(&data).map_err(anyhow::Error::from)?;

    let character = blocking(&state.gateway.db, move |db| {
        let id = db.create_character(user.id, &game, &data_json)?;
        db.get_character(id)?.map(|row| row.into_character()).transpose()
    })
    .await?
    .ok_or_else(|| TavernError::Intern("character vanished after insert".into()))?;

    Ok((StatusCode::CREATED, Json(character)))
}

/// Replace a character sheet. Owner only. Clients follow up with a
/// `characterUpdate` socket event so the master sees the change.
pub async fn update_character(
    State(state): State<AppState>,
    Extension(user): Extension<SafeUser>,
    path: Result<Path<i64>, PathRejection>,
    payload: Result<Json<UpdateCharacterRequest>, JsonRejection>,
) -> ApiResult<Json<Character>> {
    let Path(character_id) = path?;
    let Json(req) = payload?;
    let data_json = serde_json::to_string(&req.data).map_err(anyhow::Error::from)?;

    let db = &state.gateway.db;
    let existing = blocking(db, move |db| {
        db.get_character(character_id)?.map(|row| row.into_character()).transpose()
    })
    .await?
    .ok_or_else(|| TavernError::NotFound(format!("Character {character_id} not found")))?;
    if existing.user_id != user.id {
        return Err(TavernError::Forbidden(format!("Character {character_id} does not belong to you")).into());
    }

    blocking(db, move |db| db.update_character_data(character_id, &data_json)).await?;
    Ok(Json(Character {
        data: req.data,
        ..existing
    }))
}

fn required(value: &str, field: &'static str) -> Result<String, TavernError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(TavernError::validation_with(
            format!("{field} is required"),
            json!({ "field": field }),
        ));
    }
    Ok(value.to_string())
}
