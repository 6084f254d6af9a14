use axum::{
    Extension, Json,
    extract::{Path, State, rejection::{JsonRejection, PathRejection}},
    http::StatusCode,
    response::IntoResponse,
};

use tavern_db::Shift;
use tavern_gateway::notes::{self, NoteCaller};
use tavern_types::api::CreateNoteRequest;
use tavern_types::events::{NoteRemoved, ServerEvent, Stamped};
use tavern_types::models::{Note, NotePatch, SafeUser};

use crate::AppState;
use crate::error::ApiResult;

pub async fn list_notes(
    State(state): State<AppState>,
    Extension(user): Extension<SafeUser>,
    path: Result<Path<i64>, PathRejection>,
) -> ApiResult<Json<Vec<Note>>> {
    let Path(session_id) = path?;
    Ok(Json(notes::list(&state.gateway.db, session_id, user.id).await?))
}

pub async fn create_note(
    State(state): State<AppState>,
    Extension(user): Extension<SafeUser>,
    path: Result<Path<i64>, PathRejection>,
    payload: Result<Json<CreateNoteRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Path(session_id) = path?;
    let Json(req) = payload?;

    let note = notes::create(&state.gateway.db, session_id, user.id, req).await?;
    if note.is_shared {
        let event = ServerEvent::NoteUpdate(Stamped::now(note.clone()));
        state.gateway.hub.emit_to_room(session_id, &event, None).await;
    }
    Ok((StatusCode::CREATED, Json(note)))
}

pub async fn get_note(
    State(state): State<AppState>,
    Extension(user): Extension<SafeUser>,
    path: Result<Path<i64>, PathRejection>,
) -> ApiResult<Json<Note>> {
    let Path(note_id) = path?;
    Ok(Json(notes::get(&state.gateway.db, NoteCaller::user(user.id), note_id).await?))
}

pub async fn update_note(
    State(state): State<AppState>,
    Extension(user): Extension<SafeUser>,
    path: Result<Path<i64>, PathRejection>,
    payload: Result<Json<NotePatch>, JsonRejection>,
) -> ApiResult<Json<Note>> {
    let Path(note_id) = path?;
    let Json(patch) = payload?;

    let change = notes::update(&state.gateway.db, NoteCaller::user(user.id), note_id, patch).await?;
    if change.note.is_shared || change.was_shared {
        let event = ServerEvent::NoteUpdate(Stamped::now(change.note.clone()));
        state
            .gateway
            .hub
            .emit_to_room(change.note.session_id, &event, None)
            .await;
    }
    Ok(Json(change.note))
}

pub async fn delete_note(
    State(state): State<AppState>,
    Extension(user): Extension<SafeUser>,
    path: Result<Path<i64>, PathRejection>,
) -> ApiResult<StatusCode> {
    let Path(note_id) = path?;

    let removed = notes::delete(&state.gateway.db, NoteCaller::user(user.id), note_id).await?;
    if removed.is_shared {
        let event = ServerEvent::NoteDelete(Stamped::now(NoteRemoved {
            note_id: removed.id,
            user_id: removed.user_id,
        }));
        state
            .gateway
            .hub
            .emit_to_room(removed.session_id, &event, None)
            .await;
    }
    Ok(StatusCode::NO_CONTENT)
}

pub async fn move_up(
    State(state): State<AppState>,
    Extension(user): Extension<SafeUser>,
    path: Result<Path<i64>, PathRejection>,
) -> ApiResult<Json<Note>> {
    let Path(note_id) = path?;
    shift(&state, &user, note_id, Shift::Up).await
}

pub async fn move_down(
    State(state): State<AppState>,
    Extension(user): Extension<SafeUser>,
    path: Result<Path<i64>, PathRejection>,
) -> ApiResult<Json<Note>> {
    let Path(note_id) = path?;
    shift(&state, &user, note_id, Shift::Down).await
}

async fn shift(state: &AppState, user: &SafeUser, note_id: i64, shift: Shift) -> ApiResult<Json<Note>> {
    let note = notes::move_note(&state.gateway.db, NoteCaller::user(user.id), note_id, shift).await?;
    Ok(Json(note))
}
