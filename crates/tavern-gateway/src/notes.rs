//! Note ordering service, shared by the socket handlers and the HTTP routes.
//! Ownership and visibility are checked here before anything is written.

use std::sync::Arc;

use serde_json::json;

use tavern_db::{Database, Shift, ShiftOutcome};
use tavern_types::TavernError;
use tavern_types::api::CreateNoteRequest;
use tavern_types::models::{Note, NotePatch};

use crate::blocking;

const MAX_TITLE_LEN: usize = 200;

/// Who is asking. `session_id` restricts notes to one session (socket callers);
/// HTTP callers address notes by id alone.
#[derive(Debug, Clone, Copy)]
pub struct NoteCaller {
    pub user_id: i64,
    pub session_id: Option<i64>,
}

impl NoteCaller {
    pub fn user(user_id: i64) -> Self {
        Self {
            user_id,
            session_id: None,
        }
    }

    pub fn in_session(user_id: i64, session_id: i64) -> Self {
        Self {
            user_id,
            session_id: Some(session_id),
        }
    }
}

/// Result of an edit. `was_shared` lets callers relay un-sharing too.
#[derive(Debug, Clone)]
pub struct NoteChange {
    pub note: Note,
    pub was_shared: bool,
}

pub async fn create(
    db: &Arc<Database>,
    session_id: i64,
    user_id: i64,
    request: CreateNoteRequest,
) -> Result<Note, TavernError> {
    validate_title(&request.title)?;

    let row = blocking(db, move |db| {
        if db.get_session(session_id)?.is_none() {
            return Ok(None);
        }
        db.insert_note(session_id, user_id, request.title.trim(), &request.text, request.is_shared)
            .map(Some)
    })
    .await?
    .ok_or_else(|| TavernError::NotFound(format!("Session {session_id} not found")))?;
    Ok(row.into())
}

/// Own notes in position order, then other participants' shared notes.
pub async fn list(db: &Arc<Database>, session_id: i64, user_id: i64) -> Result<Vec<Note>, TavernError> {
    let rows = blocking(db, move |db| db.list_visible_notes(session_id, user_id)).await?;
    Ok(rows.into_iter().map(Note::from).collect())
}

/// Read one note. Other users' notes are readable only while shared.
pub async fn get(db: &Arc<Database>, caller: NoteCaller, note_id: i64) -> Result<Note, TavernError> {
    let note = load(db, caller, note_id).await?;
    if note.user_id != caller.user_id && !note.is_shared {
        return Err(TavernError::Forbidden(format!("Note {note_id} is not shared")));
    }
    Ok(note)
}

pub async fn update(
    db: &Arc<Database>,
    caller: NoteCaller,
    note_id: i64,
    patch: NotePatch,
) -> Result<NoteChange, TavernError> {
    if patch.title.is_none() && patch.text.is_none() && patch.is_shared.is_none() {
        return Err(TavernError::validation("Nothing to update"));
    }
    if let Some(title) = &patch.title {
        validate_title(title)?;
    }

    let before = owned(db, caller, note_id).await?;
    let row = blocking(db, move |db| {
        let title = patch.title.as_deref().map(str::trim);
        db.update_note(note_id, title, patch.text.as_deref(), patch.is_shared)
    })
    .await?
    .ok_or_else(|| TavernError::NotFound(format!("Note {note_id} not found")))?;

    Ok(NoteChange {
        note: row.into(),
        was_shared: before.is_shared,
    })
}

/// Swap a note with its neighbour. Moving past either end is a conflict.
pub async fn move_note(db: &Arc<Database>, caller: NoteCaller, note_id: i64, shift: Shift) -> Result<Note, TavernError> {
    owned(db, caller, note_id).await?;

    match blocking(db, move |db| db.shift_note(note_id, shift)).await? {
        ShiftOutcome::Moved(row) => Ok(row.into()),
        ShiftOutcome::AtBoundary => Err(TavernError::Conflict(match shift {
            Shift::Up => "Cannot go up further".into(),
            Shift::Down => "Cannot go down further".into(),
        })),
        ShiftOutcome::Missing => Err(TavernError::NotFound(format!("Note {note_id} not found"))),
    }
}

/// Delete and close the gap in the owner's positions. Returns the removed note.
pub async fn delete(db: &Arc<Database>, caller: NoteCaller, note_id: i64) -> Result<Note, TavernError> {
    owned(db, caller, note_id).await?;

    blocking(db, move |db| db.delete_note(note_id))
        .await?
        .map(Note::from)
        .ok_or_else(|| TavernError::NotFound(format!("Note {note_id} not found")))
}

async fn load(db: &Arc<Database>, caller: NoteCaller, note_id: i64) -> Result<Note, TavernError> {
    let note: Note = blocking(db, move |db| db.get_note(note_id))
        .await?
        .ok_or_else(|| TavernError::NotFound(format!("Note {note_id} not found")))?
        .into();

    if caller.session_id.is_some_and(|session_id| session_id != note.session_id) {
        return Err(TavernError::Forbidden(format!(
            "Note {note_id} belongs to another session"
        )));
    }
    Ok(note)
}

async fn owned(db: &Arc<Database>, caller: NoteCaller, note_id: i64) -> Result<Note, TavernError> {
    let note = load(db, caller, note_id).await?;
    if note.user_id != caller.user_id {
        return Err(TavernError::Forbidden(format!("Note {note_id} is not yours")));
    }
    Ok(note)
}

fn validate_title(title: &str) -> Result<(), TavernError> {
    let len = title.trim().chars().count();
    if len == 0 || len > MAX_TITLE_LEN {
        return Err(TavernError::validation_with(
            format!("Title must be 1-{MAX_TITLE_LEN} characters"),
            json!({ "field": "title" }),
        ));
    }
    Ok(())
}
