/// Database row types — these map directly to SQLite rows.
/// Distinct from tavern-types models to keep the DB layer independent.
use anyhow::{Context, Result};
use tavern_types::models::{Character, Note, SafeUser, Session, Sketch};

pub struct UserRow {
    pub id: i64,
    pub name: String,
    pub password: String,
    pub is_admin: bool,
    pub locale: String,
    pub theme: String,
    pub created_at: String,
}

impl UserRow {
    /// Drop the credential hash.
    pub fn into_safe(self) -> SafeUser {
        SafeUser {
            id: self.id,
            name: self.name,
            is_admin: self.is_admin,
            locale: self.locale,
            theme: self.theme,
        }
    }
}

pub struct SessionRow {
    pub id: i64,
    pub master_id: i64,
    pub game: String,
    pub name: String,
    pub sketch: String,
}

impl SessionRow {
    pub fn into_session(self) -> Result<Session> {
        let sketch: Sketch = serde_json::from_str(&self.sketch)
            .with_context(|| format!("Corrupt sketch on session {}", self.id))?;
        Ok(Session {
            id: self.id,
            master_id: self.master_id,
            game: self.game,
            name: self.name,
            sketch,
        })
    }
}

pub struct CharacterRow {
    pub id: i64,
    pub user_id: i64,
    pub game: String,
    pub data: String,
}

impl CharacterRow {
    pub fn into_character(self) -> Result<Character> {
        let data = serde_json::from_str(&self.data)
            .with_context(|| format!("Corrupt data on character {}", self.id))?;
        Ok(Character {
            id: self.id,
            user_id: self.user_id,
            game: self.game,
            data,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoteRow {
    pub id: i64,
    pub session_id: i64,
    pub user_id: i64,
    pub is_shared: bool,
    pub position: i64,
    pub title: String,
    pub text: String,
}

impl From<NoteRow> for Note {
    fn from(row: NoteRow) -> Self {
        Note {
            id: row.id,
            session_id: row.session_id,
            user_id: row.user_id,
            is_shared: row.is_shared,
            position: row.position,
            title: row.title,
            text: row.text,
        }
    }
}
