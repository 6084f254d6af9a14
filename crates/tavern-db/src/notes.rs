//! Note storage. Positions are dense per `(session_id, user_id)`: every write
//! here leaves them as exactly `1..=N`.

use anyhow::{Result, bail};
use rusqlite::{Connection, Row};

use crate::Database;
use crate::models::NoteRow;
use crate::queries::OptionalExt;

const NOTE_COLUMNS: &str = "id, session_id, user_id, is_shared, position, title, text";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shift {
    Up,
    Down,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ShiftOutcome {
    Moved(NoteRow),
    /// Already first (up) or last (down); nothing was written.
    AtBoundary,
    Missing,
}

impl Database {
    /// Append a note after the owner's current last position.
    pub fn insert_note(
        &self,
        session_id: i64,
        user_id: i64,
        title: &str,
        text: &str,
        is_shared: bool,
    ) -> Result<NoteRow> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO notes (session_id, user_id, is_shared, position, title, text)
                 SELECT ?1, ?2, ?3, COALESCE(MAX(position), 0) + 1, ?4, ?5
                 FROM notes WHERE session_id = ?1 AND user_id = ?2",
                rusqlite::params![session_id, user_id, is_shared, title, text],
            )?;
            let id = conn.last_insert_rowid();
            match query_note(conn, id)? {
                Some(row) => Ok(row),
                None => bail!("Note {} vanished after insert", id),
            }
        })
    }

    pub fn get_note(&self, id: i64) -> Result<Option<NoteRow>> {
        self.with_conn(|conn| query_note(conn, id))
    }

    /// The caller's own notes first, in position order, then everyone else's shared notes.
    pub fn list_visible_notes(&self, session_id: i64, user_id: i64) -> Result<Vec<NoteRow>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {NOTE_COLUMNS} FROM notes
                 WHERE session_id = ?1 AND (user_id = ?2 OR is_shared = 1)
                 ORDER BY user_id != ?2, user_id, position"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(rusqlite::params![session_id, user_id], note_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Positions of one owner's notes, ascending.
    pub fn note_positions(&self, session_id: i64, user_id: i64) -> Result<Vec<i64>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT position FROM notes WHERE session_id = ?1 AND user_id = ?2 ORDER BY position",
            )?;
            let positions = stmt
                .query_map(rusqlite::params![session_id, user_id], |row| row.get(0))?
                .collect::<std::result::Result<Vec<i64>, _>>()?;
            Ok(positions)
        })
    }

    /// Edit title, text or sharing. `None` fields are kept.
    pub fn update_note(
        &self,
        id: i64,
        title: Option<&str>,
        text: Option<&str>,
        is_shared: Option<bool>,
    ) -> Result<Option<NoteRow>> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "UPDATE notes SET
                    title = COALESCE(?2, title),
                    text = COALESCE(?3, text),
                    is_shared = COALESCE(?4, is_shared)
                 WHERE id = ?1",
                rusqlite::params![id, title, text, is_shared],
            )?;
            query_note(conn, id)
        })
    }

    /// Swap a note with its neighbour. Both rows change in a single UPDATE so a
    /// concurrent reader never sees two notes sharing a position.
    pub fn shift_note(&self, id: i64, shift: Shift) -> Result<ShiftOutcome> {
        self.with_conn_mut(|conn| {
            let tx = conn.unchecked_transaction()?;

            let Some(note) = query_note(&tx, id)? else {
                return Ok(ShiftOutcome::Missing);
            };

            let target = match shift {
                Shift::Up => note.position - 1,
                Shift::Down => note.position + 1,
            };
            let last: i64 = tx.query_row(
                "SELECT COALESCE(MAX(position), 0) FROM notes WHERE session_id = ?1 AND user_id = ?2",
                rusqlite::params![note.session_id, note.user_id],
                |row| row.get(0),
            )?;
            if target < 1 || target > last {
                return Ok(ShiftOutcome::AtBoundary);
            }

            let swapped = tx.execute(
                "UPDATE notes
                 SET position = CASE position WHEN ?3 THEN ?4 ELSE ?3 END
                 WHERE session_id = ?1 AND user_id = ?2 AND position IN (?3, ?4)",
                rusqlite::params![note.session_id, note.user_id, note.position, target],
            )?;
            if swapped != 2 {
                // Dropping the transaction rolls it back.
                bail!(
                    "Position sequence broken for session {} user {}: swap touched {} rows",
                    note.session_id,
                    note.user_id,
                    swapped
                );
            }

            let moved = query_note(&tx, id)?;
            tx.commit()?;
            Ok(moved.map_or(ShiftOutcome::Missing, ShiftOutcome::Moved))
        })
    }

    /// Delete a note and renumber the owner's remaining notes as `1..=N-1`.
    pub fn delete_note(&self, id: i64) -> Result<Option<NoteRow>> {
        self.with_conn_mut(|conn| {
            let tx = conn.unchecked_transaction()?;

            let Some(note) = query_note(&tx, id)? else {
                return Ok(None);
            };

            tx.execute("DELETE FROM notes WHERE id = ?1", [id])?;
            tx.execute(
                "UPDATE notes SET position = ranked.rn
                 FROM (
                     SELECT id, ROW_NUMBER() OVER (ORDER BY position) AS rn
                     FROM notes WHERE session_id = ?1 AND user_id = ?2
                 ) AS ranked
                 WHERE notes.id = ranked.id",
                rusqlite::params![note.session_id, note.user_id],
            )?;

            tx.commit()?;
            Ok(Some(note))
        })
    }
}

fn query_note(conn: &Connection, id: i64) -> Result<Option<NoteRow>> {
    let sql = format!("SELECT {NOTE_COLUMNS} FROM notes WHERE id = ?1");
    conn.query_row(&sql, [id], note_from_row).optional()
}

fn note_from_row(row: &Row<'_>) -> rusqlite::Result<NoteRow> {
    Ok(NoteRow {
        id: row.get(0)?,
        session_id: row.get(1)?,
        user_id: row.get(2)?,
        is_shared: row.get(3)?,
        position: row.get(4)?,
        title: row.get(5)?,
        text: row.get(6)?,
    })
}
