use crate::Database;
use crate::models::{CharacterRow, SessionRow, UserRow};
use anyhow::Result;
use rusqlite::{Connection, Row};

impl Database {
    // -- Users --

    pub fn create_user(&self, name: &str, password_hash: &str, is_admin: bool) -> Result<i64> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO users (name, password, is_admin) VALUES (?1, ?2, ?3)",
                rusqlite::params![name, password_hash, is_admin],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn get_user_by_name(&self, name: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "name = ?1", name))
    }

    pub fn get_user_by_id(&self, id: i64) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "id = ?1", id))
    }

    // -- Sessions --

    pub fn create_session(&self, master_id: i64, game: &str, name: &str) -> Result<i64> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO sessions (master_id, game, name) VALUES (?1, ?2, ?3)",
                rusqlite::params![master_id, game, name],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn get_session(&self, id: i64) -> Result<Option<SessionRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, master_id, game, name, sketch FROM sessions WHERE id = ?1",
                [id],
                |row| {
                    Ok(SessionRow {
                        id: row.get(0)?,
                        master_id: row.get(1)?,
                        game: row.get(2)?,
                        name: row.get(3)?,
                        sketch: row.get(4)?,
                    })
                },
            )
            .optional()
        })
    }

    /// Persist a sketch document. Returns false when the session no longer exists.
    pub fn update_session_sketch(&self, id: i64, sketch_json: &str) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "UPDATE sessions SET sketch = ?2 WHERE id = ?1",
                rusqlite::params![id, sketch_json],
            )?;
            Ok(changed == 1)
        })
    }

    // -- Characters --

    pub fn create_character(&self, user_id: i64, game: &str, data_json: &str) -> Result<i64> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO characters (user_id, game, data) VALUES (?1, ?2, ?3)",
                rusqlite::params![user_id, game, data_json],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn get_character(&self, id: i64) -> Result<Option<CharacterRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, user_id, game, data FROM characters WHERE id = ?1",
                [id],
                |row| {
                    Ok(CharacterRow {
                        id: row.get(0)?,
                        user_id: row.get(1)?,
                        game: row.get(2)?,
                        data: row.get(3)?,
                    })
                },
            )
            .optional()
        })
    }

    pub fn update_character_data(&self, id: i64, data_json: &str) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "UPDATE characters SET data = ?2 WHERE id = ?1",
                rusqlite::params![id, data_json],
            )?;
            Ok(changed == 1)
        })
    }
}

fn query_user<P: rusqlite::ToSql>(conn: &Connection, filter: &str, value: P) -> Result<Option<UserRow>> {
    let sql = format!(
        "SELECT id, name, password, is_admin, locale, theme, created_at FROM users WHERE {filter}"
    );
    let mut stmt = conn.prepare(&sql)?;
    stmt.query_row([value], user_from_row).optional()
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<UserRow> {
    Ok(UserRow {
        id: row.get(0)?,
        name: row.get(1)?,
        password: row.get(2)?,
        is_admin: row.get(3)?,
        locale: row.get(4)?,
        theme: row.get(5)?,
        created_at: row.get(6)?,
    })
}

/// Extension trait for optional query results
pub(crate) trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
