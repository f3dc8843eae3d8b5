use anyhow::Context;
use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};

use crate::{Store, now_millis};

/// OpenCode session bound to a Discord thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadSession {
    pub thread_id: String,
    pub session_id: String,
    pub directory: Option<String>,
}

impl Store {
    pub fn get_thread_session(&self, thread_id: &str) -> anyhow::Result<Option<ThreadSession>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT thread_id, session_id, directory FROM thread_sessions WHERE thread_id = ?1",
                params![thread_id],
                |row| {
                    Ok(ThreadSession {
                        thread_id: row.get(0)?,
                        session_id: row.get(1)?,
                        directory: row.get(2)?,
                    })
                },
            )
            .optional()
            .context("get_thread_session")
        })
    }

    pub fn set_thread_session(&self, session: &ThreadSession) -> anyhow::Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "\
                INSERT INTO thread_sessions (thread_id, session_id, directory, updated_at)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(thread_id) DO UPDATE SET
                  session_id = excluded.session_id,
                  directory = excluded.directory,
                  updated_at = excluded.updated_at
                ",
                params![
                    session.thread_id,
                    session.session_id,
                    session.directory,
                    now_millis()
                ],
            )
            .context("set_thread_session")?;
            Ok(())
        })
    }

    pub fn delete_thread_session(&self, thread_id: &str) -> anyhow::Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM thread_sessions WHERE thread_id = ?1",
                params![thread_id],
            )
            .context("delete_thread_session")?;
            Ok(())
        })
    }
}
