// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! SQLite-backed append-only conversation log.

use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{params, Connection};
use tracing::debug;

use crate::error::SessionError;
use crate::types::{ContentBlockType, Message, Role};

/// Current schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// Kind of a logged entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    User,
    Assistant,
    ToolResult,
}

impl EntryKind {
    pub fn of(message: &Message) -> Self {
        match message.role {
            Role::Assistant => Self::Assistant,
            Role::User if message.is_tool_result() => Self::ToolResult,
            Role::User => Self::User,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::ToolResult => "tool_result",
        }
    }
}

/// Persistent manager conversation.
///
/// Entries are only ever appended. On restart the last N entries are
/// replayed, trimmed so the result is a well-formed conversation.
pub struct ConversationLog {
    conn: Mutex<Connection>,
}

impl ConversationLog {
    /// Open or create a log database at `path`.
    pub fn open(path: &Path) -> Result<Self, SessionError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Self::init(conn)
    }

    /// In-memory log, used when persistence is not wanted.
    pub fn in_memory() -> Result<Self, SessionError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, SessionError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY
            );

            CREATE TABLE IF NOT EXISTS conversation (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            "#,
        )?;
        conn.execute(
            "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
            params![SCHEMA_VERSION],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append a message. Returns its sequence number.
    pub fn append(&self, message: &Message) -> Result<i64, SessionError> {
        let kind = EntryKind::of(message);
        let content = serde_json::to_string(message)?;
        let conn = self.conn();
        conn.execute(
            "INSERT INTO conversation (kind, content, created_at) VALUES (?1, ?2, ?3)",
            params![kind.as_str(), content, Utc::now().timestamp()],
        )?;
        let seq = conn.last_insert_rowid();
        debug!(seq, kind = kind.as_str(), "Conversation entry appended");
        Ok(seq)
    }

    pub fn len(&self) -> Result<usize, SessionError> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM conversation", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool, SessionError> {
        Ok(self.len()? == 0)
    }

    /// The last `limit` entries in order, trimmed to a well-formed conversation.
    ///
    /// Leading entries are dropped until the first plain user message, so a
    /// tool result never appears without its request. A trailing assistant
    /// entry that asked for tools whose results were never logged is dropped
    /// as well.
    pub fn replay(&self, limit: usize) -> Result<Vec<Message>, SessionError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT content FROM conversation ORDER BY seq DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| row.get::<_, String>(0))?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(serde_json::from_str::<Message>(&row?)?);
        }
        messages.reverse();

        let start = messages
            .iter()
            .position(|m| EntryKind::of(m) == EntryKind::User)
            .unwrap_or(messages.len());
        messages.drain(..start);

        let dangling = messages.last().is_some_and(|m| {
            m.role == Role::Assistant
                && m.as_blocks()
                    .is_some_and(|b| b.iter().any(|b| b.block_type == ContentBlockType::ToolUse))
        });
        if dangling {
            messages.pop();
        }
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ContentBlock;
    use tempfile::TempDir;

    fn tool_use(id: &str) -> Message {
        Message::with_blocks(
            Role::Assistant,
            vec![ContentBlock::tool_use(id, "list_issues", serde_json::json!({}))],
        )
    }

    fn tool_result(id: &str) -> Message {
        Message::with_blocks(Role::User, vec![ContentBlock::tool_result(id, "[]", false)])
    }

    #[test]
    fn test_append_and_replay_survives_reopen() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(".conductor/conversation.db");
        {
            let log = ConversationLog::open(&path).unwrap();
            log.append(&Message::user("plan the sprint")).unwrap();
            log.append(&Message::assistant("Sure.")).unwrap();
        }

        let log = ConversationLog::open(&path).unwrap();
        assert_eq!(log.len().unwrap(), 2);
        let replayed = log.replay(50).unwrap();
        assert_eq!(replayed, vec![Message::user("plan the sprint"), Message::assistant("Sure.")]);
    }

    #[test]
    fn test_replay_is_bounded_and_starts_at_user_turn() {
        let log = ConversationLog::in_memory().unwrap();
        log.append(&Message::user("first")).unwrap();
        log.append(&tool_use("a")).unwrap();
        log.append(&tool_result("a")).unwrap();
        log.append(&Message::assistant("done")).unwrap();
        log.append(&Message::user("second")).unwrap();
        log.append(&Message::assistant("ok")).unwrap();

        // Last four entries start with a tool result, which is trimmed away.
        let replayed = log.replay(4).unwrap();
        assert_eq!(replayed, vec![Message::user("second"), Message::assistant("ok")]);
        assert_eq!(log.replay(6).unwrap().len(), 6);
        assert!(log.replay(0).unwrap().is_empty());
    }

    #[test]
    fn test_replay_drops_unanswered_tool_request() {
        let log = ConversationLog::in_memory().unwrap();
        log.append(&Message::user("merge #3")).unwrap();
        log.append(&tool_use("m")).unwrap();

        assert_eq!(log.replay(10).unwrap(), vec![Message::user("merge #3")]);
    }

    #[test]
    fn test_entry_kind() {
        assert_eq!(EntryKind::of(&tool_result("x")), EntryKind::ToolResult);
        assert_eq!(EntryKind::of(&Message::user("x")), EntryKind::User);
        assert_eq!(EntryKind::of(&tool_use("x")), EntryKind::Assistant);
    }
}
