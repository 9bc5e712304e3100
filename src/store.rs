//! Durable, single-writer store for one node: Raft metadata, the replicated
//! log, and the materialized user/message tables.
//!
//! One long-lived SQLite connection per node. Every write that Raft needs
//! before answering an RPC goes through here and is synced before the call
//! returns; an applied entry's row changes and the `last_applied` bump commit
//! in a single transaction.

use crate::{Command, LogEntry};
use anyhow::{bail, Context, Result};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const META_CURRENT_TERM: &str = "current_term";
pub const META_VOTED_FOR: &str = "voted_for";
pub const META_COMMIT_INDEX: &str = "commit_index";
pub const META_LAST_APPLIED: &str = "last_applied";

/// Per-user replicated data that has no column of its own.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct UserData {
    /// Unread message ids, ascending.
    pub unread: Vec<u32>,
    /// Conversation partners, most recent first, deduplicated.
    pub recent_conversants: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UserRow {
    pub id: u32,
    pub username: String,
    pub password_hash: [u8; 32],
    pub data: UserData,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageRow {
    pub id: u32,
    pub sender: u32,
    pub receiver: u32,
    pub content: String,
    pub read: bool,
    pub ts: i64,
}

/// Row changes produced by applying one committed command.
#[derive(Debug, Default)]
pub struct ApplyEffects {
    pub upsert_users: Vec<UserRow>,
    pub delete_users: Vec<u32>,
    pub upsert_messages: Vec<MessageRow>,
    pub delete_messages: Vec<u32>,
}

pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) the node's database under `data_dir`.
    pub fn open(data_dir: &Path) -> Result<Store> {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("creating data dir '{}'", data_dir.display()))?;
        let db_path = data_dir.join("chat.db");
        let conn = Connection::open(&db_path)
            .with_context(|| format!("opening database '{}'", db_path.display()))?;

        // WAL keeps readers cheap; FULL sync is the durability contract.
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;
        conn.execute_batch("PRAGMA synchronous=FULL;")?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS raft_meta (
                 key   TEXT PRIMARY KEY,
                 value TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS log (
                 idx     INTEGER PRIMARY KEY,
                 term    INTEGER NOT NULL,
                 command BLOB NOT NULL
             );
             CREATE TABLE IF NOT EXISTS users (
                 id            INTEGER PRIMARY KEY,
                 username      TEXT NOT NULL,
                 password_hash BLOB NOT NULL,
                 data          BLOB NOT NULL
             );
             CREATE TABLE IF NOT EXISTS messages (
                 id       INTEGER PRIMARY KEY,
                 sender   INTEGER NOT NULL,
                 receiver INTEGER NOT NULL,
                 content  TEXT NOT NULL,
                 read     INTEGER NOT NULL,
                 ts       INTEGER NOT NULL
             );",
        )?;

        Ok(Store { conn })
    }

    // --- Raft metadata ---

    pub fn put_meta(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO raft_meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn get_meta(&self, key: &str) -> Result<Option<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT value FROM raft_meta WHERE key = ?1")?;
        let mut rows = stmt.query(params![key])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    pub fn get_meta_i64(&self, key: &str) -> Result<Option<i64>> {
        match self.get_meta(key)? {
            Some(v) => Ok(Some(
                v.parse()
                    .with_context(|| format!("meta key '{}' holds non-numeric '{}'", key, v))?,
            )),
            None => Ok(None),
        }
    }

    /// Persist term and vote together; Raft never changes one without
    /// rereading the other.
    pub fn put_term_and_vote(&mut self, term: u64, voted_for: Option<&str>) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO raft_meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![META_CURRENT_TERM, term.to_string()],
        )?;
        tx.execute(
            "INSERT INTO raft_meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![META_VOTED_FOR, voted_for.unwrap_or("")],
        )?;
        tx.commit()?;
        Ok(())
    }

    // --- Replicated log ---

    pub fn append_log(&self, index: i64, term: u64, command: &Command) -> Result<()> {
        let blob = bincode::serialize(command)?;
        self.conn.execute(
            "INSERT OR REPLACE INTO log (idx, term, command) VALUES (?1, ?2, ?3)",
            params![index, term as i64, blob],
        )?;
        Ok(())
    }

    /// Append a run of entries starting at `first_index`, atomically.
    pub fn append_log_batch(&mut self, first_index: i64, entries: &[LogEntry]) -> Result<()> {
        let tx = self.conn.transaction()?;
        for (k, entry) in entries.iter().enumerate() {
            let blob = bincode::serialize(&entry.command)?;
            tx.execute(
                "INSERT OR REPLACE INTO log (idx, term, command) VALUES (?1, ?2, ?3)",
                params![first_index + k as i64, entry.term as i64, blob],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Drop every entry at `from_index` and above.
    pub fn truncate_log(&self, from_index: i64) -> Result<()> {
        self.conn
            .execute("DELETE FROM log WHERE idx >= ?1", params![from_index])?;
        Ok(())
    }

    /// The whole log, ordered and dense from index 0.
    pub fn scan_log(&self) -> Result<Vec<LogEntry>> {
        let mut stmt = self
            .conn
            .prepare("SELECT idx, term, command FROM log ORDER BY idx")?;
        let mut rows = stmt.query([])?;
        let mut log = Vec::new();
        while let Some(row) = rows.next()? {
            let idx: i64 = row.get(0)?;
            if idx != log.len() as i64 {
                bail!("log table has a hole at index {}", log.len());
            }
            let term: i64 = row.get(1)?;
            let blob: Vec<u8> = row.get(2)?;
            let command: Command =
                bincode::deserialize(&blob).context("decoding log command blob")?;
            log.push(LogEntry {
                term: term as u64,
                command,
            });
        }
        Ok(log)
    }

    // --- Materialized state-machine tables ---

    pub fn upsert_user(&self, row: &UserRow) -> Result<()> {
        upsert_user_inner(&self.conn, row)
    }

    pub fn delete_user(&self, id: u32) -> Result<()> {
        self.conn
            .execute("DELETE FROM users WHERE id = ?1", params![id])?;
        Ok(())
    }

    pub fn scan_users(&self) -> Result<Vec<UserRow>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, username, password_hash, data FROM users ORDER BY id")?;
        let mut rows = stmt.query([])?;
        let mut users = Vec::new();
        while let Some(row) = rows.next()? {
            let id: i64 = row.get(0)?;
            let username: String = row.get(1)?;
            let hash: Vec<u8> = row.get(2)?;
            let data: Vec<u8> = row.get(3)?;
            users.push(UserRow {
                id: id as u32,
                username,
                password_hash: hash
                    .try_into()
                    .map_err(|_| anyhow::anyhow!("user row has a non-32-byte password hash"))?,
                data: bincode::deserialize(&data).context("decoding user data blob")?,
            });
        }
        Ok(users)
    }

    pub fn upsert_message(&self, row: &MessageRow) -> Result<()> {
        upsert_message_inner(&self.conn, row)
    }

    pub fn delete_message(&self, id: u32) -> Result<()> {
        self.conn
            .execute("DELETE FROM messages WHERE id = ?1", params![id])?;
        Ok(())
    }

    pub fn scan_messages(&self) -> Result<Vec<MessageRow>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, sender, receiver, content, read, ts FROM messages ORDER BY id")?;
        let mut rows = stmt.query([])?;
        let mut messages = Vec::new();
        while let Some(row) = rows.next()? {
            let id: i64 = row.get(0)?;
            let sender: i64 = row.get(1)?;
            let receiver: i64 = row.get(2)?;
            messages.push(MessageRow {
                id: id as u32,
                sender: sender as u32,
                receiver: receiver as u32,
                content: row.get(3)?,
                read: row.get::<_, i64>(4)? != 0,
                ts: row.get(5)?,
            });
        }
        Ok(messages)
    }

    /// Commit one applied entry: all its row changes plus the new
    /// `last_applied`, in a single transaction.
    pub fn apply_entry(&mut self, last_applied: i64, effects: &ApplyEffects) -> Result<()> {
        let tx = self.conn.transaction()?;
        for row in &effects.upsert_users {
            upsert_user_inner(&tx, row)?;
        }
        for id in &effects.delete_users {
            tx.execute("DELETE FROM users WHERE id = ?1", params![id])?;
        }
        for row in &effects.upsert_messages {
            upsert_message_inner(&tx, row)?;
        }
        for id in &effects.delete_messages {
            tx.execute("DELETE FROM messages WHERE id = ?1", params![id])?;
        }
        tx.execute(
            "INSERT INTO raft_meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![META_LAST_APPLIED, last_applied.to_string()],
        )?;
        tx.commit()?;
        Ok(())
    }
}

fn upsert_user_inner(conn: &Connection, row: &UserRow) -> Result<()> {
    let data = bincode::serialize(&row.data)?;
    conn.execute(
        "INSERT OR REPLACE INTO users (id, username, password_hash, data)
         VALUES (?1, ?2, ?3, ?4)",
        params![row.id, row.username, row.password_hash.to_vec(), data],
    )?;
    Ok(())
}

fn upsert_message_inner(conn: &Connection, row: &MessageRow) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO messages (id, sender, receiver, content, read, ts)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            row.id,
            row.sender,
            row.receiver,
            row.content,
            row.read as i64,
            row.ts
        ],
    )?;
    Ok(())
}
