use std::collections::HashSet;
use std::fmt;
use std::sync::Mutex;
use rusqlite::{params, Connection};
use uuid::Uuid;

/// Rating a participant starts with when their handle is linked.
pub const DEFAULT_RATING: i64 = 1500;

#[derive(Debug)]
pub enum StoreError {
    DatabaseError(String),
    SerializationError(String),
    UserNotFound,
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StoreError::DatabaseError(msg) => write!(f, "Database error: {}", msg),
            StoreError::SerializationError(msg) => write!(f, "Serialization error: {}", msg),
            StoreError::UserNotFound => write!(f, "User not found"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::DatabaseError(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::SerializationError(err.to_string())
    }
}

/// Reads and writes participant rating records.
pub trait RatingStore: Send + Sync {
    fn rating(&self, server_id: Uuid, participant_id: Uuid) -> Result<i64, StoreError>;

    /// Problems the participant has already been challenged on.
    fn solved_history(&self, server_id: Uuid, participant_id: Uuid) -> Result<HashSet<String>, StoreError>;

    /// Atomically appends `new_rating` to the rating history, makes it the
    /// current rating, and records the problem — all in one transaction.
    fn apply_rating_update(
        &self,
        server_id: Uuid,
        participant_id: Uuid,
        new_rating: i64,
        problem_id: &str,
    ) -> Result<(), StoreError>;
}

/// Resolves a chat participant to their judge handle.
pub trait IdentityResolver: Send + Sync {
    fn linked_handle(&self, server_id: Uuid, participant_id: Uuid) -> Result<Option<String>, StoreError>;
}

/// SQLite-backed persistence for participant records.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a SQLite database at the given path.
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS users (
                server_id TEXT NOT NULL,
                participant_id TEXT NOT NULL,
                handle TEXT NOT NULL,
                rating INTEGER NOT NULL,
                rating_history TEXT NOT NULL,
                solved_history TEXT NOT NULL,
                PRIMARY KEY (server_id, participant_id)
            );",
        )?;
        Ok(SqliteStore {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::open(":memory:")
    }

    /// Registration boundary: link a judge handle for a participant, creating
    /// their record with the default rating if needed.
    pub fn link_handle(&self, server_id: Uuid, participant_id: Uuid, handle: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO users (server_id, participant_id, handle, rating, rating_history, solved_history)
             VALUES (?1, ?2, ?3, ?4, '[]', '[]')
             ON CONFLICT (server_id, participant_id) DO UPDATE SET handle = excluded.handle",
            params![server_id.to_string(), participant_id.to_string(), handle, DEFAULT_RATING],
        )?;
        log::info!("linked handle {} for participant {}", handle, participant_id);
        Ok(())
    }

    /// Every rating the participant has held, oldest first.
    pub fn rating_history(&self, server_id: Uuid, participant_id: Uuid) -> Result<Vec<i64>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let json: String = conn
            .query_row(
                "SELECT rating_history FROM users WHERE server_id = ?1 AND participant_id = ?2",
                params![server_id.to_string(), participant_id.to_string()],
                |row| row.get(0),
            )
            .map_err(not_found)?;
        Ok(serde_json::from_str(&json)?)
    }
}

fn not_found(err: rusqlite::Error) -> StoreError {
    if matches!(err, rusqlite::Error::QueryReturnedNoRows) {
        StoreError::UserNotFound
    } else {
        StoreError::from(err)
    }
}

impl RatingStore for SqliteStore {
    fn rating(&self, server_id: Uuid, participant_id: Uuid) -> Result<i64, StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT rating FROM users WHERE server_id = ?1 AND participant_id = ?2",
            params![server_id.to_string(), participant_id.to_string()],
            |row| row.get(0),
        )
        .map_err(not_found)
    }

    fn solved_history(&self, server_id: Uuid, participant_id: Uuid) -> Result<HashSet<String>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let json: String = conn
            .query_row(
                "SELECT solved_history FROM users WHERE server_id = ?1 AND participant_id = ?2",
                params![server_id.to_string(), participant_id.to_string()],
                |row| row.get(0),
            )
            .map_err(not_found)?;
        let problems: Vec<String> = serde_json::from_str(&json)?;
        Ok(problems.into_iter().collect())
    }

    fn apply_rating_update(
        &self,
        server_id: Uuid,
        participant_id: Uuid,
        new_rating: i64,
        problem_id: &str,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let (rating_json, solved_json): (String, String) = tx
            .query_row(
                "SELECT rating_history, solved_history FROM users
                 WHERE server_id = ?1 AND participant_id = ?2",
                params![server_id.to_string(), participant_id.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(not_found)?;

        let mut rating_history: Vec<i64> = serde_json::from_str(&rating_json)?;
        let mut solved_history: Vec<String> = serde_json::from_str(&solved_json)?;
        rating_history.push(new_rating);
        solved_history.push(problem_id.to_string());

        tx.execute(
            "UPDATE users SET rating = ?3, rating_history = ?4, solved_history = ?5
             WHERE server_id = ?1 AND participant_id = ?2",
            params![
                server_id.to_string(),
                participant_id.to_string(),
                new_rating,
                serde_json::to_string(&rating_history)?,
                serde_json::to_string(&solved_history)?,
            ],
        )?;
        tx.commit()?;

        log::debug!(
            "rating update applied for participant {}: {} ({})",
            participant_id,
            new_rating,
            problem_id
        );
        Ok(())
    }
}

impl IdentityResolver for SqliteStore {
    fn linked_handle(&self, server_id: Uuid, participant_id: Uuid) -> Result<Option<String>, StoreError> {
        let conn = self.conn.lock().unwrap();
        match conn.query_row(
            "SELECT handle FROM users WHERE server_id = ?1 AND participant_id = ?2",
            params![server_id.to_string(), participant_id.to_string()],
            |row| row.get(0),
        ) {
            Ok(handle) => Ok(Some(handle)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(err) => Err(StoreError::from(err)),
        }
    }
}
