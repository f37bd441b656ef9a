/*!
 * Repository layer for database operations.
 *
 * This module provides a high-level API for all database operations,
 * abstracting away the SQL details and providing type-safe access.
 * Ownership of a request is decided here: a worker owns a request only
 * after a conditional `UPDATE ... WHERE status = 'pending'` succeeded.
 */

use anyhow::Result;
use log::{debug, info, warn};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashMap;

use super::connection::DatabaseConnection;
use super::models::{
    MediaRecord, MediaState, MediaType, NewTranslationRequest, RequestLogRecord, RequestStatus,
    StatisticsRecord, TranslationRequestRecord,
};
use crate::errors::QueueError;

const REQUEST_COLUMNS: &str = "id, media_id, media_type, title, source_language, target_language, \
     subtitle_path, status, is_priority, is_active, created_at, completed_at, progress, job_id";

const MEDIA_COLUMNS: &str =
    "id, media_type, title, path, is_priority, content_hash, translation_state";

/// Result of inserting a request with deduplication
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// A new row was created
    Created(i64),
    /// An active request for the same tuple already existed
    Existing(i64),
}

impl InsertOutcome {
    /// Id of the request that represents the work
    pub fn id(&self) -> i64 {
        match self {
            InsertOutcome::Created(id) | InsertOutcome::Existing(id) => *id,
        }
    }
}

/// A log line waiting to be persisted
#[derive(Debug, Clone)]
pub struct NewLogEntry {
    /// Log level
    pub level: String,
    /// Message text
    pub message: String,
    /// Optional detail
    pub details: Option<String>,
}

/// Repository for database operations
#[derive(Clone)]
pub struct Repository {
    /// Database connection
    db: DatabaseConnection,
}

impl Repository {
    /// Create a new repository with the given database connection
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Create a repository with the default database location
    pub fn new_default() -> Result<Self> {
        let db = DatabaseConnection::new_default()?;
        Ok(Self::new(db))
    }

    /// Create a repository with an in-memory database (for testing)
    pub fn new_in_memory() -> Result<Self> {
        let db = DatabaseConnection::new_in_memory()?;
        Ok(Self::new(db))
    }

    /// Access the underlying connection wrapper
    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    // =========================================================================
    // Request creation
    // =========================================================================

    /// Insert a request unless an active one exists for the same tuple
    ///
    /// The lookup and insert run in one immediate transaction; the partial
    /// unique index catches anything that still slips through from another
    /// process, in which case the winner's id is returned.
    pub async fn insert_request(&self, request: &NewTranslationRequest) -> Result<InsertOutcome> {
        let request = request.clone();

        self.db
            .transaction_async(move |tx| {
                if let Some(existing) = Self::find_active_sync(tx, &request)? {
                    debug!("Active request {} already covers this tuple", existing);
                    return Ok(InsertOutcome::Existing(existing));
                }

                let now = chrono::Utc::now().to_rfc3339();
                let inserted = tx.execute(
                    r#"
                    INSERT INTO translation_requests (
                        media_id, media_type, title, source_language, target_language,
                        subtitle_path, status, is_priority, is_active, created_at, progress
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7, 1, ?8, 0)
                    "#,
                    params![
                        request.media_id,
                        request.media_type.map(|t| t.to_string()),
                        request.title,
                        request.source_language,
                        request.target_language,
                        request.subtitle_path,
                        request.is_priority,
                        now,
                    ],
                );

                match inserted {
                    Ok(_) => Ok(InsertOutcome::Created(tx.last_insert_rowid())),
                    Err(rusqlite::Error::SqliteFailure(err, _))
                        if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                    {
                        warn!("Uniqueness constraint hit while creating request; reusing winner");
                        Self::find_active_sync(tx, &request)?
                            .map(InsertOutcome::Existing)
                            .ok_or_else(|| anyhow::anyhow!("Constraint violation without active row"))
                    }
                    Err(e) => Err(e.into()),
                }
            })
            .await
    }

    /// Find the active request covering the same media/language tuple
    fn find_active_sync(conn: &Connection, request: &NewTranslationRequest) -> Result<Option<i64>> {
        let id = match (request.media_id, request.media_type) {
            (Some(media_id), Some(media_type)) => conn
                .query_row(
                    r#"
                    SELECT id FROM translation_requests
                    WHERE media_id = ?1 AND media_type = ?2
                      AND source_language = ?3 AND target_language = ?4
                      AND is_active = 1
                    LIMIT 1
                    "#,
                    params![
                        media_id,
                        media_type.to_string(),
                        request.source_language,
                        request.target_language
                    ],
                    |row| row.get(0),
                )
                .optional()?,
            // Ad-hoc content is deduplicated on the subtitle file instead
            _ => conn
                .query_row(
                    r#"
                    SELECT id FROM translation_requests
                    WHERE media_id IS NULL AND subtitle_path IS ?1
                      AND source_language = ?2 AND target_language = ?3
                      AND is_active = 1
                    LIMIT 1
                    "#,
                    params![
                        request.subtitle_path,
                        request.source_language,
                        request.target_language
                    ],
                    |row| row.get(0),
                )
                .optional()?,
        };

        Ok(id)
    }

    // =========================================================================
    // Request queries
    // =========================================================================

    /// Get a request by id
    pub async fn get_request(&self, request_id: i64) -> Result<Option<TranslationRequestRecord>> {
        self.db
            .execute_async(move |conn| Self::get_request_sync(conn, request_id))
            .await
    }

    fn get_request_sync(conn: &Connection, request_id: i64) -> Result<Option<TranslationRequestRecord>> {
        let sql = format!("SELECT {} FROM translation_requests WHERE id = ?1", REQUEST_COLUMNS);
        let record = conn
            .query_row(&sql, [request_id], map_request_row)
            .optional()?;
        Ok(record)
    }

    /// List requests, optionally filtered by status, newest first
    pub async fn list_requests(
        &self,
        status: Option<RequestStatus>,
    ) -> Result<Vec<TranslationRequestRecord>> {
        self.db
            .execute_async(move |conn| {
                let records = match status {
                    Some(status) => {
                        let sql = format!(
                            "SELECT {} FROM translation_requests WHERE status = ?1 ORDER BY created_at DESC, id DESC",
                            REQUEST_COLUMNS
                        );
                        let mut stmt = conn.prepare(&sql)?;
                        let rows = stmt.query_map([status.to_string()], map_request_row)?;
                        rows.collect::<rusqlite::Result<Vec<_>>>()?
                    }
                    None => {
                        let sql = format!(
                            "SELECT {} FROM translation_requests ORDER BY created_at DESC, id DESC",
                            REQUEST_COLUMNS
                        );
                        let mut stmt = conn.prepare(&sql)?;
                        let rows = stmt.query_map([], map_request_row)?;
                        rows.collect::<rusqlite::Result<Vec<_>>>()?
                    }
                };
                Ok(records)
            })
            .await
    }

    /// All requests belonging to a media item
    pub async fn requests_for_media(
        &self,
        media_id: i64,
        media_type: MediaType,
    ) -> Result<Vec<TranslationRequestRecord>> {
        self.db
            .execute_async(move |conn| {
                let sql = format!(
                    "SELECT {} FROM translation_requests WHERE media_id = ?1 AND media_type = ?2 ORDER BY created_at, id",
                    REQUEST_COLUMNS
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params![media_id, media_type.to_string()], map_request_row)?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            })
            .await
    }

    /// Number of queued or running requests
    pub async fn active_request_count(&self) -> Result<i64> {
        self.db
            .execute_async(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM translation_requests WHERE is_active = 1",
                    [],
                    |row| row.get(0),
                )?)
            })
            .await
    }

    // =========================================================================
    // Claiming and recovery
    // =========================================================================

    /// Claim the next pending request for the given job id
    ///
    /// Candidates are ordered by priority then age. When the conditional
    /// update affects no row another worker won the race and selection is
    /// retried, up to `max_attempts` times.
    pub async fn claim_next(
        &self,
        job_id: &str,
        max_attempts: usize,
    ) -> Result<Option<TranslationRequestRecord>> {
        let job_id = job_id.to_string();

        self.db
            .execute_async(move |conn| {
                for attempt in 1..=max_attempts.max(1) {
                    let candidate: Option<i64> = conn
                        .query_row(
                            r#"
                            SELECT id FROM translation_requests
                            WHERE status = 'pending'
                            ORDER BY is_priority DESC, created_at ASC, id ASC
                            LIMIT 1
                            "#,
                            [],
                            |row| row.get(0),
                        )
                        .optional()?;

                    let Some(candidate) = candidate else {
                        return Ok(None);
                    };

                    let claimed = conn.execute(
                        r#"
                        UPDATE translation_requests
                        SET status = 'in_progress', job_id = ?1, is_active = 1
                        WHERE id = ?2 AND status = 'pending'
                        "#,
                        params![job_id, candidate],
                    )?;

                    if claimed == 1 {
                        debug!("Claimed request {} as job {}", candidate, job_id);
                        return Self::get_request_sync(conn, candidate);
                    }

                    debug!(
                        "Request {} was claimed elsewhere (attempt {}), selecting again",
                        candidate, attempt
                    );
                }

                Ok(None)
            })
            .await
    }

    /// Reset requests stranded in progress by a crash back to pending
    pub async fn reset_in_progress_requests(&self) -> Result<usize> {
        let count = self
            .db
            .execute_async(|conn| {
                Ok(conn.execute(
                    r#"
                    UPDATE translation_requests
                    SET status = 'pending', job_id = NULL, progress = 0, is_active = 1
                    WHERE status = 'in_progress'
                    "#,
                    [],
                )?)
            })
            .await?;

        if count > 0 {
            info!("Reset {} in-progress request(s) to pending", count);
        }
        Ok(count)
    }

    /// Hand an abandoned request back to the queue
    pub async fn reset_to_pending(&self, request_id: i64) -> Result<bool> {
        self.db
            .execute_async(move |conn| {
                let changed = conn.execute(
                    r#"
                    UPDATE translation_requests
                    SET status = 'pending', job_id = NULL, progress = 0, is_active = 1
                    WHERE id = ?1 AND status = 'in_progress'
                    "#,
                    [request_id],
                )?;
                Ok(changed == 1)
            })
            .await
    }

    /// Confirm that `job_id` may execute the request
    ///
    /// Moves the request to in-progress under `job_id`. Refuses with
    /// `QueueError::StaleExecution` when the request already reached a
    /// terminal state, and `QueueError::NotFound` when it is gone.
    pub async fn begin_execution(
        &self,
        request_id: i64,
        job_id: &str,
    ) -> Result<TranslationRequestRecord> {
        let job_id = job_id.to_string();

        self.db
            .execute_async(move |conn| {
                let changed = conn.execute(
                    r#"
                    UPDATE translation_requests
                    SET status = 'in_progress', job_id = ?1, is_active = 1
                    WHERE id = ?2 AND status IN ('pending', 'in_progress')
                    "#,
                    params![job_id, request_id],
                )?;

                let record = Self::get_request_sync(conn, request_id)?
                    .ok_or(QueueError::NotFound(request_id))?;

                if changed == 0 {
                    return Err(QueueError::StaleExecution {
                        request_id,
                        status: record.status.to_string(),
                        job_id,
                    }
                    .into());
                }

                Ok(record)
            })
            .await
    }

    /// Move a live request to a terminal status
    ///
    /// Returns `false` when the request had already finished, and
    /// `QueueError::NotFound` when it no longer exists.
    pub async fn finish_request(&self, request_id: i64, status: RequestStatus) -> Result<bool> {
        if !status.is_terminal() {
            return Err(QueueError::InvalidTransition {
                request_id,
                from: "active".to_string(),
                to: status.to_string(),
            }
            .into());
        }

        self.db
            .execute_async(move |conn| {
                let now = chrono::Utc::now().to_rfc3339();
                let changed = conn.execute(
                    r#"
                    UPDATE translation_requests
                    SET status = ?1, is_active = NULL, completed_at = ?2,
                        progress = CASE WHEN ?1 = 'completed' THEN 100 ELSE progress END
                    WHERE id = ?3 AND status IN ('pending', 'in_progress')
                    "#,
                    params![status.to_string(), now, request_id],
                )?;

                if changed == 0 && Self::get_request_sync(conn, request_id)?.is_none() {
                    return Err(QueueError::NotFound(request_id).into());
                }

                Ok(changed == 1)
            })
            .await
    }

    /// Record progress; never lowers the stored value
    pub async fn update_progress(&self, request_id: i64, progress: u8) -> Result<()> {
        let progress = i64::from(progress.min(100));
        self.db
            .execute_async(move |conn| {
                conn.execute(
                    "UPDATE translation_requests SET progress = MAX(progress, ?1) WHERE id = ?2",
                    params![progress, request_id],
                )?;
                Ok(())
            })
            .await
    }

    /// Update the denormalized priority flag of a media item's live requests
    pub async fn update_request_priority(
        &self,
        media_id: i64,
        media_type: MediaType,
        is_priority: bool,
    ) -> Result<usize> {
        self.db
            .execute_async(move |conn| {
                Ok(conn.execute(
                    r#"
                    UPDATE translation_requests SET is_priority = ?1
                    WHERE media_id = ?2 AND media_type = ?3 AND is_active = 1
                    "#,
                    params![is_priority, media_id, media_type.to_string()],
                )?)
            })
            .await
    }

    /// Delete a request and its logs
    pub async fn delete_request(&self, request_id: i64) -> Result<bool> {
        self.db
            .execute_async(move |conn| {
                let deleted =
                    conn.execute("DELETE FROM translation_requests WHERE id = ?1", [request_id])?;
                Ok(deleted == 1)
            })
            .await
    }

    // =========================================================================
    // Request logs
    // =========================================================================

    /// Append log lines to a request's trail
    pub async fn append_logs(&self, request_id: i64, entries: Vec<NewLogEntry>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        self.db
            .transaction_async(move |tx| {
                let now = chrono::Utc::now().to_rfc3339();
                let mut stmt = tx.prepare(
                    r#"
                    INSERT INTO translation_request_logs (request_id, level, message, details, created_at)
                    VALUES (?1, ?2, ?3, ?4, ?5)
                    "#,
                )?;
                for entry in &entries {
                    stmt.execute(params![request_id, entry.level, entry.message, entry.details, now])?;
                }
                Ok(())
            })
            .await
    }

    /// Get the diagnostic trail of a request, oldest first
    pub async fn get_logs(&self, request_id: i64) -> Result<Vec<RequestLogRecord>> {
        self.db
            .execute_async(move |conn| {
                let mut stmt = conn.prepare(
                    r#"
                    SELECT id, request_id, level, message, details, created_at
                    FROM translation_request_logs WHERE request_id = ?1 ORDER BY id
                    "#,
                )?;
                let rows = stmt.query_map([request_id], |row| {
                    Ok(RequestLogRecord {
                        id: row.get(0)?,
                        request_id: row.get(1)?,
                        level: row.get(2)?,
                        message: row.get(3)?,
                        details: row.get(4)?,
                        created_at: row.get(5)?,
                    })
                })?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            })
            .await
    }

    // =========================================================================
    // Settings
    // =========================================================================

    /// Read one setting
    pub async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        self.db
            .execute_async(move |conn| {
                Ok(conn
                    .query_row("SELECT value FROM settings WHERE key = ?1", [key], |row| row.get(0))
                    .optional()?)
            })
            .await
    }

    /// Read several settings; missing keys are absent from the map
    pub async fn get_settings(&self, keys: &[&str]) -> Result<HashMap<String, String>> {
        let keys: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
        self.db
            .execute_async(move |conn| {
                let mut stmt = conn.prepare("SELECT value FROM settings WHERE key = ?1")?;
                let mut values = HashMap::new();
                for key in keys {
                    if let Some(value) = stmt
                        .query_row([&key], |row| row.get::<_, String>(0))
                        .optional()?
                    {
                        values.insert(key, value);
                    }
                }
                Ok(values)
            })
            .await
    }

    /// Write a setting, replacing any previous value
    pub async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let key = key.to_string();
        let value = value.to_string();
        self.db
            .execute_async(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)",
                    params![key, value, chrono::Utc::now().to_rfc3339()],
                )?;
                Ok(())
            })
            .await
    }

    /// Insert defaults without overwriting values that already exist
    pub async fn seed_settings(&self, defaults: HashMap<String, String>) -> Result<usize> {
        self.db
            .transaction_async(move |tx| {
                let now = chrono::Utc::now().to_rfc3339();
                let mut inserted = 0;
                for (key, value) in defaults {
                    inserted += tx.execute(
                        "INSERT OR IGNORE INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)",
                        params![key, value, now],
                    )?;
                }
                Ok(inserted)
            })
            .await
    }

    // =========================================================================
    // Media
    // =========================================================================

    /// Register a media item
    pub async fn insert_media(
        &self,
        media_type: MediaType,
        title: &str,
        path: &str,
        is_priority: bool,
    ) -> Result<i64> {
        let title = title.to_string();
        let path = path.to_string();
        self.db
            .execute_async(move |conn| {
                conn.execute(
                    r#"
                    INSERT INTO media (media_type, title, path, is_priority, translation_state)
                    VALUES (?1, ?2, ?3, ?4, 'not_started')
                    "#,
                    params![media_type.to_string(), title, path, is_priority],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await
    }

    /// Get a media item
    pub async fn get_media(&self, media_id: i64, media_type: MediaType) -> Result<Option<MediaRecord>> {
        self.db
            .execute_async(move |conn| {
                let sql = format!("SELECT {} FROM media WHERE id = ?1 AND media_type = ?2", MEDIA_COLUMNS);
                Ok(conn
                    .query_row(&sql, params![media_id, media_type.to_string()], map_media_row)
                    .optional()?)
            })
            .await
    }

    /// List all media items
    pub async fn list_media(&self) -> Result<Vec<MediaRecord>> {
        self.db
            .execute_async(|conn| {
                let sql = format!("SELECT {} FROM media ORDER BY id", MEDIA_COLUMNS);
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map([], map_media_row)?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            })
            .await
    }

    /// Change a media item's priority flag
    pub async fn set_media_priority(
        &self,
        media_id: i64,
        media_type: MediaType,
        is_priority: bool,
    ) -> Result<bool> {
        self.db
            .execute_async(move |conn| {
                let changed = conn.execute(
                    "UPDATE media SET is_priority = ?1 WHERE id = ?2 AND media_type = ?3",
                    params![is_priority, media_id, media_type.to_string()],
                )?;
                Ok(changed == 1)
            })
            .await
    }

    /// Store or clear the cached content hash of a media item
    pub async fn set_content_hash(
        &self,
        media_id: i64,
        media_type: MediaType,
        hash: Option<String>,
    ) -> Result<()> {
        self.db
            .execute_async(move |conn| {
                conn.execute(
                    "UPDATE media SET content_hash = ?1 WHERE id = ?2 AND media_type = ?3",
                    params![hash, media_id, media_type.to_string()],
                )?;
                Ok(())
            })
            .await
    }

    /// Persist the denormalized translation state of a media item
    pub async fn set_media_state(
        &self,
        media_id: i64,
        media_type: MediaType,
        state: MediaState,
    ) -> Result<()> {
        self.db
            .execute_async(move |conn| {
                conn.execute(
                    "UPDATE media SET translation_state = ?1 WHERE id = ?2 AND media_type = ?3",
                    params![state.to_string(), media_id, media_type.to_string()],
                )?;
                Ok(())
            })
            .await
    }

    // =========================================================================
    // Statistics
    // =========================================================================

    /// Add one completed job to the totals
    pub async fn record_statistics(
        &self,
        target_language: &str,
        lines: i64,
        characters: i64,
    ) -> Result<()> {
        let target_language = target_language.to_string();
        self.db
            .transaction_async(move |tx| {
                tx.execute(
                    r#"
                    INSERT INTO statistics (id, total_files, total_lines, total_characters, updated_at)
                    VALUES (1, 1, ?1, ?2, ?3)
                    ON CONFLICT(id) DO UPDATE SET
                        total_files = total_files + 1,
                        total_lines = total_lines + excluded.total_lines,
                        total_characters = total_characters + excluded.total_characters,
                        updated_at = excluded.updated_at
                    "#,
                    params![lines, characters, chrono::Utc::now().to_rfc3339()],
                )?;
                tx.execute(
                    r#"
                    INSERT INTO language_statistics (target_language, total_files, total_lines)
                    VALUES (?1, 1, ?2)
                    ON CONFLICT(target_language) DO UPDATE SET
                        total_files = total_files + 1,
                        total_lines = total_lines + excluded.total_lines
                    "#,
                    params![target_language, lines],
                )?;
                Ok(())
            })
            .await
    }

    /// Read the totals
    pub async fn get_statistics(&self) -> Result<StatisticsRecord> {
        self.db
            .execute_async(|conn| {
                let stats = conn
                    .query_row(
                        "SELECT total_files, total_lines, total_characters FROM statistics WHERE id = 1",
                        [],
                        |row| {
                            Ok(StatisticsRecord {
                                total_files: row.get(0)?,
                                total_lines: row.get(1)?,
                                total_characters: row.get(2)?,
                            })
                        },
                    )
                    .optional()?;
                Ok(stats.unwrap_or_default())
            })
            .await
    }

    /// Lines translated per target language
    pub async fn language_statistics(&self) -> Result<HashMap<String, i64>> {
        self.db
            .execute_async(|conn| {
                let mut stmt =
                    conn.prepare("SELECT target_language, total_lines FROM language_statistics")?;
                let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
                Ok(rows.collect::<rusqlite::Result<HashMap<String, i64>>>()?)
            })
            .await
    }
}

fn map_request_row(row: &Row<'_>) -> rusqlite::Result<TranslationRequestRecord> {
    Ok(TranslationRequestRecord {
        id: row.get(0)?,
        media_id: row.get(1)?,
        media_type: row
            .get::<_, Option<String>>(2)?
            .and_then(|s| s.parse().ok()),
        title: row.get(3)?,
        source_language: row.get(4)?,
        target_language: row.get(5)?,
        subtitle_path: row.get(6)?,
        status: row
            .get::<_, String>(7)?
            .parse()
            .unwrap_or(RequestStatus::Failed),
        is_priority: row.get(8)?,
        is_active: row.get(9)?,
        created_at: row.get(10)?,
        completed_at: row.get(11)?,
        progress: row.get(12)?,
        job_id: row.get(13)?,
    })
}

fn map_media_row(row: &Row<'_>) -> rusqlite::Result<MediaRecord> {
    Ok(MediaRecord {
        id: row.get(0)?,
        media_type: row
            .get::<_, String>(1)?
            .parse()
            .unwrap_or(MediaType::Movie),
        title: row.get(2)?,
        path: row.get(3)?,
        is_priority: row.get(4)?,
        content_hash: row.get(5)?,
        translation_state: row
            .get::<_, String>(6)?
            .parse()
            .unwrap_or(MediaState::NotStarted),
    })
}
