use super::schema::{FileOutcome, FileRecord, FileStatus, RegisterOutcome, Registration};
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("failed to create ledger directory {path}: {source}")]
    CreateDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("ledger database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("file record `{0}` not found")]
    UnknownFile(String),
    #[error("corrupt ledger row `{id}`: {reason}")]
    Corrupt { id: String, reason: String },
}

/// SQLite-backed ledger of case files, their checksums and processing status.
#[derive(Clone)]
pub struct ChangeTracker {
    conn: Arc<Mutex<Connection>>,
}

const SELECT_COLUMNS: &str =
    "SELECT id, case_id, filename, checksum, status, created_at, processed_at, error FROM files";

impl ChangeTracker {
    pub fn open(db_path: &Path) -> Result<Self, TrackerError> {
        if let Some(dir) = db_path.parent() {
            std::fs::create_dir_all(dir).map_err(|source| TrackerError::CreateDir {
                path: dir.display().to_string(),
                source,
            })?;
        }
        let conn = Connection::open(db_path)?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous  = NORMAL;
             PRAGMA cache_size   = -2000;
             PRAGMA temp_store   = MEMORY;",
        )?;

        Self::init_schema(&conn)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    fn init_schema(conn: &Connection) -> Result<(), TrackerError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS files (
                id            TEXT PRIMARY KEY,
                case_id       TEXT NOT NULL,
                filename      TEXT NOT NULL,
                checksum      TEXT NOT NULL,
                status        TEXT NOT NULL,
                created_at    TEXT NOT NULL,
                processed_at  TEXT,
                error         TEXT,
                UNIQUE (case_id, filename)
            );

            CREATE INDEX IF NOT EXISTS idx_files_case_status ON files(case_id, status);",
        )?;
        Ok(())
    }

    /// Record a scanned file. New files and files whose checksum changed end up NEW;
    /// unchanged files keep whatever status they had.
    pub fn register_or_update(
        &self,
        case_id: &str,
        filename: &str,
        checksum: &str,
    ) -> Result<Registration, TrackerError> {
        let conn = self.conn.lock();
        let existing: Option<(String, String)> = conn
            .query_row(
                "SELECT id, checksum FROM files WHERE case_id = ?1 AND filename = ?2",
                params![case_id, filename],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let (file_id, outcome) = match existing {
            None => {
                let id = Uuid::new_v4().to_string();
                conn.execute(
                    "INSERT INTO files (id, case_id, filename, checksum, status, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        id,
                        case_id,
                        filename,
                        checksum,
                        FileStatus::New.as_str(),
                        now()
                    ],
                )?;
                (id, RegisterOutcome::Inserted)
            }
            Some((id, stored)) if stored != checksum => {
                conn.execute(
                    "UPDATE files SET checksum = ?1, status = ?2, processed_at = NULL, error = NULL
                     WHERE id = ?3",
                    params![checksum, FileStatus::New.as_str(), id],
                )?;
                (id, RegisterOutcome::Reset)
            }
            Some((id, _)) => (id, RegisterOutcome::Unchanged),
        };

        Ok(Registration {
            file_id,
            filename: filename.to_string(),
            outcome,
        })
    }

    /// Files of a case still waiting to be processed, oldest first.
    pub fn list_pending(&self, case_id: &str) -> Result<Vec<FileRecord>, TrackerError> {
        self.query(
            &format!(
                "{SELECT_COLUMNS} WHERE case_id = ?1 AND status = ?2 ORDER BY created_at, filename"
            ),
            params![case_id, FileStatus::New.as_str()],
        )
    }

    /// Stamp the result of a processing attempt.
    pub fn mark_outcome(&self, file_id: &str, outcome: &FileOutcome) -> Result<(), TrackerError> {
        let error = match outcome {
            FileOutcome::Processed => None,
            FileOutcome::Error(message) => Some(message.as_str()),
        };
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE files SET status = ?1, processed_at = ?2, error = ?3 WHERE id = ?4",
            params![outcome.status().as_str(), now(), error, file_id],
        )?;
        if updated == 0 {
            return Err(TrackerError::UnknownFile(file_id.to_string()));
        }
        Ok(())
    }

    /// Put every ERROR file of a case back in the queue.
    pub fn requeue_failed(&self, case_id: &str) -> Result<usize, TrackerError> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE files SET status = ?1, processed_at = NULL, error = NULL
             WHERE case_id = ?2 AND status = ?3",
            params![FileStatus::New.as_str(), case_id, FileStatus::Error.as_str()],
        )?;
        Ok(updated)
    }

    pub fn get(&self, file_id: &str) -> Result<Option<FileRecord>, TrackerError> {
        let mut rows = self.query(&format!("{SELECT_COLUMNS} WHERE id = ?1"), params![file_id])?;
        Ok(rows.pop())
    }

    pub fn find(&self, case_id: &str, filename: &str) -> Result<Option<FileRecord>, TrackerError> {
        let mut rows = self.query(
            &format!("{SELECT_COLUMNS} WHERE case_id = ?1 AND filename = ?2"),
            params![case_id, filename],
        )?;
        Ok(rows.pop())
    }

    /// All records, optionally restricted to one case.
    pub fn list(&self, case_id: Option<&str>) -> Result<Vec<FileRecord>, TrackerError> {
        match case_id {
            Some(case_id) => self.query(
                &format!("{SELECT_COLUMNS} WHERE case_id = ?1 ORDER BY case_id, filename"),
                params![case_id],
            ),
            None => self.query(&format!("{SELECT_COLUMNS} ORDER BY case_id, filename"), params![]),
        }
    }

    pub fn count(&self) -> Result<usize, TrackerError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM files", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn query<P: rusqlite::Params>(
        &self,
        sql: &str,
        params: P,
    ) -> Result<Vec<FileRecord>, TrackerError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, |row| {
            Ok(RawRow {
                id: row.get(0)?,
                case_id: row.get(1)?,
                filename: row.get(2)?,
                checksum: row.get(3)?,
                status: row.get(4)?,
                created_at: row.get(5)?,
                processed_at: row.get(6)?,
                error: row.get(7)?,
            })
        })?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?.into_record()?);
        }
        Ok(records)
    }
}

struct RawRow {
    id: String,
    case_id: String,
    filename: String,
    checksum: String,
    status: String,
    created_at: String,
    processed_at: Option<String>,
    error: Option<String>,
}

impl RawRow {
    fn into_record(self) -> Result<FileRecord, TrackerError> {
        let corrupt = |reason: String| TrackerError::Corrupt {
            id: self.id.clone(),
            reason,
        };
        let status = self.status.parse::<FileStatus>().map_err(corrupt)?;
        let created_at = parse_timestamp(&self.created_at).map_err(corrupt)?;
        let processed_at = match self.processed_at.as_deref() {
            Some(ts) => Some(parse_timestamp(ts).map_err(corrupt)?),
            None => None,
        };
        Ok(FileRecord {
            id: self.id,
            case_id: self.case_id,
            filename: self.filename,
            checksum: self.checksum,
            status,
            created_at,
            processed_at,
            error: self.error,
        })
    }
}

/// Fixed-width UTC timestamp, so text order matches time order.
fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(ts: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(ts)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| format!("bad timestamp `{ts}`: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tracker() -> (TempDir, ChangeTracker) {
        let dir = TempDir::new().unwrap();
        let tracker = ChangeTracker::open(&dir.path().join("ledger").join("files.db")).unwrap();
        (dir, tracker)
    }

    #[test]
    fn first_sighting_is_pending() {
        let (_dir, tracker) = tracker();
        let reg = tracker.register_or_update("LIC-001", "bases.pdf", "aaa").unwrap();
        assert_eq!(reg.outcome, RegisterOutcome::Inserted);

        let pending = tracker.list_pending("LIC-001").unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, reg.file_id);
        assert_eq!(pending[0].status, FileStatus::New);
        assert!(pending[0].processed_at.is_none());
        assert!(tracker.list_pending("LIC-002").unwrap().is_empty());
    }

    #[test]
    fn unchanged_checksum_is_not_pending_again() {
        let (_dir, tracker) = tracker();
        let reg = tracker.register_or_update("LIC-001", "bases.pdf", "aaa").unwrap();
        tracker.mark_outcome(&reg.file_id, &FileOutcome::Processed).unwrap();

        let again = tracker.register_or_update("LIC-001", "bases.pdf", "aaa").unwrap();
        assert_eq!(again.outcome, RegisterOutcome::Unchanged);
        assert_eq!(again.file_id, reg.file_id);
        assert!(tracker.list_pending("LIC-001").unwrap().is_empty());
        assert_eq!(tracker.count().unwrap(), 1);
    }

    #[test]
    fn changed_checksum_resets_any_prior_status() {
        let (_dir, tracker) = tracker();
        let ok = tracker.register_or_update("LIC-001", "a.pdf", "1").unwrap();
        let bad = tracker.register_or_update("LIC-001", "b.pdf", "1").unwrap();
        tracker.mark_outcome(&ok.file_id, &FileOutcome::Processed).unwrap();
        tracker
            .mark_outcome(&bad.file_id, &FileOutcome::Error("boom".into()))
            .unwrap();

        assert_eq!(
            tracker.register_or_update("LIC-001", "a.pdf", "2").unwrap().outcome,
            RegisterOutcome::Reset
        );
        assert_eq!(
            tracker.register_or_update("LIC-001", "b.pdf", "2").unwrap().outcome,
            RegisterOutcome::Reset
        );

        let pending = tracker.list_pending("LIC-001").unwrap();
        assert_eq!(pending.len(), 2);
        for record in pending {
            assert_eq!(record.status, FileStatus::New);
            assert_eq!(record.checksum, "2");
            assert!(record.error.is_none());
            assert!(record.processed_at.is_none());
        }
    }

    #[test]
    fn outcome_stamps_status_and_error() {
        let (_dir, tracker) = tracker();
        let reg = tracker.register_or_update("LIC-001", "a.pdf", "1").unwrap();
        tracker
            .mark_outcome(&reg.file_id, &FileOutcome::Error("vision down".into()))
            .unwrap();

        let record = tracker.get(&reg.file_id).unwrap().unwrap();
        assert_eq!(record.status, FileStatus::Error);
        assert_eq!(record.error.as_deref(), Some("vision down"));
        assert!(record.processed_at.is_some());

        let err = tracker.mark_outcome("missing", &FileOutcome::Processed).unwrap_err();
        assert!(matches!(err, TrackerError::UnknownFile(_)));
    }

    #[test]
    fn requeue_only_touches_failed_files() {
        let (_dir, tracker) = tracker();
        let ok = tracker.register_or_update("LIC-001", "a.pdf", "1").unwrap();
        let bad = tracker.register_or_update("LIC-001", "b.pdf", "1").unwrap();
        tracker.mark_outcome(&ok.file_id, &FileOutcome::Processed).unwrap();
        tracker
            .mark_outcome(&bad.file_id, &FileOutcome::Error("x".into()))
            .unwrap();

        assert_eq!(tracker.requeue_failed("LIC-001").unwrap(), 1);
        let pending = tracker.list_pending("LIC-001").unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].filename, "b.pdf");
        assert_eq!(
            tracker.find("LIC-001", "a.pdf").unwrap().unwrap().status,
            FileStatus::Processed
        );
    }
}
