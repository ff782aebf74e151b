#![allow(clippy::missing_errors_doc)]

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, ErrorCode, OpenFlags, OptionalExtension};
use session_diffs_core::{
    encode_files_changed, format_rfc3339, normalize, now_utc, parse_timestamp,
    summarize_session, validate_session_id, DiffError, ExecutionDiffInput, ExecutionDiffRecord,
    RawExecutionDiffRecord, SessionDiffSummary,
};
use ulid::Ulid;

const DIFF_MIGRATION_VERSION: i64 = 1;

pub const INIT_HINT: &str = "initialize the store with `sdiff store init` before querying";
const OPEN_HINT: &str =
    "check that the database path exists and is readable, or initialize it with `sdiff store init`";
const CORRUPT_HINT: &str =
    "execution_diffs holds rows outside the expected schema; restore the database from a backup or re-initialize it";

const SCHEMA_DIFFS_V1: &str = r"
CREATE TABLE IF NOT EXISTS sessions (
  session_id TEXT PRIMARY KEY,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS execution_diffs (
  id TEXT PRIMARY KEY,
  session_id TEXT NOT NULL,
  prompt_marker_id TEXT,
  execution_sequence INTEGER NOT NULL CHECK (execution_sequence >= 0),
  git_diff TEXT,
  files_changed TEXT,
  stats_additions INTEGER NOT NULL DEFAULT 0 CHECK (stats_additions >= 0),
  stats_deletions INTEGER NOT NULL DEFAULT 0 CHECK (stats_deletions >= 0),
  stats_files_changed INTEGER NOT NULL DEFAULT 0 CHECK (stats_files_changed >= 0),
  before_commit_hash TEXT,
  after_commit_hash TEXT,
  timestamp TEXT NOT NULL,
  UNIQUE (session_id, execution_sequence),
  FOREIGN KEY (session_id) REFERENCES sessions(session_id)
);

CREATE TRIGGER IF NOT EXISTS trg_execution_diffs_no_update
BEFORE UPDATE ON execution_diffs
BEGIN
  SELECT RAISE(FAIL, 'execution_diffs is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_execution_diffs_no_delete
BEFORE DELETE ON execution_diffs
BEGIN
  SELECT RAISE(FAIL, 'execution_diffs is append-only');
END;
";

const SELECT_DIFF_COLUMNS: &str = "SELECT
    id, session_id, prompt_marker_id, execution_sequence, git_diff, files_changed,
    stats_additions, stats_deletions, stats_files_changed,
    before_commit_hash, after_commit_hash, timestamp
 FROM execution_diffs";

/// What to do with a record whose `files_changed` column fails to decode.
#[derive(Debug, Clone, Copy, Default, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MalformedPolicy {
    /// Fail the whole batch with [`DiffError::MalformedEncoding`].
    #[default]
    Abort,
    /// Leave the record out and report it in [`SessionDiffs::skipped`].
    Skip,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct SkippedRecord {
    pub record_id: String,
    pub execution_sequence: u32,
    pub detail: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct SessionDiffs {
    pub session_id: String,
    pub records: Vec<ExecutionDiffRecord>,
    pub skipped: Vec<SkippedRecord>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct SessionOverview {
    pub session_id: String,
    pub record_count: usize,
    pub last_execution_sequence: Option<u32>,
}

pub struct SqliteDiffStore {
    conn: Connection,
    path: PathBuf,
    read_only: bool,
}

impl SqliteDiffStore {
    /// Opens (creating if needed) a writable store.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        tracing::debug!(path = %path.display(), "opened execution diff store");
        Ok(Self {
            conn,
            path: path.to_path_buf(),
            read_only: false,
        })
    }

    /// Opens an existing store for reading only. Never creates the file.
    pub fn open_read_only(path: &Path) -> Result<Self, DiffError> {
        if !path.exists() {
            return Err(DiffError::storage_unavailable(
                format!("database file {} does not exist", path.display()),
                INIT_HINT,
            ));
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|err| {
            DiffError::storage_unavailable(
                format!("failed to open {} read-only: {err}", path.display()),
                OPEN_HINT,
            )
        })?;

        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(|err| query_unavailable(&err))?;

        tracing::debug!(path = %path.display(), "opened execution diff store read-only");
        Ok(Self {
            conn,
            path: path.to_path_buf(),
            read_only: true,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn migrate(&self) -> Result<()> {
        self.ensure_writable()?;

        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_DIFFS_V1)
            .context("failed to apply execution_diffs schema")?;

        let now = format_rfc3339(now_utc())?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![DIFF_MIGRATION_VERSION, now],
            )
            .context("failed to register execution_diffs schema migration")?;

        tracing::debug!(
            path = %self.path.display(),
            version = DIFF_MIGRATION_VERSION,
            "execution diff schema ready"
        );
        Ok(())
    }

    pub fn register_session(&self, session_id: &str) -> Result<()> {
        self.ensure_writable()?;
        validate_session_id(session_id)?;

        let now = format_rfc3339(now_utc())?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO sessions(session_id, created_at) VALUES (?1, ?2)",
                params![session_id, now],
            )
            .with_context(|| format!("failed to register session {session_id}"))?;

        Ok(())
    }

    pub fn append_diff(&mut self, input: &ExecutionDiffInput) -> Result<ExecutionDiffRecord> {
        self.ensure_writable()?;
        input
            .validate()
            .map_err(|err| anyhow!("diff validation failed: {err}"))?;

        let id = match &input.id {
            Some(value) => value.clone(),
            None => Ulid::new().to_string(),
        };
        let timestamp = input.timestamp.unwrap_or_else(now_utc);
        let files_changed = input
            .files_changed
            .as_deref()
            .map(encode_files_changed)
            .transpose()?;

        let tx = self
            .conn
            .transaction()
            .context("failed to start diff transaction")?;

        let session_known = tx
            .query_row(
                "SELECT 1 FROM sessions WHERE session_id = ?1",
                params![input.session_id],
                |_| Ok(()),
            )
            .optional()
            .context("failed to look up session")?
            .is_some();
        if !session_known {
            return Err(anyhow!(
                "unknown session_id {}; register the session before appending diffs",
                input.session_id
            ));
        }

        let latest: Option<i64> = tx
            .query_row(
                "SELECT MAX(execution_sequence) FROM execution_diffs WHERE session_id = ?1",
                params![input.session_id],
                |row| row.get(0),
            )
            .context("failed to read latest execution_sequence")?;
        if let Some(latest) = latest {
            if i64::from(input.execution_sequence) <= latest {
                return Err(anyhow!(
                    "execution_sequence MUST be strictly increasing within session {}: {} <= {}",
                    input.session_id,
                    input.execution_sequence,
                    latest
                ));
            }
        }

        tx.execute(
            "INSERT INTO execution_diffs(
                id, session_id, prompt_marker_id, execution_sequence, git_diff,
                files_changed, stats_additions, stats_deletions, stats_files_changed,
                before_commit_hash, after_commit_hash, timestamp
             ) VALUES (
                ?1, ?2, ?3, ?4, ?5,
                ?6, ?7, ?8, ?9,
                ?10, ?11, ?12
             )",
            params![
                id,
                input.session_id,
                input.prompt_marker_id,
                i64::from(input.execution_sequence),
                input.git_diff,
                files_changed,
                i64::from(input.stats_additions),
                i64::from(input.stats_deletions),
                i64::from(input.stats_files_changed),
                input.before_commit_hash,
                input.after_commit_hash,
                format_rfc3339(timestamp)?,
            ],
        )
        .context("failed to append execution diff")?;

        tx.commit().context("failed to commit diff transaction")?;

        tracing::debug!(
            session_id = %input.session_id,
            execution_sequence = input.execution_sequence,
            "appended execution diff"
        );

        Ok(ExecutionDiffRecord {
            id,
            session_id: input.session_id.clone(),
            prompt_marker_id: input.prompt_marker_id.clone(),
            execution_sequence: input.execution_sequence,
            git_diff: input.git_diff.clone(),
            files_changed: input.files_changed.clone().unwrap_or_default(),
            files_changed_present: input.files_changed.is_some(),
            stats_additions: input.stats_additions,
            stats_deletions: input.stats_deletions,
            stats_files_changed: input.stats_files_changed,
            before_commit_hash: input.before_commit_hash.clone(),
            after_commit_hash: input.after_commit_hash.clone(),
            timestamp,
        })
    }

    /// Rows for `session_id` ascending by `execution_sequence`, still encoded.
    pub fn fetch_raw_diffs_for_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<RawExecutionDiffRecord>, DiffError> {
        validate_session_id(session_id)?;

        let mut stmt = self
            .conn
            .prepare(&format!(
                "{SELECT_DIFF_COLUMNS}
                 WHERE session_id = ?1
                 ORDER BY execution_sequence ASC, id ASC"
            ))
            .map_err(|err| query_unavailable(&err))?;

        let rows = stmt
            .query_map(params![session_id], parse_diff_row)
            .map_err(|err| query_unavailable(&err))?;

        let mut values = Vec::new();
        for row in rows {
            values.push(row.map_err(|err| query_unavailable(&err))?);
        }
        Ok(values)
    }

    /// Decoded records for `session_id`; any malformed record fails the batch.
    pub fn fetch_diffs_for_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<ExecutionDiffRecord>, DiffError> {
        self.fetch_diffs_for_session_with(session_id, MalformedPolicy::Abort)
            .map(|diffs| diffs.records)
    }

    pub fn fetch_diffs_for_session_with(
        &self,
        session_id: &str,
        policy: MalformedPolicy,
    ) -> Result<SessionDiffs, DiffError> {
        let raw_records = self.fetch_raw_diffs_for_session(session_id)?;

        let mut records = Vec::with_capacity(raw_records.len());
        let mut skipped = Vec::new();
        for raw in raw_records {
            let execution_sequence = raw.execution_sequence;
            match normalize(raw) {
                Ok(record) => records.push(record),
                Err(DiffError::MalformedEncoding { record_id, detail })
                    if policy == MalformedPolicy::Skip =>
                {
                    tracing::warn!(
                        session_id,
                        record_id = %record_id,
                        execution_sequence,
                        error = %detail,
                        "skipping execution diff with malformed files_changed"
                    );
                    skipped.push(SkippedRecord {
                        record_id,
                        execution_sequence,
                        detail,
                    });
                }
                Err(err) => return Err(err),
            }
        }

        tracing::info!(
            session_id,
            records = records.len(),
            skipped = skipped.len(),
            "fetched execution diffs"
        );

        Ok(SessionDiffs {
            session_id: session_id.to_string(),
            records,
            skipped,
        })
    }

    pub fn summarize_session(&self, session_id: &str) -> Result<SessionDiffSummary, DiffError> {
        let records = self.fetch_diffs_for_session(session_id)?;
        Ok(summarize_session(session_id, &records))
    }

    pub fn list_sessions(&self) -> Result<Vec<SessionOverview>, DiffError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT session_id, COUNT(*), MAX(execution_sequence)
                 FROM execution_diffs
                 GROUP BY session_id
                 ORDER BY session_id ASC",
            )
            .map_err(|err| query_unavailable(&err))?;

        let rows = stmt
            .query_map([], |row| {
                let count: i64 = row.get(1)?;
                let last: Option<i64> = row.get(2)?;
                Ok(SessionOverview {
                    session_id: row.get(0)?,
                    record_count: usize::try_from(count).map_err(|_| {
                        invalid_column(1, rusqlite::types::Type::Integer, format!("invalid count: {count}"))
                    })?,
                    last_execution_sequence: last
                        .map(|value| {
                            u32::try_from(value).map_err(|_| {
                                invalid_column(
                                    2,
                                    rusqlite::types::Type::Integer,
                                    format!("invalid execution_sequence: {value}"),
                                )
                            })
                        })
                        .transpose()?,
                })
            })
            .map_err(|err| query_unavailable(&err))?;

        let mut values = Vec::new();
        for row in rows {
            values.push(row.map_err(|err| query_unavailable(&err))?);
        }
        Ok(values)
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(anyhow!(
                "store at {} was opened read-only",
                self.path.display()
            ));
        }
        Ok(())
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

/// Opens `db_path` read-only, reads one session, and releases the handle.
pub fn fetch_diffs_for_session(
    db_path: &Path,
    session_id: &str,
) -> Result<Vec<ExecutionDiffRecord>, DiffError> {
    let store = SqliteDiffStore::open_read_only(db_path)?;
    store.fetch_diffs_for_session(session_id)
}

fn parse_diff_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawExecutionDiffRecord> {
    let timestamp_raw: String = row.get(11)?;
    let timestamp = parse_timestamp(&timestamp_raw).map_err(|err| {
        invalid_column(11, rusqlite::types::Type::Text, err.to_string())
    })?;

    Ok(RawExecutionDiffRecord {
        id: row.get(0)?,
        session_id: row.get(1)?,
        prompt_marker_id: row.get(2)?,
        execution_sequence: column_u32(row, 3, "execution_sequence")?,
        git_diff: row.get(4)?,
        files_changed: row.get(5)?,
        stats_additions: column_u32_or_zero(row, 6, "stats_additions")?,
        stats_deletions: column_u32_or_zero(row, 7, "stats_deletions")?,
        stats_files_changed: column_u32_or_zero(row, 8, "stats_files_changed")?,
        before_commit_hash: row.get(9)?,
        after_commit_hash: row.get(10)?,
        timestamp,
    })
}

fn column_u32(row: &rusqlite::Row<'_>, index: usize, name: &str) -> rusqlite::Result<u32> {
    let raw: i64 = row.get(index)?;
    u32::try_from(raw).map_err(|_| {
        invalid_column(
            index,
            rusqlite::types::Type::Integer,
            format!("invalid {name}: {raw}"),
        )
    })
}

fn column_u32_or_zero(row: &rusqlite::Row<'_>, index: usize, name: &str) -> rusqlite::Result<u32> {
    let raw: Option<i64> = row.get(index)?;
    match raw {
        Some(_) => column_u32(row, index, name),
        None => Ok(0),
    }
}

fn invalid_column(
    index: usize,
    column_type: rusqlite::types::Type,
    message: String,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        column_type,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn query_unavailable(err: &rusqlite::Error) -> DiffError {
    let hint = match err {
        rusqlite::Error::SqliteFailure(_, Some(message)) if message.contains("no such table") => {
            INIT_HINT
        }
        rusqlite::Error::SqliteFailure(failure, _)
            if matches!(
                failure.code,
                ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase
            ) =>
        {
            CORRUPT_HINT
        }
        rusqlite::Error::FromSqlConversionFailure(..)
        | rusqlite::Error::InvalidColumnType(..)
        | rusqlite::Error::IntegralValueOutOfRange(..) => CORRUPT_HINT,
        _ => OPEN_HINT,
    };

    DiffError::storage_unavailable(format!("failed to query execution_diffs: {err}"), hint)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::too_many_lines, clippy::manual_let_else)]

    use super::*;
    use proptest::prelude::*;

    fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn fixture_store() -> SqliteDiffStore {
        let store = must(SqliteDiffStore::open(Path::new(":memory:")));
        must(store.migrate());
        store
    }

    fn temp_db_path(label: &str) -> PathBuf {
        std::env::temp_dir().join(format!("session-diffs-{label}-{}.sqlite3", Ulid::new()))
    }

    fn remove_db(path: &Path) {
        for suffix in ["", "-wal", "-shm"] {
            let mut candidate = path.as_os_str().to_owned();
            candidate.push(suffix);
            let _ = std::fs::remove_file(PathBuf::from(candidate));
        }
    }

    fn fixture_input(session_id: &str, execution_sequence: u32) -> ExecutionDiffInput {
        ExecutionDiffInput {
            id: None,
            session_id: session_id.to_string(),
            prompt_marker_id: Some(format!("prompt-{execution_sequence}")),
            execution_sequence,
            git_diff: Some("diff --git a/a.txt b/a.txt\n+added line\n".to_string()),
            files_changed: Some(vec!["a.txt".to_string(), "b.txt".to_string()]),
            stats_additions: 1,
            stats_deletions: 0,
            stats_files_changed: 2,
            before_commit_hash: Some("1111111".to_string()),
            after_commit_hash: Some("2222222".to_string()),
            timestamp: Some(must(parse_timestamp("2026-02-07T12:00:00Z"))),
        }
    }

    fn append(store: &mut SqliteDiffStore, session_id: &str, execution_sequence: u32) -> ExecutionDiffRecord {
        must(store.register_session(session_id));
        must(store.append_diff(&fixture_input(session_id, execution_sequence)))
    }

    fn insert_raw_row(
        conn: &Connection,
        id: &str,
        session_id: &str,
        execution_sequence: i64,
        files_changed: Option<&str>,
    ) {
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO sessions(session_id, created_at) VALUES (?1, '2026-02-07T00:00:00Z')",
            params![session_id],
        );
        if let Err(err) = inserted {
            panic!("failed to seed session row: {err}");
        }

        let inserted = conn.execute(
            "INSERT INTO execution_diffs(
                id, session_id, execution_sequence, files_changed, timestamp
             ) VALUES (?1, ?2, ?3, ?4, '2026-02-07T12:00:00Z')",
            params![id, session_id, execution_sequence, files_changed],
        );
        if let Err(err) = inserted {
            panic!("failed to insert raw diff row: {err}");
        }
    }

    fn sequences(records: &[ExecutionDiffRecord]) -> Vec<u32> {
        records.iter().map(|record| record.execution_sequence).collect()
    }

    fn expect_unavailable(result: Result<Vec<ExecutionDiffRecord>, DiffError>) -> (String, String) {
        match result {
            Err(DiffError::StorageUnavailable { detail, hint }) => (detail, hint),
            other => panic!("expected StorageUnavailable, got {other:?}"),
        }
    }

    #[test]
    fn unknown_session_yields_empty_sequence() {
        let mut store = fixture_store();
        let _ = append(&mut store, "S1", 0);

        let records = must(store.fetch_diffs_for_session("nobody"));
        assert!(records.is_empty());
    }

    #[test]
    fn fetch_filters_by_session_and_orders_by_sequence() {
        let mut store = fixture_store();
        let s1_first = append(&mut store, "S1", 0);
        let s2_only = append(&mut store, "S2", 0);
        let s1_second = append(&mut store, "S1", 1);

        let s1 = must(store.fetch_diffs_for_session("S1"));
        assert_eq!(s1, vec![s1_first, s1_second]);

        let s2 = must(store.fetch_diffs_for_session("S2"));
        assert_eq!(s2, vec![s2_only]);
    }

    #[test]
    fn fetch_orders_rows_inserted_out_of_sequence() {
        let store = fixture_store();
        for (id, seq) in [("d5", 5), ("d1", 1), ("d9", 9), ("d3", 3)] {
            insert_raw_row(store.connection(), id, "S1", seq, Some(r#"["x.rs"]"#));
        }

        let records = must(store.fetch_diffs_for_session("S1"));
        assert_eq!(sequences(&records), vec![1, 3, 5, 9]);
    }

    #[test]
    fn appended_record_round_trips_through_storage() {
        let mut store = fixture_store();
        let appended = append(&mut store, "S1", 0);

        let raw = must(store.fetch_raw_diffs_for_session("S1"));
        assert_eq!(raw.len(), 1);
        assert_eq!(raw[0].files_changed.as_deref(), Some(r#"["a.txt","b.txt"]"#));

        let records = must(store.fetch_diffs_for_session("S1"));
        assert_eq!(records[0], appended);
        assert_eq!(records[0].files_changed, vec!["a.txt", "b.txt"]);
        assert!(Ulid::from_string(&records[0].id).is_ok());
    }

    #[test]
    fn append_without_files_stores_null_and_reads_empty() {
        let mut store = fixture_store();
        must(store.register_session("S1"));
        let mut input = fixture_input("S1", 0);
        input.files_changed = None;
        input.stats_files_changed = 0;
        let _ = must(store.append_diff(&input));

        let raw = must(store.fetch_raw_diffs_for_session("S1"));
        assert_eq!(raw[0].files_changed, None);
        let records = must(store.fetch_diffs_for_session("S1"));
        assert!(records[0].files_changed.is_empty());
        assert!(!records[0].files_changed_present);
    }

    #[test]
    fn whitespace_files_changed_row_is_malformed() {
        let store = fixture_store();
        insert_raw_row(store.connection(), "ws", "S1", 0, Some("   "));

        match store.fetch_diffs_for_session("S1") {
            Err(DiffError::MalformedEncoding { record_id, .. }) => assert_eq!(record_id, "ws"),
            other => panic!("expected MalformedEncoding, got {other:?}"),
        }
    }

    #[test]
    fn null_files_changed_row_is_not_counted_as_inconsistent() {
        let store = fixture_store();
        let conn = store.connection();
        must(conn.execute(
            "INSERT INTO sessions(session_id, created_at) VALUES ('S1', '2026-02-07T00:00:00Z')",
            [],
        ));
        for (id, seq, files, stats) in [("nul", 0_i64, None, 3_i64), ("empty", 1, Some("[]"), 2)] {
            must(conn.execute(
                "INSERT INTO execution_diffs(
                    id, session_id, execution_sequence, files_changed, stats_files_changed, timestamp
                 ) VALUES (?1, 'S1', ?2, ?3, ?4, '2026-02-07T12:00:00Z')",
                params![id, seq, files, stats],
            ));
        }

        let records = must(store.fetch_diffs_for_session("S1"));
        assert!(records[0].stats_consistent());
        assert!(!records[1].stats_consistent());
        let summary = must(store.summarize_session("S1"));
        assert_eq!(summary.inconsistent_stats_records, 1);
    }

    #[test]
    fn append_rejects_non_increasing_sequence() {
        let mut store = fixture_store();
        let _ = append(&mut store, "S1", 4);

        for seq in [4, 2] {
            let err = match store.append_diff(&fixture_input("S1", seq)) {
                Ok(_) => panic!("expected sequence {seq} to be rejected"),
                Err(err) => err,
            };
            assert!(err.to_string().contains("strictly increasing"));
        }

        let _ = must(store.append_diff(&fixture_input("S1", 5)));
        assert_eq!(
            sequences(&must(store.fetch_diffs_for_session("S1"))),
            vec![4, 5]
        );
    }

    #[test]
    fn append_rejects_unregistered_session() {
        let mut store = fixture_store();
        let err = match store.append_diff(&fixture_input("ghost", 0)) {
            Ok(_) => panic!("expected unknown session to be rejected"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("unknown session_id ghost"));
    }

    #[test]
    fn append_only_trigger_blocks_updates_and_deletes() {
        let mut store = fixture_store();
        let record = append(&mut store, "S1", 0);

        let update_result = store.connection().execute(
            "UPDATE execution_diffs SET git_diff = 'mutated' WHERE id = ?1",
            params![record.id],
        );
        assert!(update_result.is_err());

        let delete_result = store
            .connection()
            .execute("DELETE FROM execution_diffs WHERE id = ?1", params![record.id]);
        assert!(delete_result.is_err());
    }

    #[test]
    fn malformed_files_changed_aborts_batch_by_default() {
        let store = fixture_store();
        insert_raw_row(store.connection(), "good", "S1", 0, Some(r#"["a.txt"]"#));
        insert_raw_row(store.connection(), "bad", "S1", 1, Some("a.txt, b.txt"));

        match store.fetch_diffs_for_session("S1") {
            Err(DiffError::MalformedEncoding { record_id, .. }) => assert_eq!(record_id, "bad"),
            other => panic!("expected MalformedEncoding, got {other:?}"),
        }
    }

    #[test]
    fn skip_policy_reports_malformed_records() {
        let store = fixture_store();
        insert_raw_row(store.connection(), "first", "S1", 0, Some(r#"["a.txt"]"#));
        insert_raw_row(store.connection(), "broken", "S1", 1, Some("{not json"));
        insert_raw_row(store.connection(), "third", "S1", 2, None);

        let diffs = must(store.fetch_diffs_for_session_with("S1", MalformedPolicy::Skip));
        assert_eq!(sequences(&diffs.records), vec![0, 2]);
        assert_eq!(diffs.skipped.len(), 1);
        assert_eq!(diffs.skipped[0].record_id, "broken");
        assert_eq!(diffs.skipped[0].execution_sequence, 1);
        assert!(diffs.records[1].files_changed.is_empty());
    }

    #[test]
    fn blank_session_id_is_a_validation_error() {
        let store = fixture_store();
        assert!(matches!(
            store.fetch_diffs_for_session(""),
            Err(DiffError::Validation(_))
        ));
    }

    #[test]
    fn missing_database_file_is_storage_unavailable_with_hint() {
        let db_path = temp_db_path("missing");

        let (detail, hint) = expect_unavailable(fetch_diffs_for_session(&db_path, "S1"));
        assert!(detail.contains("does not exist"));
        assert!(hint.contains("sdiff store init"));
        assert!(!db_path.exists(), "read path must not create the database");
    }

    #[test]
    fn uninitialized_database_is_storage_unavailable_with_init_hint() {
        let db_path = temp_db_path("uninitialized");
        let conn = must(Connection::open(&db_path));
        must(conn.execute_batch("CREATE TABLE unrelated (id INTEGER);"));
        drop(conn);

        let (detail, hint) = expect_unavailable(fetch_diffs_for_session(&db_path, "S1"));
        assert!(detail.contains("no such table"));
        assert_eq!(hint, INIT_HINT);

        remove_db(&db_path);
    }

    #[test]
    fn non_database_file_is_storage_unavailable() {
        let db_path = temp_db_path("garbage");
        must(std::fs::write(
            &db_path,
            b"this is definitely not an sqlite database file, just some bytes padding it out",
        ));

        let (_, hint) = expect_unavailable(fetch_diffs_for_session(&db_path, "S1"));
        assert_eq!(hint, CORRUPT_HINT);

        remove_db(&db_path);
    }

    #[test]
    fn legacy_rows_are_read_leniently_and_corrupt_rows_fail() {
        let db_path = temp_db_path("legacy");
        let conn = must(Connection::open(&db_path));
        must(conn.execute_batch(
            "CREATE TABLE execution_diffs (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                prompt_marker_id TEXT,
                execution_sequence INTEGER NOT NULL,
                git_diff TEXT,
                files_changed TEXT,
                stats_additions INTEGER,
                stats_deletions INTEGER,
                stats_files_changed INTEGER,
                before_commit_hash TEXT,
                after_commit_hash TEXT,
                timestamp DATETIME DEFAULT CURRENT_TIMESTAMP
             );
             INSERT INTO execution_diffs(id, session_id, execution_sequence, files_changed, timestamp)
               VALUES ('legacy-1', 'S1', 0, '[\"main.py\"]', '2026-02-07 12:00:00.123456');
             INSERT INTO execution_diffs(id, session_id, execution_sequence, stats_additions, timestamp)
               VALUES ('corrupt-1', 'S2', 0, -3, '2026-02-07 12:00:00');",
        ));
        drop(conn);

        let records = must(fetch_diffs_for_session(&db_path, "S1"));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].files_changed, vec!["main.py"]);
        assert_eq!(records[0].stats_additions, 0);
        assert_eq!(records[0].timestamp, must(parse_timestamp("2026-02-07T12:00:00.123456Z")));

        let (detail, hint) = expect_unavailable(fetch_diffs_for_session(&db_path, "S2"));
        assert!(detail.contains("invalid stats_additions"));
        assert_eq!(hint, CORRUPT_HINT);

        remove_db(&db_path);
    }

    #[test]
    fn read_only_store_refuses_writes() {
        let db_path = temp_db_path("read-only");
        let writer = must(SqliteDiffStore::open(&db_path));
        must(writer.migrate());
        drop(writer);

        let mut reader = must(SqliteDiffStore::open_read_only(&db_path));
        assert!(reader.is_read_only());
        assert!(reader.migrate().is_err());
        assert!(reader.register_session("S1").is_err());
        assert!(reader.append_diff(&fixture_input("S1", 0)).is_err());
        assert!(must(reader.fetch_diffs_for_session("S1")).is_empty());
        drop(reader);

        remove_db(&db_path);
    }

    #[test]
    fn concurrent_readers_for_different_sessions_do_not_interfere() {
        let db_path = temp_db_path("concurrent");
        let mut writer = must(SqliteDiffStore::open(&db_path));
        must(writer.migrate());
        for session in ["A", "B", "C", "D"] {
            for seq in 0..5 {
                let _ = append(&mut writer, session, seq);
            }
        }

        let handles = ["A", "B", "C", "D"]
            .into_iter()
            .map(|session| {
                let path = db_path.clone();
                std::thread::spawn(move || {
                    let records = fetch_diffs_for_session(&path, session)?;
                    Ok::<_, DiffError>((session, records))
                })
            })
            .collect::<Vec<_>>();

        let _ = writer.append_diff(&fixture_input("A", 5));

        for handle in handles {
            let (session, records) = match handle.join() {
                Ok(result) => must(result),
                Err(err) => panic!("reader thread panicked: {err:?}"),
            };
            assert!(records.iter().all(|record| record.session_id == session));
            let seqs = sequences(&records);
            assert!(seqs.len() >= 5);
            assert!(seqs.windows(2).all(|pair| pair[0] < pair[1]));
        }

        drop(writer);
        remove_db(&db_path);
    }

    #[test]
    fn migration_is_idempotent_and_preserves_existing_data() {
        let mut store = fixture_store();
        let before = append(&mut store, "S1", 0);

        must(store.migrate());
        let after = must(store.fetch_diffs_for_session("S1"));
        assert_eq!(after, vec![before]);

        let migrations = match store.connection().query_row(
            "SELECT COUNT(*) FROM schema_migrations",
            [],
            |row| row.get::<_, i64>(0),
        ) {
            Ok(value) => value,
            Err(err) => panic!("failed to count migrations: {err}"),
        };
        assert_eq!(migrations, 1);
    }

    #[test]
    fn list_sessions_and_summary_reflect_stored_rows() {
        let mut store = fixture_store();
        let _ = append(&mut store, "S2", 0);
        let _ = append(&mut store, "S1", 0);
        let _ = append(&mut store, "S1", 3);

        let sessions = must(store.list_sessions());
        assert_eq!(
            sessions,
            vec![
                SessionOverview {
                    session_id: "S1".to_string(),
                    record_count: 2,
                    last_execution_sequence: Some(3),
                },
                SessionOverview {
                    session_id: "S2".to_string(),
                    record_count: 1,
                    last_execution_sequence: Some(0),
                },
            ]
        );

        let summary = must(store.summarize_session("S1"));
        assert_eq!(summary.record_count, 2);
        assert_eq!(summary.total_additions, 2);
        assert_eq!(summary.files_touched, vec!["a.txt", "b.txt"]);
        assert_eq!(summary.first_execution_sequence, Some(0));
        assert_eq!(summary.last_execution_sequence, Some(3));
        assert_eq!(summary.inconsistent_stats_records, 0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_fetch_is_strictly_ascending(
            s1 in prop::collection::btree_set(0_i64..10_000, 0..30),
            s2 in prop::collection::btree_set(0_i64..10_000, 0..30),
        ) {
            let store = fixture_store();
            for seq in s1.iter().rev() {
                insert_raw_row(store.connection(), &format!("s1-{seq}"), "S1", *seq, None);
            }
            for seq in &s2 {
                insert_raw_row(store.connection(), &format!("s2-{seq}"), "S2", *seq, Some("[]"));
            }

            let records = must(store.fetch_diffs_for_session("S1"));
            let fetched: Vec<i64> = records
                .iter()
                .map(|record| i64::from(record.execution_sequence))
                .collect();
            let expected: Vec<i64> = s1.iter().copied().collect();
            prop_assert_eq!(fetched, expected);
            prop_assert!(records.iter().all(|record| record.session_id == "S1"));
        }
    }
}
