//! SQLite-backed storage engine and collection repositories.
//!
//! One shared connection guarded by a mutex; repositories never open their
//! own handle. The schema is derived from the registry in `stagekit-core`
//! and is strictly additive: `ensure_schema` creates what is missing and
//! never drops or rewrites existing tables.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use stagekit_core::{
    AdminRecord, AnalyticsRecord, CollectionDef, ContentType, ExperienceRecord, FileRecord,
    SettingsRecord, StoreError, WriteClock, COLLECTIONS, SCHEMA_VERSION,
};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = "
CREATE TABLE IF NOT EXISTS schema_migrations (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL
);
";

const CREATE_FILES_SQL: &str = "
CREATE TABLE IF NOT EXISTS files (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    content_type TEXT NOT NULL CHECK (content_type IN ('image', 'audio', 'video')),
    data TEXT NOT NULL,
    original_name TEXT NOT NULL,
    size_bytes INTEGER NOT NULL DEFAULT 0,
    uploaded_at TEXT NOT NULL,
    optimized INTEGER NOT NULL DEFAULT 0,
    heavy INTEGER NOT NULL DEFAULT 0
);
";

const CREATE_SETTINGS_SQL: &str = "
CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY,
    value_json TEXT NOT NULL,
    scope TEXT,
    last_modified TEXT NOT NULL
);
";

const CREATE_ADMIN_SQL: &str = "
CREATE TABLE IF NOT EXISTS admin (
    key TEXT PRIMARY KEY,
    value_json TEXT NOT NULL
);
";

const CREATE_ANALYTICS_SQL: &str = "
CREATE TABLE IF NOT EXISTS analytics (
    key TEXT PRIMARY KEY,
    data_json TEXT NOT NULL,
    kind TEXT NOT NULL
);
";

const CREATE_EXPERIENCE_SQL: &str = "
CREATE TABLE IF NOT EXISTS experience (
    key TEXT PRIMARY KEY,
    value_json TEXT NOT NULL
);
";

fn table_ddl(collection: &CollectionDef) -> Result<&'static str, StoreError> {
    match collection.name {
        "files" => Ok(CREATE_FILES_SQL),
        "settings" => Ok(CREATE_SETTINGS_SQL),
        "admin" => Ok(CREATE_ADMIN_SQL),
        "analytics" => Ok(CREATE_ANALYTICS_SQL),
        "experience" => Ok(CREATE_EXPERIENCE_SQL),
        other => Err(StoreError::StoreUnavailable(format!(
            "collection {other} is registered but has no table definition"
        ))),
    }
}

fn unavailable(err: &rusqlite::Error) -> StoreError {
    StoreError::StoreUnavailable(err.to_string())
}

fn read_failed(err: &rusqlite::Error) -> StoreError {
    StoreError::ReadFailed(err.to_string())
}

fn write_failed(err: &rusqlite::Error) -> StoreError {
    StoreError::WriteFailed(err.to_string())
}

fn encode_json(value: &Value) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|err| StoreError::WriteFailed(err.to_string()))
}

fn decode_json(text: &str) -> Result<Value, StoreError> {
    serde_json::from_str(text).map_err(|err| StoreError::ReadFailed(err.to_string()))
}

fn encode_timestamp(ts: OffsetDateTime) -> Result<String, StoreError> {
    ts.format(&Rfc3339).map_err(|err| StoreError::WriteFailed(err.to_string()))
}

fn decode_timestamp(text: &str) -> Result<OffsetDateTime, StoreError> {
    OffsetDateTime::parse(text, &Rfc3339).map_err(|err| StoreError::ReadFailed(err.to_string()))
}

/// The embedded storage engine.
///
/// Construction never touches the disk. The first operation (an explicit
/// `open` or any repository call) opens the SQLite handle, applies the
/// pragmas, and runs the schema pass; concurrent callers block on the
/// internal mutex and observe the handle that open produced.
#[derive(Debug)]
pub struct StorageEngine {
    path: PathBuf,
    conn: Mutex<Option<Connection>>,
    clock: WriteClock,
}

impl StorageEngine {
    #[must_use]
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            conn: Mutex::new(None),
            clock: WriteClock::new(),
        }
    }

    /// Open the database and prepare the schema. Idempotent.
    ///
    /// # Errors
    ///
    /// [`StoreError::StoreUnavailable`] when the database cannot be opened
    /// or the on-disk schema is newer than this build understands.
    pub fn open(&self) -> Result<(), StoreError> {
        self.with_conn(|_| Ok(()))
    }

    /// Close the underlying connection. A later call reopens it.
    pub fn close(&self) {
        let mut guard = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        *guard = None;
    }

    /// Timestamp source for `last_modified` stamps.
    #[must_use]
    pub fn clock(&self) -> &WriteClock {
        &self.clock
    }

    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut guard = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.is_none() {
            *guard = Some(self.open_connection()?);
        }
        let Some(conn) = guard.as_ref() else {
            return Err(StoreError::StoreUnavailable("connection unavailable".to_string()));
        };
        f(conn)
    }

    fn open_connection(&self) -> Result<Connection, StoreError> {
        let conn = Connection::open(&self.path).map_err(|err| unavailable(&err))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(|err| unavailable(&err))?;
        ensure_schema(&conn)?;
        Ok(conn)
    }
}

/// Additive schema pass, safe on every open.
fn ensure_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL).map_err(|err| unavailable(&err))?;

    let on_disk: Option<i64> = conn
        .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| row.get(0))
        .map_err(|err| unavailable(&err))?;
    if let Some(version) = on_disk {
        if version > SCHEMA_VERSION {
            return Err(StoreError::StoreUnavailable(format!(
                "database schema version {version} is newer than supported version {SCHEMA_VERSION}"
            )));
        }
    }

    for collection in COLLECTIONS {
        conn.execute_batch(table_ddl(collection)?).map_err(|err| unavailable(&err))?;
        for column in collection.indexes {
            let name = collection.name;
            conn.execute_batch(&format!(
                "CREATE INDEX IF NOT EXISTS idx_{name}_{column} ON {name}({column});"
            ))
            .map_err(|err| unavailable(&err))?;
        }
    }

    let applied_at = encode_timestamp(OffsetDateTime::now_utc())
        .map_err(|err| StoreError::StoreUnavailable(err.to_string()))?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
        params![SCHEMA_VERSION, applied_at],
    )
    .map_err(|err| unavailable(&err))?;
    Ok(())
}

struct FileRow {
    id: String,
    name: String,
    content_type: String,
    data: String,
    original_name: String,
    size_bytes: i64,
    uploaded_at: String,
    optimized: bool,
    heavy: bool,
}

impl FileRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            content_type: row.get(2)?,
            data: row.get(3)?,
            original_name: row.get(4)?,
            size_bytes: row.get(5)?,
            uploaded_at: row.get(6)?,
            optimized: row.get(7)?,
            heavy: row.get(8)?,
        })
    }

    fn into_record(self) -> Result<FileRecord, StoreError> {
        let content_type = ContentType::parse(&self.content_type).ok_or_else(|| {
            StoreError::ReadFailed(format!("unknown content type {:?}", self.content_type))
        })?;
        let size_bytes = u64::try_from(self.size_bytes)
            .map_err(|_| StoreError::ReadFailed("negative size_bytes".to_string()))?;
        Ok(FileRecord {
            id: self.id,
            name: self.name,
            content_type,
            data: self.data,
            original_name: self.original_name,
            size_bytes,
            uploaded_at: decode_timestamp(&self.uploaded_at)?,
            optimized: self.optimized,
            heavy: self.heavy,
        })
    }
}

const SELECT_FILE_COLUMNS: &str =
    "SELECT id, name, content_type, data, original_name, size_bytes, uploaded_at, optimized, heavy FROM files";

fn upsert_file(conn: &Connection, record: &FileRecord) -> Result<(), StoreError> {
    let size_bytes = i64::try_from(record.size_bytes)
        .map_err(|_| StoreError::WriteFailed("size_bytes exceeds storage range".to_string()))?;
    let uploaded_at = encode_timestamp(record.uploaded_at)?;
    conn.execute(
        "INSERT INTO files (id, name, content_type, data, original_name, size_bytes, uploaded_at, optimized, heavy)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(id) DO UPDATE SET
             name = excluded.name,
             content_type = excluded.content_type,
             data = excluded.data,
             original_name = excluded.original_name,
             size_bytes = excluded.size_bytes,
             uploaded_at = excluded.uploaded_at,
             optimized = excluded.optimized,
             heavy = excluded.heavy",
        params![
            record.id,
            record.name,
            record.content_type.as_str(),
            record.data,
            record.original_name,
            size_bytes,
            uploaded_at,
            record.optimized,
            record.heavy,
        ],
    )
    .map_err(|err| write_failed(&err))?;
    Ok(())
}

/// Repository for the `files` collection. The only collection with delete.
#[derive(Debug, Clone)]
pub struct FilesRepo {
    engine: Arc<StorageEngine>,
}

impl FilesRepo {
    #[must_use]
    pub fn new(engine: Arc<StorageEngine>) -> Self {
        Self { engine }
    }

    /// Insert or overwrite one file record.
    ///
    /// # Errors
    ///
    /// [`StoreError::WriteFailed`] when the write cannot complete.
    pub fn put(&self, record: &FileRecord) -> Result<(), StoreError> {
        self.engine.with_conn(|conn| upsert_file(conn, record))
    }

    /// # Errors
    ///
    /// [`StoreError::ReadFailed`] on engine failure; a missing id is `Ok(None)`.
    pub fn get(&self, id: &str) -> Result<Option<FileRecord>, StoreError> {
        self.engine.with_conn(|conn| {
            let row = conn
                .query_row(
                    &format!("{SELECT_FILE_COLUMNS} WHERE id = ?1"),
                    params![id],
                    FileRow::from_row,
                )
                .optional()
                .map_err(|err| read_failed(&err))?;
            row.map(FileRow::into_record).transpose()
        })
    }

    /// All file records, ordered by upload time then id.
    ///
    /// # Errors
    ///
    /// [`StoreError::ReadFailed`] on engine failure.
    pub fn get_all(&self) -> Result<Vec<FileRecord>, StoreError> {
        self.engine.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!("{SELECT_FILE_COLUMNS} ORDER BY uploaded_at ASC, id ASC"))
                .map_err(|err| read_failed(&err))?;
            let rows = stmt
                .query_map([], FileRow::from_row)
                .map_err(|err| read_failed(&err))?;
            let mut records = Vec::new();
            for row in rows {
                records.push(row.map_err(|err| read_failed(&err))?.into_record()?);
            }
            Ok(records)
        })
    }

    /// Remove one record. Deleting an absent id is a no-op.
    ///
    /// # Errors
    ///
    /// [`StoreError::WriteFailed`] when the delete cannot complete.
    pub fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.engine.with_conn(|conn| {
            conn.execute("DELETE FROM files WHERE id = ?1", params![id])
                .map_err(|err| write_failed(&err))?;
            Ok(())
        })
    }

    /// Write a batch of records in one transaction, all or nothing.
    ///
    /// # Errors
    ///
    /// [`StoreError::WriteFailed`] when any write in the batch fails; no
    /// record from the batch is persisted in that case.
    pub fn save_all(&self, records: &[FileRecord]) -> Result<(), StoreError> {
        self.engine.with_conn(|conn| {
            let tx = conn.unchecked_transaction().map_err(|err| write_failed(&err))?;
            for record in records {
                upsert_file(&tx, record)?;
            }
            tx.commit().map_err(|err| write_failed(&err))?;
            Ok(())
        })
    }
}

/// Repository for the `settings` collection.
///
/// Every write stamps `last_modified` from the engine's write clock, so
/// stamps are strictly monotonic within a process.
#[derive(Debug, Clone)]
pub struct SettingsRepo {
    engine: Arc<StorageEngine>,
}

impl SettingsRepo {
    #[must_use]
    pub fn new(engine: Arc<StorageEngine>) -> Self {
        Self { engine }
    }

    /// Insert or overwrite one settings surface with no scope tag.
    ///
    /// # Errors
    ///
    /// [`StoreError::WriteFailed`] when the write cannot complete.
    pub fn put(&self, key: &str, value: &Value) -> Result<SettingsRecord, StoreError> {
        self.put_inner(key, value, None)
    }

    /// Insert or overwrite one settings surface carrying a sync-scope tag.
    /// The scope is metadata only; it never affects the key.
    ///
    /// # Errors
    ///
    /// [`StoreError::WriteFailed`] when the write cannot complete.
    pub fn put_scoped(
        &self,
        key: &str,
        value: &Value,
        scope: &str,
    ) -> Result<SettingsRecord, StoreError> {
        self.put_inner(key, value, Some(scope))
    }

    fn put_inner(
        &self,
        key: &str,
        value: &Value,
        scope: Option<&str>,
    ) -> Result<SettingsRecord, StoreError> {
        let last_modified = self.engine.clock().now();
        let value_json = encode_json(value)?;
        let stamp = encode_timestamp(last_modified)?;
        self.engine.with_conn(|conn| {
            conn.execute(
                "INSERT INTO settings (key, value_json, scope, last_modified)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(key) DO UPDATE SET
                     value_json = excluded.value_json,
                     scope = excluded.scope,
                     last_modified = excluded.last_modified",
                params![key, value_json, scope, stamp],
            )
            .map_err(|err| write_failed(&err))?;
            Ok(())
        })?;
        Ok(SettingsRecord {
            key: key.to_string(),
            value: value.clone(),
            scope: scope.map(str::to_string),
            last_modified,
        })
    }

    /// # Errors
    ///
    /// [`StoreError::ReadFailed`] on engine failure; a missing key is `Ok(None)`.
    pub fn get(&self, key: &str) -> Result<Option<SettingsRecord>, StoreError> {
        self.engine.with_conn(|conn| {
            let row: Option<(String, Option<String>, String)> = conn
                .query_row(
                    "SELECT value_json, scope, last_modified FROM settings WHERE key = ?1",
                    params![key],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()
                .map_err(|err| read_failed(&err))?;
            row.map(|(value_json, scope, last_modified)| {
                Ok(SettingsRecord {
                    key: key.to_string(),
                    value: decode_json(&value_json)?,
                    scope,
                    last_modified: decode_timestamp(&last_modified)?,
                })
            })
            .transpose()
        })
    }

    /// # Errors
    ///
    /// [`StoreError::ReadFailed`] on engine failure.
    pub fn get_all(&self) -> Result<Vec<SettingsRecord>, StoreError> {
        self.engine.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT key, value_json, scope, last_modified FROM settings ORDER BY key ASC")
                .map_err(|err| read_failed(&err))?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                })
                .map_err(|err| read_failed(&err))?;
            let mut records = Vec::new();
            for row in rows {
                let (key, value_json, scope, last_modified) = row.map_err(|err| read_failed(&err))?;
                records.push(SettingsRecord {
                    key,
                    value: decode_json(&value_json)?,
                    scope,
                    last_modified: decode_timestamp(&last_modified)?,
                });
            }
            Ok(records)
        })
    }
}

/// Repository for the `admin` collection. Local-only by policy.
#[derive(Debug, Clone)]
pub struct AdminRepo {
    engine: Arc<StorageEngine>,
}

impl AdminRepo {
    #[must_use]
    pub fn new(engine: Arc<StorageEngine>) -> Self {
        Self { engine }
    }

    /// # Errors
    ///
    /// [`StoreError::WriteFailed`] when the write cannot complete.
    pub fn put(&self, record: &AdminRecord) -> Result<(), StoreError> {
        let value_json = encode_json(&record.value)?;
        self.engine.with_conn(|conn| {
            conn.execute(
                "INSERT INTO admin (key, value_json) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
                params![record.key, value_json],
            )
            .map_err(|err| write_failed(&err))?;
            Ok(())
        })
    }

    /// # Errors
    ///
    /// [`StoreError::ReadFailed`] on engine failure; a missing key is `Ok(None)`.
    pub fn get(&self, key: &str) -> Result<Option<AdminRecord>, StoreError> {
        self.engine.with_conn(|conn| {
            let value_json: Option<String> = conn
                .query_row("SELECT value_json FROM admin WHERE key = ?1", params![key], |row| {
                    row.get(0)
                })
                .optional()
                .map_err(|err| read_failed(&err))?;
            value_json
                .map(|text| Ok(AdminRecord { key: key.to_string(), value: decode_json(&text)? }))
                .transpose()
        })
    }

    /// # Errors
    ///
    /// [`StoreError::ReadFailed`] on engine failure.
    pub fn get_all(&self) -> Result<Vec<AdminRecord>, StoreError> {
        self.engine.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT key, value_json FROM admin ORDER BY key ASC")
                .map_err(|err| read_failed(&err))?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
                .map_err(|err| read_failed(&err))?;
            let mut records = Vec::new();
            for row in rows {
                let (key, value_json) = row.map_err(|err| read_failed(&err))?;
                records.push(AdminRecord { key, value: decode_json(&value_json)? });
            }
            Ok(records)
        })
    }
}

/// Repository for the `analytics` collection. Overwrite-only buckets.
#[derive(Debug, Clone)]
pub struct AnalyticsRepo {
    engine: Arc<StorageEngine>,
}

impl AnalyticsRepo {
    #[must_use]
    pub fn new(engine: Arc<StorageEngine>) -> Self {
        Self { engine }
    }

    /// # Errors
    ///
    /// [`StoreError::WriteFailed`] when the write cannot complete.
    pub fn put(&self, record: &AnalyticsRecord) -> Result<(), StoreError> {
        let data_json = encode_json(&record.data)?;
        self.engine.with_conn(|conn| {
            conn.execute(
                "INSERT INTO analytics (key, data_json, kind) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET
                     data_json = excluded.data_json,
                     kind = excluded.kind",
                params![record.key, data_json, record.kind],
            )
            .map_err(|err| write_failed(&err))?;
            Ok(())
        })
    }

    /// # Errors
    ///
    /// [`StoreError::ReadFailed`] on engine failure; a missing key is `Ok(None)`.
    pub fn get(&self, key: &str) -> Result<Option<AnalyticsRecord>, StoreError> {
        self.engine.with_conn(|conn| {
            let row: Option<(String, String)> = conn
                .query_row(
                    "SELECT data_json, kind FROM analytics WHERE key = ?1",
                    params![key],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .map_err(|err| read_failed(&err))?;
            row.map(|(data_json, kind)| {
                Ok(AnalyticsRecord { key: key.to_string(), data: decode_json(&data_json)?, kind })
            })
            .transpose()
        })
    }

    /// # Errors
    ///
    /// [`StoreError::ReadFailed`] on engine failure.
    pub fn get_all(&self) -> Result<Vec<AnalyticsRecord>, StoreError> {
        self.engine.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT key, data_json, kind FROM analytics ORDER BY key ASC")
                .map_err(|err| read_failed(&err))?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })
                .map_err(|err| read_failed(&err))?;
            let mut records = Vec::new();
            for row in rows {
                let (key, data_json, kind) = row.map_err(|err| read_failed(&err))?;
                records.push(AnalyticsRecord { key, data: decode_json(&data_json)?, kind });
            }
            Ok(records)
        })
    }
}

/// Repository for the `experience` collection.
#[derive(Debug, Clone)]
pub struct ExperienceRepo {
    engine: Arc<StorageEngine>,
}

impl ExperienceRepo {
    #[must_use]
    pub fn new(engine: Arc<StorageEngine>) -> Self {
        Self { engine }
    }

    /// # Errors
    ///
    /// [`StoreError::WriteFailed`] when the write cannot complete.
    pub fn put(&self, record: &ExperienceRecord) -> Result<(), StoreError> {
        let value_json = encode_json(&record.value)?;
        self.engine.with_conn(|conn| {
            conn.execute(
                "INSERT INTO experience (key, value_json) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
                params![record.key, value_json],
            )
            .map_err(|err| write_failed(&err))?;
            Ok(())
        })
    }

    /// # Errors
    ///
    /// [`StoreError::ReadFailed`] on engine failure; a missing key is `Ok(None)`.
    pub fn get(&self, key: &str) -> Result<Option<ExperienceRecord>, StoreError> {
        self.engine.with_conn(|conn| {
            let value_json: Option<String> = conn
                .query_row(
                    "SELECT value_json FROM experience WHERE key = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|err| read_failed(&err))?;
            value_json
                .map(|text| Ok(ExperienceRecord { key: key.to_string(), value: decode_json(&text)? }))
                .transpose()
        })
    }

    /// # Errors
    ///
    /// [`StoreError::ReadFailed`] on engine failure.
    pub fn get_all(&self) -> Result<Vec<ExperienceRecord>, StoreError> {
        self.engine.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT key, value_json FROM experience ORDER BY key ASC")
                .map_err(|err| read_failed(&err))?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
                .map_err(|err| read_failed(&err))?;
            let mut records = Vec::new();
            for row in rows {
                let (key, value_json) = row.map_err(|err| read_failed(&err))?;
                records.push(ExperienceRecord { key, value: decode_json(&value_json)? });
            }
            Ok(records)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn temp_engine() -> anyhow::Result<(tempfile::TempDir, Arc<StorageEngine>)> {
        let dir = tempfile::tempdir()?;
        let engine = Arc::new(StorageEngine::new(dir.path().join("stagekit.db")));
        Ok((dir, engine))
    }

    fn sample_file(id: &str, uploaded_at: OffsetDateTime) -> FileRecord {
        FileRecord {
            id: id.to_string(),
            name: format!("{id}.jpg"),
            content_type: ContentType::Image,
            data: "data:image/jpeg;base64,AAAA".to_string(),
            original_name: format!("{id}.jpg"),
            size_bytes: 2048,
            uploaded_at,
            optimized: false,
            heavy: false,
        }
    }

    #[test]
    fn put_overwrites_the_whole_record() -> anyhow::Result<()> {
        let (_dir, engine) = temp_engine()?;
        let files = FilesRepo::new(engine);
        let mut record = sample_file("a", OffsetDateTime::UNIX_EPOCH);
        files.put(&record)?;

        record.name = "renamed.jpg".to_string();
        record.size_bytes = 4096;
        record.optimized = true;
        files.put(&record)?;

        let stored = files.get("a")?.ok_or_else(|| anyhow::anyhow!("record missing"))?;
        assert_eq!(stored, record);
        assert_eq!(files.get_all()?.len(), 1);
        Ok(())
    }

    #[test]
    fn missing_key_reads_as_none() -> anyhow::Result<()> {
        let (_dir, engine) = temp_engine()?;
        let files = FilesRepo::new(Arc::clone(&engine));
        let settings = SettingsRepo::new(Arc::clone(&engine));
        let admin = AdminRepo::new(engine);
        assert_eq!(files.get("nope")?, None);
        assert_eq!(settings.get("nope")?, None);
        assert_eq!(admin.get("nope")?, None);
        Ok(())
    }

    #[test]
    fn delete_is_a_noop_for_absent_ids() -> anyhow::Result<()> {
        let (_dir, engine) = temp_engine()?;
        let files = FilesRepo::new(engine);
        files.delete("absent")?;

        files.put(&sample_file("a", OffsetDateTime::UNIX_EPOCH))?;
        files.delete("a")?;
        assert_eq!(files.get("a")?, None);
        Ok(())
    }

    #[test]
    fn save_all_writes_a_batch_in_upload_order() -> anyhow::Result<()> {
        let (_dir, engine) = temp_engine()?;
        let files = FilesRepo::new(engine);
        let early = OffsetDateTime::UNIX_EPOCH;
        let late = early + time::Duration::hours(1);
        files.save_all(&[
            sample_file("b", late),
            sample_file("c", early),
            sample_file("a", early),
        ])?;

        let ids: Vec<String> = files.get_all()?.into_iter().map(|f| f.id).collect();
        assert_eq!(ids, vec!["a", "c", "b"]);
        Ok(())
    }

    #[test]
    fn settings_writes_stamp_strictly_increasing_timestamps() -> anyhow::Result<()> {
        let (_dir, engine) = temp_engine()?;
        let settings = SettingsRepo::new(engine);
        let first = settings.put("introSettings", &json!({"title": "A"}))?;
        let second = settings.put("introSettings", &json!({"title": "B"}))?;
        assert!(second.last_modified > first.last_modified);

        let stored = settings.get("introSettings")?.ok_or_else(|| anyhow::anyhow!("missing"))?;
        assert_eq!(stored.value, json!({"title": "B"}));
        assert_eq!(stored.last_modified, second.last_modified);
        Ok(())
    }

    #[test]
    fn scope_tag_persists_and_plain_put_clears_it() -> anyhow::Result<()> {
        let (_dir, engine) = temp_engine()?;
        let settings = SettingsRepo::new(engine);
        settings.put_scoped("audioSettings", &json!({"volume": 0.5}), "device-local")?;
        let scoped = settings.get("audioSettings")?.ok_or_else(|| anyhow::anyhow!("missing"))?;
        assert_eq!(scoped.scope.as_deref(), Some("device-local"));

        settings.put("audioSettings", &json!({"volume": 0.7}))?;
        let plain = settings.get("audioSettings")?.ok_or_else(|| anyhow::anyhow!("missing"))?;
        assert_eq!(plain.scope, None);
        Ok(())
    }

    #[test]
    fn data_survives_reopening_the_database() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("stagekit.db");

        let engine = Arc::new(StorageEngine::new(&path));
        FilesRepo::new(Arc::clone(&engine)).put(&sample_file("a", OffsetDateTime::UNIX_EPOCH))?;
        engine.close();
        drop(engine);

        let reopened = Arc::new(StorageEngine::new(&path));
        reopened.open()?;
        let stored = FilesRepo::new(reopened).get("a")?;
        assert!(stored.is_some());
        Ok(())
    }

    #[test]
    fn schema_from_the_future_is_rejected() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("stagekit.db");

        let engine = StorageEngine::new(&path);
        engine.open()?;
        engine.with_conn(|conn| {
            conn.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                params![SCHEMA_VERSION + 1, "2099-01-01T00:00:00Z"],
            )
            .map_err(|err| write_failed(&err))?;
            Ok(())
        })?;
        engine.close();

        let newer = StorageEngine::new(&path);
        assert!(matches!(newer.open(), Err(StoreError::StoreUnavailable(_))));
        Ok(())
    }

    #[test]
    fn analytics_and_experience_round_trip() -> anyhow::Result<()> {
        let (_dir, engine) = temp_engine()?;
        let analytics = AnalyticsRepo::new(Arc::clone(&engine));
        let experience = ExperienceRepo::new(Arc::clone(&engine));
        let admin = AdminRepo::new(engine);

        analytics.put(&AnalyticsRecord {
            key: "usageAnalytics".to_string(),
            data: json!({"opens": 12}),
            kind: "usage".to_string(),
        })?;
        experience.put(&ExperienceRecord {
            key: "experienceData".to_string(),
            value: json!({"slides": []}),
        })?;
        admin.put(&AdminRecord {
            key: "adminSession".to_string(),
            value: json!({"token": "t"}),
        })?;

        let bucket = analytics.get("usageAnalytics")?.ok_or_else(|| anyhow::anyhow!("missing"))?;
        assert_eq!(bucket.kind, "usage");
        assert_eq!(bucket.data, json!({"opens": 12}));
        assert_eq!(analytics.get_all()?.len(), 1);
        assert!(experience.get("experienceData")?.is_some());
        assert_eq!(admin.get_all()?.len(), 1);
        Ok(())
    }
}
