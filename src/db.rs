//! Metadata repository: one record per content digest.
//!
//! The SQLite implementation follows the raw-statement style of the rest of
//! the service: explicit `CREATE TABLE IF NOT EXISTS` at init, parameterized
//! statements everywhere else. Column names in projection queries are always
//! taken from the static field registry, never from caller input.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::{ConnectionTrait, Database, DatabaseConnection, QueryResult, Statement};
use serde_json::{Map, Value};
use std::path::Path;

use crate::error::{AppError, Result};
use crate::record::{canonical_field, ExtractedString, FileRecord, ScanStatus};

/// Attempts before a concurrent-writer conflict is surfaced to the caller.
const MERGE_RETRIES: usize = 3;

#[async_trait]
pub trait MetadataRepository: Send + Sync {
    /// Admission primitive: insert the record skeleton unless a record for
    /// this digest already exists. Returns `true` if a record was created.
    /// Re-admission never overwrites existing metadata.
    async fn create_if_absent(&self, record: &FileRecord) -> Result<bool>;

    /// Point lookup; `NotFound` when the digest is unknown.
    async fn get(&self, digest: &str) -> Result<FileRecord>;

    /// Read-merge-write partial update under optimistic concurrency.
    /// Retried on revision conflict; returns the updated record.
    async fn merge_update(&self, digest: &str, patch: &Map<String, Value>) -> Result<FileRecord>;

    /// List records, optionally projecting a subset of fields. An empty
    /// field list means all fields. Unknown field names fail with
    /// `InvalidFilter` before any query is issued.
    async fn list_projected(&self, fields: &[String]) -> Result<Vec<Value>>;

    /// Check administrative credentials for destructive operations.
    async fn verify_admin(&self, username: &str, password: &str) -> Result<()>;

    /// Delete every record. Privileged and irreversible; callers must have
    /// passed `verify_admin` first. Returns the number of deleted records.
    async fn flush_all(&self) -> Result<u64>;
}

#[derive(Debug)]
pub struct SqliteRepository {
    db: DatabaseConnection,
    admin_username: String,
    admin_password: String,
}

impl SqliteRepository {
    /// Open (or create) the database file and ensure the schema exists.
    pub async fn open(
        db_path: &Path,
        admin_username: String,
        admin_password: String,
    ) -> Result<Self> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                AppError::Storage(format!(
                    "creating database directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }
        let db_url = format!("sqlite:{}?mode=rwc", db_path.display());
        tracing::info!("Connecting to database: {}", db_url);
        Self::connect(&db_url, admin_username, admin_password).await
    }

    /// Connect to an arbitrary SQLite URL.
    pub async fn connect(
        db_url: &str,
        admin_username: String,
        admin_password: String,
    ) -> Result<Self> {
        let db = Database::connect(db_url).await?;
        create_tables(&db).await?;
        Ok(Self {
            db,
            admin_username,
            admin_password,
        })
    }

    fn stmt(&self, sql: &str, values: Vec<sea_orm::Value>) -> Statement {
        Statement::from_sql_and_values(self.db.get_database_backend(), sql, values)
    }

    fn row_to_record(row: &QueryResult) -> Result<FileRecord> {
        let first_seen: String = row.try_get("", "first_seen")?;
        let first_seen = DateTime::parse_from_rfc3339(&first_seen)
            .map_err(|e| AppError::Storage(format!("malformed first_seen timestamp: {}", e)))?
            .with_timezone(&Utc);

        let status: i64 = row.try_get("", "status")?;
        let status = ScanStatus::try_from(status).map_err(AppError::Storage)?;

        let enrichment: String = row.try_get("", "enrichment")?;
        let enrichment: Map<String, Value> = serde_json::from_str(&enrichment)
            .map_err(|e| AppError::Storage(format!("malformed enrichment column: {}", e)))?;

        let strings: Option<String> = row.try_get("", "strings")?;
        let strings: Option<Vec<ExtractedString>> = match strings {
            Some(s) => Some(
                serde_json::from_str(&s)
                    .map_err(|e| AppError::Storage(format!("malformed strings column: {}", e)))?,
            ),
            None => None,
        };

        Ok(FileRecord {
            digest: row.try_get("", "digest")?,
            size: row.try_get("", "size")?,
            first_seen,
            status,
            revision: row.try_get("", "revision")?,
            enrichment,
            file_type: row.try_get("", "file_type")?,
            packer: row.try_get("", "packer")?,
            strings,
        })
    }
}

async fn create_tables(db: &DatabaseConnection) -> Result<()> {
    db.execute(Statement::from_string(
        db.get_database_backend(),
        r#"
        CREATE TABLE IF NOT EXISTS files (
            digest TEXT PRIMARY KEY,
            size INTEGER NOT NULL,
            first_seen TEXT NOT NULL,
            status INTEGER NOT NULL DEFAULT 0,
            revision INTEGER NOT NULL DEFAULT 0,
            enrichment TEXT NOT NULL DEFAULT '{}',
            file_type TEXT,
            packer TEXT,
            strings TEXT
        )
        "#
        .to_string(),
    ))
    .await?;

    tracing::info!("Database tables initialized");
    Ok(())
}

#[async_trait]
impl MetadataRepository for SqliteRepository {
    async fn create_if_absent(&self, record: &FileRecord) -> Result<bool> {
        let strings = match &record.strings {
            Some(s) => Some(
                serde_json::to_string(s)
                    .map_err(|e| AppError::Storage(format!("serializing strings: {}", e)))?,
            ),
            None => None,
        };
        let enrichment = serde_json::to_string(&record.enrichment)
            .map_err(|e| AppError::Storage(format!("serializing enrichment: {}", e)))?;

        let result = self
            .db
            .execute(self.stmt(
                r#"
                INSERT INTO files
                    (digest, size, first_seen, status, revision, enrichment, file_type, packer, strings)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(digest) DO NOTHING
                "#,
                vec![
                    record.digest.clone().into(),
                    record.size.into(),
                    record.first_seen.to_rfc3339().into(),
                    i64::from(record.status).into(),
                    record.revision.into(),
                    enrichment.into(),
                    record.file_type.clone().into(),
                    record.packer.clone().into(),
                    strings.into(),
                ],
            ))
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn get(&self, digest: &str) -> Result<FileRecord> {
        let row = self
            .db
            .query_one(self.stmt(
                "SELECT * FROM files WHERE digest = ?",
                vec![digest.into()],
            ))
            .await?;

        match row {
            Some(row) => Self::row_to_record(&row),
            None => Err(AppError::NotFound(digest.to_string())),
        }
    }

    async fn merge_update(&self, digest: &str, patch: &Map<String, Value>) -> Result<FileRecord> {
        for _ in 0..MERGE_RETRIES {
            let mut record = self.get(digest).await?;
            let read_revision = record.revision;
            record.apply_patch(patch)?;
            record.revision = read_revision + 1;

            let strings = match &record.strings {
                Some(s) => Some(
                    serde_json::to_string(s)
                        .map_err(|e| AppError::Storage(format!("serializing strings: {}", e)))?,
                ),
                None => None,
            };
            let enrichment = serde_json::to_string(&record.enrichment)
                .map_err(|e| AppError::Storage(format!("serializing enrichment: {}", e)))?;

            // Guarded by the revision we read; zero rows affected means a
            // concurrent writer got there first and we re-read.
            let result = self
                .db
                .execute(self.stmt(
                    r#"
                    UPDATE files
                    SET status = ?, revision = ?, enrichment = ?,
                        file_type = ?, packer = ?, strings = ?
                    WHERE digest = ? AND revision = ?
                    "#,
                    vec![
                        i64::from(record.status).into(),
                        record.revision.into(),
                        enrichment.into(),
                        record.file_type.clone().into(),
                        record.packer.clone().into(),
                        strings.into(),
                        digest.into(),
                        read_revision.into(),
                    ],
                ))
                .await?;

            if result.rows_affected() == 1 {
                return Ok(record);
            }
            tracing::debug!(digest, "merge update lost a revision race, retrying");
        }

        Err(AppError::Storage(format!(
            "metadata update for {} conflicted {} times",
            digest, MERGE_RETRIES
        )))
    }

    async fn list_projected(&self, fields: &[String]) -> Result<Vec<Value>> {
        // Resolve every requested name to its canonical static column name
        // before building any SQL; unknown names never reach the database.
        let columns: Vec<&'static str> = if fields.is_empty() {
            crate::record::PROJECTION_FIELDS.to_vec()
        } else {
            fields
                .iter()
                .map(|f| {
                    canonical_field(f).ok_or_else(|| AppError::InvalidFilter(f.clone()))
                })
                .collect::<Result<_>>()?
        };

        let sql = format!("SELECT {} FROM files", columns.join(", "));
        let rows = self.db.query_all(self.stmt(&sql, vec![])).await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let mut obj = Map::new();
            for col in &columns {
                let value = match *col {
                    "digest" | "first_seen" => {
                        Value::String(row.try_get::<String>("", col)?)
                    }
                    "size" | "status" | "revision" => {
                        Value::from(row.try_get::<i64>("", col)?)
                    }
                    "file_type" | "packer" => row
                        .try_get::<Option<String>>("", col)?
                        .map(Value::String)
                        .unwrap_or(Value::Null),
                    "strings" => match row.try_get::<Option<String>>("", col)? {
                        Some(s) => serde_json::from_str(&s).map_err(|e| {
                            AppError::Storage(format!("malformed strings column: {}", e))
                        })?,
                        None => Value::Null,
                    },
                    "enrichment" => {
                        let s = row.try_get::<String>("", col)?;
                        serde_json::from_str(&s).map_err(|e| {
                            AppError::Storage(format!("malformed enrichment column: {}", e))
                        })?
                    }
                    _ => unreachable!("column names come from the field registry"),
                };
                obj.insert((*col).to_string(), value);
            }
            out.push(Value::Object(obj));
        }

        Ok(out)
    }

    async fn verify_admin(&self, username: &str, password: &str) -> Result<()> {
        if username == self.admin_username && password == self.admin_password {
            Ok(())
        } else {
            Err(AppError::AuthFailed)
        }
    }

    async fn flush_all(&self) -> Result<u64> {
        let result = self
            .db
            .execute(Statement::from_string(
                self.db.get_database_backend(),
                "DELETE FROM files".to_string(),
            ))
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    // File-backed test databases: pooled connections to `sqlite::memory:`
    // would each see their own empty database.
    async fn repo() -> (SqliteRepository, TempDir) {
        let dir = TempDir::new().unwrap();
        let repo = SqliteRepository::open(
            &dir.path().join("test.db"),
            "admin".into(),
            "hunter2".into(),
        )
        .await
        .unwrap();
        (repo, dir)
    }

    fn digest(n: u8) -> String {
        format!("{:02x}", n).repeat(32)
    }

    #[tokio::test]
    async fn test_create_then_get() {
        let (repo, _dir) = repo().await;
        let record = FileRecord::new(digest(1), 42);

        assert!(repo.create_if_absent(&record).await.unwrap());

        let fetched = repo.get(&digest(1)).await.unwrap();
        assert_eq!(fetched.digest, record.digest);
        assert_eq!(fetched.size, 42);
        assert_eq!(fetched.status, ScanStatus::Queued);
        assert_eq!(fetched.revision, 0);
    }

    #[tokio::test]
    async fn test_get_unknown_digest_is_not_found() {
        let (repo, _dir) = repo().await;
        let err = repo.get(&digest(9)).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_readmission_preserves_existing_record() {
        let (repo, _dir) = repo().await;
        let record = FileRecord::new(digest(2), 10);
        assert!(repo.create_if_absent(&record).await.unwrap());

        // Analysis results land on the record.
        repo.merge_update(
            &digest(2),
            json!({ "enrichment": { "engine-a": { "verdict": "clean" } }, "status": 2 })
                .as_object()
                .unwrap(),
        )
        .await
        .unwrap();

        // Second admission of identical content must not clobber anything.
        let again = FileRecord::new(digest(2), 10);
        assert!(!repo.create_if_absent(&again).await.unwrap());

        let fetched = repo.get(&digest(2)).await.unwrap();
        assert_eq!(fetched.status, ScanStatus::Finished);
        assert!(fetched.enrichment.contains_key("engine-a"));
    }

    #[tokio::test]
    async fn test_merge_update_merges_enrichment() {
        let (repo, _dir) = repo().await;
        repo.create_if_absent(&FileRecord::new(digest(3), 5))
            .await
            .unwrap();

        repo.merge_update(
            &digest(3),
            json!({ "enrichment": { "a": 1 } }).as_object().unwrap(),
        )
        .await
        .unwrap();
        let updated = repo
            .merge_update(
                &digest(3),
                json!({ "enrichment": { "b": 2 } }).as_object().unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(updated.enrichment.len(), 2);
        assert_eq!(updated.revision, 2);

        let fetched = repo.get(&digest(3)).await.unwrap();
        assert_eq!(fetched.enrichment, updated.enrichment);
    }

    #[tokio::test]
    async fn test_concurrent_merge_updates_preserve_both_patches() {
        let (repo, _dir) = repo().await;
        repo.create_if_absent(&FileRecord::new(digest(10), 1))
            .await
            .unwrap();
        let repo = std::sync::Arc::new(repo);

        // Both writers may read revision 0; the loser of the guarded
        // UPDATE must re-read and retry rather than clobber.
        let a = {
            let repo = repo.clone();
            tokio::spawn(async move {
                let patch = json!({ "enrichment": { "engine-a": { "verdict": "clean" } } });
                repo.merge_update(&digest(10), patch.as_object().unwrap())
                    .await
            })
        };
        let b = {
            let repo = repo.clone();
            tokio::spawn(async move {
                let patch = json!({ "enrichment": { "engine-b": { "verdict": "malicious" } } });
                repo.merge_update(&digest(10), patch.as_object().unwrap())
                    .await
            })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        let fetched = repo.get(&digest(10)).await.unwrap();
        assert!(fetched.enrichment.contains_key("engine-a"));
        assert!(fetched.enrichment.contains_key("engine-b"));
        assert_eq!(fetched.revision, 2);
    }

    #[tokio::test]
    async fn test_merge_update_rejects_backward_status() {
        let (repo, _dir) = repo().await;
        repo.create_if_absent(&FileRecord::new(digest(4), 5))
            .await
            .unwrap();
        repo.merge_update(&digest(4), json!({ "status": 2 }).as_object().unwrap())
            .await
            .unwrap();

        let err = repo
            .merge_update(&digest(4), json!({ "status": 1 }).as_object().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        let fetched = repo.get(&digest(4)).await.unwrap();
        assert_eq!(fetched.status, ScanStatus::Finished);
    }

    #[tokio::test]
    async fn test_projection_selects_requested_fields() {
        let (repo, _dir) = repo().await;
        repo.create_if_absent(&FileRecord::new(digest(5), 123))
            .await
            .unwrap();

        let rows = repo
            .list_projected(&["digest".to_string(), "size".to_string()])
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        let obj = rows[0].as_object().unwrap();
        assert_eq!(obj.len(), 2);
        assert_eq!(obj["size"], json!(123));
    }

    #[tokio::test]
    async fn test_projection_empty_fields_means_all() {
        let (repo, _dir) = repo().await;
        repo.create_if_absent(&FileRecord::new(digest(6), 1))
            .await
            .unwrap();

        let rows = repo.list_projected(&[]).await.unwrap();
        let obj = rows[0].as_object().unwrap();
        assert_eq!(obj.len(), crate::record::PROJECTION_FIELDS.len());
    }

    #[tokio::test]
    async fn test_projection_rejects_unknown_field() {
        let (repo, _dir) = repo().await;
        let err = repo
            .list_projected(&["digest; DROP TABLE files".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidFilter(_)));
    }

    #[tokio::test]
    async fn test_open_surfaces_directory_creation_failure() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"not a directory").unwrap();

        let err = SqliteRepository::open(
            &blocker.join("sub").join("test.db"),
            "admin".into(),
            "pw".into(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::Storage(_)));
        assert!(err.to_string().contains("creating database directory"));
    }

    #[tokio::test]
    async fn test_flush_requires_valid_credentials() {
        let (repo, _dir) = repo().await;
        let err = repo.verify_admin("admin", "wrong").await.unwrap_err();
        assert!(matches!(err, AppError::AuthFailed));
        repo.verify_admin("admin", "hunter2").await.unwrap();
    }

    #[tokio::test]
    async fn test_flush_all_empties_repository() {
        let (repo, _dir) = repo().await;
        repo.create_if_absent(&FileRecord::new(digest(7), 1))
            .await
            .unwrap();
        repo.create_if_absent(&FileRecord::new(digest(8), 2))
            .await
            .unwrap();

        let deleted = repo.flush_all().await.unwrap();
        assert_eq!(deleted, 2);

        let err = repo.get(&digest(7)).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }
}
