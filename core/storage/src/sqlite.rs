//! SQLite-backed metadata repository.
//!
//! Folder and file rows live in a single database file next to the blob
//! area. Each trait call runs under one connection lock; multi-row updates
//! run inside a transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, Row};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::info;

use crate::repository::{
    FileRecord, FolderCredentials, FolderRecord, MediaHints, MetadataRepository, NewFile,
    NewFolder,
};
use hidevault_common::{Error, FileId, FolderId, Result};
use hidevault_crypto::{KdfParams, WrappedKey};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS folders (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    parent_id INTEGER REFERENCES folders(id),
    salt BLOB NOT NULL,
    password_hash BLOB NOT NULL,
    kdf_memory_cost INTEGER NOT NULL,
    kdf_time_cost INTEGER NOT NULL,
    kdf_parallelism INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    modified_at INTEGER NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_folders_sibling_name
    ON folders(COALESCE(parent_id, 0), name);

CREATE TABLE IF NOT EXISTS files (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    folder_id INTEGER NOT NULL REFERENCES folders(id),
    original_file_name TEXT NOT NULL,
    mime_type TEXT NOT NULL,
    encrypted_file_name TEXT NOT NULL UNIQUE,
    file_size INTEGER NOT NULL,
    encrypted_size INTEGER NOT NULL,
    wrapped_key BLOB NOT NULL,
    is_image INTEGER NOT NULL,
    is_video INTEGER NOT NULL,
    duration_ms INTEGER,
    width INTEGER,
    height INTEGER,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_files_folder ON files(folder_id);
"#;

const FOLDER_COLUMNS: &str = "id, name, parent_id, salt, password_hash, kdf_memory_cost, \
     kdf_time_cost, kdf_parallelism, created_at, modified_at";

const FILE_COLUMNS: &str = "id, folder_id, original_file_name, mime_type, encrypted_file_name, \
     file_size, encrypted_size, wrapped_key, is_image, is_video, duration_ms, width, height, \
     created_at";

fn storage_err(e: rusqlite::Error) -> Error {
    Error::Storage(e.to_string())
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::ConstraintViolation
    )
}

fn to_sql_u64(value: u64, column: &str) -> Result<i64> {
    i64::try_from(value).map_err(|_| Error::InvalidInput(format!("{} out of range", column)))
}

fn from_millis(millis: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| Error::Corrupted(format!("Invalid stored timestamp: {}", millis)))
}

/// Folder row as read from SQLite, before validation.
struct FolderRow {
    id: i64,
    name: String,
    parent_id: Option<i64>,
    salt: Vec<u8>,
    password_hash: Vec<u8>,
    kdf_params: KdfParams,
    created_at: i64,
    modified_at: i64,
}

impl FolderRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            parent_id: row.get(2)?,
            salt: row.get(3)?,
            password_hash: row.get(4)?,
            kdf_params: KdfParams {
                memory_cost: row.get(5)?,
                time_cost: row.get(6)?,
                parallelism: row.get(7)?,
            },
            created_at: row.get(8)?,
            modified_at: row.get(9)?,
        })
    }

    fn into_record(self) -> Result<FolderRecord> {
        Ok(FolderRecord {
            id: FolderId::new(self.id),
            name: self.name,
            parent_id: self.parent_id.map(FolderId::new),
            salt: self.salt,
            password_hash: self.password_hash,
            kdf_params: self.kdf_params,
            created_at: from_millis(self.created_at)?,
            modified_at: from_millis(self.modified_at)?,
        })
    }
}

/// File row as read from SQLite, before validation.
struct FileRow {
    id: i64,
    folder_id: i64,
    original_file_name: String,
    mime_type: String,
    encrypted_file_name: String,
    file_size: i64,
    encrypted_size: i64,
    wrapped_key: Vec<u8>,
    is_image: bool,
    is_video: bool,
    duration_ms: Option<i64>,
    width: Option<u32>,
    height: Option<u32>,
    created_at: i64,
}

impl FileRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            folder_id: row.get(1)?,
            original_file_name: row.get(2)?,
            mime_type: row.get(3)?,
            encrypted_file_name: row.get(4)?,
            file_size: row.get(5)?,
            encrypted_size: row.get(6)?,
            wrapped_key: row.get(7)?,
            is_image: row.get(8)?,
            is_video: row.get(9)?,
            duration_ms: row.get(10)?,
            width: row.get(11)?,
            height: row.get(12)?,
            created_at: row.get(13)?,
        })
    }

    fn into_record(self) -> Result<FileRecord> {
        let size = |v: i64, what: &str| {
            u64::try_from(v).map_err(|_| Error::Corrupted(format!("Negative {} stored", what)))
        };
        Ok(FileRecord {
            id: FileId::new(self.id),
            folder_id: FolderId::new(self.folder_id),
            original_file_name: self.original_file_name,
            mime_type: self.mime_type,
            encrypted_file_name: self.encrypted_file_name,
            file_size: size(self.file_size, "file size")?,
            encrypted_size: size(self.encrypted_size, "encrypted size")?,
            wrapped_key: WrappedKey::from_bytes(self.wrapped_key),
            media: MediaHints {
                is_image: self.is_image,
                is_video: self.is_video,
                duration_ms: self
                    .duration_ms
                    .map(|d| size(d, "duration"))
                    .transpose()?,
                width: self.width,
                height: self.height,
            },
            created_at: from_millis(self.created_at)?,
        })
    }
}

/// Metadata repository using SQLite.
pub struct SqliteRepository {
    conn: Mutex<Connection>,
}

impl SqliteRepository {
    /// Create or open a repository database.
    ///
    /// # Errors
    /// - Database creation or migration failure
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path).map_err(storage_err)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(storage_err)?;
        conn.execute_batch(SCHEMA).map_err(storage_err)?;

        info!("Metadata repository opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory repository (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Storage("Connection lock poisoned".to_string()))
    }

    fn query_folder(conn: &Connection, sql: &str, arg: &dyn rusqlite::ToSql) -> Result<Option<FolderRecord>> {
        let mut stmt = conn.prepare(sql).map_err(storage_err)?;
        match stmt.query_row([arg], FolderRow::from_row) {
            Ok(row) => Ok(Some(row.into_record()?)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(storage_err(e)),
        }
    }

    fn folder_salt(conn: &Connection, id: FolderId) -> Result<Option<Vec<u8>>> {
        match conn.query_row("SELECT salt FROM folders WHERE id = ?1", [id.get()], |row| {
            row.get(0)
        }) {
            Ok(salt) => Ok(Some(salt)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(storage_err(e)),
        }
    }

    fn folder_exists(conn: &Connection, id: FolderId) -> Result<bool> {
        conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM folders WHERE id = ?1)",
            [id.get()],
            |row| row.get(0),
        )
        .map_err(storage_err)
    }
}

#[async_trait]
impl MetadataRepository for SqliteRepository {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn create_folder(&self, folder: NewFolder) -> Result<FolderId> {
        let conn = self.conn()?;

        if let Some(parent) = folder.parent_id {
            if !Self::folder_exists(&conn, parent)? {
                return Err(Error::NotFound(format!("Parent folder {}", parent)));
            }
        }

        let now = Utc::now().timestamp_millis();
        let result = conn.execute(
            r#"
            INSERT INTO folders
            (name, parent_id, salt, password_hash, kdf_memory_cost, kdf_time_cost,
             kdf_parallelism, created_at, modified_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
            "#,
            params![
                folder.name,
                folder.parent_id.map(|p| p.get()),
                folder.salt,
                folder.password_hash,
                folder.kdf_params.memory_cost,
                folder.kdf_params.time_cost,
                folder.kdf_params.parallelism,
                now,
            ],
        );

        match result {
            Ok(_) => Ok(FolderId::new(conn.last_insert_rowid())),
            Err(e) if is_constraint_violation(&e) => Err(Error::AlreadyExists(format!(
                "Folder named '{}' already exists here",
                folder.name
            ))),
            Err(e) => Err(storage_err(e)),
        }
    }

    async fn get_folder(&self, id: FolderId) -> Result<Option<FolderRecord>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM folders WHERE id = ?1", FOLDER_COLUMNS);
        Self::query_folder(&conn, &sql, &id.get())
    }

    async fn find_folder_by_name(&self, name: &str) -> Result<Option<FolderRecord>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM folders WHERE name = ?1 ORDER BY id LIMIT 1",
            FOLDER_COLUMNS
        );
        Self::query_folder(&conn, &sql, &name)
    }

    async fn list_child_folders(&self, parent: Option<FolderId>) -> Result<Vec<FolderRecord>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM folders WHERE parent_id IS ?1 ORDER BY id",
            FOLDER_COLUMNS
        );
        let mut stmt = conn.prepare(&sql).map_err(storage_err)?;
        let rows = stmt
            .query_map([parent.map(|p| p.get())], FolderRow::from_row)
            .map_err(storage_err)?;

        let mut folders = Vec::new();
        for row in rows {
            folders.push(row.map_err(storage_err)?.into_record()?);
        }
        Ok(folders)
    }

    async fn delete_folder(&self, id: FolderId) -> Result<()> {
        let conn = self.conn()?;

        if !Self::folder_exists(&conn, id)? {
            return Err(Error::NotFound(format!("Folder {}", id)));
        }

        let (files, children): (i64, i64) = conn
            .query_row(
                r#"
                SELECT (SELECT COUNT(*) FROM files WHERE folder_id = ?1),
                       (SELECT COUNT(*) FROM folders WHERE parent_id = ?1)
                "#,
                [id.get()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(storage_err)?;
        if files > 0 {
            return Err(Error::Conflict(format!("Folder {} still has files", id)));
        }
        if children > 0 {
            return Err(Error::Conflict(format!("Folder {} still has subfolders", id)));
        }

        conn.execute("DELETE FROM folders WHERE id = ?1", [id.get()])
            .map_err(storage_err)?;
        Ok(())
    }

    async fn rekey_folder(
        &self,
        id: FolderId,
        credentials: FolderCredentials,
        wrapped_keys: Vec<(FileId, WrappedKey)>,
    ) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(storage_err)?;

        if !Self::folder_exists(&tx, id)? {
            return Err(Error::NotFound(format!("Folder {}", id)));
        }

        let current: BTreeSet<i64> = {
            let mut stmt = tx
                .prepare("SELECT id FROM files WHERE folder_id = ?1")
                .map_err(storage_err)?;
            let ids = stmt
                .query_map([id.get()], |row| row.get::<_, i64>(0))
                .map_err(storage_err)?;
            ids.collect::<rusqlite::Result<_>>().map_err(storage_err)?
        };
        let supplied: BTreeSet<i64> = wrapped_keys.iter().map(|(f, _)| f.get()).collect();
        if current != supplied || supplied.len() != wrapped_keys.len() {
            return Err(Error::Conflict(format!(
                "Rekey of folder {} does not cover its current files",
                id
            )));
        }

        for (file_id, wrapped) in &wrapped_keys {
            tx.execute(
                "UPDATE files SET wrapped_key = ?1 WHERE id = ?2",
                params![wrapped.as_bytes(), file_id.get()],
            )
            .map_err(storage_err)?;
        }
        tx.execute(
            r#"
            UPDATE folders
            SET salt = ?1, password_hash = ?2, kdf_memory_cost = ?3, kdf_time_cost = ?4,
                kdf_parallelism = ?5, modified_at = ?6
            WHERE id = ?7
            "#,
            params![
                credentials.salt,
                credentials.password_hash,
                credentials.kdf_params.memory_cost,
                credentials.kdf_params.time_cost,
                credentials.kdf_params.parallelism,
                Utc::now().timestamp_millis(),
                id.get(),
            ],
        )
        .map_err(storage_err)?;

        tx.commit().map_err(storage_err)
    }

    async fn create_file(&self, file: NewFile) -> Result<FileId> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(storage_err)?;

        match Self::folder_salt(&tx, file.folder_id)? {
            None => return Err(Error::NotFound(format!("Folder {}", file.folder_id))),
            Some(salt) if salt != file.wrapped_under_salt => {
                return Err(Error::Conflict(format!(
                    "Folder {} was rekeyed during the import",
                    file.folder_id
                )));
            }
            Some(_) => {}
        }

        let now = Utc::now().timestamp_millis();
        tx.execute(
            r#"
            INSERT INTO files
            (folder_id, original_file_name, mime_type, encrypted_file_name, file_size,
             encrypted_size, wrapped_key, is_image, is_video, duration_ms, width, height,
             created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
            params![
                file.folder_id.get(),
                file.original_file_name,
                file.mime_type,
                file.encrypted_file_name,
                to_sql_u64(file.file_size, "file size")?,
                to_sql_u64(file.encrypted_size, "encrypted size")?,
                file.wrapped_key.as_bytes(),
                file.media.is_image,
                file.media.is_video,
                file.media
                    .duration_ms
                    .map(|d| to_sql_u64(d, "duration"))
                    .transpose()?,
                file.media.width,
                file.media.height,
                now,
            ],
        )
        .map_err(storage_err)?;
        let id = tx.last_insert_rowid();

        tx.execute(
            "UPDATE folders SET modified_at = ?1 WHERE id = ?2",
            params![now, file.folder_id.get()],
        )
        .map_err(storage_err)?;

        tx.commit().map_err(storage_err)?;
        Ok(FileId::new(id))
    }

    async fn get_file(&self, id: FileId) -> Result<Option<FileRecord>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM files WHERE id = ?1", FILE_COLUMNS);
        let mut stmt = conn.prepare(&sql).map_err(storage_err)?;
        match stmt.query_row([id.get()], FileRow::from_row) {
            Ok(row) => Ok(Some(row.into_record()?)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(storage_err(e)),
        }
    }

    async fn list_files(&self, folder_id: FolderId) -> Result<Vec<FileRecord>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM files WHERE folder_id = ?1 ORDER BY id",
            FILE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql).map_err(storage_err)?;
        let rows = stmt
            .query_map([folder_id.get()], FileRow::from_row)
            .map_err(storage_err)?;

        let mut files = Vec::new();
        for row in rows {
            files.push(row.map_err(storage_err)?.into_record()?);
        }
        Ok(files)
    }

    async fn delete_file(&self, id: FileId) -> Result<()> {
        let conn = self.conn()?;
        let deleted = conn
            .execute("DELETE FROM files WHERE id = ?1", [id.get()])
            .map_err(storage_err)?;
        if deleted == 0 {
            return Err(Error::NotFound(format!("File {}", id)));
        }
        Ok(())
    }
}
