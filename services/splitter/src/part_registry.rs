use crate::attachment_host::NoticeRef;
use crate::config::DatabaseConfig;
use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::FromRow;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// One row per upload attempt
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct FileEntry {
    /// Externally supplied file ID
    pub id: String,
    /// Uploading principal
    pub owner_id: String,
    /// Single-use upload credential
    #[serde(skip_serializing)]
    pub upload_token: String,
    /// Epoch-millis deadline for starting the upload, 0 once closed
    pub upload_expiry: i64,
    /// Filename, set when the upload starts
    pub name: Option<String>,
    /// MIME type, set when the upload starts
    pub content_type: Option<String>,
    /// Channel of the upload notice
    pub notice_channel_id: Option<String>,
    /// Message ID of the upload notice
    pub notice_message_id: Option<String>,
    /// When the token was issued (epoch millis)
    pub created_at: i64,
}

impl FileEntry {
    /// Reference to the notice announcing this file, if one was recorded
    pub fn notice(&self) -> Option<NoticeRef> {
        match (&self.notice_channel_id, &self.notice_message_id) {
            (Some(channel_id), Some(message_id)) => Some(NoticeRef {
                channel_id: channel_id.clone(),
                message_id: message_id.clone(),
            }),
            _ => None,
        }
    }
}

/// One row per uploaded part
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct PartEntry {
    pub file_id: String,
    /// Position of the part in the original byte stream
    pub part_index: i64,
    /// Host batch this part was uploaded in
    pub batch_ref: String,
    /// Durable fetch location
    pub url: String,
    pub size_bytes: i64,
}

/// A part about to be registered
#[derive(Debug, Clone)]
pub struct NewPart {
    pub part_index: i64,
    pub url: String,
    pub size_bytes: i64,
}

/// Result of a token lookup
#[derive(Debug, Clone, FromRow)]
pub struct TokenLookup {
    pub id: String,
    pub upload_expiry: i64,
}

impl TokenLookup {
    /// Whether an upload may still start at `now_ms`
    pub fn is_open(&self, now_ms: i64) -> bool {
        self.upload_expiry >= now_ms
    }
}

/// Metadata needed to serve downloads and check ownership
#[derive(Debug, Clone, FromRow)]
pub struct FileMetadata {
    pub name: Option<String>,
    pub content_type: Option<String>,
    pub owner_id: String,
}

/// Filename search result
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct FilenameMatch {
    pub id: String,
    pub name: String,
}

/// Sort order for owner file listings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileSort {
    Name,
    #[default]
    Date,
    Extension,
    ContentType,
}

/// Everything recorded about one file, for export
#[derive(Debug, Clone, Serialize)]
pub struct FileExport {
    pub id: String,
    pub name: Option<String>,
    pub content_type: Option<String>,
    pub notice: Option<NoticeRef>,
    pub created_at: i64,
    pub parts: Vec<ExportedPart>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportedPart {
    pub url: String,
    pub batch_ref: String,
    pub size_bytes: i64,
}

/// Durable store of files and their part locations
pub struct PartRegistry {
    pool: SqlitePool,
}

impl PartRegistry {
    /// Create a registry with a connection pool
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&config.url)
            .context("Invalid database URL")?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
            .connect_with(options)
            .await
            .context("Failed to open SQLite database")?;

        info!(url = %config.url, "Connected to registry database");

        Ok(Self { pool })
    }

    /// Create a migrated registry in a private in-memory database
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .context("Invalid in-memory database URL")?
            .foreign_keys(true);

        // Every connection to :memory: is its own database, so keep exactly one alive
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .context("Failed to open in-memory database")?;

        let registry = Self { pool };
        registry.run_migrations().await?;
        Ok(registry)
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }

    /// Create the file row for a freshly issued token
    #[instrument(skip(self, token))]
    pub async fn open_upload(
        &self,
        file_id: &str,
        owner_id: &str,
        token: &str,
        expiry_ms: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO files (id, owner_id, upload_token, upload_expiry, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(file_id)
        .bind(owner_id)
        .bind(token)
        .bind(expiry_ms)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await
        .context("Failed to insert file")?;

        debug!(expiry_ms = expiry_ms, "Upload opened");
        Ok(())
    }

    /// Find the file an upload token belongs to
    pub async fn file_by_token(&self, token: &str) -> Result<Option<TokenLookup>> {
        let lookup = sqlx::query_as::<_, TokenLookup>(
            r#"
            SELECT id, upload_expiry
            FROM files
            WHERE upload_token = ?
            "#,
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to query file by token")?;

        Ok(lookup)
    }

    /// Record name and content type. Only the first call for a file has an
    /// effect; returns whether this call set them.
    #[instrument(skip(self))]
    pub async fn set_metadata(&self, file_id: &str, name: &str, content_type: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE files
            SET name = ?, content_type = ?
            WHERE id = ? AND name IS NULL
            "#,
        )
        .bind(name)
        .bind(content_type)
        .bind(file_id)
        .execute(&self.pool)
        .await
        .context("Failed to set file metadata")?;

        Ok(result.rows_affected() > 0)
    }

    /// Get name, content type and owner of a file
    pub async fn metadata(&self, file_id: &str) -> Result<Option<FileMetadata>> {
        let metadata = sqlx::query_as::<_, FileMetadata>(
            r#"
            SELECT name, content_type, owner_id
            FROM files
            WHERE id = ?
            "#,
        )
        .bind(file_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to query file metadata")?;

        Ok(metadata)
    }

    /// Get the full file row
    pub async fn file(&self, file_id: &str) -> Result<Option<FileEntry>> {
        let file = sqlx::query_as::<_, FileEntry>(
            r#"
            SELECT id, owner_id, upload_token, upload_expiry, name, content_type,
                   notice_channel_id, notice_message_id, created_at
            FROM files
            WHERE id = ?
            "#,
        )
        .bind(file_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to query file")?;

        Ok(file)
    }

    /// Disable the upload token of a file
    #[instrument(skip(self))]
    pub async fn close_upload(&self, file_id: &str) -> Result<()> {
        sqlx::query("UPDATE files SET upload_expiry = 0 WHERE id = ?")
            .bind(file_id)
            .execute(&self.pool)
            .await
            .context("Failed to close upload")?;

        debug!("Upload closed");
        Ok(())
    }

    /// Register every part of one batch in a single transaction
    #[instrument(skip(self, parts), fields(count = parts.len()))]
    pub async fn add_parts(&self, file_id: &str, batch_ref: &str, parts: &[NewPart]) -> Result<()> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        for part in parts {
            sqlx::query(
                r#"
                INSERT INTO parts (file_id, part_index, batch_ref, url, size_bytes)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(file_id)
            .bind(part.part_index)
            .bind(batch_ref)
            .bind(&part.url)
            .bind(part.size_bytes)
            .execute(&mut *tx)
            .await
            .context("Failed to insert part")?;
        }

        tx.commit().await.context("Failed to commit transaction")?;

        debug!("Parts registered");
        Ok(())
    }

    /// Part URLs of a file in stream order
    pub async fn part_urls(&self, file_id: &str) -> Result<Vec<String>> {
        let urls = sqlx::query_scalar::<_, String>(
            r#"
            SELECT url
            FROM parts
            WHERE file_id = ?
            ORDER BY part_index ASC
            "#,
        )
        .bind(file_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to query part URLs")?;

        Ok(urls)
    }

    /// Parts of a file in stream order
    pub async fn parts(&self, file_id: &str) -> Result<Vec<PartEntry>> {
        let parts = sqlx::query_as::<_, PartEntry>(
            r#"
            SELECT file_id, part_index, batch_ref, url, size_bytes
            FROM parts
            WHERE file_id = ?
            ORDER BY part_index ASC
            "#,
        )
        .bind(file_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to query parts")?;

        Ok(parts)
    }

    /// Record where the upload notice of a file was posted
    #[instrument(skip(self))]
    pub async fn set_upload_info(&self, file_id: &str, notice: &NoticeRef) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE files
            SET notice_channel_id = ?, notice_message_id = ?
            WHERE id = ?
            "#,
        )
        .bind(&notice.channel_id)
        .bind(&notice.message_id)
        .bind(file_id)
        .execute(&self.pool)
        .await
        .context("Failed to set upload info")?;

        Ok(())
    }

    /// Where the upload notice of a file was posted. `None` if the file does
    /// not exist, `Some(None)` if no notice was recorded.
    pub async fn upload_info(&self, file_id: &str) -> Result<Option<Option<NoticeRef>>> {
        Ok(self.file(file_id).await?.map(|file| file.notice()))
    }

    /// Delete a file row; its parts go with it. Returns whether a row existed.
    #[instrument(skip(self))]
    pub async fn delete_file(&self, file_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM files WHERE id = ?")
            .bind(file_id)
            .execute(&self.pool)
            .await
            .context("Failed to delete file")?;

        debug!(deleted = result.rows_affected(), "File row deleted");
        Ok(result.rows_affected() > 0)
    }

    /// Named files of an owner whose name starts with `prefix`
    pub async fn filenames_by_owner(&self, owner_id: &str, prefix: &str) -> Result<Vec<FilenameMatch>> {
        let pattern = format!("{}%", escape_like(prefix));

        let matches = sqlx::query_as::<_, FilenameMatch>(
            r#"
            SELECT id, name
            FROM files
            WHERE owner_id = ?
              AND name IS NOT NULL
              AND name LIKE ? ESCAPE '\'
            ORDER BY name ASC
            "#,
        )
        .bind(owner_id)
        .bind(pattern)
        .fetch_all(&self.pool)
        .await
        .context("Failed to search filenames")?;

        Ok(matches)
    }

    /// Every file of an owner
    pub async fn files_by_owner(&self, owner_id: &str, sort: FileSort) -> Result<Vec<FileEntry>> {
        let mut files = sqlx::query_as::<_, FileEntry>(
            r#"
            SELECT id, owner_id, upload_token, upload_expiry, name, content_type,
                   notice_channel_id, notice_message_id, created_at
            FROM files
            WHERE owner_id = ?
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to query files by owner")?;

        match sort {
            FileSort::Date => {}
            FileSort::Name => files.sort_by(|a, b| a.name.cmp(&b.name)),
            FileSort::Extension => {
                files.sort_by(|a, b| extension(a.name.as_deref()).cmp(&extension(b.name.as_deref())))
            }
            FileSort::ContentType => files.sort_by(|a, b| a.content_type.cmp(&b.content_type)),
        }

        Ok(files)
    }

    /// Every file of an owner with its parts
    #[instrument(skip(self))]
    pub async fn export_by_owner(&self, owner_id: &str) -> Result<Vec<FileExport>> {
        let files = self.files_by_owner(owner_id, FileSort::Date).await?;

        let parts = sqlx::query_as::<_, PartEntry>(
            r#"
            SELECT p.file_id, p.part_index, p.batch_ref, p.url, p.size_bytes
            FROM parts p
            INNER JOIN files f ON f.id = p.file_id
            WHERE f.owner_id = ?
            ORDER BY p.file_id ASC, p.part_index ASC
            "#,
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to query parts by owner")?;

        let exports = files
            .into_iter()
            .map(|file| {
                let parts = parts
                    .iter()
                    .filter(|p| p.file_id == file.id)
                    .map(|p| ExportedPart {
                        url: p.url.clone(),
                        batch_ref: p.batch_ref.clone(),
                        size_bytes: p.size_bytes,
                    })
                    .collect();
                FileExport {
                    notice: file.notice(),
                    id: file.id,
                    name: file.name,
                    content_type: file.content_type,
                    created_at: file.created_at,
                    parts,
                }
            })
            .collect();

        Ok(exports)
    }

    /// Check that the database answers
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("Registry database unreachable")?;
        Ok(())
    }

    /// Get the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn extension(name: Option<&str>) -> Option<&str> {
    name.and_then(|n| n.rsplit_once('.')).map(|(_, ext)| ext)
}
