use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool, Transaction, migrate::Migrator};
use thiserror::Error;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const LEGACY_IMPORT_MARKER: &str = "legacy_seen_import";

const IMAGE_COLUMNS: &str = "i.id, i.relative_path, i.artist_id, a.username AS artist, i.remote_id, i.title, i.tags, i.is_favorite, i.file_size, i.mtime";

pub type ArtistId = i64;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid tag payload: {0}")]
    Tags(#[from] serde_json::Error),
    #[error("artist name is empty")]
    EmptyArtist,
    #[error("integrity violation: {0}")]
    IntegrityViolation(String),
    #[error("record missing after upsert: {0}")]
    MissingRecord(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err
            && db.is_unique_violation()
        {
            return StoreError::IntegrityViolation(db.message().to_string());
        }
        StoreError::Sqlx(err)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtistRecord {
    pub id: ArtistId,
    pub username: String,
    pub display_name: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInput {
    pub relative_path: String,
    pub artist_id: ArtistId,
    pub remote_id: Option<String>,
    pub title: Option<String>,
    pub tags: Vec<String>,
    /// `None` keeps the stored flag (false for new rows).
    pub favorite: Option<bool>,
    pub file_size: i64,
    pub mtime: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageRecord {
    pub id: i64,
    pub relative_path: String,
    pub artist_id: ArtistId,
    pub artist: String,
    pub remote_id: Option<String>,
    pub title: Option<String>,
    pub tags: Vec<String>,
    pub is_favorite: bool,
    pub file_size: i64,
    pub mtime: i64,
}

impl ImageRecord {
    pub fn file_name(&self) -> &str {
        self.relative_path
            .rsplit('/')
            .next()
            .unwrap_or(&self.relative_path)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GalleryQuery {
    pub search: Option<String>,
    pub favorites_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GalleryImage {
    pub artist: String,
    pub remote_id: Option<String>,
    pub name: String,
    pub relative_path: String,
    pub title: Option<String>,
    pub tags: Vec<String>,
    pub is_favorite: bool,
    pub mtime: i64,
    pub size_bytes: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtistGroup {
    pub artist: String,
    pub count: usize,
    pub images: Vec<GalleryImage>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GalleryListing {
    pub images: Vec<GalleryImage>,
    pub groups: Vec<ArtistGroup>,
    pub count: usize,
    pub group_count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LegacySeen {
    pub seen_ids: Vec<String>,
    pub seeded_ids: HashSet<String>,
}

pub type LegacyMapping = BTreeMap<String, LegacySeen>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LegacyImportStats {
    pub artists: usize,
    pub seen_rows: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub relative_path: String,
    pub file_size: i64,
    pub mtime: i64,
}

/// Record deletions held open in a transaction. The caller removes the
/// files, then commits; dropping it rolls the records back.
pub struct PendingDelete {
    tx: Transaction<'static, Sqlite>,
    pub records: Vec<ImageRecord>,
}

impl PendingDelete {
    pub async fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    pub async fn rollback(self) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct MetadataStore {
    pool: SqlitePool,
}

impl MetadataStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn new(database_url: &str) -> Result<Self, StoreError> {
        let pool = SqlitePool::connect(database_url).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub async fn ensure_artist(&self, username: &str) -> Result<ArtistId, StoreError> {
        let mut conn = self.pool.acquire().await?;
        ensure_artist_in(&mut conn, username).await
    }

    pub async fn artist_by_username(
        &self,
        username: &str,
    ) -> Result<Option<ArtistRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT id, username, display_name, created_at FROM artists WHERE username = ?1",
        )
        .bind(normalize_username(username))
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| row_to_artist(&row)).transpose()
    }

    pub async fn list_artists(&self) -> Result<Vec<ArtistRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, username, display_name, created_at FROM artists ORDER BY username ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_artist).collect()
    }

    pub async fn is_seen(&self, artist_id: ArtistId, remote_id: &str) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT 1 FROM seen_items WHERE artist_id = ?1 AND remote_id = ?2")
            .bind(artist_id)
            .bind(remote_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Idempotent: marking an already-seen pair is a no-op.
    pub async fn mark_seen(&self, artist_id: ArtistId, remote_id: &str) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        mark_seen_in(&mut conn, artist_id, remote_id, false).await?;
        Ok(())
    }

    /// Marks an item seen as part of a baseline run (nothing downloaded).
    pub async fn mark_seeded(
        &self,
        artist_id: ArtistId,
        remote_id: &str,
    ) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        mark_seen_in(&mut conn, artist_id, remote_id, true).await?;
        Ok(())
    }

    pub async fn seen_ids(&self, artist_id: ArtistId) -> Result<HashSet<String>, StoreError> {
        let rows = sqlx::query("SELECT remote_id FROM seen_items WHERE artist_id = ?1")
            .bind(artist_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| row.try_get::<String, _>("remote_id").map_err(StoreError::from))
            .collect()
    }

    /// Keeps only the newest `max_seen` rows for the artist.
    pub async fn trim_seen(&self, artist_id: ArtistId, max_seen: u32) -> Result<u64, StoreError> {
        if max_seen == 0 {
            return Ok(0);
        }
        let result = sqlx::query(
            "DELETE FROM seen_items
             WHERE artist_id = ?1
               AND id NOT IN (
                   SELECT id FROM seen_items
                   WHERE artist_id = ?1
                   ORDER BY id DESC
                   LIMIT ?2
               )",
        )
        .bind(artist_id)
        .bind(i64::from(max_seen))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn upsert_image(&self, image: &ImageInput) -> Result<ImageRecord, StoreError> {
        let mut tx = self.pool.begin().await?;
        upsert_image_in(&mut tx, image).await?;
        let record = get_image_in(&mut tx, &image.relative_path)
            .await?
            .ok_or_else(|| StoreError::MissingRecord(image.relative_path.clone()))?;
        tx.commit().await?;
        Ok(record)
    }

    /// Marks the item seen and records its file in one transaction, so a
    /// crash never leaves one without the other.
    pub async fn commit_download(
        &self,
        artist_id: ArtistId,
        remote_id: &str,
        image: &ImageInput,
    ) -> Result<ImageRecord, StoreError> {
        let mut tx = self.pool.begin().await?;
        mark_seen_in(&mut tx, artist_id, remote_id, false).await?;
        upsert_image_in(&mut tx, image).await?;
        let record = get_image_in(&mut tx, &image.relative_path)
            .await?
            .ok_or_else(|| StoreError::MissingRecord(image.relative_path.clone()))?;
        tx.commit().await?;
        Ok(record)
    }

    pub async fn get_image(&self, relative_path: &str) -> Result<Option<ImageRecord>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        get_image_in(&mut conn, relative_path).await
    }

    pub async fn list_artist_images(
        &self,
        artist_id: ArtistId,
    ) -> Result<Vec<ImageRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {IMAGE_COLUMNS} FROM images i JOIN artists a ON a.id = i.artist_id
             WHERE i.artist_id = ?1 ORDER BY i.relative_path ASC"
        ))
        .bind(artist_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_image).collect()
    }

    pub async fn list_image_paths(&self) -> Result<Vec<StoredFile>, StoreError> {
        let rows = sqlx::query(
            "SELECT relative_path, file_size, mtime FROM images ORDER BY relative_path ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(StoredFile {
                relative_path: row.try_get("relative_path")?,
                file_size: row.try_get("file_size")?,
                mtime: row.try_get("mtime")?,
            });
        }
        Ok(out)
    }

    pub async fn refresh_file_stats(
        &self,
        relative_path: &str,
        file_size: i64,
        mtime: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE images SET file_size = ?1, mtime = ?2, updated_at = ?3 WHERE relative_path = ?4",
        )
        .bind(file_size)
        .bind(mtime)
        .bind(now_unix())
        .bind(relative_path)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Returns false when no record exists for the path.
    pub async fn set_favorite(
        &self,
        relative_path: &str,
        is_favorite: bool,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE images SET is_favorite = ?1 WHERE relative_path = ?2")
            .bind(if is_favorite { 1 } else { 0 })
            .bind(relative_path)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Removes the record only; the caller owns removal of the file.
    pub async fn delete_image(&self, relative_path: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM images WHERE relative_path = ?1")
            .bind(relative_path)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_images(&self, relative_paths: &[String]) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut removed = 0;
        for path in relative_paths {
            removed += sqlx::query("DELETE FROM images WHERE relative_path = ?1")
                .bind(path)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;
        Ok(removed)
    }

    pub async fn begin_image_delete(
        &self,
        relative_path: &str,
    ) -> Result<Option<PendingDelete>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let Some(record) = get_image_in(&mut tx, relative_path).await? else {
            tx.rollback().await?;
            return Ok(None);
        };
        sqlx::query("DELETE FROM images WHERE id = ?1")
            .bind(record.id)
            .execute(&mut *tx)
            .await?;
        Ok(Some(PendingDelete {
            tx,
            records: vec![record],
        }))
    }

    /// Opens a deletion of every image owned by the artist. The artist row
    /// and its seen items stay.
    pub async fn begin_artist_delete(
        &self,
        username: &str,
    ) -> Result<Option<(ArtistRecord, PendingDelete)>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "SELECT id, username, display_name, created_at FROM artists WHERE username = ?1",
        )
        .bind(normalize_username(username))
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };
        let artist = row_to_artist(&row)?;
        let rows = sqlx::query(&format!(
            "SELECT {IMAGE_COLUMNS} FROM images i JOIN artists a ON a.id = i.artist_id
             WHERE i.artist_id = ?1 ORDER BY i.relative_path ASC"
        ))
        .bind(artist.id)
        .fetch_all(&mut *tx)
        .await?;
        let records = rows.iter().map(row_to_image).collect::<Result<Vec<_>, _>>()?;
        sqlx::query("DELETE FROM images WHERE artist_id = ?1")
            .bind(artist.id)
            .execute(&mut *tx)
            .await?;
        Ok(Some((artist, PendingDelete { tx, records })))
    }

    pub async fn query_gallery(&self, query: &GalleryQuery) -> Result<GalleryListing, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {IMAGE_COLUMNS} FROM images i JOIN artists a ON a.id = i.artist_id
             WHERE (?1 = 0 OR i.is_favorite = 1)
             ORDER BY i.mtime DESC, i.id DESC"
        ))
        .bind(if query.favorites_only { 1 } else { 0 })
        .fetch_all(&self.pool)
        .await?;

        let needle = query
            .search
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_lowercase);

        let mut images = Vec::with_capacity(rows.len());
        for row in &rows {
            let record = row_to_image(row)?;
            let image = GalleryImage {
                name: record.file_name().to_string(),
                artist: record.artist,
                remote_id: record.remote_id,
                relative_path: record.relative_path,
                title: record.title,
                tags: record.tags,
                is_favorite: record.is_favorite,
                mtime: record.mtime,
                size_bytes: record.file_size,
            };
            if let Some(needle) = &needle
                && !matches_search(&image, needle)
            {
                continue;
            }
            images.push(image);
        }

        let mut grouped: BTreeMap<String, ArtistGroup> = BTreeMap::new();
        for image in &images {
            let group = grouped
                .entry(image.artist.to_lowercase())
                .or_insert_with(|| ArtistGroup {
                    artist: image.artist.clone(),
                    count: 0,
                    images: Vec::new(),
                });
            group.count += 1;
            group.images.push(image.clone());
        }
        let groups: Vec<ArtistGroup> = grouped.into_values().collect();

        Ok(GalleryListing {
            count: images.len(),
            group_count: groups.len(),
            images,
            groups,
        })
    }

    pub async fn legacy_import_done(&self) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT value FROM store_meta WHERE key = ?1")
            .bind(LEGACY_IMPORT_MARKER)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Bulk import of legacy seen ids. Re-importing the same mapping adds
    /// nothing.
    pub async fn import_legacy_seen(
        &self,
        mapping: &LegacyMapping,
    ) -> Result<LegacyImportStats, StoreError> {
        let mut tx = self.pool.begin().await?;
        let stats = import_legacy_in(&mut tx, mapping).await?;
        tx.commit().await?;
        Ok(stats)
    }

    /// Imports the mapping unless the completion marker is already present;
    /// the marker is written in the same transaction as the rows.
    pub async fn import_legacy_seen_once(
        &self,
        mapping: &LegacyMapping,
        source: &str,
    ) -> Result<Option<LegacyImportStats>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let marker = sqlx::query("SELECT value FROM store_meta WHERE key = ?1")
            .bind(LEGACY_IMPORT_MARKER)
            .fetch_optional(&mut *tx)
            .await?;
        if marker.is_some() {
            tx.rollback().await?;
            return Ok(None);
        }
        let stats = import_legacy_in(&mut tx, mapping).await?;
        sqlx::query("INSERT INTO store_meta (key, value) VALUES (?1, ?2)")
            .bind(LEGACY_IMPORT_MARKER)
            .bind(format!("{source}@{}", now_unix()))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(Some(stats))
    }
}

pub fn normalize_username(username: &str) -> String {
    username.trim().to_lowercase()
}

async fn ensure_artist_in(
    conn: &mut SqliteConnection,
    username: &str,
) -> Result<ArtistId, StoreError> {
    let normalized = normalize_username(username);
    if normalized.is_empty() {
        return Err(StoreError::EmptyArtist);
    }
    sqlx::query(
        "INSERT INTO artists (username, display_name, created_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(username) DO NOTHING",
    )
    .bind(&normalized)
    .bind(username.trim())
    .bind(now_unix())
    .execute(&mut *conn)
    .await?;
    let id: i64 = sqlx::query_scalar("SELECT id FROM artists WHERE username = ?1")
        .bind(&normalized)
        .fetch_one(&mut *conn)
        .await?;
    Ok(id)
}

async fn mark_seen_in(
    conn: &mut SqliteConnection,
    artist_id: ArtistId,
    remote_id: &str,
    seeded: bool,
) -> Result<u64, StoreError> {
    let result = sqlx::query(
        "INSERT INTO seen_items (artist_id, remote_id, seeded, first_seen_at) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(artist_id, remote_id) DO NOTHING",
    )
    .bind(artist_id)
    .bind(remote_id)
    .bind(if seeded { 1 } else { 0 })
    .bind(now_unix())
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

async fn upsert_image_in(conn: &mut SqliteConnection, image: &ImageInput) -> Result<(), StoreError> {
    let owner: Option<i64> =
        sqlx::query_scalar("SELECT artist_id FROM images WHERE relative_path = ?1")
            .bind(&image.relative_path)
            .fetch_optional(&mut *conn)
            .await?;
    if let Some(owner) = owner
        && owner != image.artist_id
    {
        return Err(StoreError::IntegrityViolation(format!(
            "{} already belongs to artist {owner}",
            image.relative_path
        )));
    }

    let tags = serde_json::to_string(&image.tags)?;
    let now = now_unix();
    sqlx::query(
        "\n            INSERT INTO images (\n                relative_path,\n                artist_id,\n                remote_id,\n                title,\n                tags,\n                is_favorite,\n                file_size,\n                mtime,\n                created_at,\n                updated_at\n            )\n            VALUES (?1, ?2, ?3, ?4, ?5, COALESCE(?6, 0), ?7, ?8, ?9, ?9)\n            ON CONFLICT(relative_path) DO UPDATE SET\n                remote_id = COALESCE(excluded.remote_id, images.remote_id),\n                title = excluded.title,\n                tags = excluded.tags,\n                is_favorite = COALESCE(?6, images.is_favorite),\n                file_size = excluded.file_size,\n                mtime = excluded.mtime,\n                updated_at = excluded.updated_at;\n            ",
    )
    .bind(&image.relative_path)
    .bind(image.artist_id)
    .bind(&image.remote_id)
    .bind(&image.title)
    .bind(tags)
    .bind(image.favorite.map(i64::from))
    .bind(image.file_size)
    .bind(image.mtime)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn get_image_in(
    conn: &mut SqliteConnection,
    relative_path: &str,
) -> Result<Option<ImageRecord>, StoreError> {
    let row = sqlx::query(&format!(
        "SELECT {IMAGE_COLUMNS} FROM images i JOIN artists a ON a.id = i.artist_id
         WHERE i.relative_path = ?1"
    ))
    .bind(relative_path)
    .fetch_optional(&mut *conn)
    .await?;
    row.map(|row| row_to_image(&row)).transpose()
}

async fn import_legacy_in(
    conn: &mut SqliteConnection,
    mapping: &LegacyMapping,
) -> Result<LegacyImportStats, StoreError> {
    let mut stats = LegacyImportStats::default();
    for (username, entry) in mapping {
        if normalize_username(username).is_empty() {
            continue;
        }
        let artist_id = ensure_artist_in(conn, username).await?;
        stats.artists += 1;
        for remote_id in &entry.seen_ids {
            let remote_id = remote_id.trim();
            if remote_id.is_empty() {
                continue;
            }
            let seeded = entry.seeded_ids.contains(remote_id);
            stats.seen_rows += mark_seen_in(conn, artist_id, remote_id, seeded).await?;
        }
    }
    Ok(stats)
}

fn matches_search(image: &GalleryImage, needle: &str) -> bool {
    image
        .title
        .as_deref()
        .is_some_and(|title| title.to_lowercase().contains(needle))
        || image.name.to_lowercase().contains(needle)
        || image
            .tags
            .iter()
            .any(|tag| tag.to_lowercase().contains(needle))
}

fn row_to_artist(row: &SqliteRow) -> Result<ArtistRecord, StoreError> {
    Ok(ArtistRecord {
        id: row.try_get("id")?,
        username: row.try_get("username")?,
        display_name: row.try_get("display_name")?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_image(row: &SqliteRow) -> Result<ImageRecord, StoreError> {
    let tags: String = row.try_get("tags")?;
    let is_favorite: i64 = row.try_get("is_favorite")?;
    Ok(ImageRecord {
        id: row.try_get("id")?,
        relative_path: row.try_get("relative_path")?,
        artist_id: row.try_get("artist_id")?,
        artist: row.try_get("artist")?,
        remote_id: row.try_get("remote_id")?,
        title: row.try_get("title")?,
        tags: serde_json::from_str(&tags)?,
        is_favorite: is_favorite != 0,
        file_size: row.try_get("file_size")?,
        mtime: row.try_get("mtime")?,
    })
}

pub(crate) fn now_unix() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
