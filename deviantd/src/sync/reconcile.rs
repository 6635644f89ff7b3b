use std::{
    collections::{HashMap, HashSet},
    io,
    path::{Path, PathBuf},
    time::UNIX_EPOCH,
};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::paths::{PathError, relative_key};
use super::store::{ImageInput, MetadataStore, StoreError};

pub const MEDIA_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "bmp", "avif"];

/// Artist for files sitting directly in the download root.
pub const UNGROUPED_ARTIST: &str = "ungrouped";

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("walk failed: {0}")]
    Walk(#[from] walkdir::Error),
    #[error("scan task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error(transparent)]
    Path(#[from] PathError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileStats {
    pub scanned: usize,
    pub added: usize,
    pub refreshed: usize,
    pub removed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct DiscoveredFile {
    relative_path: String,
    artist: String,
    remote_id: Option<String>,
    title: String,
    file_size: i64,
    mtime: i64,
}

/// Brings the store in line with the media files under `root`: untracked
/// files get records, records without files are dropped. Must not run while
/// a sync is writing into the tree.
pub async fn reconcile(
    store: &MetadataStore,
    root: &Path,
) -> Result<ReconcileStats, ReconcileError> {
    tokio::fs::create_dir_all(root).await?;
    let scan_root = root.to_path_buf();
    let discovered = tokio::task::spawn_blocking(move || scan_media(&scan_root)).await??;

    let known: HashMap<String, (i64, i64)> = store
        .list_image_paths()
        .await?
        .into_iter()
        .map(|file| (file.relative_path, (file.file_size, file.mtime)))
        .collect();
    let on_disk: HashSet<&str> = discovered
        .iter()
        .map(|file| file.relative_path.as_str())
        .collect();

    let stale: Vec<String> = known
        .keys()
        .filter(|path| !on_disk.contains(path.as_str()))
        .cloned()
        .collect();
    let mut stats = ReconcileStats {
        scanned: discovered.len(),
        removed: store.delete_images(&stale).await? as usize,
        ..ReconcileStats::default()
    };
    for path in &stale {
        debug!(path = %path, "dropped record for missing file");
    }

    for file in &discovered {
        match known.get(&file.relative_path) {
            Some(&(size, mtime)) => {
                if size != file.file_size || mtime != file.mtime {
                    store
                        .refresh_file_stats(&file.relative_path, file.file_size, file.mtime)
                        .await?;
                    stats.refreshed += 1;
                }
            }
            None => {
                let artist_id = store.ensure_artist(&file.artist).await?;
                let input = ImageInput {
                    relative_path: file.relative_path.clone(),
                    artist_id,
                    remote_id: file.remote_id.clone(),
                    title: Some(file.title.clone()),
                    tags: Vec::new(),
                    favorite: None,
                    file_size: file.file_size,
                    mtime: file.mtime,
                };
                match store.upsert_image(&input).await {
                    Ok(_) => stats.added += 1,
                    Err(StoreError::IntegrityViolation(reason)) => {
                        warn!(path = %file.relative_path, %reason, "skipping untracked file");
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        }
    }

    info!(
        root = %root.display(),
        scanned = stats.scanned,
        added = stats.added,
        refreshed = stats.refreshed,
        removed = stats.removed,
        "reconciled download directory"
    );
    Ok(stats)
}

pub fn is_media_file(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .is_some_and(|ext| MEDIA_EXTENSIONS.contains(&ext.as_str()))
}

/// Remote id encoded as the `{id}_` file name prefix, if any.
pub fn remote_id_from_name(name: &str) -> Option<String> {
    match name.find('_') {
        Some(index) if index > 0 => Some(name[..index].to_string()),
        _ => None,
    }
}

fn scan_media(root: &Path) -> Result<Vec<DiscoveredFile>, ReconcileError> {
    let mut out = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry?;
        if !entry.file_type().is_file() || !is_media_file(entry.path()) {
            continue;
        }
        let relative_path = relative_key(root, entry.path())?;
        let artist = match relative_path.split_once('/') {
            Some((dir, _)) => dir.to_string(),
            None => UNGROUPED_ARTIST.to_string(),
        };
        let name = entry.file_name().to_string_lossy().into_owned();
        let metadata = entry.metadata()?;
        let mtime = metadata
            .modified()
            .ok()
            .and_then(|at| at.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        out.push(DiscoveredFile {
            remote_id: remote_id_from_name(&name),
            title: title_from_name(&name),
            relative_path,
            artist,
            file_size: metadata.len() as i64,
            mtime,
        });
    }
    Ok(out)
}

fn title_from_name(name: &str) -> String {
    PathBuf::from(name)
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;
    use tempfile::tempdir;

    async fn make_store() -> MetadataStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = MetadataStore::from_pool(pool);
        store.init().await.unwrap();
        store
    }

    fn write(root: &Path, relative: &str, body: &[u8]) {
        let path = root.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, body).unwrap();
    }

    #[test]
    fn recognizes_media_and_ids() {
        assert!(is_media_file(Path::new("a/b.JPG")));
        assert!(is_media_file(Path::new("b.avif")));
        assert!(!is_media_file(Path::new("b.png.partial")));
        assert!(!is_media_file(Path::new("notes.txt")));
        assert_eq!(remote_id_from_name("ABC_title.png").as_deref(), Some("ABC"));
        assert_eq!(remote_id_from_name("_title.png"), None);
        assert_eq!(remote_id_from_name("plain.png"), None);
    }

    #[tokio::test]
    async fn adds_untracked_files_and_drops_missing_ones() {
        let store = make_store().await;
        let dir = tempdir().unwrap();
        write(dir.path(), "alice/A1_sunset.png", b"png");
        write(dir.path(), "loose.jpg", b"jpg");
        write(dir.path(), "alice/B2_half.png.partial", b"part");
        write(dir.path(), "alice/readme.txt", b"txt");

        let artist = store.ensure_artist("bob").await.unwrap();
        store
            .upsert_image(&ImageInput {
                relative_path: "bob/gone.png".into(),
                artist_id: artist,
                remote_id: None,
                title: None,
                tags: Vec::new(),
                favorite: Some(true),
                file_size: 1,
                mtime: 1,
            })
            .await
            .unwrap();

        let stats = reconcile(&store, dir.path()).await.unwrap();

        assert_eq!(stats.scanned, 2);
        assert_eq!(stats.added, 2);
        assert_eq!(stats.removed, 1);
        assert!(store.get_image("bob/gone.png").await.unwrap().is_none());

        let record = store.get_image("alice/A1_sunset.png").await.unwrap().unwrap();
        assert_eq!(record.artist, "alice");
        assert_eq!(record.remote_id.as_deref(), Some("A1"));
        assert_eq!(record.title.as_deref(), Some("A1_sunset"));
        assert!(record.tags.is_empty());
        assert_eq!(record.file_size, 3);

        let loose = store.get_image("loose.jpg").await.unwrap().unwrap();
        assert_eq!(loose.artist, UNGROUPED_ARTIST);
    }

    #[tokio::test]
    async fn rerun_is_stable_and_keeps_favorites() {
        let store = make_store().await;
        let dir = tempdir().unwrap();
        write(dir.path(), "alice/A1_sunset.png", b"png");

        reconcile(&store, dir.path()).await.unwrap();
        store
            .set_favorite("alice/A1_sunset.png", true)
            .await
            .unwrap();

        write(dir.path(), "alice/A1_sunset.png", b"bigger png");
        let stats = reconcile(&store, dir.path()).await.unwrap();

        assert_eq!(stats.added, 0);
        assert_eq!(stats.removed, 0);
        assert_eq!(stats.refreshed, 1);
        let record = store.get_image("alice/A1_sunset.png").await.unwrap().unwrap();
        assert!(record.is_favorite);
        assert_eq!(record.file_size, 10);

        let again = reconcile(&store, dir.path()).await.unwrap();
        assert_eq!(again.refreshed, 0);
    }

    #[tokio::test]
    async fn creates_missing_root() {
        let store = make_store().await;
        let dir = tempdir().unwrap();
        let root = dir.path().join("downloads");

        let stats = reconcile(&store, &root).await.unwrap();

        assert_eq!(stats, ReconcileStats::default());
        assert!(root.is_dir());
    }
}
