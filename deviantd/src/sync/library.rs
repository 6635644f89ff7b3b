use std::{
    collections::BTreeSet,
    io,
    path::{Path, PathBuf},
};

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use super::paths::{PathError, relative_key, resolve_under_root};
use super::store::{
    GalleryListing, GalleryQuery, ImageRecord, MetadataStore, PendingDelete, StoreError,
};

#[derive(Debug, Error)]
pub enum LibraryError {
    #[error("no image recorded at {0}")]
    NotFound(String),
    #[error("unknown artist {0}")]
    UnknownArtist(String),
    #[error("invalid path: {0}")]
    Path(#[from] PathError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to remove {path}: {source}")]
    Remove { path: PathBuf, source: io::Error },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeleteSummary {
    pub records: usize,
    pub files: usize,
}

/// Gallery operations for the CLI and web collaborators. Files and records
/// are always removed together.
#[derive(Clone)]
pub struct Library {
    store: MetadataStore,
    root: PathBuf,
}

impl Library {
    pub fn new(store: MetadataStore, root: PathBuf) -> Self {
        Self { store, root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn query(
        &self,
        search: Option<&str>,
        favorites_only: bool,
    ) -> Result<GalleryListing, LibraryError> {
        Ok(self
            .store
            .query_gallery(&GalleryQuery {
                search: search.map(str::to_string),
                favorites_only,
            })
            .await?)
    }

    pub async fn set_favorite(
        &self,
        relative_path: &str,
        favorite: bool,
    ) -> Result<ImageRecord, LibraryError> {
        let key = self.normalize(relative_path)?;
        if !self.store.set_favorite(&key, favorite).await? {
            return Err(LibraryError::NotFound(key));
        }
        self.store
            .get_image(&key)
            .await?
            .ok_or(LibraryError::NotFound(key))
    }

    pub async fn delete_image(&self, relative_path: &str) -> Result<DeleteSummary, LibraryError> {
        let key = self.normalize(relative_path)?;
        let pending = self
            .store
            .begin_image_delete(&key)
            .await?
            .ok_or_else(|| LibraryError::NotFound(key.clone()))?;
        let summary = self.remove_files_and_commit(pending).await?;
        info!(path = %key, "deleted image");
        Ok(summary)
    }

    /// Removes every image of the artist. The artist and its seen history
    /// stay, so a later sync does not fetch the same uploads again.
    pub async fn delete_artist(&self, username: &str) -> Result<DeleteSummary, LibraryError> {
        let (artist, pending) = self
            .store
            .begin_artist_delete(username)
            .await?
            .ok_or_else(|| LibraryError::UnknownArtist(username.trim().to_string()))?;
        let dirs: BTreeSet<String> = pending
            .records
            .iter()
            .filter_map(|record| {
                record
                    .relative_path
                    .split_once('/')
                    .map(|(dir, _)| dir.to_string())
            })
            .collect();
        let summary = self.remove_files_and_commit(pending).await?;

        for dir in dirs {
            let path = self.root.join(&dir);
            if tokio::fs::remove_dir(&path).await.is_ok() {
                info!(dir = %path.display(), "removed empty artist directory");
            }
        }
        info!(artist = %artist.username, images = summary.records, "deleted artist images");
        Ok(summary)
    }

    /// Deletes the files behind a pending record deletion. On failure the
    /// records whose files are already gone are still removed; the rest are
    /// rolled back.
    async fn remove_files_and_commit(
        &self,
        pending: PendingDelete,
    ) -> Result<DeleteSummary, LibraryError> {
        let mut removed_paths = Vec::new();
        let mut files = 0;
        let mut failure = None;
        for record in &pending.records {
            let path = match resolve_under_root(&self.root, &record.relative_path) {
                Ok(path) => path,
                Err(err) => {
                    failure = Some(LibraryError::Path(err));
                    break;
                }
            };
            match tokio::fs::remove_file(&path).await {
                Ok(()) => files += 1,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(source) => {
                    failure = Some(LibraryError::Remove { path, source });
                    break;
                }
            }
            removed_paths.push(record.relative_path.clone());
        }

        match failure {
            None => {
                let records = pending.records.len();
                pending.commit().await?;
                Ok(DeleteSummary { records, files })
            }
            Some(err) => {
                pending.rollback().await?;
                if !removed_paths.is_empty() {
                    self.store.delete_images(&removed_paths).await?;
                }
                warn!(error = %err, removed = removed_paths.len(), "delete stopped early");
                Err(err)
            }
        }
    }

    fn normalize(&self, relative_path: &str) -> Result<String, LibraryError> {
        let absolute = resolve_under_root(&self.root, relative_path)?;
        Ok(relative_key(&self.root, &absolute)?)
    }
}
