use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use deviant_core::{ApiErrorClass, DEFAULT_BASE_URL, DeviantClient, DeviantError, Deviation, GalleryPage, MAX_PAGE_SIZE};
use reqwest::Client;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::backoff::Backoff;
use super::paths::{PathError, relative_key, unique_path};
use super::resolver::{
    ContentRating, ItemDescriptor, ResolvePolicy, resolve, sanitize_filename, tags_from_wire,
};
use super::store::{ArtistId, ImageInput, MetadataStore, StoreError, normalize_username};
use super::transfer::{TransferClient, TransferError};
use crate::token_provider::{TokenProvider, TokenProviderError};

/// Upper bound on pages scanned per artist in one run.
pub const MAX_PAGE_SPAN: u32 = 200;
pub const DEFAULT_MAX_SEEN: u32 = 5000;
pub const MIN_MAX_SEEN: u32 = 100;

macro_rules! item_log {
    ($verbose:expr, $($arg:tt)+) => {
        if $verbose {
            tracing::info!($($arg)+);
        } else {
            tracing::debug!($($arg)+);
        }
    };
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid run configuration: {0}")]
    InvalidConfig(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("api error: {0}")]
    Api(#[from] DeviantError),
    #[error("token error: {0}")]
    Token(#[from] TokenProviderError),
    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),
    #[error("path error: {0}")]
    Path(#[from] PathError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("authentication expired and could not be renewed")]
    AuthenticationExpired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunConfig {
    pub artists: Vec<String>,
    pub start_page: u32,
    pub end_page: u32,
    pub page_size: u32,
    pub include_mature: bool,
    pub allow_preview: bool,
    pub seed_only: bool,
    pub verbose: bool,
    pub max_seen: u32,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            artists: Vec::new(),
            start_page: 1,
            end_page: 3,
            page_size: MAX_PAGE_SIZE,
            include_mature: false,
            allow_preview: false,
            seed_only: false,
            verbose: false,
            max_seen: DEFAULT_MAX_SEEN,
        }
    }
}

impl RunConfig {
    /// Normalized copy: artists trimmed and deduplicated case-insensitively,
    /// page size clamped, page span capped.
    pub fn validated(&self) -> Result<RunConfig, EngineError> {
        let mut seen = HashSet::new();
        let mut artists = Vec::new();
        for raw in &self.artists {
            let name = raw.trim();
            if name.is_empty() {
                continue;
            }
            if !is_valid_username(name) {
                return Err(EngineError::InvalidConfig(format!(
                    "invalid artist name: {name:?}"
                )));
            }
            if seen.insert(name.to_lowercase()) {
                artists.push(name.to_string());
            }
        }
        if artists.is_empty() {
            return Err(EngineError::InvalidConfig("no artists configured".into()));
        }
        if self.start_page < 1 {
            return Err(EngineError::InvalidConfig("start page must be at least 1".into()));
        }
        if self.end_page < self.start_page {
            return Err(EngineError::InvalidConfig(format!(
                "end page {} is before start page {}",
                self.end_page, self.start_page
            )));
        }
        let end_page = self
            .end_page
            .min(self.start_page.saturating_add(MAX_PAGE_SPAN - 1));
        Ok(RunConfig {
            artists,
            start_page: self.start_page,
            end_page,
            page_size: self.page_size.clamp(1, MAX_PAGE_SIZE),
            max_seen: self.max_seen.max(MIN_MAX_SEEN),
            ..self.clone()
        })
    }

    fn policy(&self) -> ResolvePolicy {
        ResolvePolicy {
            allow_preview: self.allow_preview,
            include_mature: self.include_mature,
        }
    }
}

pub fn is_valid_username(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    pub artists_checked: u32,
    pub pages_checked: u32,
    pub new_items: u32,
    pub downloaded: u32,
    pub existing: u32,
    pub skipped: u32,
    pub errors: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunProgress {
    pub artist: Option<String>,
    pub page: Option<u32>,
    pub stats: RunStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunOutcome {
    Completed,
    CompletedWithErrors,
    Cancelled,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunResult {
    pub ok: bool,
    pub outcome: RunOutcome,
    pub stats: RunStats,
    pub start_page: u32,
    pub end_page: u32,
    pub errors: Vec<String>,
    pub message: String,
}

#[derive(Debug, Default)]
struct RunTally {
    stats: RunStats,
    errors: Vec<String>,
}

impl RunTally {
    fn error(&mut self, message: String) {
        self.stats.errors += 1;
        self.errors.push(message);
    }
}

enum ArtistFlow {
    Finished,
    Cancelled,
}

/// Credentials plus a client bound to the current token.
struct ApiSession {
    tokens: TokenProvider,
    base_url: String,
    http: Client,
    client: Option<DeviantClient>,
}

impl ApiSession {
    async fn client(&mut self) -> Result<DeviantClient, EngineError> {
        let token = self.tokens.valid_access_token().await?;
        if let Some(client) = &self.client
            && client.token() == token
        {
            return Ok(client.clone());
        }
        self.bind(token)
    }

    async fn renew(&mut self) -> Result<DeviantClient, EngineError> {
        if !self.tokens.can_refresh() {
            return Err(EngineError::AuthenticationExpired);
        }
        let token = self
            .tokens
            .refresh_now()
            .await
            .map_err(|_| EngineError::AuthenticationExpired)?;
        self.bind(token)
    }

    fn bind(&mut self, token: String) -> Result<DeviantClient, EngineError> {
        let client = DeviantClient::with_base_url(&self.base_url, token)?.with_http(self.http.clone());
        self.client = Some(client.clone());
        Ok(client)
    }
}

pub struct SyncEngine {
    session: Mutex<ApiSession>,
    store: MetadataStore,
    transfer: TransferClient,
    output_root: PathBuf,
    backoff: Backoff,
    max_attempts: u32,
}

impl SyncEngine {
    pub fn new(tokens: TokenProvider, store: MetadataStore, output_root: PathBuf) -> Self {
        Self {
            session: Mutex::new(ApiSession {
                tokens,
                base_url: DEFAULT_BASE_URL.to_string(),
                http: Client::new(),
                client: None,
            }),
            store,
            transfer: TransferClient::new(),
            output_root,
            backoff: Backoff::default(),
            max_attempts: 3,
        }
    }

    pub fn with_api_base(mut self, base_url: impl Into<String>) -> Self {
        let session = self.session.get_mut();
        session.base_url = base_url.into();
        session.client = None;
        self
    }

    /// Uses `http` for API calls and asset downloads alike.
    pub fn with_http(mut self, http: Client) -> Self {
        let session = self.session.get_mut();
        session.http = http.clone();
        session.client = None;
        self.transfer = TransferClient::with_http(http);
        self
    }

    pub fn with_transfer(mut self, transfer: TransferClient) -> Self {
        self.transfer = transfer;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn store(&self) -> &MetadataStore {
        &self.store
    }

    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    pub async fn run(&self, config: &RunConfig) -> Result<RunResult, EngineError> {
        let (progress, _) = watch::channel(RunProgress::default());
        self.run_sync(config, &CancellationToken::new(), &progress)
            .await
    }

    /// Runs one pass over every configured artist. Only configuration errors
    /// are returned as `Err`; everything else lands in the result.
    pub async fn run_sync(
        &self,
        config: &RunConfig,
        cancel: &CancellationToken,
        progress: &watch::Sender<RunProgress>,
    ) -> Result<RunResult, EngineError> {
        let config = config.validated()?;
        let mut tally = RunTally::default();

        if let Err(err) = self.session.lock().await.client().await {
            warn!(error = %err, "cannot reach the API; sync not started");
            tally.error(format!("authentication failed: {err}"));
            return Ok(finish(&config, tally, RunOutcome::Aborted, 0));
        }

        let mut outcome = None;
        let mut artists_failed = 0usize;
        for artist in &config.artists {
            if cancel.is_cancelled() {
                outcome = Some(RunOutcome::Cancelled);
                break;
            }
            tally.stats.artists_checked += 1;
            match self
                .sync_artist(artist, &config, cancel, progress, &mut tally)
                .await
            {
                Ok(ArtistFlow::Finished) => {}
                Ok(ArtistFlow::Cancelled) => {
                    outcome = Some(RunOutcome::Cancelled);
                    break;
                }
                Err(EngineError::AuthenticationExpired) => {
                    warn!(artist = %artist, "authentication expired; aborting run");
                    tally.error(format!("@{artist}: authentication expired"));
                    artists_failed += 1;
                    outcome = Some(RunOutcome::Aborted);
                    break;
                }
                Err(err) => {
                    warn!(artist = %artist, error = %err, "artist sync failed");
                    tally.error(format!("@{artist}: {err}"));
                    artists_failed += 1;
                }
            }
            progress.send_replace(RunProgress {
                artist: Some(artist.clone()),
                page: None,
                stats: tally.stats,
            });
        }

        let outcome = outcome.unwrap_or(if tally.errors.is_empty() {
            RunOutcome::Completed
        } else {
            RunOutcome::CompletedWithErrors
        });
        let result = finish(&config, tally, outcome, artists_failed);
        info!(
            outcome = ?result.outcome,
            artists = result.stats.artists_checked,
            pages = result.stats.pages_checked,
            new_items = result.stats.new_items,
            downloaded = result.stats.downloaded,
            existing = result.stats.existing,
            skipped = result.stats.skipped,
            errors = result.stats.errors,
            "sync run finished"
        );
        Ok(result)
    }

    async fn sync_artist(
        &self,
        artist: &str,
        config: &RunConfig,
        cancel: &CancellationToken,
        progress: &watch::Sender<RunProgress>,
        tally: &mut RunTally,
    ) -> Result<ArtistFlow, EngineError> {
        let artist_id = self.store.ensure_artist(artist).await?;
        let artist_dir = self
            .output_root
            .join(sanitize_filename(&normalize_username(artist), "user"));
        let mut in_run = HashSet::new();
        let before = tally.stats;
        let mut offset = (config.start_page - 1).saturating_mul(config.page_size);
        let mut flow = ArtistFlow::Finished;

        'pages: for page_number in config.start_page..=config.end_page {
            if cancel.is_cancelled() {
                flow = ArtistFlow::Cancelled;
                break;
            }
            let page = self
                .fetch_page(artist, offset, config.page_size, config.include_mature)
                .await?;
            tally.stats.pages_checked += 1;
            item_log!(
                config.verbose,
                artist = %artist,
                page = page_number,
                offset,
                items = page.results.len(),
                has_more = page.has_more,
                "fetched gallery page"
            );

            for deviation in &page.results {
                if cancel.is_cancelled() {
                    flow = ArtistFlow::Cancelled;
                    break 'pages;
                }
                self.process_item(
                    artist,
                    artist_id,
                    &artist_dir,
                    deviation,
                    config,
                    &mut in_run,
                    tally,
                )
                .await?;
                progress.send_replace(RunProgress {
                    artist: Some(artist.to_string()),
                    page: Some(page_number),
                    stats: tally.stats,
                });
            }

            if page.results.len() < config.page_size as usize || !page.has_more {
                break;
            }
            offset = page
                .next_offset
                .unwrap_or_else(|| offset.saturating_add(config.page_size));
        }

        let trimmed = self.store.trim_seen(artist_id, config.max_seen).await?;
        let stats = tally.stats;
        info!(
            artist = %artist,
            pages = stats.pages_checked - before.pages_checked,
            new_items = stats.new_items - before.new_items,
            downloaded = stats.downloaded - before.downloaded,
            existing = stats.existing - before.existing,
            skipped = stats.skipped - before.skipped,
            trimmed,
            "checked artist"
        );
        Ok(flow)
    }

    #[allow(clippy::too_many_arguments)]
    async fn process_item(
        &self,
        artist: &str,
        artist_id: ArtistId,
        artist_dir: &Path,
        deviation: &Deviation,
        config: &RunConfig,
        in_run: &mut HashSet<String>,
        tally: &mut RunTally,
    ) -> Result<(), EngineError> {
        let item = match ItemDescriptor::from_wire(deviation, None) {
            Ok(item) => item,
            Err(err) => {
                warn!(artist = %artist, title = ?deviation.title, error = %err, "skipping malformed item");
                tally.stats.skipped += 1;
                return Ok(());
            }
        };
        if !in_run.insert(item.remote_id.clone()) {
            item_log!(config.verbose, artist = %artist, id = %item.remote_id, "already handled in this run");
            return Ok(());
        }
        if self.store.is_seen(artist_id, &item.remote_id).await? {
            tally.stats.skipped += 1;
            item_log!(config.verbose, artist = %artist, id = %item.remote_id, "seen before");
            return Ok(());
        }
        if config.seed_only {
            self.store.mark_seeded(artist_id, &item.remote_id).await?;
            tally.stats.new_items += 1;
            item_log!(config.verbose, artist = %artist, id = %item.remote_id, title = %item.title, "seeded");
            return Ok(());
        }

        let Some(item) = self.attach_original(artist, item, config, tally).await? else {
            return Ok(());
        };
        let asset = match resolve(&item, config.policy()) {
            Ok(asset) => asset,
            Err(reason) => {
                self.store.mark_seen(artist_id, &item.remote_id).await?;
                tally.stats.skipped += 1;
                item_log!(
                    config.verbose,
                    artist = %artist,
                    id = %item.remote_id,
                    title = %item.title,
                    %reason,
                    "skipped"
                );
                return Ok(());
            }
        };

        let tags = self.tags_for(&item, config).await?;
        let preferred = artist_dir.join(&asset.filename);
        let adopt = if preferred.exists() {
            let key = relative_key(&self.output_root, &preferred)?;
            match self.store.get_image(&key).await? {
                None => true,
                Some(record) => record.remote_id.as_deref() == Some(item.remote_id.as_str()),
            }
        } else {
            false
        };
        let target = if preferred.exists() && !adopt {
            unique_path(artist_dir, &asset.filename)?
        } else {
            preferred
        };

        if !adopt {
            match self.transfer.download_to_path(&asset.url, &target).await {
                Ok(bytes) => {
                    item_log!(config.verbose, artist = %artist, id = %item.remote_id, bytes, "fetched asset");
                }
                Err(err) if err.is_unavailable() => {
                    self.store.mark_seen(artist_id, &item.remote_id).await?;
                    tally.stats.skipped += 1;
                    item_log!(
                        config.verbose,
                        artist = %artist,
                        id = %item.remote_id,
                        error = %err,
                        "asset unavailable; skipped"
                    );
                    return Ok(());
                }
                Err(err) => {
                    warn!(artist = %artist, id = %item.remote_id, title = %item.title, error = %err, "download failed");
                    tally.error(format!("@{artist} {}: {err}", item.remote_id));
                    return Ok(());
                }
            }
        }

        let (file_size, mtime) = file_stats(&target).await?;
        let input = ImageInput {
            relative_path: relative_key(&self.output_root, &target)?,
            artist_id,
            remote_id: Some(item.remote_id.clone()),
            title: Some(item.title.clone()),
            tags,
            favorite: None,
            file_size,
            mtime,
        };
        match self
            .store
            .commit_download(artist_id, &item.remote_id, &input)
            .await
        {
            Ok(_) => {}
            Err(StoreError::IntegrityViolation(reason)) => {
                warn!(artist = %artist, id = %item.remote_id, %reason, "could not record download");
                tally.error(format!("@{artist} {}: {reason}", item.remote_id));
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        }

        tally.stats.new_items += 1;
        if adopt {
            tally.stats.existing += 1;
            info!(artist = %artist, id = %item.remote_id, title = %item.title, path = %target.display(), "already on disk");
        } else {
            tally.stats.downloaded += 1;
            info!(artist = %artist, id = %item.remote_id, title = %item.title, path = %target.display(), "downloaded");
        }
        Ok(())
    }

    /// Looks up the original file. A missing or forbidden download leaves
    /// the item without an original; any other failure is an item error and
    /// `None`, so the item stays unseen and the next run tries again.
    async fn attach_original(
        &self,
        artist: &str,
        item: ItemDescriptor,
        config: &RunConfig,
        tally: &mut RunTally,
    ) -> Result<Option<ItemDescriptor>, EngineError> {
        let rating_ok = item.rating == ContentRating::General || config.include_mature;
        if !item.downloadable || item.deleted || !rating_ok {
            return Ok(Some(item));
        }
        let id = item.remote_id.as_str();
        let mature = config.include_mature;
        let result = self
            .call_api_with_retry("download info", |client| async move {
                client.get_download_info(id, mature).await
            })
            .await;
        match result {
            Ok(info) => Ok(Some(item.with_download(&info))),
            Err(EngineError::Api(err))
                if matches!(
                    err.classification(),
                    Some(ApiErrorClass::NotFound | ApiErrorClass::Forbidden)
                ) =>
            {
                item_log!(config.verbose, artist = %artist, id = %item.remote_id, error = %err, "no original download");
                Ok(Some(item))
            }
            Err(EngineError::Api(err)) => {
                warn!(artist = %artist, id = %item.remote_id, title = %item.title, error = %err, "download info failed");
                tally.error(format!("@{artist} {}: {err}", item.remote_id));
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Listing tags, or the full deviation's tags when the listing has none.
    async fn tags_for(
        &self,
        item: &ItemDescriptor,
        config: &RunConfig,
    ) -> Result<Vec<String>, EngineError> {
        if !item.tags.is_empty() {
            return Ok(item.tags.clone());
        }
        let id = item.remote_id.clone();
        let mature = config.include_mature;
        match self
            .call_api(|client| {
                let id = id.clone();
                async move { client.get_deviation(&id, mature).await }
            })
            .await
        {
            Ok(deviation) => Ok(tags_from_wire(deviation.tags.as_deref())),
            Err(EngineError::AuthenticationExpired) => Err(EngineError::AuthenticationExpired),
            Err(err) => {
                tracing::debug!(id = %item.remote_id, error = %err, "could not fetch tags");
                Ok(Vec::new())
            }
        }
    }

    async fn fetch_page(
        &self,
        artist: &str,
        offset: u32,
        limit: u32,
        include_mature: bool,
    ) -> Result<GalleryPage, EngineError> {
        self.call_api_with_retry("gallery page", |client| async move {
            client
                .list_gallery(artist, offset, limit, include_mature)
                .await
        })
        .await
    }

    /// `call_api` with backoff on rate limits and transient failures.
    async fn call_api_with_retry<T, F, Fut>(&self, what: &str, op: F) -> Result<T, EngineError>
    where
        F: Fn(DeviantClient) -> Fut,
        Fut: Future<Output = Result<T, DeviantError>>,
    {
        let mut attempt = 0;
        loop {
            match self.call_api(&op).await {
                Err(EngineError::Api(err)) if err.is_retryable() && attempt + 1 < self.max_attempts => {
                    let delay = self.backoff.delay_honoring(attempt, err.retry_after_secs());
                    warn!(
                        request = what,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "request failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Runs `op` with the current client. An auth failure renews the token
    /// once; a second one is `AuthenticationExpired`.
    async fn call_api<T, F, Fut>(&self, op: F) -> Result<T, EngineError>
    where
        F: Fn(DeviantClient) -> Fut,
        Fut: Future<Output = Result<T, DeviantError>>,
    {
        let client = self.session.lock().await.client().await?;
        match op(client).await {
            Err(err) if err.is_auth() => {
                warn!(error = %err, "access token rejected; renewing");
                let client = self.session.lock().await.renew().await?;
                match op(client).await {
                    Err(err) if err.is_auth() => Err(EngineError::AuthenticationExpired),
                    other => other.map_err(EngineError::from),
                }
            }
            other => other.map_err(EngineError::from),
        }
    }
}

fn finish(
    config: &RunConfig,
    tally: RunTally,
    outcome: RunOutcome,
    artists_failed: usize,
) -> RunResult {
    let all_failed = artists_failed > 0 && artists_failed >= config.artists.len();
    let ok = !all_failed && matches!(outcome, RunOutcome::Completed | RunOutcome::CompletedWithErrors);
    let stats = tally.stats;
    let message = match outcome {
        RunOutcome::Completed | RunOutcome::CompletedWithErrors => format!(
            "{} new, {} downloaded, {} existing, {} skipped, {} errors",
            stats.new_items, stats.downloaded, stats.existing, stats.skipped, stats.errors
        ),
        RunOutcome::Cancelled => format!(
            "cancelled after {} downloads",
            stats.downloaded
        ),
        RunOutcome::Aborted => "aborted: authentication failed".to_string(),
    };
    RunResult {
        ok,
        outcome,
        stats,
        start_page: config.start_page,
        end_page: config.end_page,
        errors: tally.errors,
        message,
    }
}

async fn file_stats(path: &Path) -> Result<(i64, i64), EngineError> {
    let metadata = tokio::fs::metadata(path).await?;
    let mtime = metadata
        .modified()
        .ok()
        .and_then(|at| at.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    Ok((metadata.len() as i64, mtime))
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
