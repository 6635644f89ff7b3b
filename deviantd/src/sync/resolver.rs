use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use deviant_core::{Deviation, DownloadInfo, MediaRef, Tag};
use serde::Serialize;
use thiserror::Error;
use url::Url;

const MAX_NAME_CHARS: usize = 120;
const FALLBACK_EXTENSION: &str = ".jpg";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ContentRating {
    General,
    Mature,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginalAsset {
    pub url: String,
    pub filename: Option<String>,
}

/// Validated gallery entry. Built from the loose wire shape; anything the
/// sync path relies on is guaranteed present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemDescriptor {
    pub remote_id: String,
    pub title: String,
    pub tags: Vec<String>,
    pub downloadable: bool,
    pub deleted: bool,
    pub rating: ContentRating,
    pub original: Option<OriginalAsset>,
    pub preview_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DescriptorError {
    #[error("item has no remote id")]
    MissingId,
}

impl ItemDescriptor {
    pub fn from_wire(
        deviation: &Deviation,
        download: Option<&DownloadInfo>,
    ) -> Result<Self, DescriptorError> {
        let remote_id = deviation
            .deviationid
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or(DescriptorError::MissingId)?
            .to_string();
        let title = deviation
            .title
            .as_deref()
            .map(str::trim)
            .filter(|title| !title.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| remote_id.clone());

        let descriptor = Self {
            remote_id,
            title,
            tags: tags_from_wire(deviation.tags.as_deref()),
            downloadable: deviation.is_downloadable.unwrap_or(false),
            deleted: deviation.is_deleted.unwrap_or(false),
            rating: if deviation.is_mature.unwrap_or(false) {
                ContentRating::Mature
            } else {
                ContentRating::General
            },
            original: None,
            preview_url: best_preview(deviation),
        };
        Ok(match download {
            Some(info) => descriptor.with_download(info),
            None => descriptor,
        })
    }

    /// Attaches the original asset. Ignored unless the item is downloadable.
    pub fn with_download(mut self, info: &DownloadInfo) -> Self {
        let url = info.src.trim();
        if self.downloadable && !url.is_empty() {
            self.original = Some(OriginalAsset {
                url: url.to_string(),
                filename: info
                    .filename
                    .as_deref()
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(str::to_string),
            });
        }
        self
    }
}

/// Trims, drops empties and dedupes case-insensitively, first spelling wins.
pub fn normalize_tags<'a>(raw: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for tag in raw {
        let tag = tag.trim();
        if tag.is_empty() {
            continue;
        }
        if seen.insert(tag.to_lowercase()) {
            out.push(tag.to_string());
        }
    }
    out
}

pub fn tags_from_wire(tags: Option<&[Tag]>) -> Vec<String> {
    normalize_tags(tags.unwrap_or_default().iter().filter_map(Tag::name))
}

fn best_preview(deviation: &Deviation) -> Option<String> {
    let usable = |media: &MediaRef| {
        media
            .src
            .as_deref()
            .map(str::trim)
            .filter(|src| !src.is_empty())
            .map(str::to_string)
    };
    deviation
        .content
        .as_ref()
        .and_then(usable)
        .or_else(|| deviation.preview.as_ref().and_then(usable))
        .or_else(|| {
            deviation
                .thumbs
                .as_deref()
                .unwrap_or_default()
                .iter()
                .filter(|thumb| usable(*thumb).is_some())
                .max_by_key(|thumb| thumb.width.unwrap_or(0))
                .and_then(usable)
        })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResolvePolicy {
    pub allow_preview: bool,
    pub include_mature: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AssetKind {
    Original,
    Preview,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAsset {
    pub url: String,
    pub filename: String,
    pub kind: AssetKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Deleted,
    MatureContent,
    NoPermittedAsset,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Deleted => write!(f, "deleted upstream"),
            SkipReason::MatureContent => write!(f, "mature content not enabled"),
            SkipReason::NoPermittedAsset => write!(f, "no downloadable image"),
        }
    }
}

/// Picks the asset to fetch. Deterministic for a given item and policy.
pub fn resolve(item: &ItemDescriptor, policy: ResolvePolicy) -> Result<ResolvedAsset, SkipReason> {
    if item.deleted {
        return Err(SkipReason::Deleted);
    }
    if item.rating == ContentRating::Mature && !policy.include_mature {
        return Err(SkipReason::MatureContent);
    }
    if let Some(original) = &item.original {
        return Ok(ResolvedAsset {
            filename: derive_filename(item, original.filename.as_deref(), &original.url),
            url: original.url.clone(),
            kind: AssetKind::Original,
        });
    }
    if policy.allow_preview
        && let Some(preview) = &item.preview_url
    {
        return Ok(ResolvedAsset {
            filename: derive_filename(item, None, preview),
            url: preview.clone(),
            kind: AssetKind::Preview,
        });
    }
    Err(SkipReason::NoPermittedAsset)
}

/// `{id}_{stem}{ext}`; the id prefix lets a disk scan recover the remote id.
pub fn derive_filename(item: &ItemDescriptor, preferred: Option<&str>, url: &str) -> String {
    let (stem, ext) = match preferred {
        Some(name) => split_name(name),
        None => (String::new(), String::new()),
    };
    let ext = if !ext.is_empty() {
        ext
    } else {
        let from_url = extension_from_url(url);
        if from_url.is_empty() {
            FALLBACK_EXTENSION.to_string()
        } else {
            from_url
        }
    };
    let source = [stem.as_str(), item.title.as_str(), item.remote_id.as_str()]
        .into_iter()
        .find(|candidate| !candidate.trim().is_empty())
        .unwrap_or("deviation");
    format!(
        "{}_{}{}",
        sanitize_filename(&item.remote_id, "item"),
        sanitize_filename(source, "deviation"),
        ext
    )
}

/// Replaces characters no common filesystem accepts, collapses whitespace
/// and caps the length.
pub fn sanitize_filename(name: &str, fallback: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| {
            if matches!(c, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*') || c.is_control()
            {
                '_'
            } else {
                c
            }
        })
        .collect();
    let trimmed = replaced.trim().trim_matches('.');
    let collapsed = trimmed.split_whitespace().collect::<Vec<_>>().join(" ");
    let cleaned = if collapsed.is_empty() {
        fallback.to_string()
    } else {
        collapsed
    };
    cleaned.chars().take(MAX_NAME_CHARS).collect()
}

fn split_name(name: &str) -> (String, String) {
    let path = Path::new(name);
    let stem = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy().to_lowercase()))
        .unwrap_or_default();
    (stem, ext)
}

fn extension_from_url(url: &str) -> String {
    let Ok(parsed) = Url::parse(url) else {
        return String::new();
    };
    let Some(last) = parsed
        .path_segments()
        .and_then(|mut segments| segments.next_back())
    else {
        return String::new();
    };
    let decoded = percent_decode(last);
    Path::new(&decoded)
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy().to_lowercase()))
        .unwrap_or_default()
}

fn percent_decode(segment: &str) -> String {
    url::form_urlencoded::parse(format!("x={}", segment.replace('+', "%2B")).as_bytes())
        .next()
        .map(|(_, value)| value.into_owned())
        .unwrap_or_else(|| segment.to_string())
}
