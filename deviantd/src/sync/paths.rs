use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("relative path is empty")]
    Empty,
    #[error("relative path contains unsupported component")]
    UnsupportedComponent,
    #[error("path is outside the download root")]
    OutsideRoot,
    #[error("no free file name for {0}")]
    Exhausted(String),
}

const MAX_SUFFIX: u32 = 10_000;

/// Maps a slash-separated store path under the download root.
pub fn resolve_under_root(root: &Path, relative: &str) -> Result<PathBuf, PathError> {
    let trimmed = relative.trim();
    if trimmed.is_empty() {
        return Err(PathError::Empty);
    }

    let mut out = root.to_path_buf();
    let mut pushed = false;
    for component in Path::new(trimmed).components() {
        match component {
            Component::Normal(part) => {
                out.push(part);
                pushed = true;
            }
            Component::CurDir => continue,
            Component::RootDir | Component::ParentDir | Component::Prefix(_) => {
                return Err(PathError::UnsupportedComponent);
            }
        }
    }
    if !pushed {
        return Err(PathError::Empty);
    }
    Ok(out)
}

/// Store key for a file below the root: components joined with `/`.
pub fn relative_key(root: &Path, path: &Path) -> Result<String, PathError> {
    let relative = path.strip_prefix(root).map_err(|_| PathError::OutsideRoot)?;
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => continue,
            _ => return Err(PathError::UnsupportedComponent),
        }
    }
    if parts.is_empty() {
        return Err(PathError::Empty);
    }
    Ok(parts.join("/"))
}

/// `name.ext` -> `name (n).ext`.
pub fn suffixed_name(name: &str, n: u32) -> String {
    if let Some((stem, ext)) = name.rsplit_once('.')
        && !stem.is_empty()
    {
        return format!("{stem} ({n}).{ext}");
    }
    format!("{name} ({n})")
}

/// First path in `dir` that does not exist yet, starting with `name` and
/// then trying ` (2)`, ` (3)` and so on.
pub fn unique_path(dir: &Path, name: &str) -> Result<PathBuf, PathError> {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return Ok(candidate);
    }
    for n in 2..MAX_SUFFIX {
        let candidate = dir.join(suffixed_name(name, n));
        if !candidate.exists() {
            return Ok(candidate);
        }
    }
    Err(PathError::Exhausted(name.to_string()))
}
