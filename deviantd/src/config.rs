use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Args;
use deviant_core::MAX_PAGE_SIZE;
use thiserror::Error;

use crate::sync::engine::{DEFAULT_MAX_SEEN, MIN_MAX_SEEN, RunConfig};

const DEFAULT_OUTPUT_DIR: &str = "downloads";
const DEFAULT_STATE_FILE: &str = "state.json";
const DEFAULT_PAGES_PER_CHECK: u64 = 3;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const MIN_REQUEST_TIMEOUT_SECS: u64 = 5;
const DEFAULT_USER_AGENT: &str = concat!("deviantd/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration invalid: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppConfig {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub artists: Vec<String>,
    pub output_dir: PathBuf,
    pub db_file: PathBuf,
    pub state_file: PathBuf,
    pub pages_per_check: u32,
    pub page_size: u32,
    pub poll_interval: Duration,
    pub include_mature: bool,
    pub allow_preview: bool,
    pub seed_only: bool,
    pub verbose: bool,
    pub max_seen: u32,
    pub request_timeout: Duration,
    pub user_agent: String,
}

/// Command-line values that win over the environment.
#[derive(Args, Clone, Debug, Default)]
pub struct Overrides {
    /// Artist to watch; repeat for several. Replaces DA_USERNAMES.
    #[arg(long = "artist", global = true)]
    pub artists: Vec<String>,
    #[arg(long, global = true)]
    pub output_dir: Option<PathBuf>,
    #[arg(long, global = true)]
    pub db_file: Option<PathBuf>,
    #[arg(long, global = true)]
    pub state_file: Option<PathBuf>,
    #[arg(long, global = true)]
    pub pages: Option<u32>,
    #[arg(long, global = true)]
    pub page_size: Option<u32>,
    #[arg(long, global = true)]
    pub include_mature: bool,
    #[arg(long, global = true)]
    pub allow_preview: bool,
    #[arg(long, global = true)]
    pub seed_only: bool,
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let home = dirs::home_dir();
        Self::from_source(|name| std::env::var(name).ok(), home.as_deref())
    }

    /// Builds the config from a variable lookup. Unparsable numbers and
    /// booleans fall back to their defaults.
    pub fn from_source<F>(lookup: F, home: Option<&Path>) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let read_path = |name: &str| read(name).map(|value| expand_with_home(&value, home));
        let read_u64 = |name: &str, default: u64| {
            read(name)
                .and_then(|value| value.parse::<u64>().ok())
                .unwrap_or(default)
        };
        let read_bool = |name: &str, default: bool| {
            read(name)
                .and_then(|value| parse_bool(&value))
                .unwrap_or(default)
        };

        let artists = read("DA_USERNAMES")
            .or_else(|| read("DA_USERNAME"))
            .map(|value| parse_usernames(&value))
            .unwrap_or_default();
        let state_file = read_path("STATE_FILE").unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_FILE));
        let db_file = read_path("DB_FILE").unwrap_or_else(|| default_db_file(&state_file));

        Self {
            client_id: read("DA_CLIENT_ID"),
            client_secret: read("DA_CLIENT_SECRET"),
            artists,
            output_dir: read_path("OUTPUT_DIR").unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR)),
            db_file,
            state_file,
            pages_per_check: to_u32(read_u64("PAGES_PER_CHECK", DEFAULT_PAGES_PER_CHECK).max(1)),
            page_size: to_u32(read_u64("PAGE_SIZE", u64::from(MAX_PAGE_SIZE)))
                .clamp(1, MAX_PAGE_SIZE),
            poll_interval: Duration::from_secs(read_u64("POLL_INTERVAL_SECONDS", 0)),
            include_mature: read_bool("INCLUDE_MATURE", false),
            allow_preview: read_bool("ALLOW_PREVIEW", false),
            seed_only: read_bool("SEED_ONLY", false),
            verbose: read_bool("VERBOSE", false),
            max_seen: to_u32(read_u64("MAX_SEEN_IDS", u64::from(DEFAULT_MAX_SEEN)))
                .max(MIN_MAX_SEEN),
            request_timeout: Duration::from_secs(
                read_u64("REQUEST_TIMEOUT_SECONDS", DEFAULT_REQUEST_TIMEOUT_SECS)
                    .max(MIN_REQUEST_TIMEOUT_SECS),
            ),
            user_agent: read("USER_AGENT").unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
        }
    }

    pub fn apply(&mut self, overrides: &Overrides) {
        if !overrides.artists.is_empty() {
            self.artists = parse_usernames(&overrides.artists.join(","));
        }
        if let Some(dir) = &overrides.output_dir {
            self.output_dir = dir.clone();
        }
        if let Some(state_file) = &overrides.state_file {
            self.state_file = state_file.clone();
        }
        if let Some(db_file) = &overrides.db_file {
            self.db_file = db_file.clone();
        }
        if let Some(pages) = overrides.pages {
            self.pages_per_check = pages.max(1);
        }
        if let Some(size) = overrides.page_size {
            self.page_size = size.clamp(1, MAX_PAGE_SIZE);
        }
        self.include_mature |= overrides.include_mature;
        self.allow_preview |= overrides.allow_preview;
        self.seed_only |= overrides.seed_only;
        self.verbose |= overrides.verbose;
    }

    /// Credentials and artists are only needed for talking to the remote API.
    pub fn validate_for_sync(&self) -> Result<(&str, &str), ConfigError> {
        let (Some(client_id), Some(client_secret)) = (&self.client_id, &self.client_secret) else {
            return Err(ConfigError::Invalid(
                "DA_CLIENT_ID and DA_CLIENT_SECRET must be set".to_string(),
            ));
        };
        if self.artists.is_empty() {
            return Err(ConfigError::Invalid(
                "no artists configured; set DA_USERNAMES or pass --artist".to_string(),
            ));
        }
        Ok((client_id.as_str(), client_secret.as_str()))
    }

    pub fn run_config(&self) -> RunConfig {
        RunConfig {
            artists: self.artists.clone(),
            start_page: 1,
            end_page: self.pages_per_check,
            page_size: self.page_size,
            include_mature: self.include_mature,
            allow_preview: self.allow_preview,
            seed_only: self.seed_only,
            verbose: self.verbose,
            max_seen: self.max_seen,
        }
    }
}

/// Comma or newline separated names, deduplicated case-insensitively with
/// the first spelling kept.
pub fn parse_usernames(value: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    value
        .split([',', '\n', '\r'])
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .filter(|name| seen.insert(name.to_lowercase()))
        .map(str::to_string)
        .collect()
}

pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Some(true),
        "0" | "false" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}

fn default_db_file(state_file: &Path) -> PathBuf {
    if state_file.file_stem().is_some() {
        state_file.with_extension("db")
    } else {
        PathBuf::from("state.db")
    }
}

fn expand_with_home(value: &str, home: Option<&Path>) -> PathBuf {
    let Some(home) = home else {
        return PathBuf::from(value);
    };
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn to_u32(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}
