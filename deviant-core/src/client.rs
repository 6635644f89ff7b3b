use std::time::SystemTime;

use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

pub const DEFAULT_BASE_URL: &str = "https://www.deviantart.com";
const API_PREFIX: &str = "/api/v1/oauth2";

/// Largest page the gallery endpoint accepts.
pub const MAX_PAGE_SIZE: u32 = 24;

#[derive(Debug, Error)]
pub enum DeviantError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("base url cannot carry path segments")]
    InvalidBaseUrl,
    #[error("api returned {status}: {body}")]
    Api {
        status: StatusCode,
        body: String,
        retry_after: Option<u64>,
    },
    #[error("invalid response body: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    Forbidden,
    NotFound,
    RateLimit,
    Transient,
    Permanent,
}

#[derive(Clone)]
pub struct DeviantClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl DeviantClient {
    pub fn new(token: impl Into<String>) -> Result<Self, DeviantError> {
        Self::with_base_url(DEFAULT_BASE_URL, token)
    }

    pub fn with_base_url(base_url: &str, token: impl Into<String>) -> Result<Self, DeviantError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            token: token.into(),
        })
    }

    /// Replaces the HTTP client, e.g. one carrying a user agent and timeout.
    pub fn with_http(mut self, http: Client) -> Self {
        self.http = http;
        self
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub async fn list_gallery(
        &self,
        username: &str,
        offset: u32,
        limit: u32,
        include_mature: bool,
    ) -> Result<GalleryPage, DeviantError> {
        let mut url = self.endpoint("/gallery/all")?;
        url.query_pairs_mut()
            .append_pair("username", username)
            .append_pair("offset", &offset.to_string())
            .append_pair("limit", &limit.clamp(1, MAX_PAGE_SIZE).to_string())
            .append_pair("mature_content", bool_param(include_mature));
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn get_download_info(
        &self,
        deviation_id: &str,
        include_mature: bool,
    ) -> Result<DownloadInfo, DeviantError> {
        let mut url = self.endpoint_with_id("/deviation/download", deviation_id)?;
        url.query_pairs_mut()
            .append_pair("mature_content", bool_param(include_mature));
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn get_deviation(
        &self,
        deviation_id: &str,
        include_mature: bool,
    ) -> Result<Deviation, DeviantError> {
        let mut url = self.endpoint_with_id("/deviation", deviation_id)?;
        url.query_pairs_mut()
            .append_pair("mature_content", bool_param(include_mature));
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    fn endpoint(&self, path: &str) -> Result<Url, DeviantError> {
        Ok(self.base_url.join(&format!("{API_PREFIX}{path}"))?)
    }

    fn endpoint_with_id(&self, path: &str, id: &str) -> Result<Url, DeviantError> {
        let mut url = self.endpoint(path)?;
        url.path_segments_mut()
            .map_err(|_| DeviantError::InvalidBaseUrl)?
            .pop_if_empty()
            .push(id);
        Ok(url)
    }

    async fn handle_response<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, DeviantError> {
        let status = response.status();
        let retry_after = retry_after_secs(response.headers());
        let body = response.text().await?;
        if !status.is_success() {
            return Err(DeviantError::Api {
                status,
                body,
                retry_after,
            });
        }
        // The API occasionally reports failures inside a 200 payload.
        let value: serde_json::Value = serde_json::from_str(&body)?;
        if value.get("error").is_some() {
            return Err(DeviantError::Api {
                status,
                body,
                retry_after,
            });
        }
        Ok(serde_json::from_value(value)?)
    }
}

impl DeviantError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            DeviantError::Api { status, body, .. } => Some(classify_api_status(*status, body)),
            DeviantError::Request(err) if err.is_timeout() || err.is_connect() || err.is_request() => {
                Some(ApiErrorClass::Transient)
            }
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.classification(),
            Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient)
        )
    }

    pub fn is_auth(&self) -> bool {
        matches!(self.classification(), Some(ApiErrorClass::Auth))
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            DeviantError::Api { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

fn classify_api_status(status: StatusCode, body: &str) -> ApiErrorClass {
    if status == StatusCode::UNAUTHORIZED || body.contains("invalid_token") {
        ApiErrorClass::Auth
    } else if status == StatusCode::FORBIDDEN {
        ApiErrorClass::Forbidden
    } else if matches!(status, StatusCode::NOT_FOUND | StatusCode::GONE) {
        ApiErrorClass::NotFound
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

fn retry_after_secs(headers: &HeaderMap) -> Option<u64> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(seconds);
    }
    let at = httpdate::parse_http_date(value).ok()?;
    Some(
        at.duration_since(SystemTime::now())
            .map(|d| d.as_secs())
            .unwrap_or(0),
    )
}

fn bool_param(value: bool) -> &'static str {
    if value { "true" } else { "false" }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct GalleryPage {
    #[serde(default)]
    pub results: Vec<Deviation>,
    #[serde(default)]
    pub has_more: bool,
    #[serde(default)]
    pub next_offset: Option<u32>,
}

/// Gallery entry as the API sends it. Every field is optional on the wire;
/// callers validate before use.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Deviation {
    #[serde(default)]
    pub deviationid: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub is_downloadable: Option<bool>,
    #[serde(default)]
    pub is_deleted: Option<bool>,
    #[serde(default)]
    pub is_mature: Option<bool>,
    #[serde(default)]
    pub content: Option<MediaRef>,
    #[serde(default)]
    pub preview: Option<MediaRef>,
    #[serde(default)]
    pub thumbs: Option<Vec<MediaRef>>,
    #[serde(default)]
    pub tags: Option<Vec<Tag>>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct MediaRef {
    #[serde(default)]
    pub src: Option<String>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub filesize: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(untagged)]
pub enum Tag {
    Name(String),
    Object {
        #[serde(default)]
        tag_name: Option<String>,
        #[serde(default)]
        tag: Option<String>,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        title: Option<String>,
    },
    Other(serde_json::Value),
}

impl Tag {
    pub fn name(&self) -> Option<&str> {
        match self {
            Tag::Name(name) => Some(name.as_str()),
            Tag::Object {
                tag_name,
                tag,
                name,
                title,
            } => [tag_name, tag, name, title]
                .into_iter()
                .flatten()
                .map(String::as_str)
                .find(|value| !value.trim().is_empty()),
            Tag::Other(_) => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DownloadInfo {
    pub src: String,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub filesize: Option<u64>,
}
