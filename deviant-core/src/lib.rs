mod client;
mod oauth;

pub use client::{
    ApiErrorClass, DEFAULT_BASE_URL, DeviantClient, DeviantError, Deviation, DownloadInfo,
    GalleryPage, MAX_PAGE_SIZE, MediaRef, Tag,
};
pub use oauth::{OAuthClient, OAuthError, OAuthToken};
