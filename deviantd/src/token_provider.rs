use deviant_core::{OAuthClient, OAuthToken};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum TokenProviderError {
    #[error("oauth client is required to obtain a token")]
    MissingOAuthClient,
    #[error("client credential exchange failed: {0}")]
    OAuth(#[from] deviant_core::OAuthError),
}

#[derive(Debug, Clone, Default)]
struct TokenState {
    access_token: Option<String>,
    expires_at: Option<i64>,
}

/// Hands out app-level bearer tokens, exchanging client credentials again
/// shortly before expiry.
pub struct TokenProvider {
    state: TokenState,
    oauth_client: Option<OAuthClient>,
    refresh_skew_secs: i64,
}

impl TokenProvider {
    pub fn new(oauth_client: OAuthClient) -> Self {
        Self {
            state: TokenState::default(),
            oauth_client: Some(oauth_client),
            refresh_skew_secs: 60,
        }
    }

    /// A provider bound to one token that can never be refreshed.
    pub fn fixed(access_token: impl Into<String>) -> Self {
        Self {
            state: TokenState {
                access_token: Some(access_token.into()),
                expires_at: None,
            },
            oauth_client: None,
            refresh_skew_secs: 60,
        }
    }

    pub fn can_refresh(&self) -> bool {
        self.oauth_client.is_some()
    }

    pub async fn valid_access_token(&mut self) -> Result<String, TokenProviderError> {
        if let Some(token) = &self.state.access_token
            && !self.should_refresh()
        {
            return Ok(token.clone());
        }
        self.refresh_now().await
    }

    pub async fn refresh_now(&mut self) -> Result<String, TokenProviderError> {
        let client = self
            .oauth_client
            .as_ref()
            .ok_or(TokenProviderError::MissingOAuthClient)?;
        let token = client.client_credentials().await?;
        debug!(expires_in = ?token.expires_in, "obtained access token");
        self.state = state_from_token(&token);
        Ok(token.access_token)
    }

    fn should_refresh(&self) -> bool {
        let Some(expires_at) = self.state.expires_at else {
            return false;
        };
        expires_at <= now_unix().saturating_add(self.refresh_skew_secs)
    }
}

fn state_from_token(token: &OAuthToken) -> TokenState {
    TokenState {
        access_token: Some(token.access_token.clone()),
        expires_at: token
            .expires_in
            .map(|secs| now_unix().saturating_add(secs.min(i64::MAX as u64) as i64)),
    }
}

fn now_unix() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
