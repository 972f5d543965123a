//! Twitch Helix client: app access tokens, user lookup, live status and
//! recent clips.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use super::StreamSource;
use crate::config::TwitchConfig;

/// Client ids and secrets issued by the Twitch developer console have this
/// fixed length.
pub const CREDENTIAL_LEN: usize = 30;

#[derive(Debug, thiserror::Error)]
pub enum TwitchError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Credentials rejected: {0}")]
    Rejected(String),

    #[error("Access token is invalid or expired")]
    Unauthorized,

    #[error("Twitch API error (status {status}): {message}")]
    ApiError { status: u16, message: String },
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct HelixResponse<T> {
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct HelixUser {
    id: String,
}

#[derive(Debug, Deserialize)]
struct HelixClip {
    url: String,
    title: String,
    creator_name: String,
    created_at: DateTime<Utc>,
}

/// A clip card, with the creation time as Unix milliseconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Clip {
    pub title: String,
    pub url: String,
    pub creator: String,
    pub created_at: i64,
}

pub struct TwitchClient {
    http: reqwest::Client,
    auth_url: String,
    helix_url: String,
}

impl TwitchClient {
    pub fn new(config: &TwitchConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            auth_url: config.auth_url.clone(),
            helix_url: config.helix_url.trim_end_matches('/').to_string(),
        }
    }

    async fn helix_get<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        query: &[(&str, &str)],
        client_id: &str,
        token: &str,
    ) -> Result<HelixResponse<T>, TwitchError> {
        let url = format!("{}/{}", self.helix_url, endpoint);
        debug!("GET {}", url);

        let resp = self
            .http
            .get(&url)
            .query(query)
            .header("Client-ID", client_id)
            .bearer_auth(token)
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await?;

        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(TwitchError::Unauthorized);
        }
        if !status.is_success() {
            return Err(TwitchError::ApiError {
                status: status.as_u16(),
                message: body,
            });
        }

        Ok(serde_json::from_str(&body)?)
    }
}

#[async_trait]
impl StreamSource for TwitchClient {
    /// Client-credentials grant.
    async fn access_token(
        &self,
        client_id: &str,
        client_secret: &str,
    ) -> Result<String, TwitchError> {
        let params = [
            ("client_id", client_id),
            ("client_secret", client_secret),
            ("grant_type", "client_credentials"),
        ];

        let resp = self.http.post(&self.auth_url).form(&params).send().await?;
        let status = resp.status();
        let body = resp.text().await?;

        if status.is_client_error() {
            return Err(TwitchError::Rejected(body));
        }
        if !status.is_success() {
            return Err(TwitchError::ApiError {
                status: status.as_u16(),
                message: body,
            });
        }

        let token: TokenResponse = serde_json::from_str(&body)?;
        Ok(token.access_token)
    }

    async fn user_id(
        &self,
        login: &str,
        client_id: &str,
        token: &str,
    ) -> Result<Option<String>, TwitchError> {
        let resp: HelixResponse<HelixUser> = self
            .helix_get("users", &[("login", login)], client_id, token)
            .await?;
        Ok(resp.data.into_iter().next().map(|u| u.id))
    }

    async fn is_live(
        &self,
        user_id: &str,
        client_id: &str,
        token: &str,
    ) -> Result<bool, TwitchError> {
        let resp: HelixResponse<serde_json::Value> = self
            .helix_get("streams", &[("user_id", user_id)], client_id, token)
            .await?;
        Ok(!resp.data.is_empty())
    }

    /// Helix orders clips by views, so the newest one is picked by
    /// `created_at` among the clips created since `since`.
    async fn latest_clip(
        &self,
        user_id: &str,
        client_id: &str,
        token: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<Clip>, TwitchError> {
        let started_at = since.to_rfc3339_opts(SecondsFormat::Secs, true);
        let resp: HelixResponse<HelixClip> = self
            .helix_get(
                "clips",
                &[
                    ("broadcaster_id", user_id),
                    ("first", "10"),
                    ("started_at", started_at.as_str()),
                ],
                client_id,
                token,
            )
            .await?;

        Ok(resp
            .data
            .into_iter()
            .max_by_key(|c| c.created_at)
            .map(|c| Clip {
                title: c.title,
                url: c.url,
                creator: c.creator_name,
                created_at: c.created_at.timestamp_millis(),
            }))
    }
}
