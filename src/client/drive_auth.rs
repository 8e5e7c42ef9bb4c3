//! OAuth refresh-token exchange for the Drive integration.

use crate::{
    client::{drive::DriveError, json_or_snippet},
    config::DriveSettings,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const DEFAULT_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Short-lived access token returned by the token endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessToken {
    pub access_token: String,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

/// Trades a long-lived refresh token for access tokens.
#[derive(Clone)]
pub struct DriveAuth {
    http: reqwest::Client,
    client_id: String,
    client_secret: String,
    refresh_token: String,
    token_url: String,
}

impl DriveAuth {
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        refresh_token: impl Into<String>,
    ) -> Result<Self, DriveError> {
        Ok(Self {
            http: reqwest::Client::builder().build()?,
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            refresh_token: refresh_token.into(),
            token_url: DEFAULT_TOKEN_URL.to_string(),
        })
    }

    /// Build from configuration; every credential must be present.
    pub fn from_settings(settings: &DriveSettings) -> Result<Self, DriveError> {
        match (
            settings.client_id.as_deref(),
            settings.client_secret.as_deref(),
            settings.refresh_token.as_deref(),
        ) {
            (Some(id), Some(secret), Some(refresh))
                if !id.is_empty() && !secret.is_empty() && !refresh.is_empty() =>
            {
                let auth = Self::new(id, secret, refresh)?;
                Ok(match settings.token_url.as_deref() {
                    Some(url) if !url.is_empty() => auth.with_token_url(url),
                    _ => auth,
                })
            }
            _ => Err(DriveError::NotConfigured),
        }
    }

    pub fn with_token_url(mut self, url: impl Into<String>) -> Self {
        self.token_url = url.into();
        self
    }

    pub async fn access_token(&self) -> Result<AccessToken, DriveError> {
        debug!("requesting Drive access token from {}", self.token_url);
        let resp = self
            .http
            .post(&self.token_url)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("refresh_token", self.refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(DriveError::Token(json_or_snippet(status, &body)));
        }

        let token: AccessToken = serde_json::from_str(&body)
            .map_err(|err| DriveError::InvalidResponse(format!("token response: {err}")))?;
        if token.access_token.is_empty() {
            return Err(DriveError::InvalidResponse(
                "token response had no access_token".into(),
            ));
        }
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incomplete_settings_are_not_configured() {
        let settings = DriveSettings {
            client_id: Some("id".into()),
            client_secret: None,
            refresh_token: Some("refresh".into()),
            ..Default::default()
        };
        assert!(matches!(
            DriveAuth::from_settings(&settings),
            Err(DriveError::NotConfigured)
        ));
    }

    #[test]
    fn complete_settings_build_an_authenticator() {
        let settings = DriveSettings {
            client_id: Some("id".into()),
            client_secret: Some("secret".into()),
            refresh_token: Some("refresh".into()),
            folder_id: Some("folder".into()),
            token_url: Some("http://127.0.0.1:9/token".into()),
            ..Default::default()
        };
        let auth = DriveAuth::from_settings(&settings).unwrap();
        assert_eq!(auth.token_url, "http://127.0.0.1:9/token");
    }
}
