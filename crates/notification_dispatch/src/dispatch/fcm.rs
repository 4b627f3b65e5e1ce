/*  Copyright 2022-23, Juspay India Pvt Ltd
    This program is free software: you can redistribute it and/or modify it under the terms of the GNU Affero General Public License
    as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version. This program
    is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY
    or FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more details. You should have received a copy of
    the GNU Affero General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.
*/

use std::{collections::BTreeMap, time::Duration};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures::{stream, StreamExt, TryStreamExt};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::common::types::{MobileToken, NotificationContent};

use super::mobile::{MessagingClient, MessagingError, SendError, SendErrorKind, SendResponse};

const OAUTH_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const MESSAGING_SCOPE: &str = "https://www.googleapis.com/auth/firebase.messaging";
const SEND_CONCURRENCY: usize = 8;

fn default_token_uri() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

/// The fields of a Google service-account JSON key this client needs.
#[derive(Debug, Deserialize, Clone)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

#[derive(Serialize)]
struct GrantClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct GrantResponse {
    access_token: String,
    expires_in: i64,
}

struct CachedToken {
    access_token: String,
    expires_at: chrono::DateTime<Utc>,
}

/// Mints OAuth2 bearer tokens for the messaging scope via the signed-JWT
/// grant, caching them until shortly before expiry.
struct GoogleTokenProvider {
    client_email: String,
    token_uri: String,
    signing_key: EncodingKey,
    http: reqwest::Client,
    cached: Mutex<Option<CachedToken>>,
}

impl GoogleTokenProvider {
    fn new(key: &ServiceAccountKey, http: reqwest::Client) -> Result<Self> {
        let signing_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .context("failed to parse service-account private key")?;
        Ok(GoogleTokenProvider {
            client_email: key.client_email.clone(),
            token_uri: key.token_uri.clone(),
            signing_key,
            http,
            cached: Mutex::new(None),
        })
    }

    async fn bearer_token(&self) -> Result<String, MessagingError> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at > Utc::now() + chrono::Duration::seconds(60) {
                return Ok(token.access_token.clone());
            }
        }

        let now = Utc::now().timestamp();
        let claims = GrantClaims {
            iss: &self.client_email,
            scope: MESSAGING_SCOPE,
            aud: &self.token_uri,
            iat: now,
            exp: now + 3600,
        };
        let assertion =
            jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &self.signing_key)
                .map_err(|err| MessagingError::Transport(format!("jwt grant signing: {err}")))?;

        let response = self
            .http
            .post(&self.token_uri)
            .form(&[("grant_type", OAUTH_GRANT_TYPE), ("assertion", &assertion)])
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|err| MessagingError::Transport(format!("token exchange: {err}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(MessagingError::Transport(format!(
                "token exchange returned {status}: {body}"
            )));
        }

        let grant: GrantResponse = response
            .json()
            .await
            .map_err(|err| MessagingError::Transport(format!("token exchange decode: {err}")))?;

        debug!("Minted messaging bearer token, expires in {}s", grant.expires_in);
        let access_token = grant.access_token.clone();
        *cached = Some(CachedToken {
            access_token: grant.access_token,
            expires_at: Utc::now() + chrono::Duration::seconds(grant.expires_in),
        });
        Ok(access_token)
    }
}

#[derive(Serialize)]
struct FcmNotification<'a> {
    title: &'a str,
    body: &'a str,
}

#[derive(Serialize)]
struct AndroidNotification<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    sound: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    icon: Option<&'a str>,
}

#[derive(Serialize)]
struct AndroidConfig<'a> {
    notification: AndroidNotification<'a>,
}

#[derive(Serialize)]
struct FcmMessage<'a> {
    token: &'a str,
    notification: FcmNotification<'a>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    data: &'a BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    android: Option<AndroidConfig<'a>>,
}

#[derive(Serialize)]
struct FcmSendRequest<'a> {
    message: FcmMessage<'a>,
}

#[derive(Deserialize)]
struct FcmSendResponse {
    name: String,
}

#[derive(Deserialize, Default)]
struct FcmErrorBody {
    #[serde(default)]
    error: FcmErrorDetail,
}

#[derive(Deserialize, Default)]
struct FcmErrorDetail {
    #[serde(default)]
    status: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    details: Vec<serde_json::Value>,
}

impl FcmErrorDetail {
    /// The provider's per-message error code, carried in the FcmError detail.
    fn fcm_error_code(&self) -> Option<String> {
        self.details.iter().find_map(|detail| {
            detail
                .get("errorCode")
                .and_then(|code| code.as_str())
                .map(|code| code.to_string())
        })
    }
}

/// Mobile-push provider client speaking the FCM HTTP v1 API. The v1 API has
/// no multicast endpoint, so a batch is sent as one request per token with
/// bounded concurrency.
pub struct FcmClient {
    http: reqwest::Client,
    send_url: String,
    tokens: GoogleTokenProvider,
}

impl FcmClient {
    pub fn new(project_id: &str, key: &ServiceAccountKey) -> Result<Self> {
        let http = reqwest::Client::new();
        let tokens = GoogleTokenProvider::new(key, http.clone())?;
        info!("Mobile dispatcher enabled for project {project_id}");
        Ok(FcmClient {
            http,
            send_url: format!(
                "https://fcm.googleapis.com/v1/projects/{project_id}/messages:send"
            ),
            tokens,
        })
    }

    pub fn from_file(project_id: &str, path: &str) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read service account file: {path}"))?;
        let key: ServiceAccountKey =
            serde_json::from_str(&raw).context("parse service account file")?;
        Self::new(project_id, &key)
    }

    async fn send_one(
        &self,
        bearer: &str,
        token: &MobileToken,
        content: &NotificationContent,
        data: &BTreeMap<String, String>,
    ) -> Result<SendResponse, MessagingError> {
        let android = (content.sound.is_some() || content.icon.is_some()).then(|| AndroidConfig {
            notification: AndroidNotification {
                sound: content.sound.as_deref(),
                icon: content.icon.as_deref(),
            },
        });
        let request = FcmSendRequest {
            message: FcmMessage {
                token: &token.0,
                notification: FcmNotification {
                    title: &content.title,
                    body: &content.body,
                },
                data,
                android,
            },
        };

        let response = match self
            .http
            .post(&self.send_url)
            .bearer_auth(bearer)
            .json(&request)
            .timeout(Duration::from_secs(10))
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                // A failed request for one token does not condemn the batch.
                return Ok(SendResponse {
                    token: token.clone(),
                    result: Err(SendError {
                        kind: SendErrorKind::Unavailable,
                        detail: err.to_string(),
                    }),
                });
            }
        };

        let status = response.status();
        if status.is_success() {
            let body: FcmSendResponse = response.json().await.map_err(|err| {
                MessagingError::Transport(format!("send response decode: {err}"))
            })?;
            return Ok(SendResponse {
                token: token.clone(),
                result: Ok(body.name),
            });
        }

        let body: FcmErrorBody = response.json().await.unwrap_or_default();
        let detail = body.error;
        let error_code = detail.fcm_error_code().unwrap_or_else(|| detail.status.clone());

        let kind = match (status.as_u16(), error_code.as_str()) {
            (404, _) | (_, "UNREGISTERED") => SendErrorKind::Unregistered,
            (403, _) | (_, "SENDER_ID_MISMATCH") => SendErrorKind::SenderMismatch,
            (400, _) => {
                if detail.message.to_ascii_lowercase().contains("token") {
                    SendErrorKind::InvalidToken
                } else {
                    // The payload itself was rejected; every token in the
                    // batch would fail the same way.
                    return Err(MessagingError::InvalidArgument(detail.message));
                }
            }
            (429, _) | (_, "QUOTA_EXCEEDED") => SendErrorKind::QuotaExceeded,
            (503, _) | (_, "UNAVAILABLE") => SendErrorKind::Unavailable,
            (500, _) | (_, "INTERNAL") => SendErrorKind::Internal,
            _ => SendErrorKind::Unknown,
        };

        Ok(SendResponse {
            token: token.clone(),
            result: Err(SendError {
                kind,
                detail: format!("{status}: {}", detail.message),
            }),
        })
    }
}

#[async_trait]
impl MessagingClient for FcmClient {
    async fn send_each(
        &self,
        tokens: &[MobileToken],
        content: &NotificationContent,
        data: &BTreeMap<String, String>,
    ) -> Result<Vec<SendResponse>, MessagingError> {
        let bearer = self.tokens.bearer_token().await?;

        let bearer = &bearer;
        let futures = tokens
            .iter()
            .map(|token| self.send_one(bearer, token, content, data))
            .collect::<Vec<_>>();

        stream::iter(futures).buffered(SEND_CONCURRENCY).try_collect().await
    }
}
