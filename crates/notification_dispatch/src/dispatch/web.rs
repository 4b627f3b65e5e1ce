/*  Copyright 2022-23, Juspay India Pvt Ltd
    This program is free software: you can redistribute it and/or modify it under the terms of the GNU Affero General Public License
    as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version. This program
    is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY
    or FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more details. You should have received a copy of
    the GNU Affero General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.
*/

use std::{collections::BTreeMap, sync::Arc, time::Instant};

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};
use web_push::{
    ContentEncoding, SubscriptionInfo, VapidSignatureBuilder, WebPushClient, WebPushError,
    WebPushMessage, WebPushMessageBuilder,
};

use crate::{
    common::types::{NotificationContent, WebSubscription},
    tools::prometheus::DISPATCH_DURATION,
};

use super::DispatchError;

/// Push services drop undeliverable messages after this many seconds.
const WEB_PUSH_TTL_SECONDS: u32 = 60;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct VapidConfig {
    pub public_key: String,
    pub private_key: String,
    pub subscriber_email: String,
}

impl VapidConfig {
    pub fn is_configured(&self) -> bool {
        !self.public_key.is_empty() && !self.private_key.is_empty()
    }
}

/// Transport seam so the classification logic is testable without a live
/// push service.
#[async_trait]
pub trait WebPushTransport: Send + Sync {
    async fn send(&self, message: WebPushMessage) -> Result<(), WebPushError>;
}

pub struct HttpWebPushTransport {
    client: WebPushClient,
}

impl HttpWebPushTransport {
    pub fn new() -> Result<Self, WebPushError> {
        Ok(HttpWebPushTransport {
            client: WebPushClient::new()?,
        })
    }
}

#[async_trait]
impl WebPushTransport for HttpWebPushTransport {
    async fn send(&self, message: WebPushMessage) -> Result<(), WebPushError> {
        self.client.send(message).await
    }
}

#[derive(Serialize)]
struct WebNotification<'a> {
    title: &'a str,
    body: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    icon: Option<&'a str>,
}

#[derive(Serialize)]
struct WebPayload<'a> {
    notification: WebNotification<'a>,
    data: &'a BTreeMap<String, String>,
}

pub(crate) fn build_payload(
    content: &NotificationContent,
    data: &BTreeMap<String, String>,
) -> Result<Vec<u8>, DispatchError> {
    serde_json::to_vec(&WebPayload {
        notification: WebNotification {
            title: &content.title,
            body: &content.body,
            icon: content.icon.as_deref(),
        },
        data,
    })
    .map_err(|err| DispatchError::Payload(err.to_string()))
}

#[derive(Debug)]
pub struct WebDispatchOutcome {
    pub receipt: String,
    pub invalid_subscriptions: Vec<WebSubscription>,
}

/// Sends VAPID-signed web-push requests, one per subscription endpoint.
/// Per-endpoint failures never fail the call; only endpoints the push
/// service has declared gone are reported back for pruning.
pub struct WebDispatcher {
    transport: Arc<dyn WebPushTransport>,
    vapid: VapidConfig,
}

impl WebDispatcher {
    pub fn new(transport: Arc<dyn WebPushTransport>, vapid: VapidConfig) -> Self {
        WebDispatcher { transport, vapid }
    }

    fn build_message(
        &self,
        info: &SubscriptionInfo,
        payload: &[u8],
    ) -> Result<WebPushMessage, WebPushError> {
        let mut builder = WebPushMessageBuilder::new(info)?;
        builder.set_payload(ContentEncoding::Aes128Gcm, payload);
        let mut signature = VapidSignatureBuilder::from_base64(
            &self.vapid.private_key,
            web_push::URL_SAFE_NO_PAD,
            info,
        )?;
        signature.add_claim("sub", self.vapid.subscriber_email.as_str());
        builder.set_vapid_signature(signature.build()?);
        builder.set_ttl(WEB_PUSH_TTL_SECONDS);
        builder.build()
    }

    pub async fn dispatch(
        &self,
        subscriptions: &[WebSubscription],
        content: &NotificationContent,
        data: &BTreeMap<String, String>,
    ) -> Result<WebDispatchOutcome, DispatchError> {
        if subscriptions.is_empty() {
            return Ok(WebDispatchOutcome {
                receipt: "skipped: no subscriptions".to_string(),
                invalid_subscriptions: Vec::new(),
            });
        }

        let payload = build_payload(content, data)?;

        let start_time = Instant::now();
        let mut invalid_subscriptions = Vec::new();
        let mut success_count = 0usize;
        let mut failure_count = 0usize;

        for subscription in subscriptions {
            let info = SubscriptionInfo::new(
                subscription.endpoint.clone(),
                URL_SAFE_NO_PAD.encode(&subscription.keys.p256dh),
                URL_SAFE_NO_PAD.encode(&subscription.keys.auth),
            );

            let message = match self.build_message(&info, &payload) {
                Ok(message) => message,
                Err(err) => {
                    error!(
                        "Failed to build web push for {} : {err}",
                        subscription.endpoint
                    );
                    failure_count += 1;
                    continue;
                }
            };

            match self.transport.send(message).await {
                Ok(()) => success_count += 1,
                Err(WebPushError::EndpointNotFound) | Err(WebPushError::EndpointNotValid) => {
                    // 404 / 410 : the subscription is dead, hand it back for
                    // cleanup.
                    invalid_subscriptions.push(subscription.clone());
                    failure_count += 1;
                }
                Err(err) => {
                    warn!("Web push rejected for {} : {err}", subscription.endpoint);
                    failure_count += 1;
                }
            }
        }

        DISPATCH_DURATION
            .with_label_values(&["web"])
            .observe(start_time.elapsed().as_secs_f64());

        Ok(WebDispatchOutcome {
            receipt: format!(
                "success:{} invalid:{} total_fail:{}",
                success_count,
                invalid_subscriptions.len(),
                failure_count
            ),
            invalid_subscriptions,
        })
    }
}
