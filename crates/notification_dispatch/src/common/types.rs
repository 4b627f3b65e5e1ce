/*  Copyright 2022-23, Juspay India Pvt Ltd
    This program is free software: you can redistribute it and/or modify it under the terms of the GNU Affero General Public License
    as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version. This program
    is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY
    or FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more details. You should have received a copy of
    the GNU Affero General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.
*/

use std::{collections::BTreeMap, fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::common::utils::decode_base64_flexible;

/// Canonical identity of a user, rendered as a URN-like string
/// (e.g. `urn:x:user:A`). Compared and stored by its canonical string form.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct UserIdentity(String);

impl UserIdentity {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for UserIdentity {
    type Err = InvalidUserIdentity;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = raw.split(':').collect();
        if parts.len() < 3 {
            return Err(InvalidUserIdentity(raw.to_string()));
        }
        if parts[0] != "urn" {
            return Err(InvalidUserIdentity(raw.to_string()));
        }
        if parts.iter().any(|part| part.is_empty()) {
            return Err(InvalidUserIdentity(raw.to_string()));
        }
        Ok(UserIdentity(raw.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid user identity: {0}")]
pub struct InvalidUserIdentity(String);

impl Serialize for UserIdentity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for UserIdentity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}

/// Opaque device token issued by the mobile-push provider for one
/// installation.
#[derive(Deserialize, Serialize, Clone, Debug, Eq, Hash, PartialEq)]
pub struct MobileToken(pub String);

/// Binary key material of a web-push subscription. Serialized as base64url
/// in storage and cache rows; decoded leniently on the way in.
#[derive(Deserialize, Serialize, Clone, Debug, Eq, PartialEq)]
pub struct WebPushKeys {
    #[serde(with = "base64_bytes")]
    pub p256dh: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub auth: Vec<u8>,
}

/// A browser push subscription. The endpoint URL is the unique identifier;
/// unregistration uses the endpoint alone.
#[derive(Deserialize, Serialize, Clone, Debug, Eq, PartialEq)]
pub struct WebSubscription {
    pub endpoint: String,
    pub keys: WebPushKeys,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Mobile,
    Web,
}

/// A stored device row belonging to one user. The channel discriminates
/// which payload field is populated; readers must ignore the other.
#[derive(Deserialize, Serialize, Clone, Debug, Eq, PartialEq)]
pub struct DeviceRecord {
    pub channel: ChannelKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<MobileToken>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_subscription: Option<WebSubscription>,
    pub updated_at: DateTime<Utc>,
}

impl DeviceRecord {
    pub fn mobile(token: MobileToken) -> Self {
        DeviceRecord {
            channel: ChannelKind::Mobile,
            token: Some(token),
            web_subscription: None,
            updated_at: Utc::now(),
        }
    }

    pub fn web(subscription: WebSubscription) -> Self {
        DeviceRecord {
            channel: ChannelKind::Web,
            token: None,
            web_subscription: Some(subscription),
            updated_at: Utc::now(),
        }
    }

    /// Whether the populated payload matches the channel discriminator.
    pub fn is_consistent(&self) -> bool {
        match self.channel {
            ChannelKind::Mobile => self.token.is_some(),
            ChannelKind::Web => self.web_subscription.is_some(),
        }
    }
}

/// Notification content carried by a command. Transport only; the pipeline
/// never interprets it beyond passing it to providers.
#[derive(Deserialize, Serialize, Clone, Debug, Default, Eq, PartialEq)]
pub struct NotificationContent {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sound: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
}

/// A command pulled off the bus: "notify this user". Carries no endpoints;
/// the pipeline resolves the recipient against the registry.
#[derive(Deserialize, Serialize, Clone, Debug, Eq, PartialEq)]
pub struct NotificationCommand {
    pub recipient: UserIdentity,
    pub content: NotificationContent,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

/// The result of fanning a user identity out to concrete endpoints,
/// bucketed by channel.
#[derive(Deserialize, Serialize, Clone, Debug, Eq, PartialEq)]
pub struct ResolvedRecipient {
    pub recipient: UserIdentity,
    pub mobile_tokens: Vec<MobileToken>,
    pub web_subscriptions: Vec<WebSubscription>,
}

impl ResolvedRecipient {
    pub fn empty(recipient: UserIdentity) -> Self {
        ResolvedRecipient {
            recipient,
            mobile_tokens: Vec::new(),
            web_subscriptions: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.mobile_tokens.is_empty() && self.web_subscriptions.is_empty()
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&URL_SAFE_NO_PAD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::decode_base64_flexible(&raw).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_identity_accepts_canonical_urn() {
        let user: UserIdentity = "urn:x:user:A".parse().expect("valid urn");
        assert_eq!(user.to_string(), "urn:x:user:A");
    }

    #[test]
    fn user_identity_rejects_non_urn() {
        assert!("not-a-urn".parse::<UserIdentity>().is_err());
        assert!("urn:x".parse::<UserIdentity>().is_err());
        assert!("urn::user:A".parse::<UserIdentity>().is_err());
        assert!("http:x:user:A".parse::<UserIdentity>().is_err());
    }

    #[test]
    fn command_decodes_with_default_data() {
        let cmd: NotificationCommand =
            serde_json::from_str(r#"{"recipient":"urn:x:user:A","content":{"title":"hi"}}"#)
                .expect("decode");
        assert_eq!(cmd.recipient.as_str(), "urn:x:user:A");
        assert_eq!(cmd.content.title, "hi");
        assert!(cmd.data.is_empty());
    }

    #[test]
    fn web_push_keys_round_trip_as_base64() {
        let keys = WebPushKeys {
            p256dh: vec![1, 2, 3, 4],
            auth: vec![9, 8, 7],
        };
        let encoded = serde_json::to_string(&keys).expect("encode");
        let decoded: WebPushKeys = serde_json::from_str(&encoded).expect("decode");
        assert_eq!(decoded, keys);
    }

    #[test]
    fn device_record_consistency_follows_channel() {
        let record = DeviceRecord::mobile(MobileToken("tok-1".to_string()));
        assert!(record.is_consistent());

        let corrupt = DeviceRecord {
            channel: ChannelKind::Web,
            token: Some(MobileToken("tok-1".to_string())),
            web_subscription: None,
            updated_at: Utc::now(),
        };
        assert!(!corrupt.is_consistent());
    }
}
