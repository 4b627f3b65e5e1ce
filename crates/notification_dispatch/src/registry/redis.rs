/*  Copyright 2022-23, Juspay India Pvt Ltd
    This program is free software: you can redistribute it and/or modify it under the terms of the GNU Affero General Public License
    as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version. This program
    is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY
    or FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more details. You should have received a copy of
    the GNU Affero General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.
*/

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::{
    common::{
        types::{DeviceRecord, MobileToken, ResolvedRecipient, UserIdentity, WebSubscription},
        utils::device_key,
    },
    redis::{keys::device_rows_key, types::RedisConnectionPool},
};

use super::{RegistryError, RegistryResult, TokenRegistry};

/// Redis-backed registry. One hash per user; field = deterministic hash of
/// the channel's unique identifier, value = the device row as JSON.
pub struct RedisRegistry {
    pool: Arc<RedisConnectionPool>,
}

impl RedisRegistry {
    pub fn new(pool: Arc<RedisConnectionPool>) -> Self {
        RedisRegistry { pool }
    }

    async fn put_row(&self, user: &UserIdentity, field: &str, record: &DeviceRecord) -> RegistryResult<()> {
        self.pool
            .set_hash_field(&device_rows_key(user.as_str()), field, record)
            .await
            .map_err(|err| RegistryError::Storage(err.to_string()))
    }

    async fn delete_row(&self, user: &UserIdentity, field: &str) -> RegistryResult<()> {
        self.pool
            .delete_hash_field(&device_rows_key(user.as_str()), field)
            .await
            .map_err(|err| RegistryError::Storage(err.to_string()))
    }
}

#[async_trait]
impl TokenRegistry for RedisRegistry {
    async fn register_mobile(&self, user: &UserIdentity, token: MobileToken) -> RegistryResult<()> {
        let field = device_key(&token.0);
        self.put_row(user, &field, &DeviceRecord::mobile(token)).await
    }

    async fn register_web(
        &self,
        user: &UserIdentity,
        subscription: WebSubscription,
    ) -> RegistryResult<()> {
        let field = device_key(&subscription.endpoint);
        self.put_row(user, &field, &DeviceRecord::web(subscription))
            .await
    }

    async fn unregister_mobile(
        &self,
        user: &UserIdentity,
        token: &MobileToken,
    ) -> RegistryResult<()> {
        self.delete_row(user, &device_key(&token.0)).await
    }

    async fn unregister_web(&self, user: &UserIdentity, endpoint: &str) -> RegistryResult<()> {
        self.delete_row(user, &device_key(endpoint)).await
    }

    async fn fetch(&self, user: &UserIdentity) -> RegistryResult<ResolvedRecipient> {
        let rows = self
            .pool
            .get_hash_fields(&device_rows_key(user.as_str()))
            .await
            .map_err(|err| RegistryError::Storage(err.to_string()))?;

        let mut resolved = ResolvedRecipient::empty(user.clone());
        for (field, raw) in rows {
            let record: DeviceRecord = match serde_json::from_str(&raw) {
                Ok(record) => record,
                Err(err) => {
                    warn!("Skipping undecodable device row {field} for {user}: {err}");
                    continue;
                }
            };
            if !record.is_consistent() {
                continue;
            }
            if let Some(token) = record.token {
                resolved.mobile_tokens.push(token);
            }
            if let Some(subscription) = record.web_subscription {
                resolved.web_subscriptions.push(subscription);
            }
        }
        Ok(resolved)
    }
}
