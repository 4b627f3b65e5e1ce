/*  Copyright 2022-23, Juspay India Pvt Ltd
    This program is free software: you can redistribute it and/or modify it under the terms of the GNU Affero General Public License
    as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version. This program
    is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY
    or FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more details. You should have received a copy of
    the GNU Affero General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.
*/

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::{
    common::types::{MobileToken, ResolvedRecipient, UserIdentity, WebSubscription},
    redis::{keys::recipient_cache_key, types::RedisConnectionPool},
};

use super::{RegistryError, RegistryResult, TokenRegistry};

/// The subset of cache commands the decorator needs. Implemented by the
/// redis pool; tests substitute their own.
#[async_trait]
pub trait CacheClient: Send + Sync {
    async fn get(&self, key: &str) -> RegistryResult<Option<String>>;
    async fn set(&self, key: &str, value: String, ttl_seconds: u32) -> RegistryResult<()>;
    async fn delete(&self, key: &str) -> RegistryResult<()>;
}

#[async_trait]
impl CacheClient for RedisConnectionPool {
    async fn get(&self, key: &str) -> RegistryResult<Option<String>> {
        self.get_key::<String>(key)
            .await
            .map_err(|err| RegistryError::Cache(err.to_string()))
    }

    async fn set(&self, key: &str, value: String, ttl_seconds: u32) -> RegistryResult<()> {
        self.set_key(key, &value, ttl_seconds)
            .await
            .map_err(|err| RegistryError::Cache(err.to_string()))
    }

    async fn delete(&self, key: &str) -> RegistryResult<()> {
        self.delete_key(key)
            .await
            .map_err(|err| RegistryError::Cache(err.to_string()))
    }
}

/// Read-aside cache in front of a registry, keyed by the canonical user
/// string. Every write path deletes the user's entry after the store write
/// succeeds; a failed delete is the operation's error so that readers after
/// a successful write never observe removed rows.
pub struct CachedRegistry {
    inner: Arc<dyn TokenRegistry>,
    cache: Arc<dyn CacheClient>,
    ttl_seconds: u32,
}

impl CachedRegistry {
    pub fn new(inner: Arc<dyn TokenRegistry>, cache: Arc<dyn CacheClient>, ttl_seconds: u32) -> Self {
        CachedRegistry {
            inner,
            cache,
            ttl_seconds,
        }
    }

    async fn invalidate(&self, user: &UserIdentity) -> RegistryResult<()> {
        self.cache.delete(&recipient_cache_key(user.as_str())).await
    }
}

#[async_trait]
impl TokenRegistry for CachedRegistry {
    async fn register_mobile(&self, user: &UserIdentity, token: MobileToken) -> RegistryResult<()> {
        self.inner.register_mobile(user, token).await?;
        self.invalidate(user).await
    }

    async fn register_web(
        &self,
        user: &UserIdentity,
        subscription: WebSubscription,
    ) -> RegistryResult<()> {
        self.inner.register_web(user, subscription).await?;
        self.invalidate(user).await
    }

    async fn unregister_mobile(
        &self,
        user: &UserIdentity,
        token: &MobileToken,
    ) -> RegistryResult<()> {
        self.inner.unregister_mobile(user, token).await?;
        self.invalidate(user).await
    }

    async fn unregister_web(&self, user: &UserIdentity, endpoint: &str) -> RegistryResult<()> {
        self.inner.unregister_web(user, endpoint).await?;
        self.invalidate(user).await
    }

    async fn fetch(&self, user: &UserIdentity) -> RegistryResult<ResolvedRecipient> {
        let key = recipient_cache_key(user.as_str());

        match self.cache.get(&key).await {
            Ok(Some(raw)) => match serde_json::from_str::<ResolvedRecipient>(&raw) {
                Ok(resolved) => return Ok(resolved),
                Err(err) => debug!("Undecodable cache entry for {user}, falling through: {err}"),
            },
            Ok(None) => {}
            Err(err) => debug!("Cache read failed for {user}, treating as miss: {err}"),
        }

        let resolved = self.inner.fetch(user).await?;

        match serde_json::to_string(&resolved) {
            Ok(serialized) => {
                if let Err(err) = self.cache.set(&key, serialized, self.ttl_seconds).await {
                    warn!("Failed to populate recipient cache for {user}: {err}");
                }
            }
            Err(err) => warn!("Failed to encode recipient for caching: {err}"),
        }

        Ok(resolved)
    }
}
