/*  Copyright 2022-23, Juspay India Pvt Ltd
    This program is free software: you can redistribute it and/or modify it under the terms of the GNU Affero General Public License
    as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version. This program
    is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY
    or FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more details. You should have received a copy of
    the GNU Affero General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.
*/

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::sync::RwLock;

use crate::common::{
    types::{DeviceRecord, MobileToken, ResolvedRecipient, UserIdentity, WebSubscription},
    utils::device_key,
};

use super::{RegistryResult, TokenRegistry};

/// In-process registry used by tests and single-instance deployments.
/// Rows live under `user -> device_key -> DeviceRecord`, the same logical
/// layout the redis backend persists.
#[derive(Default)]
pub struct MemoryRegistry {
    rows: RwLock<FxHashMap<String, FxHashMap<String, DeviceRecord>>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        MemoryRegistry::default()
    }
}

#[async_trait]
impl TokenRegistry for MemoryRegistry {
    async fn register_mobile(&self, user: &UserIdentity, token: MobileToken) -> RegistryResult<()> {
        let key = device_key(&token.0);
        let mut rows = self.rows.write().await;
        rows.entry(user.to_string())
            .or_default()
            .insert(key, DeviceRecord::mobile(token));
        Ok(())
    }

    async fn register_web(
        &self,
        user: &UserIdentity,
        subscription: WebSubscription,
    ) -> RegistryResult<()> {
        let key = device_key(&subscription.endpoint);
        let mut rows = self.rows.write().await;
        rows.entry(user.to_string())
            .or_default()
            .insert(key, DeviceRecord::web(subscription));
        Ok(())
    }

    async fn unregister_mobile(
        &self,
        user: &UserIdentity,
        token: &MobileToken,
    ) -> RegistryResult<()> {
        let mut rows = self.rows.write().await;
        if let Some(devices) = rows.get_mut(user.as_str()) {
            devices.remove(&device_key(&token.0));
        }
        Ok(())
    }

    async fn unregister_web(&self, user: &UserIdentity, endpoint: &str) -> RegistryResult<()> {
        let mut rows = self.rows.write().await;
        if let Some(devices) = rows.get_mut(user.as_str()) {
            devices.remove(&device_key(endpoint));
        }
        Ok(())
    }

    async fn fetch(&self, user: &UserIdentity) -> RegistryResult<ResolvedRecipient> {
        let rows = self.rows.read().await;
        let mut resolved = ResolvedRecipient::empty(user.clone());
        if let Some(devices) = rows.get(user.as_str()) {
            for record in devices.values() {
                if !record.is_consistent() {
                    continue;
                }
                if let Some(token) = &record.token {
                    resolved.mobile_tokens.push(token.clone());
                }
                if let Some(subscription) = &record.web_subscription {
                    resolved.web_subscriptions.push(subscription.clone());
                }
            }
        }
        Ok(resolved)
    }
}
