/*  Copyright 2022-23, Juspay India Pvt Ltd
    This program is free software: you can redistribute it and/or modify it under the terms of the GNU Affero General Public License
    as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version. This program
    is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY
    or FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more details. You should have received a copy of
    the GNU Affero General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.
*/

use async_trait::async_trait;
use thiserror::Error;

use crate::common::types::{MobileToken, ResolvedRecipient, UserIdentity, WebSubscription};

pub mod cache;
pub mod memory;
pub mod redis;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("storage failure: {0}")]
    Storage(String),
    #[error("cache failure: {0}")]
    Cache(String),
}

pub type RegistryResult<T> = Result<T, RegistryError>;

/// The device registry contract. Register/unregister operations are
/// individually atomic and idempotent by `(user, device_key)`; `fetch`
/// reflects all writes completed before it started.
#[async_trait]
pub trait TokenRegistry: Send + Sync {
    /// Upsert a mobile record. A repeated registration of the same token
    /// overwrites the timestamp only.
    async fn register_mobile(&self, user: &UserIdentity, token: MobileToken) -> RegistryResult<()>;

    /// Upsert a web record keyed by the endpoint. Re-registering an endpoint
    /// with new keys replaces them.
    async fn register_web(
        &self,
        user: &UserIdentity,
        subscription: WebSubscription,
    ) -> RegistryResult<()>;

    /// Delete by token. Succeeds whether or not the row existed.
    async fn unregister_mobile(
        &self,
        user: &UserIdentity,
        token: &MobileToken,
    ) -> RegistryResult<()>;

    /// Delete by endpoint. Idempotent.
    async fn unregister_web(&self, user: &UserIdentity, endpoint: &str) -> RegistryResult<()>;

    /// Enumerate all live device rows under the user, partitioned by
    /// channel. An absent user yields an empty recipient, not an error;
    /// corrupt rows are skipped.
    async fn fetch(&self, user: &UserIdentity) -> RegistryResult<ResolvedRecipient>;
}
