/*  Copyright 2022-23, Juspay India Pvt Ltd
    This program is free software: you can redistribute it and/or modify it under the terms of the GNU Affero General Public License
    as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version. This program
    is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY
    or FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more details. You should have received a copy of
    the GNU Affero General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.
*/

use std::collections::HashMap;

use anyhow::Result;
use fred::{
    interfaces::{HashesInterface, KeysInterface},
    types::Expiration,
};
use serde::{de::DeserializeOwned, Serialize};

use super::types::RedisConnectionPool;

impl RedisConnectionPool {
    pub async fn set_key<V>(&self, key: &str, value: &V, expiry: u32) -> Result<()>
    where
        V: Serialize + Send + Sync,
    {
        let serialized_value = serde_json::to_string(value)?;

        self.pool
            .set::<(), _, _>(
                key,
                serialized_value,
                Some(Expiration::EX(expiry.into())),
                None,
                false,
            )
            .await?;

        Ok(())
    }

    pub async fn get_key<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: DeserializeOwned,
    {
        let output: Option<String> = self.pool.get(key).await?;

        match output {
            Some(value) => Ok(serde_json::from_str(&value).map(Some)?),
            None => Ok(None),
        }
    }

    pub async fn delete_key(&self, key: &str) -> Result<()> {
        self.pool.del::<u64, _>(key).await?;
        Ok(())
    }

    pub async fn set_hash_field<V>(&self, key: &str, field: &str, value: &V) -> Result<()>
    where
        V: Serialize + Send + Sync,
    {
        let serialized_value = serde_json::to_string(value)?;

        let mut entries = HashMap::new();
        entries.insert(field.to_string(), serialized_value);
        self.pool.hset::<(), _, _>(key, entries).await?;

        Ok(())
    }

    pub async fn delete_hash_field(&self, key: &str, field: &str) -> Result<()> {
        self.pool.hdel::<u64, _, _>(key, field).await?;
        Ok(())
    }

    pub async fn get_hash_fields(&self, key: &str) -> Result<HashMap<String, String>> {
        let entries: HashMap<String, String> = self.pool.hgetall(key).await?;
        Ok(entries)
    }
}
