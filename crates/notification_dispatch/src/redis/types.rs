/*  Copyright 2022-23, Juspay India Pvt Ltd
    This program is free software: you can redistribute it and/or modify it under the terms of the GNU Affero General Public License
    as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version. This program
    is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY
    or FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more details. You should have received a copy of
    the GNU Affero General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.
*/

use anyhow::Result;
use fred::{clients::RedisPool, interfaces::ClientLike, types::RedisConfig};
use serde::Deserialize;

fn default_pool_size() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct RedisSettings {
    #[serde(default)]
    pub enabled: bool,
    pub addr: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub db: u8,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

impl Default for RedisSettings {
    fn default() -> Self {
        RedisSettings {
            enabled: false,
            addr: "127.0.0.1:6379".to_string(),
            password: None,
            db: 0,
            pool_size: default_pool_size(),
        }
    }
}

/// Thin wrapper around a fred pool. All values go through the wire as JSON
/// strings; see `commands.rs` for the operation surface.
#[derive(Clone)]
pub struct RedisConnectionPool {
    pub pool: RedisPool,
}

impl RedisConnectionPool {
    pub async fn new(settings: &RedisSettings) -> Result<Self> {
        let url = match &settings.password {
            Some(password) => format!(
                "redis://:{}@{}/{}",
                password, settings.addr, settings.db
            ),
            None => format!("redis://{}/{}", settings.addr, settings.db),
        };
        let config = RedisConfig::from_url(&url)?;
        let pool = RedisPool::new(config, None, None, None, settings.pool_size)?;
        pool.connect();
        pool.wait_for_connect().await?;
        Ok(RedisConnectionPool { pool })
    }
}
