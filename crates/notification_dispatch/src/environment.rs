/*  Copyright 2022-23, Juspay India Pvt Ltd
    This program is free software: you can redistribute it and/or modify it under the terms of the GNU Affero General Public License
    as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version. This program
    is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY
    or FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more details. You should have received a copy of
    the GNU Affero General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.
*/

use std::{
    env::var,
    net::Ipv4Addr,
    sync::{atomic::AtomicBool, Arc},
};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use tracing::{info, warn};

use crate::{
    dispatch::{
        fcm::FcmClient,
        mobile::{MessagingClient, MobileDispatcher},
        web::{HttpWebPushTransport, VapidConfig, WebDispatcher, WebPushTransport},
    },
    redis::types::{RedisConnectionPool, RedisSettings},
    registry::{
        cache::{CacheClient, CachedRegistry},
        memory::MemoryRegistry,
        redis::RedisRegistry,
        TokenRegistry,
    },
    tools::logger::LoggerConfig,
};

/// Baseline configuration embedded at build time; see `AppConfig::load`.
pub const DEFAULT_CONFIG: &str = include_str!("../config/default.yaml");

#[derive(Debug, Deserialize, Clone, Default)]
pub struct CorsConfig {
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Deserialize, Clone, Copy, Default, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
}

fn default_brokers() -> String {
    "127.0.0.1:9092".to_string()
}

fn default_group_id() -> String {
    "notification-dispatch".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct KafkaSettings {
    #[serde(default = "default_brokers")]
    pub brokers: String,
    #[serde(default = "default_group_id")]
    pub group_id: String,
}

impl Default for KafkaSettings {
    fn default() -> Self {
        KafkaSettings {
            brokers: default_brokers(),
            group_id: default_group_id(),
        }
    }
}

fn default_listen_addr() -> String {
    ":8080".to_string()
}

fn default_num_workers() -> usize {
    1
}

fn default_cache_ttl() -> u32 {
    86400
}

fn default_max_delivery_attempts() -> u32 {
    5
}

fn default_min_backoff_seconds() -> u64 {
    10
}

fn default_shutdown_grace() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub project_id: String,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default)]
    pub subscription_id: String,
    #[serde(default)]
    pub subscription_dlq_topic_id: Option<String>,
    #[serde(default = "default_num_workers")]
    pub num_pipeline_workers: usize,
    #[serde(default)]
    pub cors: CorsConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub redis_cfg: RedisSettings,
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_seconds: u32,
    #[serde(default)]
    pub kafka_cfg: KafkaSettings,
    #[serde(default = "default_max_delivery_attempts")]
    pub max_delivery_attempts: u32,
    #[serde(default = "default_min_backoff_seconds")]
    pub min_backoff_seconds: u64,
    #[serde(default)]
    pub vapid: VapidConfig,
    #[serde(default)]
    pub identity_service_url: String,
    #[serde(default)]
    pub fcm_service_account_path: Option<String>,
    #[serde(default)]
    pub logger_cfg: LoggerConfig,
    #[serde(default = "default_shutdown_grace")]
    pub graceful_shutdown_seconds: u64,
}

impl AppConfig {
    /// Stage 1: the embedded YAML baseline (or `CONFIG_FILE`), stage 2: the
    /// environment overrides, stage 3: final validation.
    pub fn load() -> Result<Self> {
        let raw = match var("CONFIG_FILE") {
            Ok(path) => std::fs::read_to_string(&path)
                .with_context(|| format!("read CONFIG_FILE: {path}"))?,
            Err(_) => DEFAULT_CONFIG.to_string(),
        };
        let mut config = Self::from_yaml_str(&raw)?;
        config.apply_env_overrides();
        config.finalize()?;
        Ok(config)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        serde_yaml::from_str(raw).context("parse config yaml")
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(value) = var("PROJECT_ID") {
            self.project_id = value;
        }
        if let Ok(value) = var("PORT") {
            self.listen_addr = format!(":{value}");
        }
        if let Ok(value) = var("SUBSCRIPTION_ID") {
            self.subscription_id = value;
        }
        if let Ok(value) = var("SUBSCRIPTION_DLQ_TOPIC_ID") {
            self.subscription_dlq_topic_id = Some(value);
        }
        if let Ok(value) = var("NUM_PIPELINE_WORKERS") {
            match value.parse::<usize>() {
                Ok(workers) if workers > 0 => self.num_pipeline_workers = workers,
                _ => warn!("Ignoring invalid NUM_PIPELINE_WORKERS: {value}"),
            }
        }
        if let Ok(value) = var("CORS_ALLOWED_ORIGINS") {
            self.cors.allowed_origins = value
                .split(',')
                .map(str::trim)
                .filter(|origin| !origin.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Ok(value) = var("STORAGE_BACKEND") {
            match value.as_str() {
                "memory" => self.storage.backend = StorageBackend::Memory,
                "redis" => self.storage.backend = StorageBackend::Redis,
                _ => warn!("Ignoring unknown STORAGE_BACKEND: {value}"),
            }
        }
        if let Ok(value) = var("REDIS_ENABLED") {
            self.redis_cfg.enabled = matches!(value.as_str(), "true" | "1" | "yes");
        }
        if let Ok(value) = var("REDIS_ADDR") {
            self.redis_cfg.addr = value;
        }
        if let Ok(value) = var("REDIS_PASSWORD") {
            self.redis_cfg.password = Some(value);
        }
        if let Ok(value) = var("REDIS_DB") {
            match value.parse::<u8>() {
                Ok(db) => self.redis_cfg.db = db,
                Err(_) => warn!("Ignoring invalid REDIS_DB: {value}"),
            }
        }
        if let Ok(value) = var("KAFKA_BROKERS") {
            self.kafka_cfg.brokers = value;
        }
        if let Ok(value) = var("KAFKA_GROUP_ID") {
            self.kafka_cfg.group_id = value;
        }
        if let Ok(value) = var("VAPID_PUBLIC_KEY") {
            self.vapid.public_key = value;
        }
        if let Ok(value) = var("VAPID_PRIVATE_KEY") {
            self.vapid.private_key = value;
        }
        if let Ok(value) = var("VAPID_SUB_EMAIL") {
            self.vapid.subscriber_email = value;
        }
        if let Ok(value) = var("IDENTITY_SERVICE_URL") {
            self.identity_service_url = value;
        }
        if let Ok(value) = var("FCM_SERVICE_ACCOUNT") {
            self.fcm_service_account_path = Some(value);
        } else if self.fcm_service_account_path.is_none() {
            if let Ok(value) = var("GOOGLE_APPLICATION_CREDENTIALS") {
                self.fcm_service_account_path = Some(value);
            }
        }
        if let Ok(value) = var("LOG_LEVEL") {
            self.logger_cfg.level = value.to_lowercase();
        }
    }

    pub fn finalize(&mut self) -> Result<()> {
        if self.project_id.is_empty() {
            return Err(anyhow!(
                "project_id is required (set via YAML or PROJECT_ID env var)"
            ));
        }
        if self.subscription_id.is_empty() {
            return Err(anyhow!(
                "subscription_id is required (set via YAML or SUBSCRIPTION_ID env var)"
            ));
        }
        if self.identity_service_url.is_empty() {
            return Err(anyhow!(
                "identity_service_url is required (set via YAML or IDENTITY_SERVICE_URL env var)"
            ));
        }
        if self.listen_addr.is_empty() {
            self.listen_addr = default_listen_addr();
        }
        if self.num_pipeline_workers == 0 {
            self.num_pipeline_workers = 1;
        }
        if self.subscription_dlq_topic_id.is_none() {
            warn!("subscription_dlq_topic_id is not set; poison messages will be dropped");
        }
        if (self.storage.backend == StorageBackend::Redis || self.redis_cfg.enabled)
            && self.redis_cfg.addr.is_empty()
        {
            return Err(anyhow!("redis addr is required for the configured backend"));
        }
        self.bind_addr()?;
        Ok(())
    }

    /// The listen address keeps the original `:PORT` rendering; bind on all
    /// interfaces at that port.
    pub fn bind_addr(&self) -> Result<(Ipv4Addr, u16)> {
        let port = self
            .listen_addr
            .rsplit(':')
            .next()
            .unwrap_or_default()
            .parse::<u16>()
            .with_context(|| format!("invalid listen_addr: {}", self.listen_addr))?;
        Ok((Ipv4Addr::UNSPECIFIED, port))
    }
}

/// Process-wide singletons shared by the pipeline workers and the HTTP
/// handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<dyn TokenRegistry>,
    pub mobile_dispatcher: Arc<MobileDispatcher>,
    pub web_dispatcher: Arc<WebDispatcher>,
    pub ready: Arc<AtomicBool>,
}

impl AppState {
    pub async fn new(config: &AppConfig) -> Result<AppState> {
        let needs_redis =
            config.redis_cfg.enabled || config.storage.backend == StorageBackend::Redis;
        let redis_pool = if needs_redis {
            Some(Arc::new(
                RedisConnectionPool::new(&config.redis_cfg)
                    .await
                    .context("connect to redis")?,
            ))
        } else {
            None
        };

        let mut registry: Arc<dyn TokenRegistry> = match config.storage.backend {
            StorageBackend::Memory => {
                info!("Device registry initialized (backend: memory)");
                Arc::new(MemoryRegistry::new())
            }
            StorageBackend::Redis => {
                let pool = redis_pool
                    .clone()
                    .ok_or_else(|| anyhow!("redis pool required for redis backend"))?;
                info!("Device registry initialized (backend: redis)");
                Arc::new(RedisRegistry::new(pool))
            }
        };

        if config.redis_cfg.enabled {
            let pool = redis_pool
                .clone()
                .ok_or_else(|| anyhow!("redis pool required for the registry cache"))?;
            registry = Arc::new(CachedRegistry::new(
                registry,
                pool as Arc<dyn CacheClient>,
                config.cache_ttl_seconds,
            ));
            info!(
                "Registry read-aside cache enabled (ttl: {}s)",
                config.cache_ttl_seconds
            );
        }

        let service_account_path = config
            .fcm_service_account_path
            .as_deref()
            .ok_or_else(|| anyhow!("mobile push credentials are required (FCM_SERVICE_ACCOUNT)"))?;
        let messaging: Arc<dyn MessagingClient> = Arc::new(FcmClient::from_file(
            &config.project_id,
            service_account_path,
        )?);
        let mobile_dispatcher = Arc::new(MobileDispatcher::new(messaging));

        if !config.vapid.is_configured() {
            warn!("VAPID keys missing in configuration. Web push will fail.");
        } else {
            info!("Web dispatcher enabled (public key: {})", config.vapid.public_key);
        }
        let transport: Arc<dyn WebPushTransport> = Arc::new(
            HttpWebPushTransport::new().map_err(|err| anyhow!("web push client: {err}"))?,
        );
        let web_dispatcher = Arc::new(WebDispatcher::new(transport, config.vapid.clone()));

        Ok(AppState {
            registry,
            mobile_dispatcher,
            web_dispatcher,
            ready: Arc::new(AtomicBool::new(false)),
        })
    }
}
