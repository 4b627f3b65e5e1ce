/*  Copyright 2022-23, Juspay India Pvt Ltd
    This program is free software: you can redistribute it and/or modify it under the terms of the GNU Affero General Public License
    as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version. This program
    is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY
    or FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more details. You should have received a copy of
    the GNU Affero General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.
*/

use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct LoggerConfig {
    pub level: String,
    pub pretty: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        LoggerConfig {
            level: "info".to_string(),
            pretty: false,
        }
    }
}

/// Keeps the non-blocking writer alive for the lifetime of the process.
#[derive(Debug)]
pub struct TracingGuard {
    _log_guard: tracing_appender::non_blocking::WorkerGuard,
}

pub fn setup_tracing(cfg: &LoggerConfig) -> TracingGuard {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    // Non-blocking stdout writer; RUST_LOG overrides the configured level.
    let (console_writer, guard) = tracing_appender::non_blocking(std::io::stdout());
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.level));

    let registry = tracing_subscriber::registry().with(env_filter);
    if cfg.pretty {
        registry
            .with(
                fmt::layer()
                    .with_timer(fmt::time())
                    .pretty()
                    .with_writer(console_writer),
            )
            .init();
    } else {
        registry
            .with(fmt::layer().json().with_writer(console_writer))
            .init();
    }

    TracingGuard { _log_guard: guard }
}
