/*  Copyright 2022-23, Juspay India Pvt Ltd
    This program is free software: you can redistribute it and/or modify it under the terms of the GNU Affero General Public License
    as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version. This program
    is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY
    or FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more details. You should have received a copy of
    the GNU Affero General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.
*/
#![allow(clippy::expect_used)]

use actix_web_prom::{PrometheusMetrics, PrometheusMetricsBuilder};
use prometheus::{
    opts, register_histogram_vec, register_int_counter, register_int_counter_vec, HistogramVec,
    IntCounter, IntCounterVec,
};

pub static CONSUMED_COMMANDS: once_cell::sync::Lazy<IntCounter> =
    once_cell::sync::Lazy::new(|| {
        register_int_counter!("consumed_commands", "Notification Commands Consumed")
            .expect("Failed to register consumed commands metrics")
    });

pub static DROPPED_COMMANDS: once_cell::sync::Lazy<IntCounter> = once_cell::sync::Lazy::new(|| {
    register_int_counter!(
        "dropped_commands",
        "Commands Dropped Because No Devices Were Registered"
    )
    .expect("Failed to register dropped commands metrics")
});

pub static RETRIED_COMMANDS: once_cell::sync::Lazy<IntCounter> = once_cell::sync::Lazy::new(|| {
    register_int_counter!("retried_commands", "Commands Negatively Acknowledged")
        .expect("Failed to register retried commands metrics")
});

pub static PRUNED_ENDPOINTS: once_cell::sync::Lazy<IntCounterVec> =
    once_cell::sync::Lazy::new(|| {
        register_int_counter_vec!(
            opts!("pruned_endpoints", "Dead Endpoints Pruned From The Registry"),
            &["channel"]
        )
        .expect("Failed to register pruned endpoints metrics")
    });

pub static HANDLER_DURATION: once_cell::sync::Lazy<HistogramVec> =
    once_cell::sync::Lazy::new(|| {
        register_histogram_vec!(
            opts!("handler_duration_seconds", "Per-Message Handler Duration").into(),
            &["outcome"]
        )
        .expect("Failed to register handler duration metrics")
    });

pub static DISPATCH_DURATION: once_cell::sync::Lazy<HistogramVec> =
    once_cell::sync::Lazy::new(|| {
        register_histogram_vec!(
            opts!("dispatch_duration_seconds", "Per-Channel Dispatch Duration").into(),
            &["channel"]
        )
        .expect("Failed to register dispatch duration metrics")
    });

/// Builds the actix-web middleware that exposes `/metrics` and registers the
/// pipeline counters alongside the default HTTP metrics.
pub fn prometheus_metrics() -> PrometheusMetrics {
    let prometheus = PrometheusMetricsBuilder::new("api")
        .endpoint("/metrics")
        .buckets(&[
            0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
        ])
        .build()
        .expect("Failed to create Prometheus Metrics");

    prometheus
        .registry
        .register(Box::new(CONSUMED_COMMANDS.to_owned()))
        .expect("Failed to register consumed commands");

    prometheus
        .registry
        .register(Box::new(DROPPED_COMMANDS.to_owned()))
        .expect("Failed to register dropped commands");

    prometheus
        .registry
        .register(Box::new(RETRIED_COMMANDS.to_owned()))
        .expect("Failed to register retried commands");

    prometheus
        .registry
        .register(Box::new(PRUNED_ENDPOINTS.to_owned()))
        .expect("Failed to register pruned endpoints");

    prometheus
        .registry
        .register(Box::new(HANDLER_DURATION.to_owned()))
        .expect("Failed to register handler duration");

    prometheus
        .registry
        .register(Box::new(DISPATCH_DURATION.to_owned()))
        .expect("Failed to register dispatch duration");

    prometheus
}
