/*  Copyright 2022-23, Juspay India Pvt Ltd
    This program is free software: you can redistribute it and/or modify it under the terms of the GNU Affero General Public License
    as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version. This program
    is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY
    or FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more details. You should have received a copy of
    the GNU Affero General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.
*/

use std::{
    sync::{atomic::Ordering, Arc},
    time::Duration,
};

use actix_cors::Cors;
use actix_web::{web, App, HttpResponse, HttpServer};
use anyhow::{anyhow, Result};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

use crate::{
    api,
    api::token::TokenApi,
    bus::{kafka::{KafkaConsumer, KafkaConsumerConfig}, MessageConsumer},
    environment::{AppConfig, AppState},
    middleware::auth::{BearerAuthMiddlewareLayer, JwksVerifier},
    pipeline::{processor::Processor, runtime::Pipeline},
    tools::{logger::setup_tracing, prometheus::prometheus_metrics},
};

async fn liveness() -> HttpResponse {
    HttpResponse::Ok().body("Notification Dispatch Is Up!")
}

async fn readiness(ready: web::Data<std::sync::atomic::AtomicBool>) -> HttpResponse {
    if ready.load(Ordering::Relaxed) {
        HttpResponse::Ok().body("ready")
    } else {
        HttpResponse::ServiceUnavailable().body("starting")
    }
}

fn cors_layer(allowed_origins: &[String]) -> Cors {
    let mut cors = Cors::default()
        .allowed_methods(vec!["GET", "POST", "OPTIONS"])
        .allow_any_header()
        .max_age(3600);
    if allowed_origins.is_empty() {
        cors = cors.allow_any_origin();
    } else {
        for origin in allowed_origins {
            cors = cors.allowed_origin(origin);
        }
    }
    cors
}

pub async fn run_server() -> Result<()> {
    let config = AppConfig::load()?;

    let _guard = setup_tracing(&config.logger_cfg);

    std::panic::set_hook(Box::new(|panic_info| {
        error!("Panic Occured : {:?}", panic_info);
    }));

    let app_state = AppState::new(&config).await?;

    let verifier = Arc::new(JwksVerifier::discover(&config.identity_service_url).await?);

    let consumer: Arc<dyn MessageConsumer> = Arc::new(KafkaConsumer::new(KafkaConsumerConfig {
        brokers: config.kafka_cfg.brokers.clone(),
        group_id: config.kafka_cfg.group_id.clone(),
        topic: config.subscription_id.clone(),
        dead_letter_topic: config.subscription_dlq_topic_id.clone(),
        max_delivery_attempts: config.max_delivery_attempts,
        min_backoff: Duration::from_secs(config.min_backoff_seconds),
    })?);

    let processor = Arc::new(Processor::new(
        app_state.registry.clone(),
        app_state.mobile_dispatcher.clone(),
        app_state.web_dispatcher.clone(),
    ));

    let pipeline = Arc::new(Pipeline::new(
        config.num_pipeline_workers,
        consumer,
        processor,
    ));

    info!("Core processing pipeline starting...");
    pipeline.start().await;
    app_state.ready.store(true, Ordering::Relaxed);
    info!("Service is now ready.");

    let prometheus = prometheus_metrics();
    let token_api = web::Data::new(TokenApi {
        registry: app_state.registry.clone(),
    });
    let ready_flag = web::Data::from(app_state.ready.clone());
    let allowed_origins = config.cors.allowed_origins.clone();
    let bind_addr = config.bind_addr()?;

    let server = HttpServer::new(move || {
        App::new()
            .wrap(prometheus.clone())
            .app_data(token_api.clone())
            .app_data(ready_flag.clone())
            .route("/healthz", web::get().to(liveness))
            .route("/readyz", web::get().to(readiness))
            .service(
                web::scope("/api/v1")
                    .wrap(BearerAuthMiddlewareLayer::new(verifier.clone()))
                    .wrap(cors_layer(&allowed_origins))
                    .configure(api::token::routes),
            )
    })
    .bind(bind_addr)?
    .shutdown_timeout(config.graceful_shutdown_seconds)
    .run();

    let server_handle = server.handle();
    let mut server_task = tokio::spawn(server);

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let grace = Duration::from_secs(config.graceful_shutdown_seconds);

    tokio::select! {
        _ = sigterm.recv() => info!("[GRACEFUL_TERMINATION] SIGTERM received"),
        _ = sigint.recv() => info!("[GRACEFUL_TERMINATION] SIGINT received"),
        result = &mut server_task => {
            error!("[HTTP_SERVER] terminated : {:?}", result);
            let _ = pipeline.stop(grace).await;
            return Err(anyhow!("http server terminated unexpectedly"));
        }
    }

    // Stop the pipeline before the HTTP surface, aggregating errors.
    let mut final_error: Option<anyhow::Error> = None;

    info!("Shutting down service components...");
    if let Err(err) = pipeline.stop(grace).await {
        error!("Processing pipeline shutdown failed : {err:?}");
        final_error = Some(err);
    }

    server_handle.stop(true).await;
    match server_task.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            error!("HTTP server shutdown failed : {err:?}");
            if final_error.is_none() {
                final_error = Some(err.into());
            }
        }
        Err(err) => {
            error!("HTTP server task failed : {err:?}");
            if final_error.is_none() {
                final_error = Some(anyhow!(err));
            }
        }
    }

    info!("Service shutdown complete.");
    match final_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
