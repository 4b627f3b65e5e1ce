/*  Copyright 2022-23, Juspay India Pvt Ltd
    This program is free software: you can redistribute it and/or modify it under the terms of the GNU Affero General Public License
    as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version. This program
    is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY
    or FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more details. You should have received a copy of
    the GNU Affero General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.
*/

use std::sync::Arc;

use actix_web::{http::Method, web, HttpResponse};
use serde::Deserialize;
use tracing::error;

use crate::{
    common::{
        types::{MobileToken, WebPushKeys, WebSubscription},
        utils::decode_base64_flexible,
    },
    middleware::auth::AuthenticatedUser,
    registry::TokenRegistry,
    tools::error::AppError,
};

/// Shared state of the token API handlers.
#[derive(Clone)]
pub struct TokenApi {
    pub registry: Arc<dyn TokenRegistry>,
}

pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/register/mobile", web::post().to(register_mobile))
        .route("/register/web", web::post().to(register_web))
        .route("/unregister/mobile", web::post().to(unregister_mobile))
        .route("/unregister/web", web::post().to(unregister_web))
        // Preflight for the whole namespace; headers are added by the CORS
        // layer.
        .route("/{tail:.*}", web::method(Method::OPTIONS).to(preflight));
}

async fn preflight() -> HttpResponse {
    HttpResponse::Ok().finish()
}

#[derive(Deserialize)]
pub struct MobileTokenBody {
    #[serde(default)]
    token: String,
}

#[derive(Deserialize)]
pub struct WebKeysBody {
    #[serde(default)]
    p256dh: String,
    #[serde(default)]
    auth: String,
}

#[derive(Deserialize)]
pub struct RegisterWebBody {
    #[serde(default)]
    endpoint: String,
    keys: WebKeysBody,
}

#[derive(Deserialize)]
pub struct UnregisterWebBody {
    #[serde(default)]
    endpoint: String,
}

async fn register_mobile(
    AuthenticatedUser(user): AuthenticatedUser,
    api: web::Data<TokenApi>,
    body: web::Json<MobileTokenBody>,
) -> Result<HttpResponse, AppError> {
    if body.token.trim().is_empty() {
        return Err(AppError::InvalidRequest("token is required".to_string()));
    }

    api.registry
        .register_mobile(&user, MobileToken(body.token.clone()))
        .await
        .map_err(|err| {
            error!("Failed to register mobile token for {user} : {err}");
            AppError::from(err)
        })?;

    Ok(HttpResponse::NoContent().finish())
}

async fn register_web(
    AuthenticatedUser(user): AuthenticatedUser,
    api: web::Data<TokenApi>,
    body: web::Json<RegisterWebBody>,
) -> Result<HttpResponse, AppError> {
    if body.endpoint.trim().is_empty() {
        return Err(AppError::InvalidRequest("endpoint is required".to_string()));
    }
    if body.keys.p256dh.is_empty() || body.keys.auth.is_empty() {
        return Err(AppError::InvalidRequest(
            "subscription keys are required".to_string(),
        ));
    }

    let p256dh = decode_base64_flexible(&body.keys.p256dh)
        .map_err(|err| AppError::InvalidRequest(format!("p256dh is not base64: {err}")))?;
    let auth = decode_base64_flexible(&body.keys.auth)
        .map_err(|err| AppError::InvalidRequest(format!("auth is not base64: {err}")))?;

    let subscription = WebSubscription {
        endpoint: body.endpoint.clone(),
        keys: WebPushKeys { p256dh, auth },
    };

    api.registry
        .register_web(&user, subscription)
        .await
        .map_err(|err| {
            error!("Failed to register web subscription for {user} : {err}");
            AppError::from(err)
        })?;

    Ok(HttpResponse::NoContent().finish())
}

async fn unregister_mobile(
    AuthenticatedUser(user): AuthenticatedUser,
    api: web::Data<TokenApi>,
    body: web::Json<MobileTokenBody>,
) -> Result<HttpResponse, AppError> {
    if body.token.trim().is_empty() {
        return Err(AppError::InvalidRequest("token is required".to_string()));
    }

    // Deleting a row that never existed is a success.
    api.registry
        .unregister_mobile(&user, &MobileToken(body.token.clone()))
        .await
        .map_err(|err| {
            error!("Failed to unregister mobile token for {user} : {err}");
            AppError::from(err)
        })?;

    Ok(HttpResponse::NoContent().finish())
}

async fn unregister_web(
    AuthenticatedUser(user): AuthenticatedUser,
    api: web::Data<TokenApi>,
    body: web::Json<UnregisterWebBody>,
) -> Result<HttpResponse, AppError> {
    if body.endpoint.trim().is_empty() {
        return Err(AppError::InvalidRequest("endpoint is required".to_string()));
    }

    api.registry
        .unregister_web(&user, &body.endpoint)
        .await
        .map_err(|err| {
            error!("Failed to unregister web subscription for {user} : {err}");
            AppError::from(err)
        })?;

    Ok(HttpResponse::NoContent().finish())
}
