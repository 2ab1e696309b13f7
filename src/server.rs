// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! HTTP dispatcher for `/Microsoft-Server-ActiveSync`: authenticates the
//! request, answers OPTIONS, and hands POSTs to the per-version command
//! handler.

use std::collections::HashMap;
use std::sync::Arc;

use actix_web::http::{Method, StatusCode};
use actix_web::{web, HttpRequest, HttpResponse};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use log::{debug, error, info};

use crate::auth::{Authenticator, Credential};
use crate::codec::{BodyCodec, WBXML_CONTENT_TYPE};
use crate::eas::{CommandRegistry, EasRequest, Param, ResponseBuffer};

pub const ACTIVESYNC_PATH: &str = "/Microsoft-Server-ActiveSync";

pub struct AppState {
    pub registry: CommandRegistry,
    pub authenticator: Arc<dyn Authenticator>,
    pub param: Arc<Param>,
}

pub async fn activesync_entry(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState>,
) -> HttpResponse {
    debug!(
        "Client: {:?}, Method: {}, URL: {}",
        req.peer_addr(),
        req.method(),
        req.uri()
    );

    let credential = match authenticate(&req, state.authenticator.as_ref()).await {
        Ok(c) => c,
        Err(e) => {
            error!("failed to authorize a new request: {e}");
            return HttpResponse::InternalServerError().finish();
        }
    };
    if !credential.authorized {
        info!("Unauthorized: username={}", credential.user_id);
        return HttpResponse::Unauthorized().finish();
    }

    // The response is intended for a single user and must not be stored by
    // a shared cache such as a proxy server.
    if req.method() == Method::OPTIONS {
        options_response(&state.registry)
    } else if req.method() == Method::POST {
        dispatch(&req, body, &state, credential).await
    } else {
        HttpResponse::BadRequest()
            .insert_header(("Cache-Control", "private"))
            .insert_header(("Allow", "OPTIONS,POST"))
            .body("Only allows OPTIONS and POST HTTP methods")
    }
}

async fn authenticate(
    req: &HttpRequest,
    authenticator: &dyn Authenticator,
) -> Result<Credential, crate::error::CommandError> {
    let Some(header) = req
        .headers()
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
    else {
        return Ok(Credential::unauthorized());
    };
    let Some(encoded) = header.strip_prefix("Basic ") else {
        return Ok(Credential::unauthorized());
    };
    let Ok(decoded) = BASE64.decode(encoded.trim()) else {
        return Ok(Credential::unauthorized());
    };
    let decoded = String::from_utf8_lossy(&decoded).into_owned();
    let Some((user, password)) = decoded.split_once(':') else {
        return Ok(Credential::unauthorized());
    };
    authenticator.auth(user, password).await
}

fn options_response(registry: &CommandRegistry) -> HttpResponse {
    HttpResponse::Ok()
        .insert_header(("Cache-Control", "private"))
        .insert_header(("Allow", "OPTIONS,POST"))
        .insert_header(("MS-ASProtocolVersions", registry.versions()))
        .insert_header(("MS-ASProtocolCommands", registry.commands()))
        .finish()
}

async fn dispatch(
    req: &HttpRequest,
    body: web::Bytes,
    state: &web::Data<AppState>,
    credential: Credential,
) -> HttpResponse {
    let query = match web::Query::<HashMap<String, String>>::from_query(req.query_string()) {
        Ok(q) => q.into_inner(),
        Err(_) => HashMap::new(),
    };

    // Check DeviceId.
    if query.get("DeviceId").map(String::as_str).unwrap_or("").is_empty() {
        debug!("Missing DeviceId URI parameter from {:?}", req.peer_addr());
        return HttpResponse::BadRequest()
            .insert_header(("Cache-Control", "private"))
            .body("Missing DeviceId URI parameter");
    }

    // Check the protocol version.
    let version = req
        .headers()
        .get("MS-ASProtocolVersion")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if version.is_empty() {
        debug!(
            "Missing MS-ASProtocolVersion header from {:?}",
            req.peer_addr()
        );
        return HttpResponse::BadRequest()
            .insert_header(("Cache-Control", "private"))
            .body("Missing MS-ASProtocolVersion header");
    }

    let Some(factory) = state.registry.get(version) else {
        debug!(
            "Unsupported ActiveSync protocol version from {:?}",
            req.peer_addr()
        );
        return HttpResponse::BadRequest()
            .insert_header(("Cache-Control", "private"))
            .body("Unsupported ActiveSync protocol version");
    };

    let mut headers = HashMap::new();
    for (name, value) in req.headers() {
        if let Ok(value) = value.to_str() {
            headers.insert(name.as_str().to_ascii_lowercase(), value.to_string());
        }
    }
    let eas_req = EasRequest {
        remote_addr: req
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_default(),
        query,
        headers,
        body: body.to_vec(),
    };

    let mut handler = factory.new_handler(state.param.clone(), credential, eas_req);
    let resp = handler.handle().await;
    flush(resp, state.param.codec.as_ref())
}

/// Converts the buffered handler response into an HTTP response, encoding
/// the body through the wire codec when the command produced WBXML.
fn flush(buf: ResponseBuffer, codec: &dyn BodyCodec) -> HttpResponse {
    let status =
        StatusCode::from_u16(buf.status().unwrap_or(200)).unwrap_or(StatusCode::OK);
    let mut builder = HttpResponse::build(status);
    builder.insert_header(("Cache-Control", "private"));
    for (name, value) in buf.headers() {
        builder.insert_header((name.as_str(), value.as_str()));
    }
    if buf.body().is_empty() {
        return builder.finish();
    }
    if buf.is_wbxml() {
        match codec.encode(&buf.body_str()) {
            Ok(encoded) => {
                builder.insert_header(("Content-Type", WBXML_CONTENT_TYPE));
                builder.body(encoded)
            }
            Err(e) => {
                error!("Failed to encode the response body: {e}");
                HttpResponse::InternalServerError().finish()
            }
        }
    } else {
        builder.body(buf.body().to_vec())
    }
}
