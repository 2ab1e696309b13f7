// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::sync::Arc;

use actix_web::{web, App, HttpServer};
use dotenvy::dotenv;
use log::{error, info, warn};

use rustysync::auth::StaticAuthenticator;
use rustysync::codec::PlainXmlCodec;
use rustysync::config::Settings;
use rustysync::eas::{CommandRegistry, Param};
use rustysync::eas25::Eas25Factory;
use rustysync::mailer::SmtpMailer;
use rustysync::server::{activesync_entry, AppState, ACTIVESYNC_PATH};
use rustysync::store::memory::MemoryStore;
use rustysync::tls;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // Load .env if present.
    dotenv().ok();

    let config_path = std::env::args().nth(1);
    let settings = match Settings::new(config_path.as_deref()) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Failed to read configurations: {e}");
            std::process::exit(1);
        }
    };

    let level = settings
        .log_level()
        .map_err(|e| std::io::Error::other(e.to_string()))?;
    env_logger::Builder::from_env(
        env_logger::Env::new().default_filter_or(level.to_string()),
    )
    .init();
    info!("Starting RustySync server...");

    // Development backends: the in-memory store and the single-account
    // authenticator. A deployment swaps these for the SQL-backed stores and
    // the directory authenticator.
    warn!("Using the in-memory store and the static authenticator");
    let store = MemoryStore::new();
    let authenticator = StaticAuthenticator::new("test", "test", 1);
    let mailer = SmtpMailer::new(&settings.smtp.host, settings.smtp.port);

    // ActiveSync protocol version 2.5.
    let mut registry = CommandRegistry::new();
    registry.register(Arc::new(Eas25Factory));

    let param = Arc::new(Param {
        tx_manager: Arc::new(store),
        mailer: Arc::new(mailer),
        codec: Arc::new(PlainXmlCodec),
    });
    let state = web::Data::new(AppState {
        registry,
        authenticator: Arc::new(authenticator),
        param,
    });

    let tls_config = tls::server_config(&settings.server.cert_file, &settings.server.key_file)
        .map_err(|e| std::io::Error::other(e.to_string()))?;

    // Allow non-secured HTTP connections for debugging purposes only.
    if settings.server.allow_http {
        let http_state = state.clone();
        let http_server = HttpServer::new(move || {
            App::new()
                .app_data(http_state.clone())
                .route(ACTIVESYNC_PATH, web::route().to(activesync_entry))
        })
        .bind(("0.0.0.0", 80))?
        .run();
        tokio::spawn(async move {
            if let Err(e) = http_server.await {
                error!("Failed to listen on HTTP: {e}");
            }
        });
    }

    info!("Listening on port {}", settings.server.port);
    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .route(ACTIVESYNC_PATH, web::route().to(activesync_entry))
    })
    .bind_rustls_0_23(("0.0.0.0", settings.server.port), tls_config)?
    .run()
    .await
}
