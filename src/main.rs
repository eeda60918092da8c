//! upload2dir server binary.
//!
//! An HTTP file-write gateway: `PUT` uploads a multipart file under the
//! configured root (keeping a timestamped backup of what it replaces),
//! `POST` creates a directory and `DELETE` removes a file. Every other method
//! falls through to a static file server over the same root.

mod auth;
mod background;
mod committer;
mod config;
mod directory;
mod envelope;
mod error;
mod handler;
mod http;
mod logging;
mod paths;
mod spool;

use axum::extract::connect_info::ConnectInfo;
use axum::http::Request;
use axum_server::Handle;
use clap::Parser;
use shadow_rs::shadow;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, error, info, info_span};

use crate::auth::Authorizer;
use crate::background::spawn_background_tasks;
use crate::config::{Args, GatewayConfig};
use crate::handler::Gateway;

shadow!(build);

/// Starts the gateway and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    let args = Args::parse();
    logging::init_logging(args.log_format);

    let config = match GatewayConfig::load(&args).await {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "invalid configuration, refusing to start");
            return Err(err.into());
        }
    };
    let authorizer = Authorizer::from_lines(&args.users, args.auth_mode);
    info!(
        version = build::PKG_VERSION,
        root = ?config.root,
        dest_field = config.dest_field.as_deref().unwrap_or(""),
        file_field_name = config.file_field_name,
        max_filesize = config.max_filesize,
        max_form_buffer = config.max_form_buffer,
        spool_dir = ?config.spool_dir,
        auth_enabled = authorizer.is_enabled(),
        users = authorizer.user_count(),
        "current config"
    );

    let gateway = Arc::new(Gateway::new(config, authorizer));
    spawn_background_tasks(
        gateway.config().spool_dir.clone(),
        gateway.config().spool_ttl,
    );

    let app = handler::router(gateway).layer(
        TraceLayer::new_for_http()
            .make_span_with(|request: &Request<_>| {
                let connect_ip = request
                    .extensions()
                    .get::<ConnectInfo<SocketAddr>>()
                    .map(|ConnectInfo(addr)| addr.ip());
                let client_ip = http::resolve_client_ip(request.headers(), connect_ip)
                    .map(|ip| ip.to_string())
                    .unwrap_or_else(|| "unknown".to_string());

                info_span!(
                    env!("CARGO_CRATE_NAME"),
                    client_ip,
                    method = ?request.method(),
                    path = ?request.uri().path(),
                )
            })
            .on_request(DefaultOnRequest::new().level(Level::DEBUG))
            .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
    );

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    let addr = SocketAddr::new(host, args.port);
    let handle = Handle::new();

    info!("Starting upload2dir at {}", addr);
    let server = axum_server::bind(addr)
        .handle(handle.clone())
        .serve(app.into_make_service_with_connect_info::<SocketAddr>());

    tokio::select! {
        result = server => result?,
        _ = shutdown_signal(handle) => {}
    }

    Ok(())
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}
