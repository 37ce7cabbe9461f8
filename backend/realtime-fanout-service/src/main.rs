use actix_web::{web, App, HttpServer};
use realtime_fanout_service::{
    config, db,
    error::AppError,
    logging,
    middleware::auth::JwtIdentityResolver,
    routes,
    services::{PgMembershipStore, PgUserDirectory},
    state::AppState,
    websocket::{Gateway, HubSettings, RealtimeHub},
};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing_actix_web::TracingLogger;

#[actix_rt::main]
async fn main() -> Result<(), AppError> {
    logging::init_tracing();
    let cfg = Arc::new(config::Config::from_env()?);

    let pool = db::init_pool(&cfg.database_url, cfg.db_max_connections)
        .await
        .map_err(|e| AppError::StartServer(format!("db: {e}")))?;
    let store = Arc::new(PgMembershipStore::new(pool.clone()));
    let users = Arc::new(PgUserDirectory::new(pool));

    let mut resolver = JwtIdentityResolver::from_rsa_pem(&cfg.jwt_public_key_pem, users)
        .map_err(|e| AppError::Config(format!("invalid JWT public key: {e}")))?;
    if let Some(audience) = cfg.jwt_audience.as_deref() {
        resolver = resolver.with_audience(audience);
    }
    if let Some(issuer) = cfg.jwt_issuer.as_deref() {
        resolver = resolver.with_issuer(issuer);
    }
    let resolver = Arc::new(resolver);

    let hub = Arc::new(RealtimeHub::new(HubSettings {
        outbound_buffer: cfg.outbound_buffer,
        typing_timeout: cfg.typing_timeout,
        revocation_retention: (cfg.handshake_timeout * 2).max(Duration::from_secs(60)),
    }));
    let gateway = Arc::new(Gateway::new(
        hub.clone(),
        resolver,
        store,
        cfg.handshake_timeout,
    ));

    let sweeper =
        RealtimeHub::spawn_idle_sweeper(hub.clone(), cfg.idle_sweep_interval, cfg.client_timeout);

    let state = AppState {
        hub: hub.clone(),
        gateway,
        config: cfg.clone(),
    };

    let bind_addr = format!("0.0.0.0:{}", cfg.port);
    tracing::info!(%bind_addr, "starting realtime-fanout-service");

    let server = HttpServer::new(move || {
        App::new()
            .wrap(TracingLogger::default())
            .app_data(web::Data::new(state.clone()))
            .configure(routes::configure_routes)
    })
    .disable_signals()
    .bind(&bind_addr)
    .map_err(|e| AppError::StartServer(format!("bind: {e}")))?
    .run();
    let handle = server.handle();

    tokio::select! {
        res = server => {
            res.map_err(|e| AppError::StartServer(format!("server: {e}")))?;
        }
        _ = shutdown_signal() => {
            // Close every live connection first so clients reconnect elsewhere,
            // then let in-flight HTTP requests finish.
            let closed = hub.shutdown();
            tracing::info!(closed, "realtime hub shut down");
            handle.stop(true).await;
        }
    }

    sweeper.abort();
    tracing::info!("realtime-fanout-service stopped");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received Ctrl+C"),
        _ = terminate => tracing::info!("received SIGTERM"),
    }
}
