pub mod internal;
pub mod wsroute;

use crate::metrics;
use actix_web::{web, HttpResponse};

async fn health() -> HttpResponse {
    HttpResponse::Ok().body("OK")
}

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(wsroute::ws_handler)
        .route("/health", web::get().to(health))
        .route("/metrics", web::get().to(metrics::metrics_handler))
        .configure(internal::configure);
}
