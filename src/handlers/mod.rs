pub mod transcribe;

use crate::health;
use actix_web::web;

/// Register every route the server exposes.
pub fn routes(cfg: &mut web::ServiceConfig, max_upload_bytes: usize) {
    cfg.route("/health", web::get().to(health::health_check))
        .route("/metrics", web::get().to(health::detailed_metrics))
        .route("/transcribe", web::post().to(transcribe::transcribe))
        .route("/process", web::post().to(transcribe::transcribe))
        .service(
            web::resource("/transcribe-upload")
                .app_data(web::PayloadConfig::new(max_upload_bytes))
                .route(web::post().to(transcribe::transcribe_upload)),
        );
}
