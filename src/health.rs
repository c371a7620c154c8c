use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

/// `GET /health`: model settings and whether the model is in memory.
pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let settings = state.models.settings();

    HttpResponse::Ok().json(json!({
        "status": "ok",
        "model_name": settings.model_name,
        "compute_type": settings.compute_type,
        "device": settings.device,
        "model_loaded": state.models.is_loaded(),
    }))
}

/// `GET /metrics`: uptime, idle time, model lifecycle and request counters.
pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.metrics_snapshot();
    let uptime_seconds = state.uptime_seconds();
    let config = &state.config;

    let mut endpoint_stats = Vec::new();
    for (endpoint, metric) in metrics.endpoint_metrics.iter() {
        endpoint_stats.push(json!({
            "endpoint": endpoint,
            "request_count": metric.request_count,
            "error_count": metric.error_count,
            "error_rate": metric.error_rate(),
            "average_duration_ms": metric.average_duration_ms(),
            "total_duration_ms": metric.total_duration_ms
        }));
    }

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        },
        "lifecycle": {
            "busy": state.activity.is_held(),
            "shutting_down": state.shutdown.is_cancelled(),
            "idle_seconds": state.activity.idle_duration().map(|d| d.as_secs_f64()),
            "unload_timeout_seconds": config.lifecycle.unload_timeout_seconds,
            "shutdown_timeout_seconds": config.lifecycle.shutdown_timeout_seconds,
        },
        "model": {
            "loaded": state.models.is_loaded(),
            "stats": state.models.stats(),
        },
        "transcriptions": metrics.transcriptions,
        "overall": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": if metrics.request_count > 0 {
                metrics.error_count as f64 / metrics.request_count as f64
            } else {
                0.0
            },
        },
        "endpoints": endpoint_stats,
        "memory": get_memory_info(),
    }))
}

fn get_memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        let pid = std::process::id();
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", pid)) {
            let mut vm_rss = 0;
            let mut vm_size = 0;

            for line in status.lines() {
                if line.starts_with("VmRSS:") {
                    if let Some(kb_str) = line.split_whitespace().nth(1) {
                        vm_rss = kb_str.parse::<u64>().unwrap_or(0) * 1024;
                    }
                } else if line.starts_with("VmSize:") {
                    if let Some(kb_str) = line.split_whitespace().nth(1) {
                        vm_size = kb_str.parse::<u64>().unwrap_or(0) * 1024;
                    }
                }
            }

            return json!({
                "resident_memory_bytes": vm_rss,
                "virtual_memory_bytes": vm_size,
                "available": true
            });
        }
    }

    json!({
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false
    })
}
