use crate::state::AppState;
use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    http::Method,
    web, Error,
};
use futures_util::future::LocalBoxFuture;
use std::{
    future::{ready, Ready},
    time::Instant,
};

/// Bucket for requests that match no registered route.
pub const UNMATCHED_ENDPOINT: &str = "<unmatched>";

/// Records per-endpoint request counts, durations and errors.
///
/// For streaming endpoints the duration covers the time until the response
/// head is ready, not the whole stream.
///
/// Endpoints are keyed by route pattern, never by raw path, so the number of
/// keys is bounded by the routing table.
pub struct MetricsMiddleware;

const STANDARD_METHODS: [Method; 7] = [
    Method::GET,
    Method::POST,
    Method::PUT,
    Method::DELETE,
    Method::PATCH,
    Method::HEAD,
    Method::OPTIONS,
];

fn endpoint_key(method: &Method, pattern: Option<String>) -> String {
    let Some(pattern) = pattern else {
        return UNMATCHED_ENDPOINT.to_string();
    };
    let method = if STANDARD_METHODS.contains(method) {
        method.as_str()
    } else {
        "OTHER"
    };
    format!("{} {}", method, pattern)
}

impl<S, B> Transform<S, ServiceRequest> for MetricsMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = MetricsMiddlewareService<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(MetricsMiddlewareService { service }))
    }
}

pub struct MetricsMiddlewareService<S> {
    service: S,
}

impl<S, B> Service<ServiceRequest> for MetricsMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let start_time = Instant::now();
        let endpoint = endpoint_key(req.method(), req.match_pattern());
        let state = req.app_data::<web::Data<AppState>>().cloned();

        let fut = self.service.call(req);

        Box::pin(async move {
            let result = fut.await;
            let duration_ms = start_time.elapsed().as_millis() as u64;

            let is_error = match &result {
                Ok(response) => {
                    response.status().is_client_error() || response.status().is_server_error()
                }
                Err(_) => true,
            };

            if let Some(state) = state {
                state.record_endpoint_request(&endpoint, duration_ms, is_error);
            }

            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::transcription::testing::ScriptedLoader;
    use actix_web::{test, App, HttpResponse};
    use tokio_util::sync::CancellationToken;

    #[actix_web::test]
    async fn test_requests_are_recorded_per_endpoint() {
        let state = AppState::new(AppConfig::default(), ScriptedLoader::new(), CancellationToken::new());
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .wrap(MetricsMiddleware)
                .route("/ok", web::get().to(|| async { HttpResponse::Ok().finish() }))
                .route("/bad", web::get().to(|| async { HttpResponse::BadRequest().finish() })),
        )
        .await;

        test::call_service(&app, test::TestRequest::get().uri("/ok").to_request()).await;
        test::call_service(&app, test::TestRequest::get().uri("/bad").to_request()).await;

        let metrics = state.metrics_snapshot();
        assert_eq!(metrics.request_count, 2);
        assert_eq!(metrics.error_count, 1);
        assert_eq!(metrics.endpoint_metrics["GET /bad"].error_count, 1);
        assert_eq!(metrics.endpoint_metrics["GET /ok"].request_count, 1);
    }

    #[actix_web::test]
    async fn test_unknown_paths_share_one_bucket() {
        let state = AppState::new(AppConfig::default(), ScriptedLoader::new(), CancellationToken::new());
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .wrap(crate::middleware::SharedSecretAuth::new(Some("s3cret".into()), false))
                .wrap(MetricsMiddleware)
                .route("/ok", web::get().to(|| async { HttpResponse::Ok().finish() })),
        )
        .await;

        for path in ["/junk/1", "/junk/2", "/other"] {
            let req = test::TestRequest::get().uri(path).to_request();
            let _ = test::try_call_service(&app, req).await;
        }

        let metrics = state.metrics_snapshot();
        assert_eq!(metrics.request_count, 3);
        assert_eq!(metrics.endpoint_metrics.len(), 1);
        assert_eq!(metrics.endpoint_metrics[UNMATCHED_ENDPOINT].request_count, 3);
        assert_eq!(metrics.endpoint_metrics[UNMATCHED_ENDPOINT].error_count, 3);
    }

    #[::core::prelude::v1::test]
    fn test_endpoint_key_normalizes_method() {
        assert_eq!(endpoint_key(&Method::GET, Some("/health".into())), "GET /health");
        let custom = Method::from_bytes(b"PURGE").unwrap();
        assert_eq!(endpoint_key(&custom, Some("/health".into())), "OTHER /health");
        assert_eq!(endpoint_key(&Method::GET, None), UNMATCHED_ENDPOINT);
    }
}
