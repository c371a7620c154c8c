pub mod auth;
pub mod metrics;

pub use auth::SharedSecretAuth;
pub use metrics::MetricsMiddleware;
