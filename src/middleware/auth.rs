//! Shared-secret authentication.
//!
//! When a password is configured, every route except `/health` requires
//! `Authorization: Bearer <password>`. When authentication is marked as
//! required but no password is configured, protected routes fail with
//! `auth_misconfigured` instead of silently running open.

use crate::error::AppError;
use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    http::header::AUTHORIZATION,
    Error,
};
use futures_util::future::LocalBoxFuture;
use std::future::{ready, Ready};
use std::rc::Rc;

/// Paths that never require credentials.
const PUBLIC_PATHS: &[&str] = &["/health"];

#[derive(Debug, Clone)]
pub struct SharedSecretAuth {
    policy: Rc<AuthPolicy>,
}

#[derive(Debug)]
struct AuthPolicy {
    password: Option<String>,
    required: bool,
}

impl SharedSecretAuth {
    pub fn new(password: Option<String>, required: bool) -> Self {
        Self {
            policy: Rc::new(AuthPolicy {
                password: password.filter(|p| !p.is_empty()),
                required,
            }),
        }
    }
}

impl AuthPolicy {
    fn check(&self, req: &ServiceRequest) -> Result<(), AppError> {
        if PUBLIC_PATHS.contains(&req.path()) {
            return Ok(());
        }

        let expected = match (&self.password, self.required) {
            (Some(password), _) => password,
            (None, true) => {
                return Err(AppError::AuthMisconfigured(
                    "authentication is required but no password is configured".to_string(),
                ))
            }
            (None, false) => return Ok(()),
        };

        let provided = req
            .headers()
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim);

        match provided {
            Some(token) if constant_time_eq(token.as_bytes(), expected.as_bytes()) => Ok(()),
            _ => Err(AppError::Unauthorized(
                "Missing or invalid bearer token".to_string(),
            )),
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

impl<S, B> Transform<S, ServiceRequest> for SharedSecretAuth
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = SharedSecretAuthService<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(SharedSecretAuthService {
            service,
            policy: Rc::clone(&self.policy),
        }))
    }
}

pub struct SharedSecretAuthService<S> {
    service: S,
    policy: Rc<AuthPolicy>,
}

impl<S, B> Service<ServiceRequest> for SharedSecretAuthService<S>
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
        if let Err(err) = self.policy.check(&req) {
            tracing::warn!(path = %req.path(), "Rejected request: {}", err);
            return Box::pin(async move { Err(err.into()) });
        }

        let fut = self.service.call(req);
        Box::pin(fut)
    }
}
