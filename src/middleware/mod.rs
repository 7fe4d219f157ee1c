pub mod builder;
#[cfg(test)]
mod tests;

use crate::backend::Backend;
use actix_web::body::EitherBody;
use actix_web::dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::http::header::HeaderMap;
use actix_web::http::StatusCode;
use actix_web::HttpResponse;
use builder::RateLimiterBuilder;
use futures::future::{ok, LocalBoxFuture, Ready};
use serde::Deserialize;
use std::{future::Future, rc::Rc};

type AllowedTransformation<BO> = dyn Fn(&mut HeaderMap, Option<&BO>, bool);
type DeniedResponse<BO> = dyn Fn(Option<&BO>) -> HttpResponse;
type RollbackCondition = dyn Fn(StatusCode) -> bool;

/// What to do with a request when the rate limiter backend fails.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Allow the request, favouring availability.
    Open,
    /// Deny the request with the denied response, favouring strict quotas.
    Closed,
}

/// Rate limit middleware.
pub struct RateLimiter<BA, BO, F> {
    backend: BA,
    input_fn: Rc<F>,
    failure_policy: FailurePolicy,
    scopes: Rc<[String]>,
    allowed_mutation: Option<Rc<AllowedTransformation<BO>>>,
    denied_response: Rc<DeniedResponse<BO>>,
    rollback_condition: Option<Rc<RollbackCondition>>,
}

impl<BA, BI, BO, F, O> Clone for RateLimiter<BA, BO, F>
where
    BA: Backend<BI> + 'static,
    BI: 'static,
    BO: 'static,
    F: Fn(&ServiceRequest) -> O + 'static,
    O: Future<Output = Result<Option<BI>, actix_web::Error>>,
{
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            input_fn: self.input_fn.clone(),
            failure_policy: self.failure_policy,
            scopes: self.scopes.clone(),
            allowed_mutation: self.allowed_mutation.clone(),
            denied_response: self.denied_response.clone(),
            rollback_condition: self.rollback_condition.clone(),
        }
    }
}

impl<BA, BI, BO, F, O> RateLimiter<BA, BO, F>
where
    BA: Backend<BI, Output = BO> + 'static,
    BI: 'static,
    BO: 'static,
    F: Fn(&ServiceRequest) -> O + 'static,
    O: Future<Output = Result<Option<BI>, actix_web::Error>>,
{
    /// # Arguments
    ///
    /// * `backend`: A rate limiting algorithm and store implementation.
    /// * `input_fn`: A future that produces input to the backend based on the incoming request,
    ///   or `None` if the request should not be rate limited.
    /// * `failure_policy`: Whether to allow or deny requests when the backend fails.
    pub fn builder(
        backend: BA,
        input_fn: F,
        failure_policy: FailurePolicy,
    ) -> RateLimiterBuilder<BA, BO, F> {
        RateLimiterBuilder::new(backend, input_fn, failure_policy)
    }
}

impl<S, B, BA, BI, BO, BE, BT, F, O> Transform<S, ServiceRequest> for RateLimiter<BA, BO, F>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = actix_web::Error> + 'static,
    S::Future: 'static,
    B: 'static,
    BA: Backend<BI, Output = BO, Error = BE, RollbackToken = BT> + 'static,
    BI: 'static,
    BO: 'static,
    BE: std::fmt::Display + 'static,
    BT: 'static,
    F: Fn(&ServiceRequest) -> O + 'static,
    O: Future<Output = Result<Option<BI>, actix_web::Error>>,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = actix_web::Error;
    type Transform = RateLimiterMiddleware<S, BA, BO, F>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ok(RateLimiterMiddleware {
            service: Rc::new(service),
            backend: self.backend.clone(),
            input_fn: Rc::clone(&self.input_fn),
            failure_policy: self.failure_policy,
            scopes: self.scopes.clone(),
            allowed_transformation: self.allowed_mutation.clone(),
            denied_response: self.denied_response.clone(),
            rollback_condition: self.rollback_condition.clone(),
        })
    }
}

pub struct RateLimiterMiddleware<S, BA, BO, F> {
    service: Rc<S>,
    backend: BA,
    input_fn: Rc<F>,
    failure_policy: FailurePolicy,
    scopes: Rc<[String]>,
    allowed_transformation: Option<Rc<AllowedTransformation<BO>>>,
    denied_response: Rc<DeniedResponse<BO>>,
    rollback_condition: Option<Rc<RollbackCondition>>,
}

impl<S, B, BA, BI, BO, BE, BT, F, O> Service<ServiceRequest> for RateLimiterMiddleware<S, BA, BO, F>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = actix_web::Error> + 'static,
    S::Future: 'static,
    B: 'static,
    BA: Backend<BI, Output = BO, Error = BE, RollbackToken = BT> + 'static,
    BI: 'static,
    BO: 'static,
    BE: std::fmt::Display + 'static,
    BT: 'static,
    F: Fn(&ServiceRequest) -> O + 'static,
    O: Future<Output = Result<Option<BI>, actix_web::Error>>,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = actix_web::Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        if !in_scope(&self.scopes, req.path()) {
            let response = self.service.call(req);
            return Box::pin(async move { Ok(response.await?.map_into_left_body()) });
        }

        let service = self.service.clone();
        let backend = self.backend.clone();
        let input_fn = self.input_fn.clone();
        let failure_policy = self.failure_policy;
        let allowed_transformation = self.allowed_transformation.clone();
        let denied_response = self.denied_response.clone();
        let rollback_condition = self.rollback_condition.clone();

        Box::pin(async move {
            let input = match (input_fn)(&req).await {
                Ok(Some(input)) => input,
                // Unidentified clients are never rate limited
                Ok(None) => {
                    log::debug!("No rate limit key for request to {}, skipping", req.path());
                    return Ok(service.call(req).await?.map_into_left_body());
                }
                Err(e) => {
                    log::error!("Rate limiter input function failed: {e}");
                    return Ok(req.into_response(e.error_response()).map_into_right_body());
                }
            };

            // Detached from this request, so that the store calls run to completion even if the
            // client goes away.
            let limiter = backend.clone();
            let result = match actix_web::rt::spawn(async move { limiter.request(input).await })
                .await
            {
                Ok(result) => result.map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };

            let (output, rollback) = match result {
                // Able to successfully query rate limiter backend
                Ok((decision, output, rollback)) => {
                    if decision.is_denied() {
                        let response: HttpResponse = (denied_response)(Some(&output));
                        return Ok(req.into_response(response).map_into_right_body());
                    }
                    (Some(output), Some(rollback))
                }
                // Unable to query rate limiter backend
                Err(e) => match failure_policy {
                    FailurePolicy::Open => {
                        log::warn!("Rate limiter failed: {e}, allowing the request anyway");
                        (None, None)
                    }
                    FailurePolicy::Closed => {
                        log::error!("Rate limiter failed: {e}, denying the request");
                        let response: HttpResponse = (denied_response)(None);
                        return Ok(req.into_response(response).map_into_right_body());
                    }
                },
            };

            let mut service_response = service.call(req).await?;

            let mut rolled_back = false;
            if let Some(token) = rollback {
                if let Some(rollback_condition) = rollback_condition {
                    let status = service_response.status();
                    if rollback_condition(status) {
                        if let Err(e) = backend.rollback(token).await {
                            log::error!("Unable to rollback rate-limit count for response: {:?}, error: {e}", status);
                        } else {
                            rolled_back = true;
                        };
                    }
                }
            }

            if let Some(transformation) = allowed_transformation {
                (transformation)(service_response.headers_mut(), output.as_ref(), rolled_back);
            }

            Ok(service_response.map_into_left_body())
        })
    }
}

/// An empty scope list covers every path.
fn in_scope(scopes: &[String], path: &str) -> bool {
    scopes.is_empty() || scopes.iter().any(|scope| matches_scope(scope, path))
}

/// `/api` matches `/api` and everything below `/api/`, but not `/apiary`.
fn matches_scope(scope: &str, path: &str) -> bool {
    let scope = scope.trim_end_matches('/');
    match path.strip_prefix(scope) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}
