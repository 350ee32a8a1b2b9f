pub mod builder;
pub mod input_builder;

use crate::audit::DecisionSink;
use crate::clock::Clock;
use crate::limiter::{Decision, RateLimiterEngine};
use crate::policy::QuotaPolicy;
use crate::settings::StoreFailurePolicy;
use crate::store::WindowStore;
use actix_web::body::EitherBody;
use actix_web::dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::http::header::HeaderMap;
use actix_web::{HttpResponse, ResponseError};
use builder::RateLimiterBuilder;
use futures::future::{ok, LocalBoxFuture, Ready};
use std::cell::RefCell;
use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::{future::Future, rc::Rc};

type AllowedTransformation = dyn Fn(&mut HeaderMap, Option<&Decision>);
type DeniedResponse = dyn Fn(&Decision) -> HttpResponse;

/// What the input function produces for each request.
#[derive(Debug, Clone)]
pub struct RateLimitInput {
    /// The rate limit key to be used for this request.
    pub key: String,
    /// The quota to apply to the key.
    pub policy: QuotaPolicy,
}

/// Rate limit middleware.
pub struct RateLimiter<WS, CL, F> {
    engine: Rc<RateLimiterEngine<WS, CL>>,
    input_fn: Rc<F>,
    on_store_failure: StoreFailurePolicy,
    allowed_transformation: Option<Rc<AllowedTransformation>>,
    denied_response: Rc<DeniedResponse>,
    bypass_paths: Rc<HashSet<String>>,
    sink: Option<Rc<dyn DecisionSink>>,
}

impl<WS, CL, F> Clone for RateLimiter<WS, CL, F> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            input_fn: self.input_fn.clone(),
            on_store_failure: self.on_store_failure,
            allowed_transformation: self.allowed_transformation.clone(),
            denied_response: self.denied_response.clone(),
            bypass_paths: self.bypass_paths.clone(),
            sink: self.sink.clone(),
        }
    }
}

impl<WS, CL, F, O> RateLimiter<WS, CL, F>
where
    WS: WindowStore + 'static,
    CL: Clock + 'static,
    F: Fn(&ServiceRequest) -> O + 'static,
    O: Future<Output = Result<RateLimitInput, actix_web::Error>>,
{
    /// # Arguments
    ///
    /// * `engine`: The sliding window engine and its store.
    /// * `input_fn`: A future that produces the key and policy based on the incoming request.
    /// * `on_store_failure`: Whether to admit requests while the store is unreachable.
    pub fn builder(
        engine: RateLimiterEngine<WS, CL>,
        input_fn: F,
        on_store_failure: StoreFailurePolicy,
    ) -> RateLimiterBuilder<WS, CL, F> {
        RateLimiterBuilder::new(engine, input_fn, on_store_failure)
    }
}

impl<S, B, WS, CL, F, O> Transform<S, ServiceRequest> for RateLimiter<WS, CL, F>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = actix_web::Error> + 'static,
    S::Future: 'static,
    B: 'static,
    WS: WindowStore + 'static,
    CL: Clock + 'static,
    F: Fn(&ServiceRequest) -> O + 'static,
    O: Future<Output = Result<RateLimitInput, actix_web::Error>>,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = actix_web::Error;
    type Transform = RateLimiterMiddleware<S, WS, CL, F>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ok(RateLimiterMiddleware {
            service: Rc::new(RefCell::new(service)),
            limiter: self.clone(),
        })
    }
}

pub struct RateLimiterMiddleware<S, WS, CL, F> {
    service: Rc<RefCell<S>>,
    limiter: RateLimiter<WS, CL, F>,
}

impl<S, B, WS, CL, F, O> Service<ServiceRequest> for RateLimiterMiddleware<S, WS, CL, F>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = actix_web::Error> + 'static,
    S::Future: 'static,
    B: 'static,
    WS: WindowStore + 'static,
    CL: Clock + 'static,
    F: Fn(&ServiceRequest) -> O + 'static,
    O: Future<Output = Result<RateLimitInput, actix_web::Error>>,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = actix_web::Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = self.service.clone();
        let limiter = self.limiter.clone();

        Box::pin(async move {
            if limiter.bypass_paths.contains(req.path()) {
                return Ok(service.call(req).await?.map_into_left_body());
            }

            let input = match (limiter.input_fn)(&req).await {
                Ok(input) => input,
                Err(e) => {
                    log::error!("Rate limiter input function failed: {e}");
                    return Ok(req.into_response(e.error_response()).map_into_right_body());
                }
            };

            let decision = match limiter.engine.check(&input.key, &input.policy).await {
                Ok(decision) => {
                    if let Some(sink) = &limiter.sink {
                        let recorded = panic::catch_unwind(AssertUnwindSafe(|| {
                            sink.record(&input.key, req.path(), &decision)
                        }));
                        if recorded.is_err() {
                            log::error!("Decision sink panicked recording {}", input.key);
                        }
                    }
                    if decision.is_rejected() {
                        let response: HttpResponse = (limiter.denied_response)(&decision);
                        return Ok(req.into_response(response).map_into_right_body());
                    }
                    Some(decision)
                }
                // Only an unreachable store is subject to the failure policy, anything else is a bug
                Err(e) if e.is_store_unavailable() && limiter.on_store_failure.is_fail_open() => {
                    log::warn!("Rate limiter failed: {e}, allowing the request anyway");
                    None
                }
                Err(e) => {
                    log::error!("Rate limiter failed: {e}");
                    return Ok(req.into_response(e.error_response()).map_into_right_body());
                }
            };

            let mut service_response = service.call(req).await?;

            if let Some(transformation) = &limiter.allowed_transformation {
                (transformation)(service_response.headers_mut(), decision.as_ref());
            }

            Ok(service_response.map_into_left_body())
        })
    }
}
