use crate::audit::{DecisionSink, LogSink};
use crate::clock::Clock;
use crate::limiter::{Decision, RateLimiterEngine};
use crate::middleware::{AllowedTransformation, DeniedResponse, RateLimitInput, RateLimiter};
use crate::settings::StoreFailurePolicy;
use crate::store::WindowStore;
use actix_web::dev::ServiceRequest;
use actix_web::http::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use actix_web::HttpResponse;
use once_cell::sync::Lazy;
use std::collections::HashSet;
use std::future::Future;
use std::rc::Rc;

pub static X_RATELIMIT_LIMIT: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-ratelimit-limit"));

pub static X_RATELIMIT_REMAINING: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-ratelimit-remaining"));

pub static X_RATELIMIT_RESET: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-ratelimit-reset"));

pub struct RateLimiterBuilder<WS, CL, F> {
    engine: RateLimiterEngine<WS, CL>,
    input_fn: F,
    on_store_failure: StoreFailurePolicy,
    allowed_transformation: Option<Rc<AllowedTransformation>>,
    denied_response: Rc<DeniedResponse>,
    bypass_paths: HashSet<String>,
    sink: Option<Rc<dyn DecisionSink>>,
}

impl<WS, CL, F, O> RateLimiterBuilder<WS, CL, F>
where
    WS: WindowStore + 'static,
    CL: Clock + 'static,
    F: Fn(&ServiceRequest) -> O,
    O: Future<Output = Result<RateLimitInput, actix_web::Error>>,
{
    pub(super) fn new(
        engine: RateLimiterEngine<WS, CL>,
        input_fn: F,
        on_store_failure: StoreFailurePolicy,
    ) -> Self {
        Self {
            engine,
            input_fn,
            on_store_failure,
            allowed_transformation: None,
            denied_response: Rc::new(|_: &Decision| {
                HttpResponse::TooManyRequests().finish()
            }),
            bypass_paths: HashSet::new(),
            sink: None,
        }
    }

    /// Sets the [RateLimiterBuilder::request_allowed_transformation] and
    /// [RateLimiterBuilder::request_denied_response] functions, such that the following headers
    /// are set in both the allowed and denied responses:
    ///
    /// - `x-ratelimit-limit`\
    /// - `x-ratelimit-remaining`\
    /// - `x-ratelimit-reset` (seconds until the oldest counted request leaves the window)
    /// - `retry-after` (denied only, seconds until the reset)
    pub fn add_headers(mut self) -> Self {
        self.allowed_transformation = Some(Rc::new(
            |map: &mut HeaderMap, decision: Option<&Decision>| {
                if let Some(decision) = decision {
                    insert_headers(map, decision);
                }
            },
        ));
        self.denied_response = Rc::new(|decision: &Decision| {
            let mut response = HttpResponse::TooManyRequests().finish();
            let map = response.headers_mut();
            insert_headers(map, decision);
            map.insert(
                RETRY_AFTER,
                HeaderValue::from(decision.seconds_until_reset()),
            );
            response
        });
        self
    }

    /// In the event that the request is allowed:
    ///
    /// You can optionally mutate the response headers to include the rate limit status.
    ///
    /// By default no changes are made to the response.
    ///
    /// Note the [Decision] will be [None] if the store was unavailable and the failure policy is
    /// [StoreFailurePolicy::FailOpen].
    pub fn request_allowed_transformation<M>(mut self, mutation: Option<M>) -> Self
    where
        M: Fn(&mut HeaderMap, Option<&Decision>) + 'static,
    {
        self.allowed_transformation = mutation.map(|m| Rc::new(m) as Rc<AllowedTransformation>);
        self
    }

    /// In the event that the request is denied, configure the [HttpResponse] returned.
    ///
    /// Defaults to an empty body with status 429.
    pub fn request_denied_response<R>(mut self, denied_response: R) -> Self
    where
        R: Fn(&Decision) -> HttpResponse + 'static,
    {
        self.denied_response = Rc::new(denied_response);
        self
    }

    /// Requests to exactly this path skip rate limiting altogether, e.g. a health check.
    pub fn bypass_path(mut self, path: &str) -> Self {
        self.bypass_paths.insert(path.to_owned());
        self
    }

    /// Hand every decision, together with its key and request path, to `sink`.
    pub fn decision_sink<D>(mut self, sink: D) -> Self
    where
        D: DecisionSink + 'static,
    {
        self.sink = Some(Rc::new(sink));
        self
    }

    /// Shorthand for [RateLimiterBuilder::decision_sink] with a [LogSink].
    pub fn log_decisions(self) -> Self {
        self.decision_sink(LogSink)
    }

    pub fn build(self) -> RateLimiter<WS, CL, F> {
        RateLimiter {
            engine: Rc::new(self.engine),
            input_fn: Rc::new(self.input_fn),
            on_store_failure: self.on_store_failure,
            allowed_transformation: self.allowed_transformation,
            denied_response: self.denied_response,
            bypass_paths: Rc::new(self.bypass_paths),
            sink: self.sink,
        }
    }
}

fn insert_headers(map: &mut HeaderMap, output: &impl HeaderCompatibleOutput) {
    map.insert(X_RATELIMIT_LIMIT.clone(), HeaderValue::from(output.limit()));
    map.insert(
        X_RATELIMIT_REMAINING.clone(),
        HeaderValue::from(output.remaining()),
    );
    map.insert(
        X_RATELIMIT_RESET.clone(),
        HeaderValue::from(output.seconds_until_reset()),
    );
}

/// Values needed to render the `x-ratelimit-*` headers.
pub trait HeaderCompatibleOutput {
    /// Value for the `x-ratelimit-limit` header.
    fn limit(&self) -> u64;

    /// Value for the `x-ratelimit-remaining` header.
    fn remaining(&self) -> u64;

    /// Value for the `x-ratelimit-reset` and `retry-after` headers.
    ///
    /// This should be the number of seconds from now until the limit resets.\
    /// If the limit has already reset this should return 0.
    fn seconds_until_reset(&self) -> u64;
}
