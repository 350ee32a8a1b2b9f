use crate::limiter::Decision;

/// Receives a copy of every decision for auditing.
///
/// `record` is called inline on the request path, before the response is produced, and the
/// request waits for it to return. Implementations must not block: anything slow, such as a
/// message queue or a database, should be handed off to a background task (for example with
/// [actix_web::rt::spawn] or a channel).
///
/// A panic inside `record` is caught and logged by the middleware, and the request carries on
/// with its decision.
pub trait DecisionSink {
    fn record(&self, key: &str, path: &str, decision: &Decision);
}

impl<F> DecisionSink for F
where
    F: Fn(&str, &str, &Decision),
{
    fn record(&self, key: &str, path: &str, decision: &Decision) {
        self(key, path, decision)
    }
}

/// Writes decisions to the `log` facade under the `rate_limit::audit` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl DecisionSink for LogSink {
    fn record(&self, key: &str, path: &str, decision: &Decision) {
        if decision.admitted {
            log::info!(target: "rate_limit::audit", "ALLOWED: {key} hit {path}");
        } else {
            log::warn!(target: "rate_limit::audit", "BLOCKED: {key} exceeded quota on {path}");
        }
    }
}
