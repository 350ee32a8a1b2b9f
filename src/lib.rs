#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod audit;
pub mod clock;
pub mod error;
pub mod limiter;
mod middleware;
pub mod policy;
pub mod settings;
pub mod store;

pub use error::Error;
pub use limiter::{Decision, RateLimiterEngine};
pub use middleware::builder::{HeaderCompatibleOutput, RateLimiterBuilder};
pub use middleware::input_builder::{SimpleInputFunctionBuilder, SimpleInputFuture};
pub use middleware::{RateLimitInput, RateLimiter};
pub use policy::QuotaPolicy;
pub use settings::{Settings, StoreFailurePolicy};
