//! GCRA rate limiting: limits, the decision script and the limiter API.

pub mod gcra;
mod limit;
mod limiter;
mod result;
mod rules;
mod script;

pub use limit::{Limit, TimeWindow};
pub use limiter::{validate, Limiter};
pub use result::RateLimitResult;
pub use rules::{LimitRule, LimitRules, TimeUnit};
pub use script::{Script, GCRA_EPOCH_UNIX_SECS, SENTINEL};
