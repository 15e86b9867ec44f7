pub mod config;
pub mod config_validator;
pub mod error;
pub mod handlers;
pub mod health;
pub mod key_generator;
pub mod limiter;
pub mod metrics;
pub mod middleware;
pub mod redis;
pub mod response;
pub mod rules;
pub mod server;

pub use config::{FailurePolicy, Settings};
pub use error::{Error, Result};
pub use limiter::{Decision, RateLimiter};
pub use rules::{Rule, RuleSet};
pub use server::{build_router, build_state, Server};
