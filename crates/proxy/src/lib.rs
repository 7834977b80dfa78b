pub mod config;
pub mod credentials;
pub mod engine;
pub mod headers;
pub mod http;
pub mod identity;
pub mod locks;
pub mod metrics;
pub mod partition;
pub mod rate_limit;
