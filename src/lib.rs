pub mod accounts;
pub mod app;
pub mod caller_config;
pub mod claude;
pub mod config;
pub mod convert;
pub mod error;
pub mod relay;
pub mod scheduler;
pub mod session;
pub mod sse;
pub mod store;
pub mod upstream;
pub mod usage;
