//! Infrastructure - configuration, metrics, logging, and shutdown
//!
//! This module contains infrastructure concerns:
//! - `config` - Application configuration (TOML loading, env overrides, defaults)
//! - `metrics` - Lock-free metrics collection
//! - `logging` - Tracing subscriber setup and the backend log layer
//! - `shutdown` - Process-wide shutdown signal

pub mod config;
pub mod logging;
pub mod metrics;
pub mod shutdown;

// Re-export commonly used types
pub use config::Config;
pub use logging::{init_tracing, BackendLogLayer, LogRecord};
pub use metrics::Metrics;
pub use shutdown::Shutdown;
