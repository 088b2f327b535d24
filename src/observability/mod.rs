//! Observability: structured logging setup and registry metrics

pub mod logging;
pub mod metrics;

pub use logging::{init_default_logging, init_logging, LogFormat};
pub use metrics::{MetricsSnapshot, RegistryMetrics};

// Span macros for structured logging
pub use logging::{engine_span, session_span};
