//! Observability — in-process metrics for the invoker

pub mod metrics;
