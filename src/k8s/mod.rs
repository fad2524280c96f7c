//! Kubernetes API client module
//!
//! Namespace management for the per-run cluster bindings.

mod client;

pub use client::K8sClient;
