//! Adapters between CRD specs, Kubernetes secrets and the worker transport

mod s3;
mod secrets;
mod ssh;
mod transport_config;

pub use s3::*;
pub use secrets::*;
pub use ssh::*;
pub use transport_config::*;
