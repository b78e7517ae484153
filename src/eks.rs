//! AWS EKS control plane, node group and add-on operations.

pub mod addon;
pub mod client;
pub mod nodegroup;
pub mod version;

pub use client::EksClient;
