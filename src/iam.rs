//! AWS IAM roles, policies and OIDC identity providers.

pub mod oidc;
pub mod role;
pub mod thumbprint;
