//! AWS backend: SDK clients, EKS bearer tokens and the cloud capability implementation.

pub mod client;
pub mod cloud;
pub mod token;

pub use client::AwsClients;
pub use cloud::AwsConnector;
