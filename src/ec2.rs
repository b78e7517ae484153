//! AWS EC2 network operations and CIDR planning.

pub mod cidr;
pub mod network;

pub use cidr::Ipv4Block;
