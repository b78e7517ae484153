//! IPv4 CIDR arithmetic for VPC and subnet blocks.

use std::fmt;
use std::net::Ipv4Addr;

use rand::Rng;

use crate::error::DpoError;

/// Prefix length of every subnet carved out of the VPC block.
pub const SUBNET_PREFIX: u8 = 20;

/// An IPv4 network block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Block {
    base: u32,
    prefix: u8,
}

impl Ipv4Block {
    /// Parse `a.b.c.d/p`. Host bits are masked off.
    pub fn parse(cidr: &str) -> Result<Self, DpoError> {
        let invalid = || DpoError::InvalidSpec(format!("invalid IPv4 CIDR: {cidr}"));

        let (addr, prefix) = cidr.split_once('/').ok_or_else(invalid)?;
        let addr: Ipv4Addr = addr.parse().map_err(|_| invalid())?;
        let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
        if prefix > 32 {
            return Err(invalid());
        }

        Ok(Self {
            base: u32::from(addr) & Self::mask(prefix),
            prefix,
        })
    }

    /// A 10.x.0.0/16 block with `x` drawn from [0, 254).
    pub fn random_private() -> Self {
        let octet: u8 = rand::thread_rng().gen_range(0..254);
        Self::private_with_octet(octet)
    }

    pub fn private_with_octet(octet: u8) -> Self {
        Self {
            base: u32::from(Ipv4Addr::new(10, octet, 0, 0)),
            prefix: 16,
        }
    }

    pub const fn prefix(&self) -> u8 {
        self.prefix
    }

    /// The `index`-th /20 slice of this block, or `None` when it does not fit.
    pub fn subnet(&self, index: usize) -> Option<Self> {
        if self.prefix > SUBNET_PREFIX {
            return None;
        }
        let slices = 1u64 << (SUBNET_PREFIX - self.prefix);
        if index as u64 >= slices {
            return None;
        }
        let step = 1u32 << (32 - SUBNET_PREFIX);
        let offset = u32::try_from(index).ok()?.checked_mul(step)?;
        Some(Self {
            base: self.base + offset,
            prefix: SUBNET_PREFIX,
        })
    }

    const fn mask(prefix: u8) -> u32 {
        if prefix == 0 {
            0
        } else {
            u32::MAX << (32 - prefix)
        }
    }
}

impl fmt::Display for Ipv4Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", Ipv4Addr::from(self.base), self.prefix)
    }
}
