//! Initial pool and port provisioning

use std::net::{IpAddr, Ipv4Addr};

use crate::model::{PoolAddress, Port};
use crate::{Error, Result};

/// First address of the default pool
pub const DEFAULT_POOL_START: Ipv4Addr = Ipv4Addr::new(100, 64, 0, 2);

/// Last address of the default pool
pub const DEFAULT_POOL_END: Ipv4Addr = Ipv4Addr::new(100, 64, 2, 199);

pub const DEFAULT_PORT_BASE: u16 = 1000;

pub const DEFAULT_PORT_COUNT: u16 = 128;

/// Every address from `start` to `end`, inclusive
pub fn address_range(start: Ipv4Addr, end: Ipv4Addr) -> Result<Vec<PoolAddress>> {
    let (first, last) = (u32::from(start), u32::from(end));
    if first > last {
        return Err(Error::invalid_input(format!(
            "address range start {} is after end {}",
            start, end
        )));
    }

    Ok((first..=last)
        .map(|n| PoolAddress::new(IpAddr::V4(Ipv4Addr::from(n))))
        .collect())
}

/// `count` unowned, unbound ports starting at `base`, already expired
pub fn port_range(base: u16, count: u16, host: &str) -> Result<Vec<Port>> {
    if base == 0 {
        return Err(Error::invalid_input("port 0 cannot be provisioned"));
    }
    let last = u32::from(base) + u32::from(count);
    if count == 0 || last - 1 > u32::from(u16::MAX) {
        return Err(Error::invalid_input(format!(
            "port range {}+{} does not fit in 1..=65535",
            base, count
        )));
    }

    Ok((0..count).map(|i| Port::new(base + i, host)).collect())
}
