//! Default values for configuration fields.

use std::net::{IpAddr, Ipv4Addr};

pub fn bind() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

pub fn port() -> u16 {
    64738
}

pub fn bandwidth() -> u32 {
    72_000
}

pub fn timeout() -> u32 {
    30
}

pub fn max_users() -> u32 {
    100
}
