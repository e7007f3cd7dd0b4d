//! IPv4 network arithmetic for pool creation and guest NIC configuration.

use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;

use crate::error::{Error, Result};

/// Smallest prefix a pool may use; bounds the size of the bulk insert.
pub const MIN_POOL_PREFIX: u8 = 16;

pub fn parse_ipv4(field: &str, value: &str) -> Result<Ipv4Addr> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::validation(format!("{field}: '{value}' is not a valid IPv4 address")))
}

/// Prefix length of a dotted-quad subnet mask. Rejects non-contiguous masks.
pub fn prefix_len(mask: &str) -> Result<u8> {
    let mask = parse_ipv4("subnet_mask", mask)?;
    ipnetwork::ipv4_mask_to_prefix(mask)
        .map_err(|_| Error::validation(format!("subnet_mask: {mask} is not a contiguous mask")))
}

/// Dotted-quad subnet mask for a prefix length.
pub fn subnet_mask(prefix: u8) -> Result<Ipv4Addr> {
    Ipv4Network::new(Ipv4Addr::UNSPECIFIED, prefix)
        .map(|net| net.mask())
        .map_err(|_| Error::validation(format!("prefix length {prefix} is out of range")))
}

/// Parse `network` given as `a.b.c.d/len`, `a.b.c.d/mask`, or a bare
/// address combined with `mask`. When both carry a mask they must agree.
/// Host bits are masked off, so `192.168.2.5/24` yields `192.168.2.0/24`.
pub fn parse_network(network: &str, mask: Option<&str>) -> Result<Ipv4Network> {
    let (addr, suffix) = match network.trim().split_once('/') {
        Some((addr, suffix)) => (addr, Some(suffix)),
        None => (network.trim(), None),
    };
    let addr = parse_ipv4("network", addr)?;

    let from_suffix = suffix
        .map(|s| match s.parse::<u8>() {
            Ok(len) if len <= 32 => Ok(len),
            Ok(len) => Err(Error::validation(format!("network: prefix length {len} is out of range"))),
            Err(_) => prefix_len(s),
        })
        .transpose()?;
    let from_mask = mask.map(prefix_len).transpose()?;

    let prefix = match (from_suffix, from_mask) {
        (Some(a), Some(b)) if a != b => {
            return Err(Error::validation(format!(
                "network /{a} disagrees with subnet mask /{b}"
            )));
        }
        (Some(p), _) | (None, Some(p)) => p,
        (None, None) => {
            return Err(Error::validation("network: no prefix length or subnet mask given"));
        }
    };

    let net = Ipv4Network::new(addr, prefix)
        .map_err(|e| Error::validation(format!("network: {e}")))?;
    if net.network() == addr {
        return Ok(net);
    }
    tracing::debug!(%addr, prefix, network = %net.network(), "masking host bits off network");
    Ipv4Network::new(net.network(), prefix).map_err(|e| Error::validation(format!("network: {e}")))
}

/// Assignable host addresses: everything except the network and broadcast
/// addresses, except on /31 and /32 where every address is a host.
pub fn usable_hosts(net: Ipv4Network) -> impl Iterator<Item = Ipv4Addr> {
    let first = u32::from(net.network());
    let last = u32::from(net.broadcast());
    let (start, end) = if net.prefix() >= 31 {
        (first, last)
    } else {
        (first + 1, last - 1)
    };
    (start..=end).map(Ipv4Addr::from)
}

/// `xx:xx:xx:xx:xx:xx` or `xx-xx-xx-xx-xx-xx`, hex digits, one separator style.
pub fn validate_mac(mac: &str) -> Result<()> {
    let sep = if mac.contains(':') { ':' } else { '-' };
    let octets: Vec<&str> = mac.split(sep).collect();
    let valid = octets.len() == 6
        && octets
            .iter()
            .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()));
    if valid {
        Ok(())
    } else {
        Err(Error::validation(format!("mac_address: '{mac}' is not a valid MAC address")))
    }
}
