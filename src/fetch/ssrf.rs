//! Outbound request guard
//!
//! Blocks page fetches aimed at internal infrastructure:
//! - IPv4 private ranges: 10.0.0.0/8, 172.16.0.0/12, 192.168.0.0/16
//! - IPv4 link-local 169.254.0.0/16, loopback 127.0.0.0/8, CGNAT 100.64.0.0/10
//! - IPv6 ULA fc00::/7, link-local fe80::/10, loopback ::1, IPv4-mapped private
//! - Multicast, reserved and documentation ranges
//! - Cloud metadata endpoints (169.254.169.254, fd00:ec2::254, *.internal)
//!
//! URL checks alone do not stop DNS rebinding. Callers must also resolve the
//! host, run [`SsrfGuard::validate_resolved_ip`] on every address, and pin the
//! connection to a validated address.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use thiserror::Error;
use url::{Host, Url};

/// Guard errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SsrfError {
    #[error("blocked request to {0}")]
    Blocked(String),

    #[error("protocol not allowed: {0} (only http/https allowed)")]
    ProtocolNotAllowed(String),

    #[error("URL has no host")]
    MissingHost,
}

/// Guard configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct SsrfConfig {
    /// Skip every check. Only for tests and trusted local deployments that
    /// need to fetch from loopback or LAN hosts.
    pub allow_private_networks: bool,
}

/// Stateless validator for outbound targets
pub struct SsrfGuard;

impl SsrfGuard {
    /// Validate the literal URL (scheme, host name, literal IP).
    pub fn validate_url(url: &Url, config: &SsrfConfig) -> Result<(), SsrfError> {
        match url.scheme() {
            "http" | "https" => {}
            scheme => return Err(SsrfError::ProtocolNotAllowed(scheme.to_string())),
        }

        if config.allow_private_networks {
            return Ok(());
        }

        match url.host().ok_or(SsrfError::MissingHost)? {
            Host::Domain(domain) => {
                if is_localhost_name(domain) {
                    return Err(SsrfError::Blocked(format!("localhost address: {}", domain)));
                }
                if is_metadata_name(domain) {
                    return Err(SsrfError::Blocked(format!(
                        "cloud metadata endpoint: {}",
                        domain
                    )));
                }
            }
            Host::Ipv4(ip) => {
                if is_private_ipv4(&ip) {
                    return Err(SsrfError::Blocked(format!("private IP address: {}", ip)));
                }
            }
            Host::Ipv6(ip) => {
                if is_private_ipv6(&ip) {
                    return Err(SsrfError::Blocked(format!("private IP address: {}", ip)));
                }
            }
        }

        Ok(())
    }

    /// Validate one address the host resolved to.
    pub fn validate_resolved_ip(
        ip: &IpAddr,
        original_host: &str,
        config: &SsrfConfig,
    ) -> Result<(), SsrfError> {
        if config.allow_private_networks {
            return Ok(());
        }
        if is_private_ip(ip) {
            return Err(SsrfError::Blocked(format!(
                "DNS {} resolved to private IP: {}",
                original_host, ip
            )));
        }
        Ok(())
    }
}

fn is_localhost_name(host: &str) -> bool {
    let host = host.to_ascii_lowercase();
    host == "localhost" || host == "localhost.localdomain" || host.ends_with(".localhost")
}

fn is_metadata_name(host: &str) -> bool {
    let host = host.to_ascii_lowercase();
    host == "metadata"
        || host == "instance-data"
        || host == "metadata.google.internal"
        || host.ends_with(".internal")
}

/// Check if an IP address is private/internal
pub fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ipv4) => is_private_ipv4(ipv4),
        IpAddr::V6(ipv6) => is_private_ipv6(ipv6),
    }
}

fn is_private_ipv4(ip: &Ipv4Addr) -> bool {
    let octets = ip.octets();

    // 10.0.0.0/8, 172.16.0.0/12, 192.168.0.0/16
    if octets[0] == 10
        || (octets[0] == 172 && (16..=31).contains(&octets[1]))
        || (octets[0] == 192 && octets[1] == 168)
    {
        return true;
    }

    // Loopback, link-local (includes 169.254.169.254), "this" network
    if octets[0] == 127 || (octets[0] == 169 && octets[1] == 254) || octets[0] == 0 {
        return true;
    }

    // 100.64.0.0/10 - Carrier-grade NAT
    if octets[0] == 100 && (64..=127).contains(&octets[1]) {
        return true;
    }

    // 192.0.0.0/24, 192.0.2.0/24, 198.51.100.0/24, 203.0.113.0/24
    if (octets[0] == 192 && octets[1] == 0 && (octets[2] == 0 || octets[2] == 2))
        || (octets[0] == 198 && octets[1] == 51 && octets[2] == 100)
        || (octets[0] == 203 && octets[1] == 0 && octets[2] == 113)
    {
        return true;
    }

    // Multicast and reserved (224.0.0.0/4, 240.0.0.0/4)
    octets[0] >= 224
}

fn is_private_ipv6(ip: &Ipv6Addr) -> bool {
    let segments = ip.segments();

    if *ip == Ipv6Addr::LOCALHOST || *ip == Ipv6Addr::UNSPECIFIED {
        return true;
    }

    // fc00::/7 (ULA, includes fd00:ec2::254)
    if (segments[0] & 0xfe00) == 0xfc00 {
        return true;
    }

    // fe80::/10 link-local, ff00::/8 multicast
    if (segments[0] & 0xffc0) == 0xfe80 || (segments[0] & 0xff00) == 0xff00 {
        return true;
    }

    // ::ffff:0:0/96 - judge the embedded IPv4 address
    if let Some(ipv4) = ip.to_ipv4_mapped() {
        return is_private_ipv4(&ipv4);
    }

    // 2001:db8::/32 - Documentation
    segments[0] == 0x2001 && segments[1] == 0x0db8
}
