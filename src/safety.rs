//! URL safety gate (SSRF prevention)
//!
//! Every outbound target (HTTP or websocket) passes through
//! [`verify`] before any connection is opened. Localhost, loopback
//! and private-range addresses are rejected unless the "allow local
//! targets" override is set; a fixed hostname blocklist is rejected
//! regardless of the override.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use url::Url;

use crate::config::SafetyConfig;
use crate::error::RunnerError;

/// Hostnames that are never fetched, override or not.
const HOSTNAME_BLOCKLIST: &[&str] = &["ftx.us", "ftx.com"];

/// Validate an outbound target. Returns the parsed URL on success so
/// callers never re-parse (and never fetch an unverified string).
pub fn verify(raw: &str, cfg: &SafetyConfig) -> Result<Url, RunnerError> {
    let parsed = Url::parse(raw).map_err(|e| RunnerError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;

    match parsed.scheme() {
        "http" | "https" | "ws" | "wss" => {}
        scheme => {
            return Err(RunnerError::InvalidUrl {
                url: raw.to_string(),
                reason: format!("scheme '{}' not allowed", scheme),
            })
        }
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| RunnerError::InvalidUrl {
            url: raw.to_string(),
            reason: "URL has no host".to_string(),
        })?
        .to_ascii_lowercase();

    // Blocklist applies unconditionally.
    if HOSTNAME_BLOCKLIST
        .iter()
        .any(|blocked| host == *blocked || host.ends_with(&format!(".{}", blocked)))
    {
        return Err(RunnerError::HostnameDisabled {
            host,
            reason: "hostname is blocklisted".to_string(),
        });
    }

    if cfg.allow_local_targets {
        return Ok(parsed);
    }

    // Encoding tricks in the hostname (hex/percent forms).
    if host.contains('%') || host.contains("0x") {
        return Err(RunnerError::HostnameDisabled {
            host,
            reason: "encoded hostname not allowed".to_string(),
        });
    }

    if host == "localhost" || host.ends_with(".localhost") || host.ends_with(".localdomain") {
        return Err(RunnerError::HostnameDisabled {
            host,
            reason: "localhost not allowed".to_string(),
        });
    }

    match parsed.host() {
        Some(url::Host::Ipv4(ip)) => reject_private(&host, IpAddr::V4(ip))?,
        Some(url::Host::Ipv6(ip)) => reject_private(&host, IpAddr::V6(ip))?,
        Some(url::Host::Domain(domain)) => {
            // Unusual literal forms (integer IPs) parse as domains.
            if let Ok(ip) = domain.parse::<IpAddr>() {
                reject_private(&host, ip)?;
            }
        }
        None => {}
    }

    Ok(parsed)
}

fn reject_private(host: &str, ip: IpAddr) -> Result<(), RunnerError> {
    if is_private_ip(&ip) {
        return Err(RunnerError::HostnameDisabled {
            host: host.to_string(),
            reason: format!("private address {} not allowed", ip),
        });
    }
    Ok(())
}

fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ipv4) => {
            let octets = ipv4.octets();
            // 10.0.0.0/8
            octets[0] == 10
                // 172.16.0.0/12
                || (octets[0] == 172 && (16..=31).contains(&octets[1]))
                // 192.168.0.0/16
                || (octets[0] == 192 && octets[1] == 168)
                // 127.0.0.0/8 (loopback)
                || octets[0] == 127
                // 169.254.0.0/16 (link-local, cloud metadata)
                || (octets[0] == 169 && octets[1] == 254)
                // 0.0.0.0
                || octets == [0, 0, 0, 0]
        }
        IpAddr::V6(ipv6) => {
            let octets = ipv6.octets();
            ipv6.is_loopback()
                || ipv6.is_unspecified()
                // fc00::/7 (unique local)
                || (octets[0] & 0xfe) == 0xfc
                // fe80::/10 (link-local)
                || (octets[0] == 0xfe && (octets[1] & 0xc0) == 0x80)
                // fec0::/10 (site-local, deprecated)
                || (octets[0] == 0xfe && (octets[1] & 0xc0) == 0xc0)
                || is_ipv4_mapped_private(ipv6)
        }
    }
}

/// ::ffff:x.x.x.x with a private embedded IPv4.
fn is_ipv4_mapped_private(ipv6: &Ipv6Addr) -> bool {
    let octets = ipv6.octets();
    if octets[..10] == [0; 10] && octets[10] == 0xff && octets[11] == 0xff {
        let ipv4 = Ipv4Addr::new(octets[12], octets[13], octets[14], octets[15]);
        return is_private_ip(&IpAddr::V4(ipv4));
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strict() -> SafetyConfig {
        SafetyConfig::default()
    }

    fn permissive() -> SafetyConfig {
        SafetyConfig::default().with_allow_local_targets(true)
    }

    #[test]
    fn localhost_gated_by_override() {
        let err = verify("http://localhost:8080", &strict()).unwrap_err();
        assert!(matches!(err, RunnerError::HostnameDisabled { .. }));

        let ok = verify("http://localhost:8080", &permissive()).unwrap();
        assert_eq!(ok.host_str(), Some("localhost"));
    }

    #[test]
    fn private_ranges_gated_by_override() {
        for url in [
            "http://10.10.10.10:8080",
            "http://192.168.1.1",
            "http://172.20.0.5",
            "http://127.0.0.1:9000",
            "http://169.254.169.254/latest/meta-data",
        ] {
            let err = verify(url, &strict()).unwrap_err();
            assert!(
                matches!(err, RunnerError::HostnameDisabled { .. }),
                "{} should be blocked",
                url
            );
            assert!(verify(url, &permissive()).is_ok(), "{} under override", url);
        }
    }

    #[test]
    fn blocklist_ignores_override() {
        for cfg in [strict(), permissive()] {
            let err = verify("http://ftx.us", &cfg).unwrap_err();
            assert!(matches!(err, RunnerError::HostnameDisabled { .. }));

            let err = verify("https://api.ftx.com/markets", &cfg).unwrap_err();
            assert!(matches!(err, RunnerError::HostnameDisabled { .. }));
        }
    }

    #[test]
    fn public_hosts_pass() {
        let url = verify("https://api.example.com/price?x=1", &strict()).unwrap();
        assert_eq!(url.host_str(), Some("api.example.com"));

        assert!(verify("wss://stream.example.com/ws", &strict()).is_ok());
    }

    #[test]
    fn non_http_schemes_rejected() {
        assert!(verify("file:///etc/passwd", &strict()).is_err());
        assert!(verify("gopher://example.com", &strict()).is_err());
    }

    #[test]
    fn ipv6_private_forms_rejected() {
        for url in [
            "http://[::1]:8080",
            "http://[fc00::1]",
            "http://[fe80::1]",
            "http://[::ffff:10.0.0.1]",
        ] {
            assert!(verify(url, &strict()).is_err(), "{} should be blocked", url);
        }
    }
}
