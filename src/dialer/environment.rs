//! Proxy selection from environment-style settings.
//!
//! # Responsibilities
//! - Capture HTTP_PROXY / HTTPS_PROXY / NO_PROXY (and lower-case forms)
//! - Pick the proxy for a target URL, honoring NO_PROXY exclusions
//!
//! Values are read once into a plain struct so callers (and tests) can
//! supply a fixed environment instead of the live process one.

use std::net::IpAddr;

use ipnet::IpNet;
use url::{Host, Url};

use super::ProxyError;

/// A snapshot of proxy-related environment settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyEnvironment {
    pub http_proxy: String,
    pub https_proxy: String,
    pub no_proxy: String,
    /// Running as a CGI handler; `HTTP_PROXY` may be attacker controlled and is ignored.
    pub cgi: bool,
}

impl ProxyEnvironment {
    /// Read the current process environment.
    pub fn from_env() -> Self {
        Self {
            http_proxy: first_env(&["HTTP_PROXY", "http_proxy"]),
            https_proxy: first_env(&["HTTPS_PROXY", "https_proxy"]),
            no_proxy: first_env(&["NO_PROXY", "no_proxy"]),
            cgi: std::env::var_os("REQUEST_METHOD").is_some_and(|v| !v.is_empty()),
        }
    }

    /// Proxy URL to use for `target`, or `None` for a direct connection.
    pub fn proxy_for(&self, target: &Url) -> Result<Option<Url>, ProxyError> {
        let raw = match target.scheme() {
            "https" => self.https_proxy.as_str(),
            "http" if !self.cgi => self.http_proxy.as_str(),
            _ => return Ok(None),
        };
        if raw.is_empty() {
            return Ok(None);
        }

        let proxy = parse_proxy(raw)?;

        let Some(host) = target.host() else {
            return Ok(Some(proxy));
        };
        let port = target.port_or_known_default();
        if !self.use_proxy(&host, port) {
            return Ok(None);
        }
        Ok(Some(proxy))
    }

    fn use_proxy(&self, host: &Host<&str>, port: Option<u16>) -> bool {
        let (name, ip) = match host {
            Host::Domain(d) => (d.to_ascii_lowercase(), None),
            Host::Ipv4(v4) => (v4.to_string(), Some(IpAddr::V4(*v4))),
            Host::Ipv6(v6) => (v6.to_string(), Some(IpAddr::V6(*v6))),
        };

        if name == "localhost" {
            return false;
        }
        if ip.is_some_and(|ip| ip.is_loopback()) {
            return false;
        }

        !NoProxy::parse(&self.no_proxy).matches(&name, ip, port)
    }
}

fn first_env(keys: &[&str]) -> String {
    keys.iter()
        .find_map(|k| std::env::var(k).ok().filter(|v| !v.is_empty()))
        .unwrap_or_default()
}

/// Parse a proxy setting, assuming `http://` when no usable scheme is given.
fn parse_proxy(raw: &str) -> Result<Url, ProxyError> {
    match Url::parse(raw) {
        Ok(url) if url.has_host() => Ok(url),
        _ => Url::parse(&format!("http://{raw}"))
            .ok()
            .filter(|u| u.has_host())
            .ok_or_else(|| ProxyError::InvalidProxyUrl(raw.to_string())),
    }
}

/// Parsed NO_PROXY exclusion list.
#[derive(Debug, Default)]
struct NoProxy {
    all: bool,
    networks: Vec<IpNet>,
    ips: Vec<(IpAddr, Option<u16>)>,
    domains: Vec<DomainMatch>,
}

#[derive(Debug)]
struct DomainMatch {
    /// Always starts with '.'.
    suffix: String,
    port: Option<u16>,
    /// Also match the bare domain, not only subdomains.
    match_host: bool,
}

impl NoProxy {
    fn parse(list: &str) -> Self {
        let mut out = Self::default();

        for entry in list.split(',') {
            let entry = entry.trim().to_ascii_lowercase();
            if entry.is_empty() {
                continue;
            }
            if entry == "*" {
                out.all = true;
                return out;
            }
            if let Ok(net) = entry.parse::<IpNet>() {
                out.networks.push(net);
                continue;
            }

            let (host, port) = split_host_port(&entry);
            if let Ok(ip) = host.trim_matches(|c: char| c == '[' || c == ']').parse::<IpAddr>() {
                out.ips.push((ip, port));
                continue;
            }
            if host.is_empty() {
                continue;
            }

            let host = host.strip_prefix('*').unwrap_or(host);
            let (suffix, match_host) = match host.strip_prefix('.') {
                Some(_) => (host.to_string(), false),
                None => (format!(".{host}"), true),
            };
            out.domains.push(DomainMatch {
                suffix,
                port,
                match_host,
            });
        }

        out
    }

    fn matches(&self, host: &str, ip: Option<IpAddr>, port: Option<u16>) -> bool {
        if self.all {
            return true;
        }

        if let Some(ip) = ip {
            if self.networks.iter().any(|n| n.contains(&ip)) {
                return true;
            }
            if self
                .ips
                .iter()
                .any(|(candidate, p)| *candidate == ip && port_matches(*p, port))
            {
                return true;
            }
        }

        self.domains.iter().any(|d| {
            let hit = host.ends_with(&d.suffix) || (d.match_host && host == &d.suffix[1..]);
            hit && port_matches(d.port, port)
        })
    }
}

fn port_matches(wanted: Option<u16>, actual: Option<u16>) -> bool {
    wanted.is_none() || wanted == actual
}

fn split_host_port(entry: &str) -> (&str, Option<u16>) {
    // Bracketed IPv6, optionally with a port.
    if entry.starts_with('[') {
        if let Some(end) = entry.find(']') {
            let port = entry[end + 1..]
                .strip_prefix(':')
                .and_then(|p| p.parse().ok());
            return (&entry[..=end], port);
        }
    }
    match entry.rsplit_once(':') {
        // A bare IPv6 literal has several colons and no port.
        Some((host, port)) if !host.contains(':') => match port.parse() {
            Ok(port) => (host, Some(port)),
            Err(_) => (entry, None),
        },
        _ => (entry, None),
    }
}
