/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::config::InboxConfig;
use crate::error::InboxError;
use http::Uri;
use serde_json::Value;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Activity fields whose string values are dereferenceable URIs.
pub const LINK_FIELDS: &[&str] = &[
    "actor",
    "object",
    "id",
    "url",
    "target",
    "origin",
    "attributedTo",
    "inReplyTo",
    "href",
];

#[derive(Debug, Clone)]
pub struct UriPolicy {
    allowed_schemes: HashSet<String>,
    blocked_ports: HashSet<u16>,
    blocked_hosts: Vec<String>,
    max_length: usize,
}

impl UriPolicy {
    pub fn from_config(cfg: &InboxConfig) -> Self {
        Self {
            allowed_schemes: cfg
                .uri_allowed_schemes
                .iter()
                .map(|s| s.trim().to_ascii_lowercase())
                .collect(),
            blocked_ports: cfg.uri_blocked_ports.iter().copied().collect(),
            blocked_hosts: cfg
                .uri_blocked_hosts
                .iter()
                .map(|h| normalize_host(h))
                .filter(|h| !h.is_empty())
                .collect(),
            max_length: cfg.max_uri_length,
        }
    }

    pub fn check_uri(&self, raw: &str) -> Result<(), InboxError> {
        let fail = |reason: &str| InboxError::UnsafeUri {
            uri: truncate(raw, 256),
            reason: reason.to_string(),
        };

        if raw.len() > self.max_length {
            return Err(fail("uri too long"));
        }
        let uri: Uri = raw.parse().map_err(|_| fail("unparseable uri"))?;
        let scheme = uri
            .scheme_str()
            .map(|s| s.to_ascii_lowercase())
            .ok_or_else(|| fail("missing scheme"))?;
        if !self.allowed_schemes.contains(&scheme) {
            return Err(fail("scheme not allowed"));
        }
        let authority = uri.authority().ok_or_else(|| fail("missing host"))?;
        if authority.as_str().contains('@') {
            return Err(fail("userinfo not allowed"));
        }
        let host = normalize_host(authority.host());
        if host.is_empty() {
            return Err(fail("missing host"));
        }

        let port = match uri.port_u16() {
            Some(p) => Some(p),
            None => default_port(&scheme),
        };
        if let Some(p) = port {
            if self.blocked_ports.contains(&p) {
                return Err(fail("port blocked"));
            }
        }

        if self.blocked_hosts.iter().any(|p| domain_matches(&host, p)) {
            return Err(fail("host blocked"));
        }
        match host.parse::<IpAddr>() {
            Ok(ip) => {
                if is_forbidden_ip(ip) {
                    return Err(fail("address range not allowed"));
                }
            }
            Err(_) => {
                if looks_numeric(&host) {
                    return Err(fail("non-canonical numeric host"));
                }
            }
        }
        Ok(())
    }

    /// Checks every link-field string in the activity, including nested objects
    /// and arrays. `@context` is skipped.
    pub fn check_activity(&self, activity: &Value) -> Result<(), InboxError> {
        let mut stack: Vec<(&Value, bool)> = vec![(activity, false)];
        while let Some((v, is_link)) = stack.pop() {
            match v {
                Value::String(s) if is_link => self.check_uri(s)?,
                Value::Array(items) => stack.extend(items.iter().map(|i| (i, is_link))),
                Value::Object(map) => {
                    for (k, child) in map {
                        if k == "@context" {
                            continue;
                        }
                        stack.push((child, LINK_FIELDS.contains(&k.as_str())));
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}

pub fn host_from_url(url: &str) -> Option<String> {
    let uri: Uri = url.parse().ok()?;
    uri.host().map(normalize_host).filter(|h| !h.is_empty())
}

pub(crate) fn normalize_host(host: &str) -> String {
    host.trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_ascii_lowercase()
}

/// Exact match, or `*.example.com` / `.example.com` for the domain and its subdomains.
pub(crate) fn domain_matches(host: &str, pattern: &str) -> bool {
    let host = host.trim().trim_end_matches('.').to_ascii_lowercase();
    let p = pattern.trim().trim_end_matches('.').to_ascii_lowercase();
    if p.is_empty() {
        return false;
    }
    if let Some(suffix) = p.strip_prefix("*.") {
        return host == suffix || host.ends_with(&format!(".{suffix}"));
    }
    if let Some(suffix) = p.strip_prefix('.') {
        return host == suffix || host.ends_with(&format!(".{suffix}"));
    }
    host == p
}

fn default_port(scheme: &str) -> Option<u16> {
    match scheme {
        "http" | "ws" => Some(80),
        "https" | "wss" => Some(443),
        _ => None,
    }
}

fn is_forbidden_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_forbidden_v4(v4),
        IpAddr::V6(v6) => is_forbidden_v6(v6),
    }
}

fn is_forbidden_v4(ip: Ipv4Addr) -> bool {
    let o = ip.octets();
    ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || ip.is_multicast()
        || o[0] == 0
        // 100.64.0.0/10 carrier-grade NAT
        || (o[0] == 100 && (o[1] & 0xc0) == 64)
}

fn is_forbidden_v6(ip: Ipv6Addr) -> bool {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_forbidden_v4(v4);
    }
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        || ip.is_multicast()
        || (first & 0xfe00) == 0xfc00
        || (first & 0xffc0) == 0xfe80
}

/// Hosts like `2130706433`, `0x7f.1` or `127.1` that resolvers may read as IPv4.
fn looks_numeric(host: &str) -> bool {
    let last = host.rsplit('.').next().unwrap_or(host);
    if last.is_empty() {
        return false;
    }
    last.bytes().all(|b| b.is_ascii_digit()) || last.starts_with("0x")
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}
