/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use bytes::Bytes;
use http::{HeaderMap, Method, Uri};
use std::net::{IpAddr, SocketAddr};

/// An inbox POST as received from the network, with the body fully read.
#[derive(Debug, Clone)]
pub struct InboundHttpRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub remote_addr: Option<String>,
    pub body: Bytes,
    /// Unix millis at arrival, before the body was read.
    pub received_at_ms: i64,
}

impl InboundHttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.header("user-agent")
    }

    /// Declared length, informational only.
    pub fn declared_content_length(&self) -> Option<u64> {
        self.header("content-length").and_then(|v| v.trim().parse().ok())
    }

    /// Headers in arrival order; values that are not visible ASCII are lossily decoded.
    pub fn headers_vec(&self) -> Vec<(String, String)> {
        self.headers
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_string(),
                    String::from_utf8_lossy(v.as_bytes()).into_owned(),
                )
            })
            .collect()
    }
}

/// Client address, honouring proxy headers only when configured to.
pub fn client_ip(trust_proxy_headers: bool, peer: Option<&SocketAddr>, headers: &HeaderMap) -> Option<String> {
    if trust_proxy_headers {
        if let Some(ip) = headers
            .get("X-Real-IP")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_ip_str)
        {
            return Some(ip);
        }
        if let Some(v) = headers.get("X-Forwarded-For").and_then(|v| v.to_str().ok()) {
            if let Some(ip) = v.split(',').map(|s| s.trim()).find_map(parse_ip_str) {
                return Some(ip);
            }
        }
    }
    peer.map(|p| p.ip().to_string())
}

fn parse_ip_str(s: &str) -> Option<String> {
    s.trim().parse::<IpAddr>().ok().map(|ip| ip.to_string())
}
