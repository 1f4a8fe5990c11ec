/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use http::{HeaderMap, Method, Uri};
use httpdate::parse_http_date;
use rsa::{pkcs1v15::VerifyingKey, pkcs8::DecodePublicKey, signature::Verifier, RsaPublicKey};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::RwLock;

const KEY_CACHE_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedKey {
    pub key_id: String,
    /// Actor URI the key belongs to.
    pub owner: String,
    pub public_key_pem: String,
}

/// Looks up the public key named by a signature `keyId`. `Ok(None)` means the
/// key does not exist; `Err` means the lookup itself failed.
#[async_trait]
pub trait KeyResolve: Send + Sync {
    async fn resolve_public_key(&self, key_id: &str) -> Result<Option<ResolvedKey>>;
}

/// Fetches the actor document over HTTP and caches its key.
#[derive(Clone)]
pub struct HttpKeyResolver {
    client: reqwest::Client,
    cache: Arc<RwLock<HashMap<String, CachedKey>>>,
}

#[derive(Clone)]
struct CachedKey {
    key: ResolvedKey,
    expires_at: std::time::Instant,
}

impl HttpKeyResolver {
    pub fn new(timeout: Duration) -> Result<Self> {
        // redirect targets never pass through the URI checks
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(concat!("fedigate/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("build key fetch client")?;
        Ok(Self {
            client,
            cache: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    async fn get_cached(&self, actor_url: &str) -> Option<ResolvedKey> {
        let mut cache = self.cache.write().await;
        let now = std::time::Instant::now();
        if let Some(v) = cache.get(actor_url) {
            if v.expires_at > now {
                return Some(v.key.clone());
            }
        }
        cache.remove(actor_url);
        None
    }

    async fn put_cached(&self, actor_url: &str, key: ResolvedKey) {
        let mut cache = self.cache.write().await;
        cache.insert(
            actor_url.to_string(),
            CachedKey {
                key,
                expires_at: std::time::Instant::now() + KEY_CACHE_TTL,
            },
        );
    }
}

#[async_trait]
impl KeyResolve for HttpKeyResolver {
    async fn resolve_public_key(&self, key_id: &str) -> Result<Option<ResolvedKey>> {
        let actor_url = match key_id.split_once('#') {
            Some((actor, _frag)) => actor.to_string(),
            None => key_id.to_string(),
        };

        if let Some(hit) = self.get_cached(&actor_url).await {
            if hit.key_id == key_id || !key_id.contains('#') {
                return Ok(Some(hit));
            }
        }

        let resp = self
            .client
            .get(&actor_url)
            .header(
                "Accept",
                "application/activity+json, application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"",
            )
            .send()
            .await
            .with_context(|| format!("fetch actor: {actor_url}"))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND || resp.status() == reqwest::StatusCode::GONE {
            return Ok(None);
        }
        let resp = resp
            .error_for_status()
            .with_context(|| format!("actor not ok: {actor_url}"))?;

        let text = resp.text().await?;
        let actor: ActorDoc = serde_json::from_str(&text)
            .with_context(|| format!("parse actor json from {actor_url}"))?;

        let Some(pk) = actor.public_key else {
            return Ok(None);
        };
        let key = ResolvedKey {
            owner: pk.owner.or(actor.id).unwrap_or_else(|| actor_url.clone()),
            key_id: pk.id,
            public_key_pem: pk.public_key_pem,
        };
        if key_id.contains('#') && key.key_id != key_id {
            return Ok(None);
        }
        self.put_cached(&actor_url, key.clone()).await;
        Ok(Some(key))
    }
}

#[derive(Debug)]
pub struct SignatureParams {
    pub key_id: String,
    pub algorithm: Option<String>,
    pub headers: Vec<String>,
    pub signature: Vec<u8>,
}

pub fn parse_signature_header(value: &str) -> Result<SignatureParams> {
    // Signature: keyId="...",headers="(request-target) host date",signature="base64..."
    let mut map = HashMap::<String, String>::new();
    for part in value.split(',') {
        let part = part.trim();
        let Some((k, v)) = part.split_once('=') else { continue };
        let v = v.trim().trim_matches('"');
        map.insert(k.trim().to_string(), v.to_string());
    }

    let key_id = map
        .get("keyId")
        .cloned()
        .ok_or_else(|| anyhow!("Signature missing keyId"))?;
    let headers = map
        .get("headers")
        .cloned()
        .unwrap_or_else(|| "date".to_string());
    let signature_b64 = map
        .get("signature")
        .cloned()
        .ok_or_else(|| anyhow!("Signature missing signature"))?;
    let algorithm = map.get("algorithm").map(|a| a.to_ascii_lowercase());
    if let Some(alg) = algorithm.as_deref() {
        if alg != "rsa-sha256" && alg != "hs2019" {
            return Err(anyhow!("unsupported signature algorithm: {alg}"));
        }
    }

    let signature = B64
        .decode(signature_b64.as_bytes())
        .context("decode signature")?;

    Ok(SignatureParams {
        key_id,
        algorithm,
        headers: headers
            .split_whitespace()
            .map(|s| s.to_ascii_lowercase())
            .collect(),
        signature,
    })
}

pub fn build_signing_string(method: &Method, uri: &Uri, headers: &HeaderMap, signed_headers: &[String]) -> Result<String> {
    let mut out = String::new();
    for (i, name) in signed_headers.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        if name == "(request-target)" {
            let path = uri.path();
            let query = uri.query().map(|q| format!("?{q}")).unwrap_or_default();
            out.push_str("(request-target): ");
            out.push_str(&method.as_str().to_ascii_lowercase());
            out.push(' ');
            out.push_str(path);
            out.push_str(&query);
            continue;
        }

        let header_name = http::header::HeaderName::from_bytes(name.as_bytes())
            .with_context(|| format!("bad signed header name: {name}"))?;
        let value = headers
            .get(&header_name)
            .ok_or_else(|| anyhow!("missing signed header: {name}"))?
            .to_str()
            .with_context(|| format!("invalid header value for {name}"))?;
        out.push_str(name);
        out.push_str(": ");
        out.push_str(value.trim());
    }
    Ok(out)
}

/// Requires a `Digest: SHA-256=...` header matching `body`.
pub fn verify_digest(headers: &HeaderMap, body: &[u8]) -> Result<()> {
    let digest = headers
        .get("Digest")
        .ok_or_else(|| anyhow!("missing Digest header"))?
        .to_str()
        .context("Digest header not utf8")?;
    // a header may list several digests; one SHA-256 entry must match
    for entry in digest.split(',') {
        let Some((alg, value)) = entry.split_once('=') else {
            continue;
        };
        if !alg.trim().eq_ignore_ascii_case("SHA-256") {
            continue;
        }
        let expected = B64.decode(value.trim().as_bytes()).context("decode digest")?;
        let actual = Sha256::digest(body);
        if expected.as_slice() != actual.as_slice() {
            return Err(anyhow!("digest mismatch"));
        }
        return Ok(());
    }
    Err(anyhow!("no SHA-256 digest present"))
}

pub fn verify_date(headers: &HeaderMap, max_skew: Duration) -> Result<()> {
    let date = headers
        .get("Date")
        .ok_or_else(|| anyhow!("missing Date header"))?
        .to_str()
        .context("Date header not utf8")?;
    let ts = parse_http_date(date).context("parse Date header")?;
    let now = std::time::SystemTime::now();
    let diff = if now > ts {
        now.duration_since(ts).unwrap_or_default()
    } else {
        ts.duration_since(now).unwrap_or_default()
    };
    if diff > max_skew {
        return Err(anyhow!("Date skew too large: {}s", diff.as_secs()));
    }
    Ok(())
}

pub fn verify_signature_rsa_sha256(public_key_pem: &str, signing_string: &str, signature: &[u8]) -> Result<()> {
    let public_key = RsaPublicKey::from_public_key_pem(public_key_pem)
        .context("parse public key pem")?;
    let verifying_key = VerifyingKey::<Sha256>::new(public_key);
    let sig = rsa::pkcs1v15::Signature::try_from(signature)
        .context("invalid rsa signature bytes")?;
    verifying_key
        .verify(signing_string.as_bytes(), &sig)
        .context("signature verify failed")?;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct ActorDoc {
    id: Option<String>,
    #[serde(rename = "publicKey")]
    public_key: Option<ActorPublicKey>,
}

#[derive(Debug, Deserialize)]
struct ActorPublicKey {
    id: String,
    owner: Option<String>,
    #[serde(rename = "publicKeyPem")]
    public_key_pem: String,
}
