/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::classify::ClassifiedActivity;
use crate::config::InboxConfig;
use crate::error::InboxError;
use crate::http_sig::{
    build_signing_string, parse_signature_header, verify_date, verify_digest,
    verify_signature_rsa_sha256, KeyResolve,
};
use crate::request::InboundHttpRequest;
use crate::uri_safety::{host_from_url, UriPolicy};
use fedigate_protocol::TrustLevel;
use std::sync::Arc;
use std::time::Duration;

/// Outcome of the signature stage, carried unchanged through the rest of the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Verified { actor: String, key_id: String },
    /// Unsigned but allowed; `actor` is only what the activity claims.
    Unverified { actor: String },
}

impl Admission {
    pub fn trust(&self) -> TrustLevel {
        match self {
            Admission::Verified { .. } => TrustLevel::Verified,
            Admission::Unverified { .. } => TrustLevel::Unverified,
        }
    }

    pub fn actor(&self) -> &str {
        match self {
            Admission::Verified { actor, .. } | Admission::Unverified { actor } => actor,
        }
    }

    /// The signer's actor id, only for verified traffic.
    pub fn verified_actor(&self) -> Option<&str> {
        match self {
            Admission::Verified { actor, .. } => Some(actor),
            Admission::Unverified { .. } => None,
        }
    }

    pub fn key_id(&self) -> Option<&str> {
        match self {
            Admission::Verified { key_id, .. } => Some(key_id),
            Admission::Unverified { .. } => None,
        }
    }

    /// Host of the signer, or of the claimed actor for unsigned traffic.
    pub fn source_instance(&self) -> Option<String> {
        host_from_url(self.actor())
    }
}

pub struct AdmissionPolicy {
    require_signatures: bool,
    allow_unsigned: bool,
    max_date_skew: Duration,
    key_fetch_timeout: Duration,
    resolver: Arc<dyn KeyResolve>,
    uris: UriPolicy,
}

impl AdmissionPolicy {
    pub fn new(cfg: &InboxConfig, resolver: Arc<dyn KeyResolve>) -> Self {
        Self {
            require_signatures: cfg.require_signatures,
            allow_unsigned: cfg.allow_unsigned_activities,
            max_date_skew: Duration::from_secs(cfg.max_date_skew_secs),
            key_fetch_timeout: cfg.key_fetch_timeout(),
            resolver,
            uris: UriPolicy::from_config(cfg),
        }
    }

    pub async fn admit(
        &self,
        req: &InboundHttpRequest,
        activity: &ClassifiedActivity,
    ) -> Result<Admission, InboxError> {
        let Some(sig_header) = req.header("signature") else {
            if self.require_signatures || !self.allow_unsigned {
                return Err(InboxError::UnauthorizedActivity);
            }
            let actor = activity
                .actor
                .clone()
                .ok_or_else(|| InboxError::MalformedPayload("activity has no actor".to_string()))?;
            return Ok(Admission::Unverified { actor });
        };

        let invalid = |e: anyhow::Error| InboxError::InvalidSignature(format!("{e:#}"));

        let params = parse_signature_header(sig_header).map_err(invalid)?;
        for required in ["(request-target)", "date", "digest"] {
            if !params.headers.iter().any(|h| h == required) {
                return Err(InboxError::InvalidSignature(format!(
                    "{required} not covered by signature"
                )));
            }
        }
        verify_digest(&req.headers, &req.body).map_err(invalid)?;
        verify_date(&req.headers, self.max_date_skew).map_err(invalid)?;

        if self.uris.check_uri(&params.key_id).is_err() {
            return Err(InboxError::InvalidSignature("keyId points at a disallowed uri".to_string()));
        }
        let key = match tokio::time::timeout(
            self.key_fetch_timeout,
            self.resolver.resolve_public_key(&params.key_id),
        )
        .await
        {
            Ok(Ok(Some(key))) => key,
            Ok(Ok(None)) => return Err(InboxError::InvalidSignature("key not found".to_string())),
            Ok(Err(e)) => return Err(invalid(e.context("resolve key"))),
            Err(_) => {
                return Err(InboxError::InvalidSignature(format!(
                    "key fetch timed out after {}s",
                    self.key_fetch_timeout.as_secs()
                )))
            }
        };

        let signing_string =
            build_signing_string(&req.method, &req.uri, &req.headers, &params.headers).map_err(invalid)?;
        verify_signature_rsa_sha256(&key.public_key_pem, &signing_string, &params.signature)
            .map_err(invalid)?;

        let signer_host = host_from_url(&key.owner)
            .ok_or_else(|| InboxError::InvalidSignature("key owner has no host".to_string()))?;
        if host_from_url(&params.key_id).as_deref() != Some(signer_host.as_str()) {
            return Err(InboxError::InvalidSignature(
                "key owner is not on the keyId host".to_string(),
            ));
        }
        if let Some(actor) = activity.actor.as_deref() {
            if host_from_url(actor).as_deref() != Some(signer_host.as_str()) {
                return Err(InboxError::InvalidSignature(
                    "signer origin does not match activity actor".to_string(),
                ));
            }
        }

        Ok(Admission::Verified {
            actor: key.owner,
            key_id: params.key_id,
        })
    }
}
