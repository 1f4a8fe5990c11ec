/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use http::StatusCode;
use std::fmt;

/// Pipeline stages in order. A request that fails while attempting a stage
/// terminates as `Rejected@<stage>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Received,
    StructurallyValid,
    UriSafe,
    SignatureChecked,
    QuotaChecked,
    NotBlocked,
    Audited,
    Dispatched,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Received => "Received",
            Stage::StructurallyValid => "StructurallyValid",
            Stage::UriSafe => "URISafe",
            Stage::SignatureChecked => "SignatureChecked",
            Stage::QuotaChecked => "QuotaChecked",
            Stage::NotBlocked => "NotBlocked",
            Stage::Audited => "Audited",
            Stage::Dispatched => "Dispatched",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InboxError {
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("payload too complex: {0}")]
    PayloadTooComplex(String),
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
    #[error("unsafe uri {uri}: {reason}")]
    UnsafeUri { uri: String, reason: String },
    #[error("unsigned activity not accepted")]
    UnauthorizedActivity,
    #[error("invalid signature: {0}")]
    InvalidSignature(String),
    #[error("actor creation quota exceeded: {0}")]
    ActorQuotaExceeded(String),
    #[error("announce limit reached for {0}")]
    RelayFlooded(String),
    #[error("vote rate exceeded for {0}")]
    VoteRateExceeded(String),
    #[error("unsupported activity type: {0}")]
    UnsupportedActivityType(String),
    #[error("dispatch unavailable: {0}")]
    DispatchUnavailable(String),
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("invalid domain: {0}")]
    InvalidDomain(String),
    #[error("missing or unknown bearer token")]
    Unauthenticated,
    #[error("principal may not change instance blocks")]
    Forbidden,
}

impl InboxError {
    /// Stable machine-readable code, used in rejection bodies and logs.
    pub fn code(&self) -> &'static str {
        match self {
            InboxError::PayloadTooLarge { .. } => "payload_too_large",
            InboxError::PayloadTooComplex(_) => "payload_too_complex",
            InboxError::MalformedPayload(_) => "malformed_payload",
            InboxError::UnsafeUri { .. } => "unsafe_uri",
            InboxError::UnauthorizedActivity => "unauthorized_activity",
            InboxError::InvalidSignature(_) => "invalid_signature",
            InboxError::ActorQuotaExceeded(_) => "actor_quota_exceeded",
            InboxError::RelayFlooded(_) => "relay_flooded",
            InboxError::VoteRateExceeded(_) => "vote_rate_exceeded",
            InboxError::UnsupportedActivityType(_) => "unsupported_activity_type",
            InboxError::DispatchUnavailable(_) => "dispatch_unavailable",
            InboxError::StoreUnavailable(_) => "store_unavailable",
            InboxError::InvalidDomain(_) => "invalid_domain",
            InboxError::Unauthenticated => "unauthenticated",
            InboxError::Forbidden => "forbidden",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            InboxError::PayloadTooLarge { .. }
            | InboxError::PayloadTooComplex(_)
            | InboxError::MalformedPayload(_)
            | InboxError::UnsafeUri { .. }
            | InboxError::InvalidDomain(_) => StatusCode::BAD_REQUEST,
            InboxError::UnauthorizedActivity
            | InboxError::InvalidSignature(_)
            | InboxError::Unauthenticated => StatusCode::UNAUTHORIZED,
            InboxError::Forbidden => StatusCode::FORBIDDEN,
            InboxError::ActorQuotaExceeded(_)
            | InboxError::RelayFlooded(_)
            | InboxError::VoteRateExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            InboxError::UnsupportedActivityType(_) => StatusCode::ACCEPTED,
            InboxError::DispatchUnavailable(_) | InboxError::StoreUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
        }
    }

    /// True when the sender is told the activity was accepted even though it was dropped.
    pub fn is_acknowledged(&self) -> bool {
        self.status().is_success()
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            InboxError::DispatchUnavailable(_) | InboxError::StoreUnavailable(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_errors_are_429() {
        for e in [
            InboxError::ActorQuotaExceeded("a".into()),
            InboxError::RelayFlooded("b".into()),
            InboxError::VoteRateExceeded("c".into()),
        ] {
            assert_eq!(e.status(), StatusCode::TOO_MANY_REQUESTS);
            assert!(!e.is_transient());
        }
    }

    #[test]
    fn unsupported_type_is_acknowledged() {
        let e = InboxError::UnsupportedActivityType("Arrive".into());
        assert!(e.is_acknowledged());
        assert_eq!(e.code(), "unsupported_activity_type");
    }

    #[test]
    fn stage_display_uses_state_names() {
        assert_eq!(Stage::UriSafe.to_string(), "URISafe");
        assert!(Stage::Audited < Stage::Dispatched);
    }
}
