//! Validation of events submitted for publication.
//!
//! Stages run in order and stop at the first failure: structure, content
//! negotiation, id and signature, NIP-26 delegation, transaction schema.

use std::time::{SystemTime, UNIX_EPOCH};

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::{
    event::{is_low_hex_32, verify_event, verify_schnorr, Event},
    trust::{TrustError, TrustRegistry},
};

/// Kind of internal transaction events.
pub const INTERNAL_TRANSACTION_KIND: u32 = 1112;
/// Sub-kind opening a transaction.
pub const INTERNAL_TRANSACTION_START: &str = "internal-transaction-start";

/// Media types advertised when the `Accept` header is not satisfiable.
const ACCEPTABLE: &str = "application/json\napplication/nostr+json";

/// Reason an event was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("malformed event")]
    Malformed,
    #[error("not acceptable")]
    NotAcceptable,
    #[error("signature verification failed")]
    SignatureFailed,
    #[error("delegation verification failed")]
    DelegationFailed,
    #[error("invalid schema")]
    InvalidSchema,
}

impl Rejection {
    pub fn status(self) -> StatusCode {
        match self {
            Rejection::Malformed => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Rejection::NotAcceptable => StatusCode::NOT_ACCEPTABLE,
            Rejection::SignatureFailed
            | Rejection::DelegationFailed
            | Rejection::InvalidSchema => StatusCode::UNPROCESSABLE_ENTITY,
        }
    }
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        match self {
            Rejection::NotAcceptable => (self.status(), ACCEPTABLE).into_response(),
            _ => self.status().into_response(),
        }
    }
}

/// Whether an `Accept` header admits a JSON response. A missing header
/// counts as `*/*`.
pub fn accepts(header: Option<&str>) -> bool {
    let Some(header) = header else {
        return true;
    };
    header
        .split(',')
        .filter_map(|range| range.split(';').next())
        .map(str::trim)
        .any(|media| {
            media.eq_ignore_ascii_case("application/json")
                || media.eq_ignore_ascii_case("application/nostr+json")
                || media == "*/*"
                || media.eq_ignore_ascii_case("application/*")
        })
}

/// Structural stage: the body must be a non-empty object shaped like an
/// event.
pub fn parse_event(body: Option<&Value>) -> Result<Event, Rejection> {
    match body {
        Some(Value::Object(obj)) if !obj.is_empty() => {
            serde_json::from_value(Value::Object(obj.clone())).map_err(|e| {
                debug!(error = %e, "event does not match the expected shape");
                Rejection::Malformed
            })
        }
        _ => Err(Rejection::Malformed),
    }
}

/// Current Unix time in seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Applies the signature, delegation and schema stages using the trust
/// anchors of the ledger and external payment modules.
#[derive(Debug, Clone)]
pub struct Validator {
    ledger_key: String,
    external_payment_key: String,
}

impl Validator {
    pub fn new(ledger_key: impl Into<String>, external_payment_key: impl Into<String>) -> Self {
        Self {
            ledger_key: ledger_key.into(),
            external_payment_key: external_payment_key.into(),
        }
    }

    /// Build a validator from the keys of the named modules.
    pub fn from_trust(
        trust: &TrustRegistry,
        ledger_module: &str,
        external_payment_module: &str,
    ) -> Result<Self, TrustError> {
        let key = |name: &str| {
            trust
                .public_key(name)
                .map(String::from)
                .ok_or_else(|| TrustError::MissingPublicKey(name.to_string()))
        };
        Ok(Self::new(key(ledger_module)?, key(external_payment_module)?))
    }

    /// Run the structural, signature, delegation and schema stages on a raw
    /// body.
    pub fn check(&self, body: Option<&Value>, now: u64) -> Result<Event, Rejection> {
        let event = parse_event(body)?;
        self.validate(&event, now)?;
        Ok(event)
    }

    /// Run the signature, delegation and schema stages on a parsed event.
    pub fn validate(&self, event: &Event, now: u64) -> Result<(), Rejection> {
        verify_event(event).map_err(|e| {
            debug!(id = %event.id, error = %e, "signature check failed");
            Rejection::SignatureFailed
        })?;
        check_delegation(event, now)?;
        self.check_schema(event)
    }

    fn check_schema(&self, event: &Event) -> Result<(), Rejection> {
        if event.kind != INTERNAL_TRANSACTION_KIND {
            return Err(Rejection::InvalidSchema);
        }
        let mut sub_kinds = event.tags_named("t");
        let sub_kind = match (sub_kinds.next(), sub_kinds.next()) {
            (Some(tag), None) => tag.value(),
            _ => None,
        };
        match sub_kind {
            Some(INTERNAL_TRANSACTION_START) => self.check_start(event),
            _ => Err(Rejection::InvalidSchema),
        }
    }

    fn check_start(&self, event: &Event) -> Result<(), Rejection> {
        let parties: Vec<&str> = event
            .tags_named("p")
            .map(|t| t.value().unwrap_or_default())
            .collect();
        let [ledger, target] = parties.as_slice() else {
            return Err(Rejection::InvalidSchema);
        };
        if *ledger != self.ledger_key || !is_low_hex_32(target) {
            return Err(Rejection::InvalidSchema);
        }
        if !positive_tokens(&event.content) {
            return Err(Rejection::InvalidSchema);
        }
        if *target == self.external_payment_key
            && !event
                .tags_named("bolt11")
                .any(|t| t.value().is_some_and(|v| !v.is_empty()))
        {
            return Err(Rejection::InvalidSchema);
        }
        Ok(())
    }
}

/// `content` carries a non-empty `tokens` object of strictly positive
/// amounts.
fn positive_tokens(content: &str) -> bool {
    let Ok(content) = serde_json::from_str::<Value>(content) else {
        return false;
    };
    match content.get("tokens").and_then(Value::as_object) {
        Some(tokens) if !tokens.is_empty() => tokens
            .values()
            .all(|v| v.as_f64().is_some_and(|amount| amount > 0.0)),
        _ => false,
    }
}

/// NIP-26 stage. Events without a `delegation` tag pass; otherwise every
/// delegation tag must carry a valid certificate whose conditions hold for
/// the event and for `now`.
pub fn check_delegation(event: &Event, now: u64) -> Result<(), Rejection> {
    for tag in event.tags_named("delegation") {
        let [_, delegator, conditions, sig] = tag.0.as_slice() else {
            return Err(Rejection::DelegationFailed);
        };
        if !is_low_hex_32(delegator) {
            return Err(Rejection::DelegationFailed);
        }
        let token = format!("nostr:delegation:{}:{}", event.pubkey, conditions);
        let digest: [u8; 32] = Sha256::digest(token.as_bytes()).into();
        verify_schnorr(delegator, &digest, sig).map_err(|e| {
            debug!(delegator = %delegator, error = %e, "delegation signature rejected");
            Rejection::DelegationFailed
        })?;
        if !conditions_hold(conditions, event, now) {
            return Err(Rejection::DelegationFailed);
        }
    }
    Ok(())
}

/// Evaluate a `kind=..&created_at<..&created_at>..` conditions string.
fn conditions_hold(conditions: &str, event: &Event, now: u64) -> bool {
    conditions.split('&').all(|clause| {
        if let Some(kind) = clause.strip_prefix("kind=") {
            kind.parse::<u32>().is_ok_and(|k| k == event.kind)
        } else if let Some(before) = clause.strip_prefix("created_at<") {
            before
                .parse::<u64>()
                .is_ok_and(|t| event.created_at < t && now < t)
        } else if let Some(after) = clause.strip_prefix("created_at>") {
            after
                .parse::<u64>()
                .is_ok_and(|t| event.created_at > t && now > t)
        } else {
            false
        }
    })
}
