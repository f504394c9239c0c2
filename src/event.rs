//! Nostr event model, canonical hashing and signature checks.

use bech32::{Bech32, Hrp};
use secp256k1::{schnorr::Signature, Message, Secp256k1, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Human readable prefix of NIP-19 event pointers.
const NEVENT_HRP: Hrp = Hrp::parse_unchecked("nevent");

/// Wrapper for a Nostr tag expressed as an array of strings.
///
/// The first element names the tag and the following elements hold data,
/// e.g. `["p", "<hex pubkey>"]` or `["t", "internal-transaction-start"]`.
/// Tags are kept verbatim so unknown tags survive re-serialization.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tag(pub Vec<String>);

impl Tag {
    /// Tag name, i.e. its first element.
    pub fn name(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    /// First value after the name.
    pub fn value(&self) -> Option<&str> {
        self.0.get(1).map(String::as_str)
    }
}

/// Signed Nostr event as received from clients and relays.
///
/// ```json
/// {
///   "id": "aa11...",
///   "pubkey": "bb22...",
///   "kind": 1112,
///   "created_at": 1700000000,
///   "tags": [["t", "internal-transaction-start"], ["p", "..."]],
///   "content": "{\"tokens\":{\"BTC\":1000}}",
///   "sig": "cc33..."
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Event identifier (hex of SHA-256 hash).
    pub id: String,
    /// Author public key (hex, x-only).
    pub pubkey: String,
    /// Kind number, e.g. `1` or `1112`.
    pub kind: u32,
    /// Unix timestamp of creation.
    pub created_at: u64,
    /// Ordered tags.
    pub tags: Vec<Tag>,
    /// Event content body.
    pub content: String,
    /// Schnorr signature over the event hash.
    pub sig: String,
}

impl Event {
    /// All tags named `name`, in event order.
    pub fn tags_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Tag> + 'a {
        self.tags.iter().filter(move |t| t.name() == Some(name))
    }

    /// Encode a NIP-19 `nevent` pointer carrying id, author and kind.
    pub fn nevent(&self) -> Result<String, SignatureError> {
        let id = decode_32(&self.id)?;
        let author = decode_32(&self.pubkey)?;
        let mut tlv = Vec::with_capacity(2 + 32 + 2 + 32 + 2 + 4);
        tlv.extend_from_slice(&[0, 32]);
        tlv.extend_from_slice(&id);
        tlv.extend_from_slice(&[2, 32]);
        tlv.extend_from_slice(&author);
        tlv.extend_from_slice(&[3, 4]);
        tlv.extend_from_slice(&self.kind.to_be_bytes());
        Ok(bech32::encode::<Bech32>(NEVENT_HRP, &tlv)?)
    }
}

/// Failures while checking ids and Schnorr signatures.
#[derive(Debug, thiserror::Error)]
pub enum SignatureError {
    #[error("id mismatch: expected {expected}")]
    IdMismatch { expected: String },
    #[error("expected 32 bytes, got {0}")]
    Length(usize),
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("secp256k1: {0}")]
    Secp(#[from] secp256k1::Error),
    #[error("serialization: {0}")]
    Json(#[from] serde_json::Error),
    #[error("bech32: {0}")]
    Bech32(#[from] bech32::EncodeError),
}

/// Recompute the Nostr event hash from its fields.
pub fn event_hash(ev: &Event) -> Result<[u8; 32], SignatureError> {
    let arr = serde_json::json!([0, ev.pubkey, ev.created_at, ev.kind, ev.tags, ev.content]);
    let data = serde_json::to_vec(&arr)?;
    Ok(Sha256::digest(&data).into())
}

/// Verify an event's ID and Schnorr signature.
pub fn verify_event(ev: &Event) -> Result<(), SignatureError> {
    let hash = event_hash(ev)?;
    let calc_id = hex::encode(hash);
    if calc_id != ev.id {
        return Err(SignatureError::IdMismatch { expected: calc_id });
    }
    verify_schnorr(&ev.pubkey, &hash, &ev.sig)
}

/// Verify a hex Schnorr signature over `digest` for the hex x-only `pubkey`.
pub fn verify_schnorr(pubkey: &str, digest: &[u8; 32], sig: &str) -> Result<(), SignatureError> {
    let sig = Signature::from_slice(&hex::decode(sig)?)?;
    let pk = XOnlyPublicKey::from_slice(&hex::decode(pubkey)?)?;
    let secp = Secp256k1::verification_only();
    let msg = Message::from_digest(*digest);
    secp.verify_schnorr(&sig, &msg, &pk)?;
    Ok(())
}

/// True for 64-character lowercase hex strings (keys and ids).
pub fn is_low_hex_32(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

fn decode_32(s: &str) -> Result<[u8; 32], SignatureError> {
    let bytes = hex::decode(s)?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| SignatureError::Length(bytes.len()))
}
