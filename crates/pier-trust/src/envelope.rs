use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use serde::{Deserialize, Deserializer, Serialize};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Maximum distance between the signer's clock and the verifier's clock.
pub const REPLAY_WINDOW: Duration = Duration::from_millis(60_000);

pub const HEADER_PORT: &str = "x-port";
pub const HEADER_TIMESTAMP: &str = "x-timestamp";
pub const HEADER_SIGNATURE: &str = "x-signature";

/// Authentication triple attached to every call crossing the tenant boundary.
///
/// The MAC covers `"{port}:{timestamp}"` only. Request bodies are not bound to
/// the signature, so an envelope proves who is calling and when, not what they
/// sent.
///
/// Textual ports and timestamps must be in canonical decimal form (see
/// [`parse_signed_integer`]), which makes the MAC input identical to the
/// characters the caller sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedEnvelope {
    #[serde(deserialize_with = "lenient_port")]
    pub port: u16,
    /// Unix epoch milliseconds at signing time.
    #[serde(deserialize_with = "lenient_millis")]
    pub timestamp: i64,
    pub signature: String,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TrustError {
    #[error("signature is not a lowercase hex sha256 digest")]
    MalformedSignature,
    #[error("signature mismatch")]
    SignatureMismatch,
    #[error("timestamp outside replay window (skew {skew_ms}ms)")]
    Stale { skew_ms: u64 },
}

impl TrustError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            TrustError::MalformedSignature => "malformed_signature",
            TrustError::SignatureMismatch => "signature_mismatch",
            TrustError::Stale { .. } => "stale_timestamp",
        }
    }
}

impl SignedEnvelope {
    /// Signs `port` at the current wall-clock time.
    pub fn sign_now(secret: &str, port: u16) -> Self {
        Self::sign_at(secret, port, now_millis())
    }

    pub fn sign_at(secret: &str, port: u16, timestamp: i64) -> Self {
        Self {
            port,
            timestamp,
            signature: compute_signature(secret, port, timestamp),
        }
    }

    /// Checks the envelope against `secret` using the default replay window.
    pub fn verify(&self, secret: &str) -> Result<(), TrustError> {
        self.verify_at(secret, now_millis(), REPLAY_WINDOW)
    }

    pub fn verify_at(&self, secret: &str, now_ms: i64, window: Duration) -> Result<(), TrustError> {
        let provided = decode_signature(&self.signature)?;

        let mut mac = keyed(secret);
        mac.update(signing_input(self.port, self.timestamp).as_bytes());
        mac.verify_slice(&provided)
            .map_err(|_| TrustError::SignatureMismatch)?;

        let skew_ms = now_ms.abs_diff(self.timestamp);
        if u128::from(skew_ms) > window.as_millis() {
            return Err(TrustError::Stale { skew_ms });
        }

        Ok(())
    }
}

/// `hex(HMAC-SHA256(secret, "{port}:{timestamp}"))`, lowercase.
pub fn compute_signature(secret: &str, port: u16, timestamp: i64) -> String {
    let mut mac = keyed(secret);
    mac.update(signing_input(port, timestamp).as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or_default()
}

/// Parses a port or timestamp as it appears on the wire. Whitespace, a plus
/// sign, leading zeros and `-0` are refused because they would reformat to a
/// different string than the one that was signed.
pub fn parse_signed_integer(text: &str) -> Option<i64> {
    let digits = text.strip_prefix('-').unwrap_or(text);
    let canonical = !digits.is_empty()
        && digits.bytes().all(|b| b.is_ascii_digit())
        && (digits == "0" || !digits.starts_with('0'))
        && text != "-0";
    if !canonical {
        return None;
    }
    text.parse().ok()
}

fn signing_input(port: u16, timestamp: i64) -> String {
    format!("{port}:{timestamp}")
}

fn keyed(secret: &str) -> HmacSha256 {
    HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts keys of any length")
}

// Signatures must match the recomputed hex string exactly, so uppercase
// digits are rejected instead of being normalised by the decoder.
fn decode_signature(signature: &str) -> Result<Vec<u8>, TrustError> {
    let well_formed = signature.len() == 64
        && signature
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
    if !well_formed {
        return Err(TrustError::MalformedSignature);
    }
    hex::decode(signature).map_err(|_| TrustError::MalformedSignature)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrText {
    Number(i64),
    Text(String),
}

impl NumberOrText {
    fn into_i64<E: serde::de::Error>(self) -> Result<i64, E> {
        match self {
            NumberOrText::Number(value) => Ok(value),
            NumberOrText::Text(text) => parse_signed_integer(&text)
                .ok_or_else(|| E::custom(format!("expected a canonical integer, got {text:?}"))),
        }
    }
}

fn lenient_port<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    let value = NumberOrText::deserialize(deserializer)?.into_i64::<D::Error>()?;
    u16::try_from(value).map_err(|_| serde::de::Error::custom(format!("port {value} out of range")))
}

fn lenient_millis<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    NumberOrText::deserialize(deserializer)?.into_i64::<D::Error>()
}
