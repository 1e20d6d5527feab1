// src/verify.rs
//! Verifier side of the display protocol. The registration flow self-checks
//! its own payload with these before submitting it.
use crate::canon::{self, RegistrationMaterial};
use crate::error::{RuntimeError, RuntimeResult};
use crate::signer::{HEADER_KEY_ID, HEADER_SIGNATURE, HEADER_SLUG, HEADER_TIMESTAMP};
use crate::types::{RegisterReq, KEY_ALGORITHM};
use base64::{engine::general_purpose::STANDARD as B64, Engine};
use chrono::{DateTime, Duration, Utc};
use ed25519_dalek::pkcs8::DecodePublicKey;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use reqwest::header::HeaderMap;
use serde_json::Value;

pub fn verifying_key_from_pem(pem: &str) -> RuntimeResult<VerifyingKey> {
    VerifyingKey::from_public_key_pem(pem.trim())
        .map_err(|e| RuntimeError::Signature(format!("invalid public key: {e}")))
}

pub fn verify_text(key: &VerifyingKey, text: &str, signature_b64: &str) -> RuntimeResult<()> {
    let sig_bytes = B64
        .decode(signature_b64)
        .map_err(|e| RuntimeError::Signature(format!("signature encoding: {e}")))?;
    let sig = Signature::from_slice(&sig_bytes)
        .map_err(|e| RuntimeError::Signature(format!("invalid signature: {e}")))?;
    key.verify(text.as_bytes(), &sig)
        .map_err(|_| RuntimeError::Signature("bad signature".into()))
}

/// Checks that `req` was signed by the private half of `req.public_key`
/// over the session `nonce`.
pub fn verify_registration_signature(req: &RegisterReq, nonce: &str) -> RuntimeResult<()> {
    if req.key_algorithm != KEY_ALGORITHM {
        return Err(RuntimeError::Signature(format!(
            "unsupported key algorithm {}",
            req.key_algorithm
        )));
    }
    let key = verifying_key_from_pem(&req.public_key)?;
    let payload = canon::registration_payload(&RegistrationMaterial {
        session_id: &req.registration_session_id,
        nonce,
        slug: &req.display_slug,
        output: &req.display_output,
        fingerprint: &req.display_fingerprint,
        public_key_pem: &req.public_key,
    });
    verify_text(&key, &payload, &req.registration_signature)
}

pub fn verify_challenge_signature(
    public_key_pem: &str,
    token: &str,
    slug: &str,
    key_id: &str,
    signature_b64: &str,
) -> RuntimeResult<()> {
    let key = verifying_key_from_pem(public_key_pem)?;
    verify_text(&key, &canon::challenge_payload(token, slug, key_id), signature_b64)
}

/// Identity claimed by a signed request's headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedRequestClaims {
    pub display_slug: String,
    pub key_id: String,
    pub timestamp: DateTime<Utc>,
}

pub fn signed_request_claims(headers: &HeaderMap) -> RuntimeResult<SignedRequestClaims> {
    let slug = header_str(headers, HEADER_SLUG)?;
    let key_id = header_str(headers, HEADER_KEY_ID)?;
    let ts = header_str(headers, HEADER_TIMESTAMP)?;
    let secs: i64 = ts
        .parse()
        .map_err(|_| RuntimeError::Signature(format!("{HEADER_TIMESTAMP} is not a unix time")))?;
    let timestamp = DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| RuntimeError::Signature(format!("{HEADER_TIMESTAMP} out of range")))?;
    Ok(SignedRequestClaims {
        display_slug: slug.to_string(),
        key_id: key_id.to_string(),
        timestamp,
    })
}

/// Validates the signature headers of one request against `public_key_pem`.
/// Requests whose timestamp is further than `max_skew` from `now` are refused.
pub fn verify_signed_request(
    public_key_pem: &str,
    method: &str,
    path: &str,
    headers: &HeaderMap,
    body: Option<&Value>,
    now: DateTime<Utc>,
    max_skew: Duration,
) -> RuntimeResult<SignedRequestClaims> {
    let claims = signed_request_claims(headers)?;
    let skew = now - claims.timestamp;
    if skew > max_skew || skew < -max_skew {
        return Err(RuntimeError::Signature("request timestamp outside allowed skew".into()));
    }
    let signature = header_str(headers, HEADER_SIGNATURE)?;
    let payload = canon::request_payload(
        method,
        path,
        &claims.display_slug,
        &claims.key_id,
        &claims.timestamp.timestamp().to_string(),
        body,
    );
    let key = verifying_key_from_pem(public_key_pem)?;
    verify_text(&key, &payload, signature)?;
    Ok(claims)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> RuntimeResult<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| RuntimeError::Signature(format!("missing {name} header")))
}
