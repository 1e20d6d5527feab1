// src/canon.rs
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// JSON with object keys sorted at every depth, so both ends hash the same bytes.
pub fn canonical_json_string(value: &Value) -> String {
    fn stable(v: &Value) -> Value {
        match v {
            Value::Object(m) => {
                let mut keys: Vec<_> = m.keys().cloned().collect();
                keys.sort();
                let mut out = Map::new();
                for k in keys {
                    out.insert(k.clone(), stable(&m[&k]));
                }
                Value::Object(out)
            }
            Value::Array(arr) => Value::Array(arr.iter().map(stable).collect()),
            _ => v.clone(),
        }
    }
    stable(value).to_string()
}

pub struct RegistrationMaterial<'a> {
    pub session_id: &'a str,
    pub nonce: &'a str,
    pub slug: &'a str,
    pub output: &'a str,
    pub fingerprint: &'a str,
    pub public_key_pem: &'a str,
}

pub fn registration_payload(m: &RegistrationMaterial<'_>) -> String {
    [
        "REGISTRATION",
        m.session_id,
        m.nonce,
        m.slug,
        m.output,
        m.fingerprint,
        m.public_key_pem,
    ]
    .join("\n")
}

pub fn challenge_payload(token: &str, slug: &str, key_id: &str) -> String {
    ["CHALLENGE", token, slug, key_id].join("\n")
}

/// Signing material for one authenticated request.
///
/// The body enters as the sha256 hex digest of its canonical JSON form;
/// bodiless requests hash the empty string.
pub fn request_payload(
    method: &str,
    path: &str,
    slug: &str,
    key_id: &str,
    timestamp: &str,
    body: Option<&Value>,
) -> String {
    let body_digest = hex::encode(Sha256::digest(
        body.map(canonical_json_string).unwrap_or_default().as_bytes(),
    ));
    [
        "REQUEST",
        &method.to_ascii_uppercase(),
        path,
        slug,
        key_id,
        timestamp,
        &body_digest,
    ]
    .join("\n")
}
