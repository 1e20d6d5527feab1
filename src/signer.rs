// src/signer.rs
use crate::api::DisplayApi;
use crate::canon;
use crate::error::{RuntimeError, RuntimeResult};
use crate::identity::DisplayKeyPair;
use crate::types::DisplayRegistrationRecord;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

pub const HEADER_SLUG: &str = "x-display-slug";
pub const HEADER_KEY_ID: &str = "x-display-key-id";
pub const HEADER_TIMESTAMP: &str = "x-display-timestamp";
pub const HEADER_SIGNATURE: &str = "x-display-signature";

/// One outbound request to be signed.
pub struct SignedRequest<'a> {
    pub method: &'a str,
    pub url: &'a str,
    pub display_slug: &'a str,
    pub key_id: &'a str,
    pub body: Option<&'a Value>,
}

/// Path component of `url`, which may already be a bare path.
pub fn signing_path(url: &str) -> String {
    match reqwest::Url::parse(url) {
        Ok(parsed) => parsed.path().to_string(),
        Err(_) => url.split('?').next().unwrap_or(url).to_string(),
    }
}

pub fn create_signed_headers(
    req: &SignedRequest<'_>,
    key: &DisplayKeyPair,
    now: DateTime<Utc>,
) -> RuntimeResult<HeaderMap> {
    let timestamp = now.timestamp().to_string();
    let payload = canon::request_payload(
        req.method,
        &signing_path(req.url),
        req.display_slug,
        req.key_id,
        &timestamp,
        req.body,
    );
    let signature = key.sign_text(&payload);

    let mut headers = HeaderMap::new();
    headers.insert(HEADER_SLUG, header_value(req.display_slug)?);
    headers.insert(HEADER_KEY_ID, header_value(req.key_id)?);
    headers.insert(HEADER_TIMESTAMP, header_value(&timestamp)?);
    headers.insert(HEADER_SIGNATURE, header_value(&signature)?);
    Ok(headers)
}

fn header_value(v: &str) -> RuntimeResult<HeaderValue> {
    HeaderValue::from_str(v).map_err(|e| RuntimeError::Signature(format!("header value: {e}")))
}

/// Everything needed to sign as a registered display.
#[derive(Clone)]
pub struct DisplayCredentials {
    pub display_slug: String,
    pub key_id: String,
    key: Arc<DisplayKeyPair>,
}

impl DisplayCredentials {
    pub fn new(record: &DisplayRegistrationRecord, key: DisplayKeyPair) -> RuntimeResult<Self> {
        if record.key_alias != key.alias() {
            return Err(RuntimeError::Identity(format!(
                "registration for {} expects key {}, got {}",
                record.display_slug,
                record.key_alias,
                key.alias()
            )));
        }
        Ok(Self {
            display_slug: record.display_slug.clone(),
            key_id: record.key_id.clone(),
            key: Arc::new(key),
        })
    }

    pub fn key(&self) -> &DisplayKeyPair {
        &self.key
    }

    pub fn signed_headers(
        &self,
        method: &str,
        url: &str,
        body: Option<&Value>,
    ) -> RuntimeResult<HeaderMap> {
        create_signed_headers(
            &SignedRequest {
                method,
                url,
                display_slug: &self.display_slug,
                key_id: &self.key_id,
                body,
            },
            &self.key,
            Utc::now(),
        )
    }

    pub fn sign_challenge(&self, token: &str) -> String {
        self.key
            .sign_text(&canon::challenge_payload(token, &self.display_slug, &self.key_id))
    }
}

impl std::fmt::Debug for DisplayCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DisplayCredentials")
            .field("display_slug", &self.display_slug)
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

/// One challenge/response round proving possession of the display key.
/// Never retried here: on failure the caller starts over with a new challenge.
pub async fn authenticate(api: &DisplayApi, creds: &DisplayCredentials) -> RuntimeResult<()> {
    let challenge = api
        .create_auth_challenge(&creds.display_slug, &creds.key_id)
        .await?;
    let signature = creds.sign_challenge(&challenge.challenge_token);
    match api
        .verify_auth_challenge(&challenge, &creds.display_slug, &creds.key_id, &signature)
        .await
    {
        Ok(()) => {
            info!("display {} authenticated", creds.display_slug);
            Ok(())
        }
        Err(e) => {
            warn!("challenge for {} failed: {e}", creds.display_slug);
            Err(e)
        }
    }
}
